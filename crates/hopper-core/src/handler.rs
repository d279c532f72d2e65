//! Job handler trait and registry.
//!
//! Handlers are looked up by the `handler` identifier carried in a job's
//! payload at execution time.
//!
//! Delivery is at-least-once: a worker may die after a handler produced its
//! side effects but before the success was recorded, in which case the job
//! runs again. Handlers must be idempotent or otherwise safe to repeat.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{Error, JobId, Result};

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    /// Non-retryable errors fail the job immediately.
    pub retryable: bool,
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for JobError {}

impl From<Error> for JobError {
    fn from(error: Error) -> Self {
        Self {
            retryable: error.is_transient(),
            message: error.to_string(),
        }
    }
}

pub type JobResult = std::result::Result<(), JobError>;

/// What a handler knows about the job it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub queue: String,
    /// 1-based execution attempt.
    pub attempt: u32,
    pub retry_count: u32,
    pub worker_id: String,
    shutdown: Arc<AtomicBool>,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        queue: impl Into<String>,
        attempt: u32,
        retry_count: u32,
        worker_id: impl Into<String>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            job_id,
            queue: queue.into(),
            attempt,
            retry_count,
            worker_id: worker_id.into(),
            shutdown,
        }
    }

    /// Set once the server starts shutting down. Long handlers may check it
    /// and return early with a retryable error.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext, args: &serde_json::Value) -> JobResult;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    async fn handle(&self, ctx: &JobContext, args: &serde_json::Value) -> JobResult {
        (self.0)(ctx.clone(), args.clone()).await
    }
}

/// Maps handler identifiers to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(JobContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler(f)))
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownHandler(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> JobContext {
        JobContext::new(
            JobId::new(),
            "default",
            1,
            0,
            "worker-1",
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_name() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("ok", |_ctx, _args| async { JobResult::Ok(()) })
            .register_fn("boom", |_ctx, args| async move {
                JobResult::Err(JobError::retryable(format!("boom: {}", args)))
            });

        assert_eq!(registry.names(), vec!["boom", "ok"]);

        let ctx = context();
        let ok = registry.get("ok").unwrap();
        assert!(ok.handle(&ctx, &serde_json::Value::Null).await.is_ok());

        let boom = registry.get("boom").unwrap();
        let err = boom
            .handle(&ctx, &serde_json::json!(1))
            .await
            .unwrap_err();
        assert_eq!(err.message, "boom: 1");
        assert!(err.retryable);
    }

    #[test]
    fn test_unknown_handler() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.get("missing"),
            Err(Error::UnknownHandler(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_job_error_from_core_error() {
        let transient: JobError = Error::StoreUnavailable("down".into()).into();
        assert!(transient.retryable);

        let permanent: JobError = Error::InvalidInput("bad".into()).into();
        assert!(!permanent.retryable);
    }

    #[test]
    fn test_shutdown_flag_is_shared() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = JobContext::new(JobId::new(), "default", 1, 0, "w", flag.clone());
        assert!(!ctx.is_shutting_down());
        flag.store(true, Ordering::Relaxed);
        assert!(ctx.is_shutting_down());
    }
}
