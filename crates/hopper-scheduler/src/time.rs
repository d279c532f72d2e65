//! Sleeping and duration helpers shared by the polling loops.

use std::time::Duration;
use tokio::sync::watch;

/// Upper bound for any configured delay once it is added to a timestamp.
const MAX_OFFSET_DAYS: i64 = 365 * 100;

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::days(MAX_OFFSET_DAYS))
        .min(chrono::Duration::days(MAX_OFFSET_DAYS))
}

/// Sleep for `delay` unless shutdown is requested first.
///
/// Returns `true` when the caller should stop. A dropped sender counts as a
/// shutdown request.
pub(crate) async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.wait_for(|stop| *stop) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_chrono_caps_huge_values() {
        assert_eq!(to_chrono(Duration::from_secs(90)), chrono::Duration::seconds(90));
        assert_eq!(
            to_chrono(Duration::MAX),
            chrono::Duration::days(MAX_OFFSET_DAYS)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_interrupted_by_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { pause(Duration::from_secs(3600), &mut rx).await });
        tx.send(true).unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_runs_to_completion() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(!pause(Duration::from_millis(10), &mut rx).await);
    }

    #[tokio::test]
    async fn test_dropped_sender_stops() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(pause(Duration::from_secs(3600), &mut rx).await);
    }
}
