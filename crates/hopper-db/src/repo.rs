//! Store trait and implementations.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;
pub use store::{JobStore, RecurringFire, Transition};
