//! Storage layer: the [`SchedulerStore`] trait and its implementations.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::InMemorySchedulerStore;
pub use postgres::PostgresSchedulerStore;
pub use store::{RunRequest, SchedulerStore, StoreError};
