#![warn(clippy::unwrap_used)]

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;
pub use store::EventStore;
