#![warn(clippy::unwrap_used)]

pub mod config;
pub mod dedup;
pub mod error;
pub mod types;

pub use config::AppConfig;
pub use error::{IngestError, IngestResult};
pub use types::{Event, GroupBy, MetricsQuery, MetricsRequest, MetricsResult};
