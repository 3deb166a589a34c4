#![warn(clippy::unwrap_used)]

pub mod policy;
pub mod queue;
pub mod writer;

pub use policy::{FlushFailurePolicy, LogAndDrop};
pub use queue::{AdmissionQueue, QueueDrain};
pub use writer::{BatchWriter, WriterConfig};
