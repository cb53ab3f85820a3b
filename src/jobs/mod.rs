//! # Batch Jobs
//!
//! Submitted uploads are registered in the [`JobQueue`] and processed in the
//! background by the [`WorkerPool`]; clients poll the registry for results.

pub mod queue;
pub mod worker;

pub use queue::{JobQueue, TranscriptionRequest};
pub use worker::WorkerPool;
