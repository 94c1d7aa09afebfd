//! Request/response correlation over a shared broker.
//!
//! [`Gateway`] submits jobs and waits for their results; [`WorkerLoop`]
//! consumes the work queue and runs a [`Processor`] on each job.

pub mod gateway;
pub mod processor;
pub mod signal;
pub mod worker;

pub use gateway::{Gateway, GatewaySettings};
pub use processor::{DigestProcessor, ProcessingError, Processor};
pub use signal::shutdown_signal;
pub use worker::{CycleOutcome, DeadLetter, WorkerLoop, WorkerSettings, WorkerStats};
