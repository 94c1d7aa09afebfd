pub mod config;
pub mod error;
pub mod job;
pub mod layout;

pub use config::Config;
pub use error::CourierError;
pub use job::{Job, JobId, JobResult, Prediction};
pub use layout::KeyLayout;
