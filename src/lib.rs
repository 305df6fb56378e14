pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod services;

pub use config::RuntimeConfig;
pub use error::{ConsumerError, ProcessingError, Result};
pub use metrics::{ConsumerMetrics, UnitOutcome};
pub use services::*;
