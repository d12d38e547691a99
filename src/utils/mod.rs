//! Shared building blocks: the error type, logging setup, timestamp
//! helpers and the tick/source data model.

pub mod error;
mod logging;
pub mod time;
pub mod types;

pub use error::{Error, ProviderFailure, Result};
pub use logging::{init_logging, init_test_logging};
