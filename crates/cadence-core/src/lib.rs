//! `cadence-core`: configuration, process-level errors and small text
//! helpers shared by the scheduler and the gateway binary.

pub mod config;
pub mod error;
pub mod truncate;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
