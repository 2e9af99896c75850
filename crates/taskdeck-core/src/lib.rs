//! # Taskdeck Core
//!
//! Configuration and the error taxonomy shared by the scheduler engine and the CLI.

pub mod config;
pub mod error;

pub use config::TaskdeckConfig;
pub use error::{Result, TaskdeckError};
