//! Shared configuration and error types for the taskrun workspace.

pub mod config;
pub mod error;

pub use config::{TaskrunConfig, SchedulerConfig};
pub use error::{Result, TaskrunError};
