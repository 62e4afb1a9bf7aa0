//! Core infrastructure for the midsched VLIW scheduler
//!
//! This crate provides the configuration, error handling and logging
//! infrastructure shared by the scheduler library and its driver.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, DebugConfig, LogLevel, RegisterConfig, SchedulerConfig};
pub use error::{MidschedError, Result, ScheduleError};
