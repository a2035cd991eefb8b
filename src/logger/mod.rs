//! # Logger Module
//!
//! Provides structured logging capabilities with flexible configuration options.
//!
//! ## Features
//!
//! - Structured logging with tracing
//! - File and console output support
//! - Configurable log levels and formatting
//! - Rolling file appenders
//! - Async-friendly logging
//! - Custom error types
//!
//! ## Examples
//!
//! ```rust,no_run
//! use dgfacade::logger;
//! use tracing::{info, error};
//!
//! # fn main() -> anyhow::Result<()> {
//! // Initialize with default configuration
//! logger::init_with_default()?;
//!
//! // Log structured data
//! info!(
//!     user_id = 12345,
//!     action = "login",
//!     ip = "192.168.1.1",
//!     "User performed action"
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ```rust,no_run
//! use dgfacade::logger;
//! use tracing::info;
//!
//! # fn main() -> anyhow::Result<()> {
//! // Custom configuration
//! let config = logger::LoggerConfig::builder()
//!     .default_level(tracing::Level::DEBUG)
//!     .log_dir("custom_logs")
//!     .enable_console(true)
//!     .enable_file(false)
//!     .build();
//!
//! logger::init(config)?;
//! info!("Logger configured successfully");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod init;

// Re-export main types and functions
pub use config::*;
pub use error::*;
pub use init::*;


