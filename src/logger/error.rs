//! # Logger Error Module
//!
//! Provides custom error types for the logger system using `thiserror` and `anyhow`.
//!
//! ## Examples
//!
//! ```rust
//! use dgfacade::logger::LoggerError;
//! use anyhow::Context;
//!
//! // Create different types of logger errors
//! let config_error = LoggerError::InvalidConfiguration("Missing log directory".to_string());
//! let init_error = LoggerError::InitializationFailed("Tracing subscriber already set".to_string());
//!
//! // Using anyhow for error context
//! # fn some_operation() -> anyhow::Result<()> { Ok(()) }
//! let result = some_operation().context("Failed to initialize logger")?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use thiserror::Error;

/// Custom error types for the logger system
#[derive(Error, Debug)]
pub enum LoggerError {
    /// Configuration validation error
    #[error("Invalid logger configuration: {0}")]
    InvalidConfiguration(String),

    /// Logger initialization error
    #[error("Logger initialization failed: {0}")]
    InitializationFailed(String),

    /// I/O related error
    #[error("Logger I/O error")]
    IoError(#[from] std::io::Error),

    /// Tracing subscriber error
    #[error("Tracing subscriber error")]
    TracingError(#[from] tracing_subscriber::util::TryInitError),

    /// Generic error with context
    #[error("Logger error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for logger operations using anyhow
pub type LoggerResult<T> = anyhow::Result<T>;

/// Validates logger configuration
pub fn validate_config(config: &crate::logger::LoggerConfig) -> LoggerResult<()> {
    use anyhow::bail;

    // Check if at least one output is enabled
    if !config.enable_console() && !config.enable_file() {
        bail!(LoggerError::InvalidConfiguration(
            "Must enable at least one of file or console logging".to_string(),
        ));
    }

    Ok(())
}


