//! Bridge error types
//!
//! One top-level error for startup and supervision, converting from the
//! per-concern errors. Startup failures map onto the process exit codes the
//! operator tooling expects.

use crate::config::ConfigError;
use crate::token::{RefreshError, TokenError};
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("credential error: {0}")]
    Token(#[from] TokenError),

    #[error("token refresh error: {0}")]
    Refresh(#[from] RefreshError),

    #[error("no usable identity token: {0}")]
    NoUsableToken(String),

    #[error("local broker connect failed: {0}")]
    LocalConnect(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Process exit code for startup failures.
    ///
    /// 1 = missing/invalid credentials or configuration, 3 = local broker
    /// unreachable. Codes 2 and 4 are reserved for client allocation
    /// failure, which cannot occur: client construction is infallible.
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::LocalConnect(_) => 3,
            _ => 1,
        }
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
