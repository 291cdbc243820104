//! Engine Error Taxonomy
//!
//! Four classes of failure cross crate boundaries:
//! - `User`: fatal errors caused by user input (bad range step, null for a
//!   required field, mismatched types). Carries a formatted message with the
//!   offending key, path, or partition index when available.
//! - `Structural`: violated internal invariants (partitioner misassignment,
//!   non-monotone keys). These indicate a bug, not bad data.
//! - `Codec` / `Json` / `Io`: (de)serialization failures.
//!
//! Element-level missingness is NOT an error; it propagates through the
//! missing-bit channel and never raises.

use std::fmt;

/// Error type shared by all Strata crates.
#[derive(Debug)]
pub enum EngineError {
    /// Fatal user-input error with a formatted message
    User(String),
    /// Violated internal invariant (a bug, not bad data)
    Structural(String),
    /// Row codec failure (framing, compression)
    Codec(String),
    /// JSON import/export failure
    Json(String),
    /// Filesystem failure
    Io(std::io::Error),
}

impl EngineError {
    /// Fatal user error, `format!`-style.
    pub fn user(msg: impl Into<String>) -> Self {
        EngineError::User(msg.into())
    }

    /// Internal invariant violation.
    pub fn structural(msg: impl Into<String>) -> Self {
        EngineError::Structural(msg.into())
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::User(msg) => write!(f, "{}", msg),
            EngineError::Structural(msg) => write!(f, "internal invariant violated: {}", msg),
            EngineError::Codec(msg) => write!(f, "codec error: {}", msg),
            EngineError::Json(msg) => write!(f, "json error: {}", msg),
            EngineError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e)
    }
}
