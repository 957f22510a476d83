//! Engine error kinds
//!
//! `EngineError` is the framework-level channel: anything carried here
//! propagates past every Case/Suite boundary up to the Program. Test-body
//! outcomes travel through [`Signal`](crate::models::Signal) instead.

use std::time::Duration;

use thiserror::Error;

/// Errors that abort the run instead of being recorded as outcomes
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Fatal signal from {origin}: {message}")]
    Fatal { origin: String, message: String },

    #[error("Framework error in {point} of {entity}: {source}")]
    Framework {
        point: &'static str,
        entity: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Programming error: {0}")]
    Misuse(String),

    #[error("Worker for {id} was not released within {timeout:?}")]
    ReleaseTimeout { id: String, timeout: Duration },

    #[error("Capability '{capability}' requested after the registry was cleared")]
    RegistryCleared { capability: String },

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Worker process error: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl EngineError {
    pub fn fatal(origin: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Fatal {
            origin: origin.into(),
            message: message.into(),
        }
    }

    pub fn misuse(message: impl Into<String>) -> Self {
        EngineError::Misuse(message.into())
    }

    /// Whether this error came from an explicit abort rather than a broken hook
    pub fn is_fatal_signal(&self) -> bool {
        matches!(self, EngineError::Fatal { .. })
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
