//! Error taxonomy shared by every layer of the engine.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type NetResult<T> = std::result::Result<T, NetError>;

/// Failure raised while building or executing a graph.
///
/// Only [`NetError::Allocation`] is recoverable: the caller may shrink its batch and retry.
/// Every other variant means the graph (or the caller's use of it) is broken and should not
/// be driven further.
#[derive(Debug, Error)]
pub enum NetError {
    /// Malformed or inconsistent description.
    #[error("graph error in '{stage}': {message}")]
    Graph { stage: String, message: String },

    /// Rank or dimension violation at reshape or connection time.
    #[error("shape error: {0}")]
    Shape(String),

    /// Host or device memory could not be provided.
    #[error("allocation error: {0}")]
    Allocation(String),

    /// Operation invoked on an element type (or input) that does not support it.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Device-side access requested without an attached device.
    #[error("no device available: {0}")]
    NoDevice(String),

    /// Description or stage parameter block could not be decoded.
    #[error("description error in '{stage}': {source}")]
    Description {
        stage: String,
        #[source]
        source: serde_json::Error,
    },
}

impl NetError {
    pub fn graph(stage: impl Into<String>, message: impl Into<String>) -> Self {
        NetError::Graph {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn shape(message: impl Into<String>) -> Self {
        NetError::Shape(message.into())
    }

    pub fn allocation(message: impl Into<String>) -> Self {
        NetError::Allocation(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        NetError::UnsupportedOperation(message.into())
    }

    pub fn no_device(message: impl Into<String>) -> Self {
        NetError::NoDevice(message.into())
    }

    /// Reports whether the caller can react to the failure and retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, NetError::Allocation(_))
    }
}

/// Early-returns a [`NetError::Shape`] unless the condition holds.
macro_rules! ensure_shape {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::NetError::shape(format!($($arg)+)));
        }
    };
}

/// Early-returns a [`NetError::Graph`] for `stage` unless the condition holds.
macro_rules! ensure_graph {
    ($cond:expr, $stage:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::NetError::graph($stage, format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_graph;
pub(crate) use ensure_shape;
