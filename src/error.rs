//! Error types for the contract binding layer.

use thiserror::Error;

/// Failures reported by a [`Backend`](crate::ethereum::provider::Backend).
///
/// Backends only describe what went wrong on the wire; the bound contract
/// decides which [`BindError`] each one becomes for the operation in flight.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The node executed the request and it reverted.
    #[error("execution reverted: {0}")]
    Reverted(String),

    /// Any other RPC or connection failure.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// The backend cannot perform this operation (e.g. subscriptions over HTTP).
    #[error("unsupported by backend: {0}")]
    Unsupported(&'static str),

    /// The live log stream ended without an explicit error.
    #[error("subscription stream closed")]
    Closed,
}

/// Errors surfaced by bound contracts, facades and event cursors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    /// The JSON interface description could not be parsed.
    #[error("malformed ABI: {0}")]
    MalformedAbi(String),

    #[error("method '{0}' not found in contract ABI")]
    UnknownMethod(String),

    #[error("event '{0}' not found in contract ABI")]
    UnknownEvent(String),

    /// Arguments did not match the method's declared inputs.
    #[error("failed to encode arguments for '{method}': {reason}")]
    Encode { method: String, reason: String },

    /// The node reported execution failure for a read call.
    #[error("call to '{method}' reverted: {reason}")]
    CallReverted { method: String, reason: String },

    /// A read call failed for a reason other than a revert.
    #[error("call to '{method}' failed: {source}")]
    Call {
        method: String,
        #[source]
        source: BackendError,
    },

    /// The transport refused or failed to accept a transaction.
    #[error("transaction submission failed: {0}")]
    Submission(BackendError),

    /// Returned bytes or a log record did not match the declared shape.
    #[error("failed to decode '{name}': {reason}")]
    Decode { name: String, reason: String },

    /// The historical log query failed.
    #[error("log filter query failed: {0}")]
    Filter(BackendError),

    /// The live log subscription could not be opened or failed mid-stream.
    #[error("log subscription failed: {0}")]
    Subscription(BackendError),

    /// The caller's cancellation signal fired before the operation finished.
    #[error("operation cancelled")]
    Cancelled,
}

impl BindError {
    pub(crate) fn decode(name: impl Into<String>, reason: impl ToString) -> Self {
        BindError::Decode {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn encode(method: impl Into<String>, reason: impl ToString) -> Self {
        BindError::Encode {
            method: method.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for binding operations.
pub type BindResult<T> = Result<T, BindError>;
