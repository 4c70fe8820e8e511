use std::time::Duration;

use kvmctl_protocol::{codes, RpcError};
use thiserror::Error;

/// Errors surfaced by the pool, cache, dispatcher and hypervisor sessions.
///
/// Every variant maps to one JSON-RPC error code and a snake_case `kind`
/// carried in `error.data`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid params: {0}")]
    Validation(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("VM {0} not found")]
    VmNotFound(String),

    #[error("VM {0} already exists")]
    VmAlreadyExists(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("no hypervisor connection to {uri} became available within {timeout:?}")]
    PoolExhausted { uri: String, timeout: Duration },

    #[error("hypervisor connection to {uri} is broken: {reason}")]
    ConnectionBroken { uri: String, reason: String },

    #[error("connection pool for {0} is closed")]
    PoolClosed(String),

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn code(&self) -> i64 {
        match self {
            Error::Validation(_) => codes::INVALID_PARAMS,
            Error::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            Error::VmNotFound(_) => codes::VM_NOT_FOUND,
            Error::VmAlreadyExists(_) => codes::VM_ALREADY_EXISTS,
            Error::InvalidState(_) => codes::INVALID_STATE,
            Error::PoolExhausted { .. } => codes::POOL_EXHAUSTED,
            Error::ConnectionBroken { .. } => codes::CONNECTION_BROKEN,
            Error::PoolClosed(_) | Error::ShuttingDown => codes::UNAVAILABLE,
            Error::Hypervisor(_) => codes::HYPERVISOR_ERROR,
            Error::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::MethodNotFound(_) => "method_not_found",
            Error::VmNotFound(_) => "vm_not_found",
            Error::VmAlreadyExists(_) => "vm_already_exists",
            Error::InvalidState(_) => "invalid_state",
            Error::PoolExhausted { .. } => "pool_exhausted",
            Error::ConnectionBroken { .. } => "connection_broken",
            Error::PoolClosed(_) => "pool_closed",
            Error::ShuttingDown => "shutting_down",
            Error::Hypervisor(_) => "hypervisor_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// True when the session that produced this error can no longer be used.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Error::ConnectionBroken { .. })
    }

    pub fn to_rpc(&self) -> RpcError {
        RpcError::new(self.code(), self.to_string()).with_kind(self.kind())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization failed: {e}"))
    }
}
