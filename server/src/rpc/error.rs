use shared::rpc::Status;
use thiserror::Error;

/// Outcome of a remote call that did not produce a value.
///
/// `NotFound` is an expected answer ("no such player", "no savegame with
/// that code"), not a fault. The other variants are genuine failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("not found")]
    NotFound,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("service error: {0}")]
    Service(String),
}

impl RpcError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::NotFound)
    }
}

impl From<Status> for RpcError {
    fn from(status: Status) -> Self {
        match status {
            Status::NotFound => RpcError::NotFound,
            Status::Unavailable(reason) => RpcError::Transport(reason),
            Status::Internal(reason) => RpcError::Service(reason),
        }
    }
}

pub type RpcResult<T> = Result<T, RpcError>;
