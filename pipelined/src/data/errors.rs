use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("no free table in the {0} stage")]
    TableExhausted(&'static str),
    #[error("app {0} is not registered")]
    NotRegistered(String),
    #[error("app {0} is already registered")]
    AlreadyRegistered(String),
    #[error("unknown app {0}")]
    UnknownApp(String),
    #[error("scratch table pool exhausted")]
    ScratchExhausted,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QosError {
    #[error("maximum id allocation exceeded")]
    MaxIdAllocationExceeded,
    #[error("qos backend failure: {0}")]
    Backend(String),
}

/// Errors surfaced to an RPC caller as a status rather than a result code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("unavailable: {0}")]
    Unavailable(String),
}
