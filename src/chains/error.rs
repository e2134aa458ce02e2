//! All chain backend related errors.

/// Enum to handle backend client errors. Everything here is transient from
/// the coordinator's point of view: no trade state changes on a backend
/// error alone.
#[derive(Debug)]
pub enum BackendError {
    Http(minreq::Error),
    /// A JSON-RPC error object returned by an EVM node.
    Rpc {
        code: i64,
        message: String,
    },
    Json(serde_json::Error),
    Consensus(bitcoin::consensus::encode::Error),
    InvalidResponse(&'static str),
    UnknownChain(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for BackendError {}

impl From<minreq::Error> for BackendError {
    fn from(value: minreq::Error) -> Self {
        Self::Http(value)
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<bitcoin::consensus::encode::Error> for BackendError {
    fn from(value: bitcoin::consensus::encode::Error) -> Self {
        Self::Consensus(value)
    }
}
