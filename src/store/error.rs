//! All persistence gateway errors.

/// Enum to handle store-related errors.
#[derive(Debug)]
pub enum StoreError {
    File(std::io::Error),
    Cbor(serde_cbor::Error),
    /// A write attempted to create a row that already exists.
    Duplicate(&'static str),
    /// The row being read or written does not exist.
    NotFound(&'static str),
    /// A write violated a gateway invariant (terminal freeze, two-legs rule,
    /// secret hash mismatch, illegal state edge).
    Invariant(&'static str),
    MutexPoison,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::File(value)
    }
}

impl From<serde_cbor::Error> for StoreError {
    fn from(value: serde_cbor::Error) -> Self {
        Self::Cbor(value)
    }
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::MutexPoison
    }
}
