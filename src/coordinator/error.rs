//! All coordinator errors, grouped by the fault they represent.
//!
//! Preconditions are the caller's fault and surface over RPC. Protocol
//! violations are the counterparty's fault: they are logged, fail the trade
//! and are never retried. Backend, messenger and store failures are
//! transient and never change trade state on their own. Invariant breaches
//! halt automatic action for the trade and preserve state for forensics.

use crate::{
    chains::error::BackendError, error::NetError, messenger::MessengerError,
    protocol::error::ProtocolError, store::error::StoreError, store::records::TradeState,
    wallet::error::WalletError,
};

/// Caller-fault failures.
#[derive(Debug, PartialEq, Eq)]
pub enum PreconditionFailure {
    DuplicateSwap,
    MissingPubKey,
    MissingNonce,
    MissingSecretHash,
    MissingPartialSig,
    MissingFunding,
    WalletLocked,
    NotOurOrder,
    UnknownTrade,
    UnknownOrder,
    UnknownChain(String),
    InvalidOffer(&'static str),
    /// The trade is in the wrong state for the attempted action.
    InvalidState {
        state: TradeState,
        action: &'static str,
    },
    /// HTLC-only operation on a MuSig2 trade or vice versa.
    MethodMismatch,
}

/// Counterparty-fault failures.
#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolViolation {
    PubKeyMismatch,
    InvalidNonce,
    SighashMismatch,
    InvalidPartialSig,
    SecretHashMismatch,
    PeerProtocolViolation(&'static str),
}

#[derive(Debug)]
pub enum CoordinatorError {
    Precondition(PreconditionFailure),
    Protocol(ProtocolViolation),
    /// A message arrived before its precondition transition; the sender will
    /// resend after our next local advance, so this is only a diagnostic.
    PreconditionNotMet(&'static str),
    Crypto(ProtocolError),
    Backend(BackendError),
    Messenger(MessengerError),
    Store(StoreError),
    Wallet(WalletError),
    Net(NetError),
    Invariant(&'static str),
    MutexPoison,
}

impl CoordinatorError {
    /// The stable JSON-RPC error code this failure surfaces as.
    pub fn rpc_error_code(&self) -> i64 {
        match self {
            Self::Precondition(_) | Self::PreconditionNotMet(_) | Self::Protocol(_) => -32602,
            _ => -32603,
        }
    }

    /// Whether a handler should fail the trade over this error.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for CoordinatorError {}

impl From<PreconditionFailure> for CoordinatorError {
    fn from(value: PreconditionFailure) -> Self {
        Self::Precondition(value)
    }
}

impl From<ProtocolViolation> for CoordinatorError {
    fn from(value: ProtocolViolation) -> Self {
        Self::Protocol(value)
    }
}

impl From<ProtocolError> for CoordinatorError {
    fn from(value: ProtocolError) -> Self {
        Self::Crypto(value)
    }
}

impl From<BackendError> for CoordinatorError {
    fn from(value: BackendError) -> Self {
        Self::Backend(value)
    }
}

impl From<MessengerError> for CoordinatorError {
    fn from(value: MessengerError) -> Self {
        Self::Messenger(value)
    }
}

impl From<StoreError> for CoordinatorError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<WalletError> for CoordinatorError {
    fn from(value: WalletError) -> Self {
        Self::Wallet(value)
    }
}

impl From<NetError> for CoordinatorError {
    fn from(value: NetError) -> Self {
        Self::Net(value)
    }
}

impl From<std::io::Error> for CoordinatorError {
    fn from(value: std::io::Error) -> Self {
        Self::Net(NetError::IO(value))
    }
}

impl<T> From<std::sync::PoisonError<T>> for CoordinatorError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::MutexPoison
    }
}
