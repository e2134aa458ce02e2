//! All wallet related errors.

#[derive(Debug)]
pub enum WalletError {
    File(std::io::Error),
    BIP32(bitcoin::bip32::Error),
    BIP39(bip39::Error),
    Secp(bitcoin::secp256k1::Error),
    Backend(crate::chains::error::BackendError),
    Store(crate::store::error::StoreError),
    Protocol(crate::protocol::error::ProtocolError),
    /// Not enough confirmed coins to fund the requested amount plus fees.
    InsufficientFunds {
        required: u64,
        available: u64,
    },
    General(&'static str),
}

impl std::fmt::Display for WalletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for WalletError {}

impl From<std::io::Error> for WalletError {
    fn from(value: std::io::Error) -> Self {
        Self::File(value)
    }
}

impl From<bitcoin::bip32::Error> for WalletError {
    fn from(value: bitcoin::bip32::Error) -> Self {
        Self::BIP32(value)
    }
}

impl From<bip39::Error> for WalletError {
    fn from(value: bip39::Error) -> Self {
        Self::BIP39(value)
    }
}

impl From<bitcoin::secp256k1::Error> for WalletError {
    fn from(value: bitcoin::secp256k1::Error) -> Self {
        Self::Secp(value)
    }
}

impl From<crate::chains::error::BackendError> for WalletError {
    fn from(value: crate::chains::error::BackendError) -> Self {
        Self::Backend(value)
    }
}

impl From<crate::store::error::StoreError> for WalletError {
    fn from(value: crate::store::error::StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<crate::protocol::error::ProtocolError> for WalletError {
    fn from(value: crate::protocol::error::ProtocolError) -> Self {
        Self::Protocol(value)
    }
}
