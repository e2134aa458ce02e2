//! All contract and signing related errors.

use bitcoin::secp256k1;

/// Enum for handling contract and signature errors.
#[derive(Debug)]
pub enum ProtocolError {
    Secp(secp256k1::Error),
    Protocol(&'static str),
    Script(bitcoin::blockdata::script::Error),
    Hash(bitcoin::hashes::FromSliceError),
    Key(bitcoin::key::FromSliceError),
    Sighash(bitcoin::transaction::InputsIndexError),
    Taproot(bitcoin::sighash::TaprootError),
    KeyAgg(musig2::errors::KeyAggError),
    Tweak(musig2::errors::TweakError),
    Signing(musig2::errors::SigningError),
    SigVerify(musig2::errors::VerifyError),
    /// A received nonce, partial signature or final signature failed to parse.
    Decode(&'static str),
}

impl From<secp256k1::Error> for ProtocolError {
    fn from(value: secp256k1::Error) -> Self {
        Self::Secp(value)
    }
}

impl From<bitcoin::blockdata::script::Error> for ProtocolError {
    fn from(value: bitcoin::blockdata::script::Error) -> Self {
        Self::Script(value)
    }
}

impl From<bitcoin::hashes::FromSliceError> for ProtocolError {
    fn from(value: bitcoin::hashes::FromSliceError) -> Self {
        Self::Hash(value)
    }
}

impl From<bitcoin::key::FromSliceError> for ProtocolError {
    fn from(value: bitcoin::key::FromSliceError) -> Self {
        Self::Key(value)
    }
}

impl From<bitcoin::transaction::InputsIndexError> for ProtocolError {
    fn from(value: bitcoin::transaction::InputsIndexError) -> Self {
        Self::Sighash(value)
    }
}

impl From<bitcoin::sighash::TaprootError> for ProtocolError {
    fn from(value: bitcoin::sighash::TaprootError) -> Self {
        Self::Taproot(value)
    }
}

impl From<musig2::errors::KeyAggError> for ProtocolError {
    fn from(value: musig2::errors::KeyAggError) -> Self {
        Self::KeyAgg(value)
    }
}

impl From<musig2::errors::TweakError> for ProtocolError {
    fn from(value: musig2::errors::TweakError) -> Self {
        Self::Tweak(value)
    }
}

impl From<musig2::errors::SigningError> for ProtocolError {
    fn from(value: musig2::errors::SigningError) -> Self {
        Self::Signing(value)
    }
}

impl From<musig2::errors::VerifyError> for ProtocolError {
    fn from(value: musig2::errors::VerifyError) -> Self {
        Self::SigVerify(value)
    }
}
