//! Contains the cryptographic sub-protocols, transaction construction and
//! wire messages shared by both sides of a swap.

pub mod contract;
pub mod error;
pub mod evm;
pub mod htlc;
pub mod messages;
pub mod musig;

pub use bitcoin::hashes::hash160::Hash as Hash160;
pub use messages::{Preimage, TradeId, PREIMAGE_LEN};
