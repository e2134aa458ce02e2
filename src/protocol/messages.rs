//! Swap Protocol Messages.
//!
//! Messages are exchanged between exactly two peers per trade. Every message
//! travels inside a [MessageEnvelope] carrying the protocol version, the
//! trade-id it belongs to, the sender's peer-id and a timestamp; the payload
//! is one of the ten recognized kinds.
//!
//! The canonical wire format is compact JSON. Byte-string fields (public
//! keys, nonces, partial signatures, hashes, preimages) are hex-encoded with
//! fixed lengths which are enforced on receive, before any payload reaches
//! the coordinator.
//!
//! The order_* kinds ride the broadcast transport; everything else is sent
//! over the direct per-peer stream, with broadcast as best-effort fallback.

use std::fmt::Display;

use bitcoin::secp256k1::rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use super::error::ProtocolError;
use crate::utill::{from_hex, now_ts};

/// Current version of the swap wire protocol.
pub const PROTOCOL_VERSION: u32 = 1;

/// Defines the length of the hashlock preimage.
pub const PREIMAGE_LEN: usize = 32;

/// Type for the hashlock preimage.
pub type Preimage = [u8; PREIMAGE_LEN];

/// Serialized length of a MuSig2 public nonce (two compressed points).
pub const PUB_NONCE_LEN: usize = 66;

/// Serialized length of a MuSig2 partial signature.
pub const PARTIAL_SIG_LEN: usize = 32;

/// Serialized length of a compressed secp256k1 public key.
pub const PUBKEY_LEN: usize = 33;

/// Globally unique 128-bit trade identifier, hex-encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TradeId(u128);

impl TradeId {
    /// Generate a fresh random identifier.
    pub fn new_random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(u128::from_be_bytes(bytes))
    }

    pub fn from_hex(hex: &str) -> Result<Self, &'static str> {
        if hex.len() != 32 {
            return Err("trade id must be 32 hex characters");
        }
        let raw = u128::from_str_radix(hex, 16).map_err(|_| "invalid trade id hex")?;
        Ok(Self(raw))
    }

    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }
}

impl Display for TradeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl std::str::FromStr for TradeId {
    type Err = &'static str;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for TradeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TradeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

/// The two interchangeable atomicity methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapMethod {
    Musig2,
    Htlc,
}

impl Display for SwapMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Musig2 => write!(f, "musig2"),
            Self::Htlc => write!(f, "htlc"),
        }
    }
}

/// An order advertisement as it travels on the broadcast transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderInfo {
    pub order_id: String,
    pub maker_peer_id: String,
    pub offer_chain: String,
    #[serde(with = "crate::utill::amount_string")]
    pub offer_amount: u128,
    pub request_chain: String,
    #[serde(with = "crate::utill::amount_string")]
    pub request_amount: u128,
    pub method: SwapMethod,
    pub created_at: u64,
}

/// Broadcast: withdraw a previously announced order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancel {
    pub order_id: String,
}

/// Broadcast: a taker commits to an order, opening a trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTake {
    pub trade_id: TradeId,
    pub order_id: String,
    pub taker_peer_id: String,
    pub method: SwapMethod,
    #[serde(with = "crate::utill::amount_string")]
    pub offer_amount: u128,
    #[serde(with = "crate::utill::amount_string")]
    pub request_amount: u128,
}

/// Direct: the sender's swap public key and its wallet addresses on both chains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubkeyExchange {
    pub pubkey_hex: String,
    pub offer_wallet_addr: String,
    pub request_wallet_addr: String,
}

/// Direct: one MuSig2 public nonce per chain, 66 bytes each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceExchange {
    pub offer_nonce_hex: String,
    pub request_nonce_hex: String,
}

/// Direct: the sender's funding transaction outpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingInfo {
    pub txid: String,
    pub vout: u32,
}

/// Direct: one MuSig2 partial signature per chain, 32 bytes each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSigExchange {
    pub offer_partial_sig_hex: String,
    pub request_partial_sig_hex: String,
}

/// Direct: the HTLC initiator's hashlock, swap key and wallet addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcSecretHash {
    pub secret_hash_hex: String,
    pub pubkey_hex: String,
    pub offer_wallet_addr: String,
    pub request_wallet_addr: String,
}

/// Direct: the revealed hashlock preimage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcSecretReveal {
    pub secret_hex: String,
}

/// Direct: notification that an HTLC output was claimed on a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcClaim {
    pub chain: String,
    pub txid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_hex: Option<String>,
}

/// The ten recognized message kinds, adjacently tagged so the envelope's
/// `type` and `payload` fields match the wire table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SwapMessage {
    OrderAnnounce(OrderInfo),
    OrderCancel(OrderCancel),
    OrderTake(OrderTake),
    PubkeyExchange(PubkeyExchange),
    NonceExchange(NonceExchange),
    FundingInfo(FundingInfo),
    PartialSig(PartialSigExchange),
    HtlcSecretHash(HtlcSecretHash),
    HtlcSecretReveal(HtlcSecretReveal),
    HtlcClaim(HtlcClaim),
}

impl Display for SwapMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OrderAnnounce(_) => write!(f, "OrderAnnounce"),
            Self::OrderCancel(_) => write!(f, "OrderCancel"),
            Self::OrderTake(_) => write!(f, "OrderTake"),
            Self::PubkeyExchange(_) => write!(f, "PubkeyExchange"),
            Self::NonceExchange(_) => write!(f, "NonceExchange"),
            Self::FundingInfo(_) => write!(f, "FundingInfo"),
            Self::PartialSig(_) => write!(f, "PartialSig"),
            Self::HtlcSecretHash(_) => write!(f, "HtlcSecretHash"),
            Self::HtlcSecretReveal(_) => write!(f, "HtlcSecretReveal"),
            Self::HtlcClaim(_) => write!(f, "HtlcClaim"),
        }
    }
}

/// The tagged envelope every swap message travels in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub version: u32,
    pub trade_id: TradeId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub order_id: Option<String>,
    pub from_peer: String,
    pub timestamp: u64,
    #[serde(flatten)]
    pub payload: SwapMessage,
}

impl MessageEnvelope {
    pub fn new(trade_id: TradeId, from_peer: &str, payload: SwapMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            trade_id,
            order_id: None,
            from_peer: from_peer.to_string(),
            timestamp: now_ts(),
            payload,
        }
    }

    pub fn with_order_id(mut self, order_id: &str) -> Self {
        self.order_id = Some(order_id.to_string());
        self
    }

    /// Enforce version and fixed byte lengths before the payload reaches the
    /// coordinator. Any violation here is the counterparty's fault.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::Protocol("unsupported protocol version"));
        }
        match &self.payload {
            SwapMessage::PubkeyExchange(m) => {
                check_hex_len(&m.pubkey_hex, PUBKEY_LEN, "pubkey must be 33 bytes")?;
            }
            SwapMessage::NonceExchange(m) => {
                check_hex_len(&m.offer_nonce_hex, PUB_NONCE_LEN, "nonce must be 66 bytes")?;
                check_hex_len(&m.request_nonce_hex, PUB_NONCE_LEN, "nonce must be 66 bytes")?;
            }
            SwapMessage::PartialSig(m) => {
                check_hex_len(
                    &m.offer_partial_sig_hex,
                    PARTIAL_SIG_LEN,
                    "partial sig must be 32 bytes",
                )?;
                check_hex_len(
                    &m.request_partial_sig_hex,
                    PARTIAL_SIG_LEN,
                    "partial sig must be 32 bytes",
                )?;
            }
            SwapMessage::HtlcSecretHash(m) => {
                check_hex_len(&m.secret_hash_hex, 32, "secret hash must be 32 bytes")?;
                check_hex_len(&m.pubkey_hex, PUBKEY_LEN, "pubkey must be 33 bytes")?;
            }
            SwapMessage::HtlcSecretReveal(m) => {
                check_hex_len(&m.secret_hex, PREIMAGE_LEN, "secret must be 32 bytes")?;
            }
            SwapMessage::HtlcClaim(m) => {
                if let Some(secret) = &m.secret_hex {
                    check_hex_len(secret, PREIMAGE_LEN, "secret must be 32 bytes")?;
                }
            }
            SwapMessage::OrderAnnounce(_)
            | SwapMessage::OrderCancel(_)
            | SwapMessage::OrderTake(_)
            | SwapMessage::FundingInfo(_) => {}
        }
        Ok(())
    }
}

fn check_hex_len(hex: &str, bytes: usize, reason: &'static str) -> Result<(), ProtocolError> {
    let decoded = from_hex(hex).map_err(ProtocolError::Protocol)?;
    if decoded.len() != bytes {
        return Err(ProtocolError::Protocol(reason));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn dummy_envelope(payload: SwapMessage) -> MessageEnvelope {
        MessageEnvelope::new(TradeId::new_random(), "12D3KooWPeerA", payload)
    }

    #[test]
    fn test_trade_id_hex_roundtrip() {
        let id = TradeId::new_random();
        assert_eq!(TradeId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(TradeId::from_hex("abcd").is_err());
        assert!(TradeId::from_hex(&"g".repeat(32)).is_err());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = dummy_envelope(SwapMessage::FundingInfo(FundingInfo {
            txid: "aa".repeat(32),
            vout: 1,
        }));
        let json: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "funding_info");
        assert_eq!(json["payload"]["vout"], 1);
        assert_eq!(json["version"], 1);
        assert!(json.get("order_id").is_none());

        let back: MessageEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_all_kinds_roundtrip() {
        let kinds = vec![
            SwapMessage::OrderAnnounce(OrderInfo {
                order_id: "ord-1".into(),
                maker_peer_id: "peerA".into(),
                offer_chain: "BTC".into(),
                offer_amount: 100_000,
                request_chain: "LTC".into(),
                request_amount: 5_000_000_000,
                method: SwapMethod::Musig2,
                created_at: 1_700_000_000,
            }),
            SwapMessage::OrderCancel(OrderCancel {
                order_id: "ord-1".into(),
            }),
            SwapMessage::OrderTake(OrderTake {
                trade_id: TradeId::new_random(),
                order_id: "ord-1".into(),
                taker_peer_id: "peerB".into(),
                method: SwapMethod::Htlc,
                offer_amount: 20_000_000,
                request_amount: 1_000_000_000_000_000_000,
            }),
            SwapMessage::PubkeyExchange(PubkeyExchange {
                pubkey_hex: "02".repeat(33)[..66].to_string(),
                offer_wallet_addr: "bcrt1qaddr".into(),
                request_wallet_addr: "0xabc".into(),
            }),
            SwapMessage::NonceExchange(NonceExchange {
                offer_nonce_hex: "03".repeat(66),
                request_nonce_hex: "02".repeat(66),
            }),
            SwapMessage::FundingInfo(FundingInfo {
                txid: "bb".repeat(32),
                vout: 0,
            }),
            SwapMessage::PartialSig(PartialSigExchange {
                offer_partial_sig_hex: "11".repeat(32),
                request_partial_sig_hex: "22".repeat(32),
            }),
            SwapMessage::HtlcSecretHash(HtlcSecretHash {
                secret_hash_hex: "33".repeat(32),
                pubkey_hex: "02".repeat(33)[..66].to_string(),
                offer_wallet_addr: "addr1".into(),
                request_wallet_addr: "addr2".into(),
            }),
            SwapMessage::HtlcSecretReveal(HtlcSecretReveal {
                secret_hex: "44".repeat(32),
            }),
            SwapMessage::HtlcClaim(HtlcClaim {
                chain: "ETH".into(),
                txid: "cc".repeat(32),
                secret_hex: Some("55".repeat(32)),
            }),
        ];

        for payload in kinds {
            let envelope = dummy_envelope(payload);
            let encoded = serde_json::to_vec(&envelope).unwrap();
            let decoded: MessageEnvelope = serde_json::from_slice(&encoded).unwrap();
            assert_eq!(decoded, envelope);
            decoded.validate().unwrap();
        }
    }

    #[test]
    fn test_nonce_length_boundary() {
        for bad in ["03", &"03".repeat(65), &"03".repeat(67)] {
            let envelope = dummy_envelope(SwapMessage::NonceExchange(NonceExchange {
                offer_nonce_hex: bad.to_string(),
                request_nonce_hex: "02".repeat(66),
            }));
            assert!(envelope.validate().is_err(), "accepted nonce of {}", bad);
        }
    }

    #[test]
    fn test_version_enforced() {
        let mut envelope = dummy_envelope(SwapMessage::OrderCancel(OrderCancel {
            order_id: "x".into(),
        }));
        envelope.version = 2;
        assert!(envelope.validate().is_err());
    }
}
