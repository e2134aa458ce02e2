//! The in-memory working set of a trade in progress.
//!
//! An [ActiveSwap] is created at swap initiation (or rehydrated on
//! recovery), exclusively owned by the coordinator behind a per-trade mutex,
//! and destroyed when the trade reaches a terminal state. Everything in it
//! is either secret material that must never leave the process or cache that
//! can be recomputed from the persisted rows.

use alloy_primitives::B256;
use bitcoin::{secp256k1::SecretKey, PublicKey, ScriptBuf, XOnlyPublicKey};
use musig2::{KeyAggContext, PartialSignature, PubNonce, SecNonce};

use crate::{
    protocol::messages::{SwapMethod, TradeId},
    store::records::{LegType, TradeRole},
};

/// Our position in the sub-protocol. The initiator generates (and later
/// reveals) the hashlock secret; in MuSig2 swaps the initiator is the maker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapRole {
    Initiator,
    Responder,
}

impl From<TradeRole> for SwapRole {
    fn from(role: TradeRole) -> Self {
        match role {
            TradeRole::Maker => Self::Initiator,
            TradeRole::Taker => Self::Responder,
        }
    }
}

/// The four chain-family pairings a trade can span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SwapPair {
    BitcoinToBitcoin,
    BitcoinToEvm,
    EvmToBitcoin,
    EvmToEvm,
}

/// Per-chain MuSig2 session state. The two chains of a trade are
/// cryptographically independent: one key pair is reused, but aggregation,
/// nonces, sighashes and partial signatures are all per-chain.
#[derive(Default)]
pub struct ChainMusigData {
    pub key_agg: Option<KeyAggContext>,
    /// Tweaked output key, committed to the refund leaf.
    pub agg_xonly: Option<XOnlyPublicKey>,
    pub escrow_spk: Option<ScriptBuf>,
    pub refund_leaf: Option<ScriptBuf>,
    /// Consumed at partial signing; never cloned.
    pub sec_nonce: Option<SecNonce>,
    pub pub_nonce: Option<PubNonce>,
    pub remote_nonce: Option<PubNonce>,
    pub sighash: Option<[u8; 32]>,
    pub local_partial: Option<PartialSignature>,
    pub remote_partial: Option<PartialSignature>,
}

/// Per-chain HTLC state: the escrow location and its timelock.
#[derive(Default)]
pub struct ChainHtlcData {
    /// Bitcoin-family: the P2WSH redeem script and its script pubkey.
    pub redeem_script: Option<ScriptBuf>,
    pub escrow_spk: Option<ScriptBuf>,
    /// EVM: the contract's swap-id and the block to scan events from.
    pub evm_swap_id: Option<B256>,
    pub created_block: Option<u64>,
    pub timelock_blocks: Option<u16>,
    pub timelock_ts: Option<u64>,
}

pub struct MusigState {
    pub offer: ChainMusigData,
    pub request: ChainMusigData,
}

pub struct HtlcState {
    pub secret: Option<[u8; 32]>,
    pub secret_hash: Option<[u8; 32]>,
    pub offer: ChainHtlcData,
    pub request: ChainHtlcData,
}

/// The method-specific substructure; the method set is closed.
pub enum SwapMethodState {
    Musig2(MusigState),
    Htlc(HtlcState),
}

impl SwapMethodState {
    pub fn new(method: SwapMethod) -> Self {
        match method {
            SwapMethod::Musig2 => Self::Musig2(MusigState {
                offer: ChainMusigData::default(),
                request: ChainMusigData::default(),
            }),
            SwapMethod::Htlc => Self::Htlc(HtlcState {
                secret: None,
                secret_hash: None,
                offer: ChainHtlcData::default(),
                request: ChainHtlcData::default(),
            }),
        }
    }

    pub fn method(&self) -> SwapMethod {
        match self {
            Self::Musig2(_) => SwapMethod::Musig2,
            Self::Htlc(_) => SwapMethod::Htlc,
        }
    }
}

/// Funding bookkeeping for one side of the trade. Txids are strings because
/// either side may live on an EVM chain.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FundingSide {
    pub txid: Option<String>,
    pub vout: Option<u32>,
    pub confirms: u32,
}

/// The in-memory state of one trade in progress.
pub struct ActiveSwap {
    pub trade_id: TradeId,
    pub order_id: String,
    pub role: SwapRole,
    pub method: SwapMethodState,
    pub local_privkey: SecretKey,
    pub local_pubkey: PublicKey,
    pub remote_pubkey: Option<PublicKey>,
    pub local_funding: FundingSide,
    pub remote_funding: FundingSide,
    pub local_offer_wallet_addr: Option<String>,
    pub local_request_wallet_addr: Option<String>,
    pub remote_offer_wallet_addr: Option<String>,
    pub remote_request_wallet_addr: Option<String>,
    pub created_at: u64,
}

impl ActiveSwap {
    /// The leg this daemon funds: the initiator pays on the offer chain, the
    /// responder on the request chain.
    pub fn local_leg(&self) -> LegType {
        match self.role {
            SwapRole::Initiator => LegType::Offer,
            SwapRole::Responder => LegType::Request,
        }
    }

    /// The leg this daemon redeems from.
    pub fn remote_leg(&self) -> LegType {
        match self.role {
            SwapRole::Initiator => LegType::Request,
            SwapRole::Responder => LegType::Offer,
        }
    }

    pub fn musig(&self) -> Option<&MusigState> {
        match &self.method {
            SwapMethodState::Musig2(state) => Some(state),
            SwapMethodState::Htlc(_) => None,
        }
    }

    pub fn musig_mut(&mut self) -> Option<&mut MusigState> {
        match &mut self.method {
            SwapMethodState::Musig2(state) => Some(state),
            SwapMethodState::Htlc(_) => None,
        }
    }

    pub fn htlc(&self) -> Option<&HtlcState> {
        match &self.method {
            SwapMethodState::Htlc(state) => Some(state),
            SwapMethodState::Musig2(_) => None,
        }
    }

    pub fn htlc_mut(&mut self) -> Option<&mut HtlcState> {
        match &mut self.method {
            SwapMethodState::Htlc(state) => Some(state),
            SwapMethodState::Musig2(_) => None,
        }
    }

    /// Funding bookkeeping for a leg, by whether it is ours.
    pub fn funding_for_leg(&self, leg: LegType) -> &FundingSide {
        if leg == self.local_leg() {
            &self.local_funding
        } else {
            &self.remote_funding
        }
    }

    pub fn both_funded(&self, required_confirms: u32) -> bool {
        self.local_funding.txid.is_some()
            && self.remote_funding.txid.is_some()
            && self.local_funding.confirms >= required_confirms
            && self.remote_funding.confirms >= required_confirms
    }
}

impl MusigState {
    pub fn chain(&self, leg: LegType) -> &ChainMusigData {
        match leg {
            LegType::Offer => &self.offer,
            LegType::Request => &self.request,
        }
    }

    pub fn chain_mut(&mut self, leg: LegType) -> &mut ChainMusigData {
        match leg {
            LegType::Offer => &mut self.offer,
            LegType::Request => &mut self.request,
        }
    }

    pub fn nonces_complete(&self) -> bool {
        self.offer.pub_nonce.is_some()
            && self.offer.remote_nonce.is_some()
            && self.request.pub_nonce.is_some()
            && self.request.remote_nonce.is_some()
    }

    pub fn partials_complete(&self) -> bool {
        self.offer.local_partial.is_some()
            && self.offer.remote_partial.is_some()
            && self.request.local_partial.is_some()
            && self.request.remote_partial.is_some()
    }
}

impl HtlcState {
    pub fn chain(&self, leg: LegType) -> &ChainHtlcData {
        match leg {
            LegType::Offer => &self.offer,
            LegType::Request => &self.request,
        }
    }

    pub fn chain_mut(&mut self, leg: LegType) -> &mut ChainHtlcData {
        match leg {
            LegType::Offer => &mut self.offer,
            LegType::Request => &mut self.request,
        }
    }
}

/// The method-specific blob persisted in a swap-leg's `method_data` column.
/// Everything needed to rebuild the in-memory chain data after a restart.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct LegMethodData {
    pub escrow_spk: Option<String>,
    pub redeem_script: Option<String>,
    pub refund_leaf: Option<String>,
    pub evm_swap_id: Option<String>,
    pub created_block: Option<u64>,
    pub sender_wallet_addr: Option<String>,
    pub receiver_wallet_addr: Option<String>,
    // Public MuSig2 session material. Safe to persist (all of it is either
    // sent to the peer or recomputable); the secret nonce never is.
    pub local_nonce: Option<String>,
    pub remote_nonce: Option<String>,
    pub local_partial: Option<String>,
    pub remote_partial: Option<String>,
    pub sighash: Option<String>,
}

impl LegMethodData {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("plain string fields always serialize")
    }

    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}
