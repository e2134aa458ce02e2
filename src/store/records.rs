//! Persistent row types of the swap store.
//!
//! All records are keyed by trade-id (orders by order-id, peers by peer-id).
//! The rows are the durable projection of a swap; everything the coordinator
//! needs to resume after a restart lives here, never in memory alone.

use serde::{Deserialize, Serialize};

use crate::protocol::messages::{MessageEnvelope, OrderInfo, SwapMethod, TradeId};
use crate::utill::now_ts;

/// Which side of the trade this daemon is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeRole {
    Maker,
    Taker,
}

/// Lifecycle of a trade. Transitions only along the state machine edges;
/// the four terminal states freeze the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeState {
    Init,
    Accepted,
    Funding,
    Funded,
    Redeemed,
    Refunded,
    Failed,
    Aborted,
}

impl TradeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Redeemed | Self::Refunded | Self::Failed | Self::Aborted
        )
    }

    /// The permitted forward edges of the trade state machine.
    pub fn can_advance_to(&self, next: TradeState) -> bool {
        use TradeState::*;
        match (self, next) {
            (Init, Accepted) => true,
            (Accepted, Funding) => true,
            (Funding, Funded) => true,
            (Funded, Redeemed) => true,
            // Refund is reachable from any non-terminal state with on-chain
            // exposure, and also from Init/Accepted when a leg was pre-funded
            // out of order. A failed trade may still resolve to refunded once
            // its script-path refunds land.
            (Init | Accepted | Funding | Funded | Failed, Refunded) => true,
            (Init | Accepted | Funding | Funded, Failed) => true,
            (Init | Accepted, Aborted) => true,
            _ => false,
        }
    }

    fn happy_rank(&self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Accepted => 1,
            Self::Funding => 2,
            Self::Funded => 3,
            Self::Redeemed => 4,
            Self::Refunded | Self::Failed | Self::Aborted => 5,
        }
    }
}

impl std::fmt::Display for TradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Accepted => "accepted",
            Self::Funding => "funding",
            Self::Funded => "funded",
            Self::Redeemed => "redeemed",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// The negotiation envelope of one swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub order_id: String,
    pub maker_peer_id: String,
    pub taker_peer_id: String,
    pub our_role: TradeRole,
    pub method: SwapMethod,
    pub state: TradeState,
    pub offer_chain: String,
    #[serde(with = "crate::utill::amount_string")]
    pub offer_amount: u128,
    pub request_chain: String,
    #[serde(with = "crate::utill::amount_string")]
    pub request_amount: u128,
    pub maker_pubkey: Option<String>,
    pub taker_pubkey: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub completed_at: Option<u64>,
    pub failure_reason: Option<String>,
}

impl Trade {
    pub fn new(
        id: TradeId,
        order: &OrderInfo,
        taker_peer_id: &str,
        our_role: TradeRole,
        method: SwapMethod,
    ) -> Self {
        let now = now_ts();
        Self {
            id,
            order_id: order.order_id.clone(),
            maker_peer_id: order.maker_peer_id.clone(),
            taker_peer_id: taker_peer_id.to_string(),
            our_role,
            method,
            state: TradeState::Init,
            offer_chain: order.offer_chain.clone(),
            offer_amount: order.offer_amount,
            request_chain: order.request_chain.clone(),
            request_amount: order.request_amount,
            maker_pubkey: None,
            taker_pubkey: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failure_reason: None,
        }
    }

    /// The monotone join of the two leg states, never regressing below the
    /// current trade state.
    pub fn join_leg_states(current: TradeState, offer: LegState, request: LegState) -> TradeState {
        let joined = match (offer, request) {
            (LegState::Redeemed, LegState::Redeemed) => TradeState::Redeemed,
            (LegState::Refunded, other) | (other, LegState::Refunded) if other.is_terminal() => {
                TradeState::Refunded
            }
            (LegState::Failed, _) | (_, LegState::Failed) => TradeState::Failed,
            (LegState::Funded, LegState::Funded)
            | (LegState::Funded, LegState::Redeemed)
            | (LegState::Redeemed, LegState::Funded) => TradeState::Funded,
            (offer, request)
                if matches!(offer, LegState::Funding | LegState::Funded)
                    || matches!(request, LegState::Funding | LegState::Funded) =>
            {
                TradeState::Funding
            }
            _ => current,
        };
        if joined.happy_rank() > current.happy_rank() {
            joined
        } else {
            current
        }
    }
}

/// Which chain of the pair a leg covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegType {
    Offer,
    Request,
}

/// Whether we fund (send) or redeem (receive) on this leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegRole {
    Sender,
    Receiver,
}

/// Lifecycle of one chain's side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegState {
    Init,
    Pending,
    Funding,
    Funded,
    Redeemed,
    Refunded,
    Failed,
}

impl LegState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Redeemed | Self::Refunded | Self::Failed)
    }
}

/// The persistent projection of one chain's side of a trade. The
/// `method_data` blob carries method-specific detail (escrow script, EVM
/// swap-id) so new methods need no schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapLeg {
    pub trade_id: TradeId,
    pub leg_type: LegType,
    pub chain: String,
    pub our_role: LegRole,
    pub state: LegState,
    pub funding_txid: Option<String>,
    pub funding_vout: Option<u32>,
    pub funding_confirms: u32,
    pub funding_address: Option<String>,
    pub redeem_txid: Option<String>,
    pub refund_txid: Option<String>,
    /// Relative timeout in blocks (Bitcoin-family legs).
    pub timeout_height: Option<u32>,
    /// Absolute unix timeout (EVM legs).
    pub timeout_timestamp: Option<u64>,
    pub method_data: Option<String>,
}

impl SwapLeg {
    pub fn new(trade_id: TradeId, leg_type: LegType, chain: &str, our_role: LegRole) -> Self {
        Self {
            trade_id,
            leg_type,
            chain: chain.to_string(),
            our_role,
            state: LegState::Init,
            funding_txid: None,
            funding_vout: None,
            funding_confirms: 0,
            funding_address: None,
            redeem_txid: None,
            refund_txid: None,
            timeout_height: None,
            timeout_timestamp: None,
            method_data: None,
        }
    }
}

/// Who generated a hashlock secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretOrigin {
    Us,
    Them,
}

/// The hashlock preimage and/or hash of an HTLC trade. The counterparty's
/// EVM wallet addresses are captured with the hash for later escrow-target
/// derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub trade_id: TradeId,
    pub secret_hash: String,
    pub secret: Option<String>,
    pub created_by: SecretOrigin,
    pub their_offer_wallet_addr: Option<String>,
    pub their_request_wallet_addr: Option<String>,
    pub created_at: u64,
}

/// A known order, ours or a peer's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order: OrderInfo,
    pub ours: bool,
    pub cancelled: bool,
    pub updated_at: u64,
}

/// A known peer and its reachability state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub net_address: String,
    pub last_seen: u64,
    /// Trades on which this peer exceeded a delivery deadline.
    pub suspect_trades: Vec<TradeId>,
}

/// A wallet address handed out for a swap, with its derivation index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletAddressRecord {
    pub chain: String,
    pub address: String,
    pub index: u32,
    pub trade_id: Option<TradeId>,
}

/// A direct message awaiting delivery, persisted so a restart resumes the
/// retry schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub peer_id: String,
    pub trade_id: TradeId,
    pub deadline: u64,
    pub envelope: MessageEnvelope,
    pub attempts: u32,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TradeState::Redeemed.is_terminal());
        assert!(TradeState::Aborted.is_terminal());
        assert!(!TradeState::Funded.is_terminal());
        assert!(LegState::Refunded.is_terminal());
        assert!(!LegState::Funding.is_terminal());
    }

    #[test]
    fn test_state_machine_edges() {
        use TradeState::*;
        assert!(Init.can_advance_to(Accepted));
        assert!(Accepted.can_advance_to(Funding));
        assert!(Funding.can_advance_to(Funded));
        assert!(Funded.can_advance_to(Redeemed));
        assert!(Funded.can_advance_to(Refunded));
        assert!(Accepted.can_advance_to(Aborted));
        assert!(Failed.can_advance_to(Refunded));
        assert!(!Funded.can_advance_to(Aborted));
        assert!(!Init.can_advance_to(Funded));
        assert!(!Redeemed.can_advance_to(Refunded));
        assert!(!Refunded.can_advance_to(Redeemed));
    }

    #[test]
    fn test_leg_join() {
        use LegState as L;
        use TradeState as T;
        let join = Trade::join_leg_states;
        assert_eq!(join(T::Accepted, L::Init, L::Init), T::Accepted);
        assert_eq!(join(T::Accepted, L::Funding, L::Init), T::Funding);
        assert_eq!(join(T::Funding, L::Funded, L::Funding), T::Funding);
        assert_eq!(join(T::Funding, L::Funded, L::Funded), T::Funded);
        assert_eq!(join(T::Funded, L::Redeemed, L::Funded), T::Funded);
        assert_eq!(join(T::Funded, L::Redeemed, L::Redeemed), T::Redeemed);
        assert_eq!(join(T::Funded, L::Refunded, L::Redeemed), T::Refunded);
        assert_eq!(join(T::Funded, L::Refunded, L::Failed), T::Refunded);
        // One leg refunded while the other is still live: not terminal yet.
        assert_eq!(join(T::Funded, L::Refunded, L::Funded), T::Funded);
        // The join never regresses the trade.
        assert_eq!(join(T::Funded, L::Init, L::Init), T::Funded);
    }
}
