//! The typed message transport between swap peers.
//!
//! Two paths exist. The direct path connects to the counterparty's
//! advertised address and writes one framed envelope; failures park the
//! message in a persistent per-(peer, trade) queue with a hard deadline, and
//! the daemon's heartbeat retries the queue with a short/long delay ladder.
//! The broadcast path fans the envelope out to every known peer, best
//! effort, and is only a fallback for the order_* kinds.
//!
//! Deliveries past their deadline are dropped, the peer is marked suspect
//! for that trade, and the trade is handed back for refund evaluation.

use std::{
    net::TcpStream,
    sync::Arc,
    time::Duration,
};

use crate::{
    error::NetError,
    protocol::messages::{MessageEnvelope, TradeId},
    store::{records::PendingDelivery, SwapStore},
    utill::{now_ts, send_message},
};

/// Default hard deadline for a direct message.
pub const DEFAULT_MESSAGE_DEADLINE_SECS: u64 = 24 * 60 * 60;

/// Connect timeout for one delivery attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// Tries redelivery on a variable schedule: quickly at first to cover
// transient network failure, then at the long interval.
pub(crate) const RETRY_SHORT_DELAY_SECS: u64 = 1;
pub(crate) const RETRY_LONG_DELAY_SECS: u64 = 30;
pub(crate) const RETRY_SHORT_ATTEMPTS: u32 = 10;

/// Enum to handle messenger errors.
#[derive(Debug)]
pub enum MessengerError {
    Net(NetError),
    Store(crate::store::error::StoreError),
    /// The peer has no known network address.
    UnknownPeer(String),
    /// The message's delivery deadline already passed.
    DeadlineExpired,
}

impl std::fmt::Display for MessengerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for MessengerError {}

impl From<NetError> for MessengerError {
    fn from(value: NetError) -> Self {
        Self::Net(value)
    }
}

impl From<crate::store::error::StoreError> for MessengerError {
    fn from(value: crate::store::error::StoreError) -> Self {
        Self::Store(value)
    }
}

/// A delivery deadline that expired; the coordinator turns these into
/// refund evaluation for the affected trade.
#[derive(Debug, Clone)]
pub struct ExpiredDelivery {
    pub peer_id: String,
    pub trade_id: TradeId,
}

/// The message transport. Stateless apart from the store-backed queue.
pub struct Messenger {
    store: Arc<SwapStore>,
}

impl Messenger {
    pub fn new(store: Arc<SwapStore>) -> Self {
        Self { store }
    }

    /// Send one envelope to a peer's direct stream. On failure the message
    /// is parked for retry until `deadline` (unix seconds).
    pub fn send_direct(
        &self,
        peer_id: &str,
        trade_id: TradeId,
        deadline: u64,
        envelope: MessageEnvelope,
    ) -> Result<(), MessengerError> {
        if deadline <= now_ts() {
            return Err(MessengerError::DeadlineExpired);
        }
        match self.try_deliver(peer_id, &envelope) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!(
                    "[{}] direct delivery of {} to {} failed ({:?}), queueing for retry",
                    trade_id,
                    envelope.payload,
                    peer_id,
                    e
                );
                self.store.push_pending_delivery(PendingDelivery {
                    peer_id: peer_id.to_string(),
                    trade_id,
                    deadline,
                    envelope,
                    attempts: 1,
                })?;
                Ok(())
            }
        }
    }

    /// Best-effort fan-out to every known peer. Failures are logged only.
    pub fn broadcast(&self, envelope: MessageEnvelope) -> Result<(), MessengerError> {
        for peer in self.store.all_peers()? {
            if peer.peer_id == envelope.from_peer {
                continue;
            }
            if let Err(e) = self.try_deliver(&peer.peer_id, &envelope) {
                log::debug!(
                    "broadcast of {} to {} failed: {:?}",
                    envelope.payload,
                    peer.peer_id,
                    e
                );
            }
        }
        Ok(())
    }

    fn try_deliver(&self, peer_id: &str, envelope: &MessageEnvelope) -> Result<(), MessengerError> {
        let peer = self
            .store
            .peer(peer_id)?
            .ok_or_else(|| MessengerError::UnknownPeer(peer_id.to_string()))?;
        let address = peer
            .net_address
            .parse()
            .map_err(|_| MessengerError::Net(NetError::InvalidNetworkAddress))?;
        let mut socket = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT)
            .map_err(|e| MessengerError::Net(NetError::IO(e)))?;
        socket
            .set_write_timeout(Some(CONNECT_TIMEOUT))
            .map_err(|e| MessengerError::Net(NetError::IO(e)))?;
        send_message(&mut socket, envelope)?;
        Ok(())
    }

    /// One pass over the pending queue: redeliver what is due, drop what is
    /// expired. Returns the expired deliveries for refund evaluation.
    pub fn flush_pending(&self) -> Result<Vec<ExpiredDelivery>, MessengerError> {
        let now = now_ts();
        let expired = self
            .store
            .prune_expired_deliveries(now)?
            .into_iter()
            .map(|d| {
                // Exceeding a deadline makes the peer suspect for the trade.
                let _ = self.store.mark_peer_suspect(&d.peer_id, d.trade_id);
                ExpiredDelivery {
                    peer_id: d.peer_id,
                    trade_id: d.trade_id,
                }
            })
            .collect::<Vec<_>>();

        for mut delivery in self.store.pending_deliveries()? {
            if !retry_due(&delivery, now) {
                continue;
            }
            match self.try_deliver(&delivery.peer_id, &delivery.envelope) {
                Ok(()) => {
                    self.store.remove_pending_delivery(&delivery)?;
                }
                Err(e) => {
                    log::debug!(
                        "[{}] retry {} of {} to {} failed: {:?}",
                        delivery.trade_id,
                        delivery.attempts,
                        delivery.envelope.payload,
                        delivery.peer_id,
                        e
                    );
                    delivery.attempts += 1;
                    self.store.push_pending_delivery(delivery)?;
                }
            }
        }
        Ok(expired)
    }
}

/// Whether a queued delivery is due another attempt at `now`, given the
/// short/long delay ladder.
fn retry_due(delivery: &PendingDelivery, now: u64) -> bool {
    let age = now.saturating_sub(delivery.envelope.timestamp);
    if delivery.attempts <= RETRY_SHORT_ATTEMPTS {
        age >= delivery.attempts as u64 * RETRY_SHORT_DELAY_SECS
    } else {
        age >= RETRY_SHORT_ATTEMPTS as u64 * RETRY_SHORT_DELAY_SECS
            + (delivery.attempts - RETRY_SHORT_ATTEMPTS) as u64 * RETRY_LONG_DELAY_SECS
    }
}

/// Clamp a message deadline to the responder-side timelock when one is
/// known for the trade.
pub fn message_deadline(now: u64, default_secs: u64, timelock_ts: Option<u64>) -> u64 {
    let deadline = now + default_secs;
    match timelock_ts {
        Some(timelock) if timelock < deadline => timelock,
        _ => deadline,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::messages::{OrderCancel, SwapMessage};

    fn delivery(attempts: u32, timestamp: u64) -> PendingDelivery {
        let trade_id = TradeId::new_random();
        let mut envelope = MessageEnvelope::new(
            trade_id,
            "peerA",
            SwapMessage::OrderCancel(OrderCancel {
                order_id: "ord".into(),
            }),
        );
        envelope.timestamp = timestamp;
        PendingDelivery {
            peer_id: "peerB".into(),
            trade_id,
            deadline: timestamp + DEFAULT_MESSAGE_DEADLINE_SECS,
            envelope,
            attempts,
        }
    }

    #[test]
    fn test_retry_ladder() {
        let sent_at = 1_000_000u64;
        // Second attempt is due after one short delay.
        assert!(!retry_due(&delivery(1, sent_at), sent_at));
        assert!(retry_due(&delivery(1, sent_at), sent_at + 1));
        // Deep into the queue the long delay applies.
        let late = delivery(RETRY_SHORT_ATTEMPTS + 2, sent_at);
        let long_due =
            sent_at + RETRY_SHORT_ATTEMPTS as u64 * RETRY_SHORT_DELAY_SECS + 2 * RETRY_LONG_DELAY_SECS;
        assert!(!retry_due(&late, long_due - 1));
        assert!(retry_due(&late, long_due));
    }

    #[test]
    fn test_message_deadline_clamped_by_timelock() {
        let now = 1_000_000u64;
        assert_eq!(
            message_deadline(now, DEFAULT_MESSAGE_DEADLINE_SECS, None),
            now + DEFAULT_MESSAGE_DEADLINE_SECS
        );
        assert_eq!(
            message_deadline(now, DEFAULT_MESSAGE_DEADLINE_SECS, Some(now + 600)),
            now + 600
        );
        assert_eq!(
            message_deadline(now, 300, Some(now + 600)),
            now + 300
        );
    }
}
