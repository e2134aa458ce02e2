//! Asynchronous swap events.
//!
//! Every externally observable step of a swap publishes one event. The RPC
//! edge streams these to subscribers; the daemon also logs them. Publication
//! is fire-and-forget: a slow or dead subscriber never blocks a transition.

use std::sync::{
    mpsc::{channel, Receiver, Sender},
    Mutex,
};

use serde::{Deserialize, Serialize};

use crate::protocol::messages::TradeId;

/// One asynchronous notification, tagged with the stable event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwapEvent {
    SwapInitialized {
        trade_id: TradeId,
    },
    PubkeyReceived {
        trade_id: TradeId,
    },
    NoncesGenerated {
        trade_id: TradeId,
    },
    NoncesReceived {
        trade_id: TradeId,
    },
    FundingBroadcast {
        trade_id: TradeId,
        chain: String,
        txid: String,
    },
    FundingReceived {
        trade_id: TradeId,
        chain: String,
        txid: String,
    },
    PartialSigsCreated {
        trade_id: TradeId,
    },
    RemotePartialSigsReceived {
        trade_id: TradeId,
    },
    SwapRedeemed {
        trade_id: TradeId,
        txid: String,
    },
    SwapRefunded {
        trade_id: TradeId,
        reason: String,
    },
    SwapFailed {
        trade_id: TradeId,
        reason: String,
    },
    HtlcSecretRevealed {
        trade_id: TradeId,
    },
    HtlcClaimReceived {
        trade_id: TradeId,
        chain: String,
        txid: String,
    },
    EvmHtlcCreated {
        trade_id: TradeId,
        chain: String,
        tx_hash: String,
    },
    EvmHtlcClaimed {
        trade_id: TradeId,
        chain: String,
        tx_hash: String,
    },
    EvmHtlcRefunded {
        trade_id: TradeId,
        chain: String,
        tx_hash: String,
    },
    CrossChainSwapInitialized {
        trade_id: TradeId,
    },
}

/// Fan-out bus for [SwapEvent]s.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<SwapEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. The returned receiver sees every event
    /// published after this call.
    pub fn subscribe(&self) -> Receiver<SwapEvent> {
        let (sender, receiver) = channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(sender);
        }
        receiver
    }

    /// Publish to all live subscribers, dropping the hung-up ones.
    pub fn publish(&self, event: SwapEvent) {
        log::debug!("event: {:?}", event);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|s| s.send(event.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_publish_reaches_all_live_subscribers() {
        let bus = EventBus::new();
        let receiver1 = bus.subscribe();
        let receiver2 = bus.subscribe();
        let event = SwapEvent::SwapInitialized {
            trade_id: TradeId::new_random(),
        };
        bus.publish(event.clone());
        assert_eq!(receiver1.try_recv().unwrap(), event);
        assert_eq!(receiver2.try_recv().unwrap(), event);

        // A dropped subscriber is pruned without blocking the next publish.
        drop(receiver1);
        bus.publish(event.clone());
        assert_eq!(receiver2.try_recv().unwrap(), event);
    }

    #[test]
    fn test_event_wire_names() {
        let event = SwapEvent::FundingBroadcast {
            trade_id: TradeId::new_random(),
            chain: "BTC".into(),
            txid: "ab".repeat(32),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "funding_broadcast");
        assert_eq!(json["chain"], "BTC");
    }
}
