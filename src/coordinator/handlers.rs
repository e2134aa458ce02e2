//! Inbound swap message handling.
//!
//! Every envelope is validated (version, hex lengths) before dispatch. The
//! handlers are idempotent: a duplicate of an already applied message is a
//! no-op, a conflicting duplicate is a protocol violation that fails the
//! trade. A message arriving before its precondition transition is answered
//! with a `PreconditionNotMet` diagnostic and dropped; the sender's retry
//! schedule redelivers it after our next local advance.

use super::{
    api::{leg_for_chain, SwapCoordinator},
    error::CoordinatorError,
};
use crate::{
    chains::ChainFamily,
    events::SwapEvent,
    protocol::messages::{
        HtlcClaim, HtlcSecretHash, MessageEnvelope, OrderInfo, OrderTake, PubkeyExchange,
        SwapMessage,
    },
    store::records::{LegState, OrderRecord, TradeRole},
    utill::{from_hex, from_hex_array, now_ts},
};

impl SwapCoordinator {
    /// The global message entry point. Applies the error policy: protocol
    /// violations fail the trade, early arrivals are dropped quietly,
    /// transient failures are surfaced to the caller for retry.
    pub fn handle_envelope(&self, envelope: MessageEnvelope) -> Result<(), CoordinatorError> {
        envelope.validate()?;
        self.touch_peer(&envelope.from_peer);
        log::debug!(
            "[{}] <== {} from {}",
            envelope.trade_id,
            envelope.payload,
            envelope.from_peer
        );

        let trade_id = envelope.trade_id;
        match self.dispatch(envelope) {
            Ok(()) => Ok(()),
            Err(e) if e.is_protocol_violation() => {
                log::error!("[{}] protocol violation: {:?}", trade_id, e);
                let _ = self.fail_swap(trade_id, &format!("{:?}", e));
                Err(e)
            }
            Err(CoordinatorError::PreconditionNotMet(reason)) => {
                // Not an error: the peer runs ahead of our local state and
                // will resend.
                log::debug!("[{}] message ahead of local state: {}", trade_id, reason);
                Ok(())
            }
            Err(e) => {
                log::warn!("[{}] message handling failed: {:?}", trade_id, e);
                Err(e)
            }
        }
    }

    fn touch_peer(&self, peer_id: &str) {
        if let Ok(Some(mut peer)) = self.store.peer(peer_id) {
            peer.last_seen = now_ts();
            let _ = self.store.upsert_peer(peer);
        }
    }

    fn dispatch(&self, envelope: MessageEnvelope) -> Result<(), CoordinatorError> {
        let trade_id = envelope.trade_id;
        let from_peer = envelope.from_peer.clone();
        match envelope.payload {
            SwapMessage::OrderAnnounce(order) => self.handle_order_announce(order, &from_peer),
            SwapMessage::OrderCancel(cancel) => {
                match self.store.order(&cancel.order_id)? {
                    Some(record) if !record.ours && !record.cancelled => {
                        self.store.cancel_order(&cancel.order_id)?;
                    }
                    _ => {}
                }
                Ok(())
            }
            SwapMessage::OrderTake(take) => self.handle_order_take(take, &from_peer),
            SwapMessage::PubkeyExchange(exchange) => {
                self.handle_pubkey_exchange(trade_id, envelope.order_id.as_deref(), exchange)
            }
            SwapMessage::NonceExchange(exchange) => {
                let offer = from_hex(&exchange.offer_nonce_hex)
                    .map_err(|_| CoordinatorError::PreconditionNotMet("unparseable nonce hex"))?;
                let request = from_hex(&exchange.request_nonce_hex)
                    .map_err(|_| CoordinatorError::PreconditionNotMet("unparseable nonce hex"))?;
                self.set_remote_nonces(trade_id, &offer, &request)?;
                // Answer with ours only if we have not generated any yet; an
                // already-sent exchange is covered by the retry queue.
                let ours_missing = {
                    let cell = self.cell(trade_id)?;
                    let swap = cell.lock()?;
                    swap.musig()
                        .map(|state| state.offer.pub_nonce.is_none())
                        .unwrap_or(false)
                };
                if ours_missing {
                    self.generate_nonces(trade_id)?;
                }
                Ok(())
            }
            SwapMessage::FundingInfo(info) => {
                self.set_funding_tx(trade_id, &info.txid, info.vout, false)?;
                // Opportunistic confirmation poll; transient backend trouble
                // is the heartbeat's problem, not the sender's.
                if let Err(e) = self.update_confirmations(trade_id) {
                    log::debug!("[{}] confirmation poll failed: {:?}", trade_id, e);
                }
                Ok(())
            }
            SwapMessage::PartialSig(sigs) => {
                let offer = from_hex(&sigs.offer_partial_sig_hex)
                    .map_err(|_| CoordinatorError::PreconditionNotMet("unparseable sig hex"))?;
                let request = from_hex(&sigs.request_partial_sig_hex)
                    .map_err(|_| CoordinatorError::PreconditionNotMet("unparseable sig hex"))?;
                self.set_remote_partial_sigs(trade_id, &offer, &request)?;
                self.try_auto_redeem(trade_id);
                Ok(())
            }
            SwapMessage::HtlcSecretHash(hash) => self.handle_htlc_secret_hash(
                trade_id,
                envelope.order_id.as_deref(),
                envelope.timestamp,
                hash,
            ),
            SwapMessage::HtlcSecretReveal(reveal) => {
                let preimage = from_hex_array::<32>(&reveal.secret_hex)
                    .map_err(|_| CoordinatorError::PreconditionNotMet("unparseable secret hex"))?;
                self.set_revealed_secret(trade_id, &preimage)?;
                self.try_auto_claim(trade_id);
                Ok(())
            }
            SwapMessage::HtlcClaim(claim) => self.handle_htlc_claim(trade_id, claim),
        }
    }

    fn handle_order_announce(
        &self,
        order: OrderInfo,
        from_peer: &str,
    ) -> Result<(), CoordinatorError> {
        if order.maker_peer_id != from_peer {
            return Err(super::error::ProtocolViolation::PeerProtocolViolation(
                "order announced for another peer",
            )
            .into());
        }
        match self.store.order(&order.order_id)? {
            // Re-announcement with identical content is a no-op.
            Some(existing) if existing.order == order => Ok(()),
            Some(existing) if existing.ours => Err(
                super::error::ProtocolViolation::PeerProtocolViolation("order id collision").into(),
            ),
            _ => {
                self.store.put_order(OrderRecord {
                    order,
                    ours: false,
                    cancelled: false,
                    updated_at: now_ts(),
                })?;
                Ok(())
            }
        }
    }

    fn handle_order_take(&self, take: OrderTake, from_peer: &str) -> Result<(), CoordinatorError> {
        if take.taker_peer_id != from_peer {
            return Err(super::error::ProtocolViolation::PeerProtocolViolation(
                "take announced for another peer",
            )
            .into());
        }
        // Duplicate takes of a trade we already run are no-ops.
        if self.store.trade(take.trade_id)?.is_some() {
            return Ok(());
        }
        let order = self
            .store
            .order(&take.order_id)?
            .ok_or(CoordinatorError::PreconditionNotMet("take for unknown order"))?;
        if !order.ours {
            // Someone else's order was taken; nothing for us to do.
            return Ok(());
        }
        if order.order.offer_amount != take.offer_amount
            || order.order.request_amount != take.request_amount
        {
            return Err(super::error::ProtocolViolation::PeerProtocolViolation(
                "take amounts do not match order",
            )
            .into());
        }
        self.initiate_swap(take.trade_id, &take.order_id, &take.taker_peer_id, take.method)?;
        Ok(())
    }

    fn handle_pubkey_exchange(
        &self,
        trade_id: crate::protocol::messages::TradeId,
        order_id: Option<&str>,
        exchange: PubkeyExchange,
    ) -> Result<(), CoordinatorError> {
        let trade = self
            .store
            .trade(trade_id)?
            .ok_or(CoordinatorError::PreconditionNotMet("pubkey for unknown trade"))?;
        match trade.our_role {
            // The taker answers the initiator's opening key with its own.
            TradeRole::Taker if self.needs_response(trade_id)? => {
                self.respond_to_swap(
                    trade_id,
                    order_id.unwrap_or(&trade.order_id),
                    &exchange.pubkey_hex,
                    None,
                    None,
                    Some(exchange.offer_wallet_addr),
                    Some(exchange.request_wallet_addr),
                    trade.method,
                )?;
            }
            _ => {
                let pubkey_bytes = from_hex(&exchange.pubkey_hex).map_err(|_| {
                    CoordinatorError::PreconditionNotMet("unparseable pubkey hex")
                })?;
                self.set_remote_pubkey(
                    trade_id,
                    &pubkey_bytes,
                    Some(exchange.offer_wallet_addr),
                    Some(exchange.request_wallet_addr),
                )?;
            }
        }
        Ok(())
    }

    fn handle_htlc_secret_hash(
        &self,
        trade_id: crate::protocol::messages::TradeId,
        order_id: Option<&str>,
        anchor_ts: u64,
        hash: HtlcSecretHash,
    ) -> Result<(), CoordinatorError> {
        let order_id = match self.store.trade(trade_id)? {
            Some(trade) => trade.order_id,
            None => order_id
                .ok_or(CoordinatorError::PreconditionNotMet("secret hash without order id"))?
                .to_string(),
        };
        self.respond_to_swap(
            trade_id,
            &order_id,
            &hash.pubkey_hex,
            Some(&hash.secret_hash_hex),
            Some(anchor_ts),
            Some(hash.offer_wallet_addr),
            Some(hash.request_wallet_addr),
            crate::protocol::messages::SwapMethod::Htlc,
        )?;
        Ok(())
    }

    fn handle_htlc_claim(
        &self,
        trade_id: crate::protocol::messages::TradeId,
        claim: HtlcClaim,
    ) -> Result<(), CoordinatorError> {
        let trade = self
            .store
            .trade(trade_id)?
            .ok_or(CoordinatorError::PreconditionNotMet("claim for unknown trade"))?;
        let leg_type = leg_for_chain(&trade, &claim.chain)?;

        if let Some(secret_hex) = &claim.secret_hex {
            let preimage = from_hex_array::<32>(secret_hex)
                .map_err(|_| CoordinatorError::PreconditionNotMet("unparseable secret hex"))?;
            self.set_revealed_secret(trade_id, &preimage)?;
        }

        let mut leg = self
            .store
            .leg(trade_id, leg_type)?
            .ok_or(CoordinatorError::Invariant("trade without leg row"))?;
        if leg.redeem_txid.as_deref() != Some(claim.txid.as_str()) {
            leg.redeem_txid = Some(claim.txid.clone());
            leg.state = LegState::Redeemed;
            self.store.upsert_leg(leg)?;
        }
        self.events.publish(SwapEvent::HtlcClaimReceived {
            trade_id,
            chain: claim.chain.clone(),
            txid: claim.txid,
        });
        self.try_auto_claim(trade_id);
        Ok(())
    }

    /// Whether the taker still owes the initiator its response (no remote
    /// key stored yet).
    fn needs_response(
        &self,
        trade_id: crate::protocol::messages::TradeId,
    ) -> Result<bool, CoordinatorError> {
        let cell = self.cell(trade_id)?;
        let swap = cell.lock()?;
        Ok(swap.remote_pubkey.is_none())
    }

    /// Resume the happy path once the counterparty's partial signatures are
    /// in: when the trade is funded, combine and broadcast our sweep.
    fn try_auto_redeem(&self, trade_id: crate::protocol::messages::TradeId) {
        let funded = self
            .store
            .trade(trade_id)
            .ok()
            .flatten()
            .map(|t| t.state == crate::store::records::TradeState::Funded)
            .unwrap_or(false);
        if !funded {
            return;
        }
        match self.redeem_swap(trade_id) {
            Ok(txid) => log::info!("[{}] auto-redeemed: {}", trade_id, txid),
            Err(e) => log::warn!("[{}] auto-redeem deferred: {:?}", trade_id, e),
        }
    }

    /// Claim our receiving leg once the secret is known, regardless of how
    /// we learned it.
    fn try_auto_claim(&self, trade_id: crate::protocol::messages::TradeId) {
        let result = (|| -> Result<Option<String>, CoordinatorError> {
            let trade = self.trade(trade_id)?;
            if trade.method != crate::protocol::messages::SwapMethod::Htlc
                || trade.state.is_terminal()
            {
                return Ok(None);
            }
            let cell = self.cell(trade_id)?;
            let (leg_type, secret_known) = {
                let swap = cell.lock()?;
                (
                    swap.remote_leg(),
                    swap.htlc().map(|s| s.secret.is_some()).unwrap_or(false),
                )
            };
            if !secret_known {
                return Ok(None);
            }
            let leg = self
                .store
                .leg(trade_id, leg_type)?
                .ok_or(CoordinatorError::Invariant("trade without leg row"))?;
            if leg.state == LegState::Redeemed {
                return Ok(None);
            }
            let chain = super::api::leg_chain(&trade, leg_type).to_string();
            let family = self.params(&chain)?.family;
            let txid = match family {
                ChainFamily::Bitcoin => self.claim_htlc(trade_id, &chain)?,
                ChainFamily::Evm => self.claim_evm_htlc(trade_id, &chain)?,
            };
            Ok(Some(txid))
        })();
        match result {
            Ok(Some(txid)) => log::info!("[{}] auto-claimed: {}", trade_id, txid),
            Ok(None) => {}
            Err(e) => log::warn!("[{}] auto-claim deferred: {:?}", trade_id, e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        chains::{ChainFamily, ChainParams},
        coordinator::{api::SwapCoordinator, config::CoordinatorConfig},
        protocol::messages::{
            MessageEnvelope, NonceExchange, OrderCancel, OrderInfo, SwapMessage, SwapMethod,
            TradeId,
        },
        store::SwapStore,
        utill::now_ts,
    };
    use std::{collections::HashMap, sync::Arc};

    fn test_coordinator() -> Arc<SwapCoordinator> {
        static COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let unique = COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("crosswap-coord-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = Arc::new(SwapStore::open(&dir.join(format!("store-{}.cbor", unique))).unwrap());

        let chains = vec![
            ChainParams {
                symbol: "BTC".into(),
                family: ChainFamily::Bitcoin,
                backend_url: "http://127.0.0.1:1".into(),
                network: bitcoin::Network::Regtest,
                dao_address: None,
                chain_id: None,
                htlc_contract: None,
                required_confirms: 1,
            },
            ChainParams {
                symbol: "LTC".into(),
                family: ChainFamily::Bitcoin,
                backend_url: "http://127.0.0.1:1".into(),
                network: bitcoin::Network::Regtest,
                dao_address: None,
                chain_id: None,
                htlc_contract: None,
                required_confirms: 1,
            },
        ];
        let backends = chains
            .iter()
            .map(|p| {
                (
                    p.symbol.clone(),
                    Arc::new(crate::chains::ChainBackend::from_params(p).unwrap()),
                )
            })
            .collect::<HashMap<_, _>>();
        let mut config = CoordinatorConfig::default();
        config.peer_id = "peer-self".into();
        SwapCoordinator::init(config, chains, backends, store, None)
    }

    fn announce(coordinator: &SwapCoordinator, order_id: &str) {
        let order = OrderInfo {
            order_id: order_id.into(),
            maker_peer_id: "peer-remote".into(),
            offer_chain: "BTC".into(),
            offer_amount: 100_000,
            request_chain: "LTC".into(),
            request_amount: 5_000_000_000,
            method: SwapMethod::Musig2,
            created_at: now_ts(),
        };
        let envelope = MessageEnvelope::new(
            TradeId::new_random(),
            "peer-remote",
            SwapMessage::OrderAnnounce(order),
        );
        coordinator.handle_envelope(envelope).unwrap();
    }

    #[test]
    fn test_order_announce_is_idempotent() {
        let coordinator = test_coordinator();
        announce(&coordinator, "ord-a");
        announce(&coordinator, "ord-a");
        assert_eq!(coordinator.store.live_orders().unwrap().len(), 1);
    }

    #[test]
    fn test_order_cancel_from_peer() {
        let coordinator = test_coordinator();
        announce(&coordinator, "ord-b");
        let envelope = MessageEnvelope::new(
            TradeId::new_random(),
            "peer-remote",
            SwapMessage::OrderCancel(OrderCancel {
                order_id: "ord-b".into(),
            }),
        );
        coordinator.handle_envelope(envelope).unwrap();
        assert!(coordinator.store.live_orders().unwrap().is_empty());
        // Cancelling twice is harmless.
        let envelope = MessageEnvelope::new(
            TradeId::new_random(),
            "peer-remote",
            SwapMessage::OrderCancel(OrderCancel {
                order_id: "ord-b".into(),
            }),
        );
        coordinator.handle_envelope(envelope).unwrap();
    }

    #[test]
    fn test_bad_nonce_length_rejected_without_state_change() {
        let coordinator = test_coordinator();
        let trade_id = TradeId::new_random();
        let envelope = MessageEnvelope::new(
            trade_id,
            "peer-remote",
            SwapMessage::NonceExchange(NonceExchange {
                offer_nonce_hex: "ab".repeat(65),
                request_nonce_hex: "ab".repeat(66),
            }),
        );
        assert!(coordinator.handle_envelope(envelope).is_err());
        assert!(coordinator.store.trade(trade_id).unwrap().is_none());
    }

    #[test]
    fn test_announce_for_wrong_peer_rejected() {
        let coordinator = test_coordinator();
        let order = OrderInfo {
            order_id: "ord-x".into(),
            maker_peer_id: "peer-remote".into(),
            offer_chain: "BTC".into(),
            offer_amount: 1,
            request_chain: "LTC".into(),
            request_amount: 1,
            method: SwapMethod::Musig2,
            created_at: now_ts(),
        };
        let envelope = MessageEnvelope::new(
            TradeId::new_random(),
            "peer-imposter",
            SwapMessage::OrderAnnounce(order),
        );
        assert!(coordinator.handle_envelope(envelope).is_err());
        assert!(coordinator.store.live_orders().unwrap().is_empty());
    }
}
