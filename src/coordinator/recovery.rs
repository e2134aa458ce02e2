//! Cold-start recovery and timeout sweeps.
//!
//! A restart rehydrates every non-terminal trade from its persisted rows:
//! the swap key, both legs, the secret row and the counterparty key are
//! enough to recompute escrow programs deterministically and resume exactly
//! where the state machine stopped. The public half of a MuSig2 session is
//! restored from the leg blobs; secret nonces never touch disk (a reused
//! one leaks the key), so a session that had not signed yet re-negotiates
//! fresh nonces instead.
//!
//! The timeout sweep turns elapsed timelocks into refund actions. Nothing
//! here blocks on the counterparty.

use bitcoin::{secp256k1::SecretKey, Amount, OutPoint, PublicKey};

use super::{
    api::{leg_amount, leg_chain, local_addr_on, parse_btc_address, SwapCoordinator},
    error::{CoordinatorError, PreconditionFailure},
    swap::{ActiveSwap, FundingSide, LegMethodData, SwapMethodState, SwapRole},
};
use crate::{
    chains::{bitcoin::BitcoinBackend, ChainFamily, ChainTx},
    protocol::{contract, messages::{SwapMethod, TradeId}, musig},
    store::records::{LegState, LegType, SwapLeg, Trade, TradeRole, TradeState},
    utill::{from_hex, from_hex_array, now_ts, DEFAULT_TX_FEE_RATE},
};

/// Margin past a timelock before an eligible refund becomes required.
const REFUND_REQUIRED_MARGIN_BLOCKS: u32 = 6;
const REFUND_REQUIRED_MARGIN_SECS: u64 = 3_600;

/// What the timeout sweep wants done about one leg.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum TimeoutAction {
    /// The refund path is open; refunding is possible but not yet urgent.
    RefundEligible { trade_id: TradeId, chain: String },
    /// The refund path has been open past the margin; refund now.
    RefundRequired { trade_id: TradeId, chain: String },
}

impl SwapCoordinator {
    /// Rehydrate one trade's working set from the persisted rows.
    /// Idempotent: an already-active trade is left untouched.
    pub fn recover_swap(&self, trade_id: TradeId) -> Result<(), CoordinatorError> {
        let trade = self.trade(trade_id)?;
        if trade.state.is_terminal() {
            return Ok(());
        }
        if self.active.read()?.contains_key(&trade_id) {
            return Ok(());
        }

        let privkey_hex = self
            .store
            .swap_key(trade_id)?
            .ok_or(CoordinatorError::Invariant("trade without persisted swap key"))?;
        let privkey = SecretKey::from_slice(
            &from_hex_array::<32>(&privkey_hex)
                .map_err(|_| CoordinatorError::Invariant("malformed persisted swap key"))?,
        )
        .map_err(|_| CoordinatorError::Invariant("malformed persisted swap key"))?;
        let secp = bitcoin::key::Secp256k1::new();
        let pubkey = PublicKey {
            compressed: true,
            inner: bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &privkey),
        };

        let remote_hex = match trade.our_role {
            TradeRole::Maker => trade.taker_pubkey.clone(),
            TradeRole::Taker => trade.maker_pubkey.clone(),
        };
        let remote_pubkey = remote_hex
            .as_deref()
            .and_then(|hex| from_hex(hex).ok())
            .and_then(|bytes| PublicKey::from_slice(&bytes).ok());

        let role: SwapRole = trade.our_role.into();
        let mut swap = ActiveSwap {
            trade_id,
            order_id: trade.order_id.clone(),
            role,
            method: SwapMethodState::new(trade.method),
            local_privkey: privkey,
            local_pubkey: pubkey,
            remote_pubkey,
            local_funding: FundingSide::default(),
            remote_funding: FundingSide::default(),
            local_offer_wallet_addr: None,
            local_request_wallet_addr: None,
            remote_offer_wallet_addr: None,
            remote_request_wallet_addr: None,
            created_at: trade.created_at,
        };

        // Secret material for HTLC trades.
        if let Some(record) = self.store.secret(trade_id)? {
            if let Some(state) = swap.htlc_mut() {
                state.secret_hash = from_hex_array::<32>(&record.secret_hash).ok();
                state.secret = record
                    .secret
                    .as_deref()
                    .and_then(|hex| from_hex_array::<32>(hex).ok());
            }
        }

        // Funding bookkeeping and wallet addresses from the leg rows.
        let legs = self.store.legs(trade_id)?;
        for leg in &legs {
            let side = if leg.leg_type == swap.local_leg() {
                &mut swap.local_funding
            } else {
                &mut swap.remote_funding
            };
            side.txid = leg.funding_txid.clone();
            side.vout = leg.funding_vout;
            side.confirms = leg.funding_confirms;

            if let Some(data) = leg.method_data.as_deref().and_then(LegMethodData::from_json) {
                let sender_is_local = (leg.leg_type == LegType::Offer)
                    == (trade.our_role == TradeRole::Maker);
                let (local_addr, remote_addr) = if sender_is_local {
                    (data.sender_wallet_addr, data.receiver_wallet_addr)
                } else {
                    (data.receiver_wallet_addr, data.sender_wallet_addr)
                };
                match leg.leg_type {
                    LegType::Offer => {
                        swap.local_offer_wallet_addr = local_addr;
                        swap.remote_offer_wallet_addr = remote_addr;
                    }
                    LegType::Request => {
                        swap.local_request_wallet_addr = local_addr;
                        swap.remote_request_wallet_addr = remote_addr;
                    }
                }
            }
        }

        let cell = self.insert_cell(trade_id, swap)?;
        // Escrow programs are deterministic; recompute rather than trusting
        // cached bytes. The public MuSig2 session material (nonces, partial
        // signatures, sighashes) is restored from the leg blobs afterwards.
        if remote_hex.is_some() {
            let mut swap = cell.lock()?;
            if let Err(e) = self.derive_escrows(&trade, &mut swap) {
                log::warn!("[{}] escrow re-derivation failed: {:?}", trade_id, e);
            }
            for leg in &legs {
                let blob = match leg.method_data.as_deref().and_then(LegMethodData::from_json) {
                    Some(blob) => blob,
                    None => continue,
                };
                if let Some(state) = swap.musig_mut() {
                    let data = state.chain_mut(leg.leg_type);
                    data.pub_nonce = blob
                        .local_nonce
                        .as_deref()
                        .and_then(|hex| from_hex(hex).ok())
                        .and_then(|bytes| musig::nonce_from_bytes(&bytes).ok());
                    data.remote_nonce = blob
                        .remote_nonce
                        .as_deref()
                        .and_then(|hex| from_hex(hex).ok())
                        .and_then(|bytes| musig::nonce_from_bytes(&bytes).ok());
                    data.local_partial = blob
                        .local_partial
                        .as_deref()
                        .and_then(|hex| from_hex(hex).ok())
                        .and_then(|bytes| musig::partial_sig_from_bytes(&bytes).ok());
                    data.remote_partial = blob
                        .remote_partial
                        .as_deref()
                        .and_then(|hex| from_hex(hex).ok())
                        .and_then(|bytes| musig::partial_sig_from_bytes(&bytes).ok());
                    data.sighash = blob
                        .sighash
                        .as_deref()
                        .and_then(|hex| from_hex_array::<32>(hex).ok());
                }
            }
        }

        log::info!(
            "[{}] recovered swap in state {} ({})",
            trade_id,
            trade.state,
            trade.method
        );
        self.resume_after_recovery(&trade)?;
        Ok(())
    }

    /// Post-recovery nudges, per the persisted state alone.
    fn resume_after_recovery(&self, trade: &Trade) -> Result<(), CoordinatorError> {
        match trade.state {
            TradeState::Funded if trade.method == SwapMethod::Musig2 => {
                let (partials_complete, signed_locally, nonces_known) = {
                    let cell = self.cell(trade.id)?;
                    let swap = cell.lock()?;
                    match swap.musig() {
                        Some(state) => (
                            state.partials_complete(),
                            state.offer.local_partial.is_some()
                                || state.request.local_partial.is_some(),
                            state.nonces_complete(),
                        ),
                        None => (false, false, false),
                    }
                };
                if partials_complete {
                    // Everything needed to finish is on disk: complete.
                    if let Err(e) = self.redeem_swap(trade.id) {
                        log::warn!("[{}] post-recovery redeem deferred: {:?}", trade.id, e);
                    }
                } else if signed_locally || nonces_known {
                    // Our partial is already with the peer (or nonces are
                    // settled); the peer's retry schedule delivers the rest.
                    log::info!("[{}] awaiting counterparty signatures", trade.id);
                } else {
                    // Nothing signed yet: re-negotiate fresh nonces, which
                    // also solicits the counterparty's partial signatures.
                    if let Err(e) = self.generate_nonces(trade.id) {
                        log::debug!("[{}] nonce re-negotiation deferred: {:?}", trade.id, e);
                    }
                }
            }
            // Mid-funding trades poll the chain for the missing side.
            TradeState::Funding => {
                if let Err(e) = self.update_confirmations(trade.id) {
                    log::debug!("[{}] confirmation poll failed: {:?}", trade.id, e);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Sweep every non-terminal trade through recovery. Called once at
    /// process startup.
    pub fn startup_sweep(&self) -> Result<usize, CoordinatorError> {
        let trades = self.store.non_terminal_trades()?;
        let mut recovered = 0usize;
        for trade in trades {
            match self.recover_swap(trade.id) {
                Ok(()) => recovered += 1,
                Err(e) => log::error!("[{}] recovery failed: {:?}", trade.id, e),
            }
        }
        log::info!("startup recovery: {} swaps rehydrated", recovered);
        Ok(recovered)
    }

    /// Compute refund eligibility for every leg we funded across all
    /// non-terminal trades.
    pub fn check_timeouts(&self) -> Result<Vec<TimeoutAction>, CoordinatorError> {
        let mut actions = Vec::new();
        let now = now_ts();
        for trade in self.store.non_terminal_trades()? {
            let local_leg = match trade.our_role {
                TradeRole::Maker => LegType::Offer,
                TradeRole::Taker => LegType::Request,
            };
            for leg in self.store.legs(trade.id)? {
                if leg.leg_type != local_leg {
                    continue;
                }
                if let Some(action) = evaluate_leg_timeout(&trade, &leg, now) {
                    actions.push(action);
                }
            }
        }
        Ok(actions)
    }

    /// Act on the sweep's verdicts: execute every required refund.
    pub fn process_timeouts(&self) -> Result<Vec<TimeoutAction>, CoordinatorError> {
        let actions = self.check_timeouts()?;
        for action in &actions {
            if let TimeoutAction::RefundRequired { trade_id, chain } = action {
                if let Err(e) = self.refund_swap(*trade_id, Some(chain.as_str())) {
                    log::error!("[{}] refund failed: {:?}", trade_id, e);
                }
            }
        }
        Ok(actions)
    }

    /// Refund dispatcher: resolves the right refund path for the trade's
    /// method and the chain's family.
    pub fn refund_swap(
        &self,
        trade_id: TradeId,
        chain: Option<&str>,
    ) -> Result<String, CoordinatorError> {
        let trade = self.trade(trade_id)?;
        let local_leg = match trade.our_role {
            TradeRole::Maker => LegType::Offer,
            TradeRole::Taker => LegType::Request,
        };
        let chain = chain
            .map(str::to_string)
            .unwrap_or_else(|| leg_chain(&trade, local_leg).to_string());
        let family = self.params(&chain)?.family;
        match (trade.method, family) {
            (SwapMethod::Htlc, ChainFamily::Bitcoin) => self.refund_htlc(trade_id, &chain),
            (SwapMethod::Htlc, ChainFamily::Evm) => self.refund_evm_htlc(trade_id, &chain),
            (SwapMethod::Musig2, ChainFamily::Bitcoin) => {
                self.refund_musig_escrow(trade_id, &chain)
            }
            (SwapMethod::Musig2, ChainFamily::Evm) => {
                Err(CoordinatorError::Invariant("musig2 trade on evm chain"))
            }
        }
    }

    /// Unilateral MuSig2 escrow refund through the committed script-path
    /// leaf, once its CSV delta has elapsed.
    pub fn refund_musig_escrow(
        &self,
        trade_id: TradeId,
        chain: &str,
    ) -> Result<String, CoordinatorError> {
        let trade = self.trade(trade_id)?;
        let leg_type = super::api::leg_for_chain(&trade, chain)?;
        let params = self.params(chain)?;
        let cell = self.cell(trade_id)?;

        let (leaf, escrow_spk, outpoint, value, dest_spk, privkey, internal_key, csv_delta) = {
            let swap = cell.lock()?;
            if leg_type != swap.local_leg() {
                return Err(PreconditionFailure::InvalidState {
                    state: trade.state,
                    action: "refund on a leg we did not fund",
                }
                .into());
            }
            let remote = swap
                .remote_pubkey
                .ok_or(PreconditionFailure::MissingPubKey)?;
            let state = swap.musig().ok_or(PreconditionFailure::MethodMismatch)?;
            let data = state.chain(leg_type);
            let leaf = data
                .refund_leaf
                .clone()
                .ok_or(PreconditionFailure::MissingPubKey)?;
            let escrow_spk = data
                .escrow_spk
                .clone()
                .ok_or(PreconditionFailure::MissingPubKey)?;
            let funding = swap.funding_for_leg(leg_type);
            let outpoint = OutPoint {
                txid: BitcoinBackend::parse_txid(
                    funding
                        .txid
                        .as_ref()
                        .ok_or(PreconditionFailure::MissingFunding)?,
                )?,
                vout: funding.vout.ok_or(PreconditionFailure::MissingFunding)?,
            };
            let value = Amount::from_sat(leg_amount(&trade, leg_type)? as u64);
            let dest = local_addr_on(&swap, leg_type)
                .ok_or(PreconditionFailure::MissingPubKey)?;
            let dest_spk = parse_btc_address(&dest, params)?.script_pubkey();
            let internal_ctx = musig::key_agg_untweaked(&swap.local_pubkey, &remote)?;
            let internal_key = musig::aggregated_xonly(&internal_ctx)?;
            (
                leaf,
                escrow_spk,
                outpoint,
                value,
                dest_spk,
                swap.local_privkey,
                internal_key,
                self.config.refund_csv_delta,
            )
        };

        let backend = self.backend(chain)?;
        let fee_rate = backend.estimate_fee_rate().unwrap_or(DEFAULT_TX_FEE_RATE);
        let miner_fee = contract::calculate_miner_fee(fee_rate, contract::REFUND_TX_VBYTE_SIZE);
        let mut refund_tx =
            contract::create_refund_tx(outpoint, value, dest_spk, csv_delta, miner_fee)?;
        let prevouts = vec![bitcoin::TxOut {
            value,
            script_pubkey: escrow_spk,
        }];
        let sighash = contract::taproot_scriptspend_sighash(&refund_tx, &prevouts, 0, &leaf)?;
        let signature = contract::sign_refund_leaf(&sighash, &privkey)?;

        let spend_info = contract::escrow_spend_info(internal_key, &leaf)?;
        let control_block = spend_info
            .control_block(&(leaf.clone(), bitcoin::taproot::LeafVersion::TapScript))
            .ok_or(CoordinatorError::Invariant("refund leaf missing from tree"))?;
        contract::apply_scriptpath_refund_witness(
            &mut refund_tx,
            0,
            &signature,
            &leaf,
            &control_block,
        );

        let txid = backend.broadcast(&ChainTx::Bitcoin(refund_tx))?;
        log::info!("[{}] script-path refund on {}: {}", trade_id, chain, txid);
        self.finish_refund(trade_id, leg_type, &txid)?;
        Ok(txid)
    }

    /// Heartbeat entry point: confirmation polls for live trades, the
    /// pending message queue, and the timeout sweep.
    pub fn housekeeping(&self) {
        let trade_ids: Vec<TradeId> = match self.active.read() {
            Ok(active) => active.keys().copied().collect(),
            Err(_) => return,
        };
        for trade_id in trade_ids {
            if let Err(e) = self.update_confirmations(trade_id) {
                log::debug!("[{}] confirmation poll failed: {:?}", trade_id, e);
            }
        }
        match self.messenger.flush_pending() {
            Ok(expired) => {
                for delivery in expired {
                    log::warn!(
                        "[{}] delivery to {} expired, evaluating refund",
                        delivery.trade_id,
                        delivery.peer_id
                    );
                    // Before any on-chain commitment a vanished counterparty
                    // just aborts the trade; afterwards the timeout sweep
                    // below drives the refund paths.
                    if let Ok(Some(trade)) = self.store.trade(delivery.trade_id) {
                        if matches!(trade.state, TradeState::Init | TradeState::Accepted) {
                            let _ = self.abort_swap(delivery.trade_id, "counterparty unreachable");
                        }
                    }
                }
            }
            Err(e) => log::debug!("pending flush failed: {:?}", e),
        }
        if let Err(e) = self.process_timeouts() {
            log::debug!("timeout sweep failed: {:?}", e);
        }
    }
}

/// Pure timeout evaluation for one funded leg. Bitcoin-family legs measure
/// elapsed confirmations against the CSV delta; EVM legs compare wall time
/// with the absolute timelock.
pub(crate) fn evaluate_leg_timeout(
    trade: &Trade,
    leg: &SwapLeg,
    now: u64,
) -> Option<TimeoutAction> {
    if leg.state != LegState::Funding && leg.state != LegState::Funded {
        return None;
    }
    leg.funding_txid.as_ref()?;

    if let Some(timeout_blocks) = leg.timeout_height {
        if leg.funding_confirms >= timeout_blocks + REFUND_REQUIRED_MARGIN_BLOCKS {
            return Some(TimeoutAction::RefundRequired {
                trade_id: trade.id,
                chain: leg.chain.clone(),
            });
        }
        if leg.funding_confirms >= timeout_blocks {
            return Some(TimeoutAction::RefundEligible {
                trade_id: trade.id,
                chain: leg.chain.clone(),
            });
        }
    }
    if let Some(timeout_ts) = leg.timeout_timestamp {
        if now >= timeout_ts + REFUND_REQUIRED_MARGIN_SECS {
            return Some(TimeoutAction::RefundRequired {
                trade_id: trade.id,
                chain: leg.chain.clone(),
            });
        }
        if now >= timeout_ts {
            return Some(TimeoutAction::RefundEligible {
                trade_id: trade.id,
                chain: leg.chain.clone(),
            });
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::messages::{OrderInfo, SwapMethod};
    use crate::store::records::{LegRole, TradeRole};
    use crate::utill::now_ts;

    fn dummy_trade() -> Trade {
        let order = OrderInfo {
            order_id: "ord-1".into(),
            maker_peer_id: "peerA".into(),
            offer_chain: "BTC".into(),
            offer_amount: 100_000,
            request_chain: "ETH".into(),
            request_amount: 1_000_000_000_000_000_000,
            method: SwapMethod::Htlc,
            created_at: now_ts(),
        };
        Trade::new(
            TradeId::new_random(),
            &order,
            "peerB",
            TradeRole::Maker,
            SwapMethod::Htlc,
        )
    }

    fn funded_leg(trade: &Trade, confirms: u32, timeout_blocks: Option<u32>) -> SwapLeg {
        let mut leg = SwapLeg::new(trade.id, LegType::Offer, "BTC", LegRole::Sender);
        leg.state = LegState::Funded;
        leg.funding_txid = Some("aa".repeat(32));
        leg.funding_confirms = confirms;
        leg.timeout_height = timeout_blocks;
        leg
    }

    #[test]
    fn test_timeout_by_blocks() {
        let trade = dummy_trade();
        let now = now_ts();

        // Before the timelock: nothing.
        let leg = funded_leg(&trade, 100, Some(144));
        assert_eq!(evaluate_leg_timeout(&trade, &leg, now), None);

        // Past the timelock: eligible.
        let leg = funded_leg(&trade, 144, Some(144));
        assert!(matches!(
            evaluate_leg_timeout(&trade, &leg, now),
            Some(TimeoutAction::RefundEligible { .. })
        ));

        // Past the margin: required.
        let leg = funded_leg(&trade, 151, Some(144));
        assert!(matches!(
            evaluate_leg_timeout(&trade, &leg, now),
            Some(TimeoutAction::RefundRequired { .. })
        ));
    }

    #[test]
    fn test_timeout_by_timestamp() {
        let trade = dummy_trade();
        let now = now_ts();
        let mut leg = funded_leg(&trade, 1, None);
        leg.timeout_timestamp = Some(now + 600);
        assert_eq!(evaluate_leg_timeout(&trade, &leg, now), None);

        leg.timeout_timestamp = Some(now - 10);
        assert!(matches!(
            evaluate_leg_timeout(&trade, &leg, now),
            Some(TimeoutAction::RefundEligible { .. })
        ));

        leg.timeout_timestamp = Some(now - REFUND_REQUIRED_MARGIN_SECS - 1);
        assert!(matches!(
            evaluate_leg_timeout(&trade, &leg, now),
            Some(TimeoutAction::RefundRequired { .. })
        ));
    }

    #[test]
    fn test_unfunded_or_terminal_legs_are_skipped() {
        let trade = dummy_trade();
        let now = now_ts();

        let mut unfunded = funded_leg(&trade, 200, Some(144));
        unfunded.funding_txid = None;
        assert_eq!(evaluate_leg_timeout(&trade, &unfunded, now), None);

        let mut refunded = funded_leg(&trade, 200, Some(144));
        refunded.state = LegState::Refunded;
        assert_eq!(evaluate_leg_timeout(&trade, &refunded, now), None);
    }
}
