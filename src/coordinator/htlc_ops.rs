//! HTLC operations of the coordinator: funding, secret handling, claims and
//! refunds on both chain families.
//!
//! The canonical HTLC sequencing is enforced here: the responder funds
//! first, the initiator funds once the responder's escrow confirmed, the
//! initiator claims (revealing the secret on-chain), and the responder uses
//! the published secret to claim the other leg before the initiator's
//! refund path opens.

use std::time::Duration;

use alloy_primitives::{Address as EvmAddress, B256, U256};
use bitcoin::{
    hashes::{sha256, Hash},
    Amount, OutPoint,
};

use super::{
    api::{
        evm_addr_of, leg_amount, leg_chain, leg_for_chain, local_addr_on, parse_btc_address,
        swap_addr, FundResult, SwapCoordinator,
    },
    error::{CoordinatorError, PreconditionFailure, ProtocolViolation},
    swap::{SwapMethodState, SwapRole},
};
use crate::{
    chains::{bitcoin::BitcoinBackend, ChainFamily, ChainTx},
    events::SwapEvent,
    protocol::{
        contract, evm,
        evm::EvmHtlcStatus,
        htlc,
        messages::{HtlcClaim, HtlcSecretReveal, Preimage, SwapMessage, SwapMethod, TradeId},
    },
    store::records::{LegState, LegType, TradeState},
    utill::{from_hex_array, now_ts, to_hex, DEFAULT_TX_FEE_RATE},
};

impl SwapCoordinator {
    /// Scan the wallet for funds and broadcast the funding transaction of
    /// the leg this daemon must pay. HTLC trades enforce the canonical
    /// ordering: the initiator only funds after the responder's escrow
    /// confirmed.
    pub fn fund_swap(&self, trade_id: TradeId) -> Result<FundResult, CoordinatorError> {
        let trade = self.trade(trade_id)?;
        if !matches!(trade.state, TradeState::Accepted | TradeState::Funding) {
            return Err(PreconditionFailure::InvalidState {
                state: trade.state,
                action: "fund",
            }
            .into());
        }
        let cell = self.cell(trade_id)?;
        let (leg_type, escrow_spk, is_initiator, remote_funding, already_funded) = {
            let swap = cell.lock()?;
            let leg_type = swap.local_leg();
            let escrow_spk = match &swap.method {
                SwapMethodState::Musig2(state) => state.chain(leg_type).escrow_spk.clone(),
                SwapMethodState::Htlc(state) => state.chain(leg_type).escrow_spk.clone(),
            };
            (
                leg_type,
                escrow_spk,
                swap.role == SwapRole::Initiator,
                swap.remote_funding.clone(),
                swap.local_funding.txid.clone(),
            )
        };
        if let Some(txid) = already_funded {
            let vout = cell.lock()?.local_funding.vout.unwrap_or(0);
            return Ok(FundResult { txid, vout });
        }
        if trade.method == SwapMethod::Htlc
            && is_initiator
            && (remote_funding.txid.is_none()
                || remote_funding.confirms < self.config.required_confirms)
        {
            return Err(PreconditionFailure::InvalidState {
                state: trade.state,
                action: "initiator funds after responder's escrow confirms",
            }
            .into());
        }

        let chain = leg_chain(&trade, leg_type).to_string();
        let params = self.params(&chain)?;
        match params.family {
            ChainFamily::Bitcoin => {
                let escrow_spk = escrow_spk.ok_or(PreconditionFailure::MissingPubKey)?;
                let amount = Amount::from_sat(leg_amount(&trade, leg_type)? as u64);
                let backend = self.backend(&chain)?;
                let (funding_tx, vout) = self.with_wallet(|wallet| {
                    Ok(wallet.build_funding_tx(
                        backend.bitcoin()?,
                        &self.store,
                        &chain,
                        escrow_spk,
                        amount,
                    )?)
                })?;
                let txid = backend.broadcast(&ChainTx::Bitcoin(funding_tx))?;
                self.set_funding_tx(trade_id, &txid, vout, true)?;
                Ok(FundResult { txid, vout })
            }
            ChainFamily::Evm => {
                let tx_hash = self.create_evm_htlc(trade_id, &chain)?;
                Ok(FundResult {
                    txid: tx_hash,
                    vout: 0,
                })
            }
        }
    }

    /// HTLC-only: hand the preimage to the counterparty. Only the initiator
    /// may reveal, and only once both escrows are confirmed.
    pub fn reveal_secret(&self, trade_id: TradeId) -> Result<Preimage, CoordinatorError> {
        let trade = self.trade(trade_id)?;
        let cell = self.cell(trade_id)?;
        {
            let swap = cell.lock()?;
            if swap.role != SwapRole::Initiator {
                return Err(PreconditionFailure::InvalidState {
                    state: trade.state,
                    action: "only the initiator reveals the secret",
                }
                .into());
            }
            if !swap.both_funded(self.config.required_confirms) {
                return Err(PreconditionFailure::MissingFunding.into());
            }
        }
        let secret = self
            .store
            .secret(trade_id)?
            .and_then(|record| record.secret)
            .ok_or(PreconditionFailure::MissingSecretHash)?;
        let preimage = from_hex_array::<32>(&secret)
            .map_err(|_| CoordinatorError::Invariant("stored secret is not 32 bytes"))?;

        self.send_to_peer(
            &trade,
            SwapMessage::HtlcSecretReveal(HtlcSecretReveal {
                secret_hex: to_hex(&preimage),
            }),
            None,
        )?;
        self.events
            .publish(SwapEvent::HtlcSecretRevealed { trade_id });
        Ok(preimage)
    }

    /// HTLC-only: accept a revealed preimage, from the peer or from chain
    /// observation. Validates against the stored hash before anything else.
    pub fn set_revealed_secret(
        &self,
        trade_id: TradeId,
        preimage: &Preimage,
    ) -> Result<(), CoordinatorError> {
        let cell = self.cell(trade_id)?;
        {
            let mut swap = cell.lock()?;
            let state = swap
                .htlc_mut()
                .ok_or(PreconditionFailure::MethodMismatch)?;
            let hash = state
                .secret_hash
                .ok_or(PreconditionFailure::MissingSecretHash)?;
            let computed = sha256::Hash::hash(preimage);
            if computed.to_byte_array() != hash {
                return Err(ProtocolViolation::SecretHashMismatch.into());
            }
            state.secret = Some(*preimage);
        }
        self.store.set_revealed_secret(trade_id, preimage)?;
        self.events
            .publish(SwapEvent::HtlcSecretRevealed { trade_id });
        Ok(())
    }

    /// Claim a Bitcoin-family HTLC output with the known preimage,
    /// publishing the secret on-chain in the process.
    pub fn claim_htlc(&self, trade_id: TradeId, chain: &str) -> Result<String, CoordinatorError> {
        let trade = self.trade(trade_id)?;
        let leg_type = leg_for_chain(&trade, chain)?;
        let params = self.params(chain)?;
        if params.family != ChainFamily::Bitcoin {
            return Err(PreconditionFailure::UnknownChain(chain.to_string()).into());
        }
        let cell = self.cell(trade_id)?;
        let (redeem_script, outpoint, value, dest_spk, privkey, pubkey, preimage) = {
            let swap = cell.lock()?;
            if leg_type != swap.remote_leg() {
                return Err(PreconditionFailure::InvalidState {
                    state: trade.state,
                    action: "claim on a leg we do not receive",
                }
                .into());
            }
            let state = swap.htlc().ok_or(PreconditionFailure::MethodMismatch)?;
            let preimage = state
                .secret
                .ok_or(PreconditionFailure::MissingSecretHash)?;
            let data = state.chain(leg_type);
            let redeem_script = data
                .redeem_script
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
            (
                redeem_script,
                outpoint,
                value,
                dest_spk,
                swap.local_privkey,
                swap.local_pubkey,
                preimage,
            )
        };

        let backend = self.backend(chain)?;
        let fee_rate = backend.estimate_fee_rate().unwrap_or(DEFAULT_TX_FEE_RATE);
        let miner_fee = contract::calculate_miner_fee(fee_rate, contract::REFUND_TX_VBYTE_SIZE);
        let mut claim_tx = contract::create_htlc_claim_tx(outpoint, value, dest_spk, miner_fee)?;
        let signature =
            contract::sign_p2wsh_input(&claim_tx, &redeem_script, value, 0, &privkey)?;
        claim_tx.input[0].witness =
            htlc::create_claim_witness(&signature, &pubkey, &preimage, &redeem_script);
        let txid = backend.broadcast(&ChainTx::Bitcoin(claim_tx))?;
        log::info!("[{}] claimed htlc on {}: {}", trade_id, chain, txid);

        self.send_to_peer(
            &trade,
            SwapMessage::HtlcClaim(HtlcClaim {
                chain: chain.to_string(),
                txid: txid.clone(),
                secret_hex: Some(to_hex(&preimage)),
            }),
            None,
        )?;
        self.complete_swap(trade_id, &txid)?;
        Ok(txid)
    }

    /// Refund a Bitcoin-family HTLC output through its timelock branch.
    pub fn refund_htlc(&self, trade_id: TradeId, chain: &str) -> Result<String, CoordinatorError> {
        let trade = self.trade(trade_id)?;
        let leg_type = leg_for_chain(&trade, chain)?;
        let params = self.params(chain)?;
        let cell = self.cell(trade_id)?;
        let (redeem_script, outpoint, value, dest_spk, privkey, pubkey, timeout) = {
            let swap = cell.lock()?;
            if leg_type != swap.local_leg() {
                return Err(PreconditionFailure::InvalidState {
                    state: trade.state,
                    action: "refund on a leg we did not fund",
                }
                .into());
            }
            let state = swap.htlc().ok_or(PreconditionFailure::MethodMismatch)?;
            let data = state.chain(leg_type);
            let redeem_script = data
                .redeem_script
                .clone()
                .ok_or(PreconditionFailure::MissingPubKey)?;
            let timeout = data
                .timelock_blocks
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
            (
                redeem_script,
                outpoint,
                value,
                dest_spk,
                swap.local_privkey,
                swap.local_pubkey,
                timeout,
            )
        };

        let backend = self.backend(chain)?;
        let fee_rate = backend.estimate_fee_rate().unwrap_or(DEFAULT_TX_FEE_RATE);
        let miner_fee = contract::calculate_miner_fee(fee_rate, contract::REFUND_TX_VBYTE_SIZE);
        let mut refund_tx =
            contract::create_refund_tx(outpoint, value, dest_spk, timeout, miner_fee)?;
        let signature =
            contract::sign_p2wsh_input(&refund_tx, &redeem_script, value, 0, &privkey)?;
        refund_tx.input[0].witness =
            htlc::create_refund_witness(&signature, &pubkey, &redeem_script);
        let txid = backend.broadcast(&ChainTx::Bitcoin(refund_tx))?;
        log::info!("[{}] refunded htlc on {}: {}", trade_id, chain, txid);

        self.finish_refund(trade_id, leg_type, &txid)?;
        Ok(txid)
    }

    /// Decode a spending transaction's witness to recover a published
    /// preimage, then store it.
    pub fn extract_secret_from_tx(
        &self,
        trade_id: TradeId,
        txid: &str,
        chain: &str,
    ) -> Result<Preimage, CoordinatorError> {
        let secret_hash = {
            let cell = self.cell(trade_id)?;
            let swap = cell.lock()?;
            swap.htlc()
                .and_then(|state| state.secret_hash)
                .ok_or(PreconditionFailure::MissingSecretHash)?
        };
        let transaction = self
            .backend(chain)?
            .bitcoin()?
            .get_transaction(txid)?
            .ok_or(CoordinatorError::PreconditionNotMet("spending tx not found"))?;
        let preimage = htlc::extract_preimage_from_tx(&transaction, &secret_hash).ok_or(
            ProtocolViolation::PeerProtocolViolation("spending tx does not carry the preimage"),
        )?;
        self.set_revealed_secret(trade_id, &preimage)?;
        Ok(preimage)
    }

    // ------------------------------------------------------------------
    // EVM mirrors
    // ------------------------------------------------------------------

    /// Open our escrow entry in the chain's swap contract.
    pub fn create_evm_htlc(&self, trade_id: TradeId, chain: &str) -> Result<String, CoordinatorError> {
        let trade = self.trade(trade_id)?;
        let leg_type = leg_for_chain(&trade, chain)?;
        let cell = self.cell(trade_id)?;
        let (secret_hash, timelock_ts, receiver_addr) = {
            let swap = cell.lock()?;
            if leg_type != swap.local_leg() {
                return Err(PreconditionFailure::InvalidState {
                    state: trade.state,
                    action: "create an escrow we do not fund",
                }
                .into());
            }
            let state = swap.htlc().ok_or(PreconditionFailure::MethodMismatch)?;
            let data = state.chain(leg_type);
            (
                state
                    .secret_hash
                    .ok_or(PreconditionFailure::MissingSecretHash)?,
                data.timelock_ts
                    .ok_or(PreconditionFailure::MissingPubKey)?,
                evm_addr_of(swap_addr(&swap, &trade, leg_type, false), "receiver")?,
            )
        };
        let amount = U256::from(leg_amount(&trade, leg_type)?);
        let backend = self.backend(chain)?;
        let evm_backend = backend.evm()?;

        let (from, seckey) = self.with_wallet(|wallet| {
            let (_, seckey) = wallet.evm_keypair()?;
            Ok((wallet.evm_address()?, seckey))
        })?;
        let data = evm::encode_new_swap(
            receiver_addr,
            EvmAddress::ZERO,
            amount,
            B256::from(secret_hash),
            U256::from(timelock_ts),
        );
        let tx_hash =
            evm_backend.send_contract_call(&seckey, from, data, amount, evm::NEW_SWAP_GAS_LIMIT)?;
        log::info!("[{}] opened evm htlc on {}: {}", trade_id, chain, tx_hash);

        self.set_funding_tx(trade_id, &tx_hash, 0, true)?;
        self.events.publish(SwapEvent::EvmHtlcCreated {
            trade_id,
            chain: chain.to_string(),
            tx_hash: tx_hash.clone(),
        });
        Ok(tx_hash)
    }

    /// Claim the counterparty's contract escrow with the known preimage.
    /// The contract emits `Claimed(secretHash, secret)`, which is how the
    /// counterparty (and anyone else) learns the secret.
    pub fn claim_evm_htlc(&self, trade_id: TradeId, chain: &str) -> Result<String, CoordinatorError> {
        let trade = self.trade(trade_id)?;
        let leg_type = leg_for_chain(&trade, chain)?;
        let cell = self.cell(trade_id)?;
        let (swap_id, preimage) = {
            let swap = cell.lock()?;
            if leg_type != swap.remote_leg() {
                return Err(PreconditionFailure::InvalidState {
                    state: trade.state,
                    action: "claim on a leg we do not receive",
                }
                .into());
            }
            let state = swap.htlc().ok_or(PreconditionFailure::MethodMismatch)?;
            (
                state
                    .chain(leg_type)
                    .evm_swap_id
                    .ok_or(PreconditionFailure::MissingPubKey)?,
                state
                    .secret
                    .ok_or(PreconditionFailure::MissingSecretHash)?,
            )
        };
        let backend = self.backend(chain)?;
        let evm_backend = backend.evm()?;
        let (from, seckey) = self.with_wallet(|wallet| {
            let (_, seckey) = wallet.evm_keypair()?;
            Ok((wallet.evm_address()?, seckey))
        })?;
        let data = evm::encode_claim(swap_id, B256::from(preimage));
        let tx_hash = evm_backend.send_contract_call(
            &seckey,
            from,
            data,
            U256::ZERO,
            evm::CLAIM_GAS_LIMIT,
        )?;
        log::info!("[{}] claimed evm htlc on {}: {}", trade_id, chain, tx_hash);

        self.send_to_peer(
            &trade,
            SwapMessage::HtlcClaim(HtlcClaim {
                chain: chain.to_string(),
                txid: tx_hash.clone(),
                secret_hex: Some(to_hex(&preimage)),
            }),
            None,
        )?;
        self.events.publish(SwapEvent::EvmHtlcClaimed {
            trade_id,
            chain: chain.to_string(),
            tx_hash: tx_hash.clone(),
        });
        self.complete_swap(trade_id, &tx_hash)?;
        Ok(tx_hash)
    }

    /// Refund our contract escrow after its timelock expired.
    pub fn refund_evm_htlc(&self, trade_id: TradeId, chain: &str) -> Result<String, CoordinatorError> {
        let trade = self.trade(trade_id)?;
        let leg_type = leg_for_chain(&trade, chain)?;
        let cell = self.cell(trade_id)?;
        let (swap_id, timelock_ts) = {
            let swap = cell.lock()?;
            if leg_type != swap.local_leg() {
                return Err(PreconditionFailure::InvalidState {
                    state: trade.state,
                    action: "refund on a leg we did not fund",
                }
                .into());
            }
            let state = swap.htlc().ok_or(PreconditionFailure::MethodMismatch)?;
            let data = state.chain(leg_type);
            (
                data.evm_swap_id.ok_or(PreconditionFailure::MissingPubKey)?,
                data.timelock_ts.ok_or(PreconditionFailure::MissingPubKey)?,
            )
        };
        if now_ts() < timelock_ts {
            return Err(PreconditionFailure::InvalidState {
                state: trade.state,
                action: "refund before the timelock expired",
            }
            .into());
        }
        let backend = self.backend(chain)?;
        let evm_backend = backend.evm()?;
        let (from, seckey) = self.with_wallet(|wallet| {
            let (_, seckey) = wallet.evm_keypair()?;
            Ok((wallet.evm_address()?, seckey))
        })?;
        let tx_hash = evm_backend.send_contract_call(
            &seckey,
            from,
            evm::encode_refund(swap_id),
            U256::ZERO,
            evm::REFUND_GAS_LIMIT,
        )?;
        log::info!("[{}] refunded evm htlc on {}: {}", trade_id, chain, tx_hash);

        self.events.publish(SwapEvent::EvmHtlcRefunded {
            trade_id,
            chain: chain.to_string(),
            tx_hash: tx_hash.clone(),
        });
        self.finish_refund(trade_id, leg_type, &tx_hash)?;
        Ok(tx_hash)
    }

    /// The contract-side status of one leg's escrow entry.
    pub fn get_evm_htlc_status(
        &self,
        trade_id: TradeId,
        chain: &str,
    ) -> Result<EvmHtlcStatus, CoordinatorError> {
        let trade = self.trade(trade_id)?;
        let leg_type = leg_for_chain(&trade, chain)?;
        let swap_id = {
            let cell = self.cell(trade_id)?;
            let swap = cell.lock()?;
            swap.htlc()
                .and_then(|state| state.chain(leg_type).evm_swap_id)
                .ok_or(PreconditionFailure::MissingPubKey)?
        };
        Ok(self.backend(chain)?.evm()?.htlc_status(swap_id)?)
    }

    /// Block until the chain's `Claimed` event reveals the secret, or the
    /// caller-supplied deadline passes. Found secrets are stored.
    pub fn wait_for_evm_secret(
        &self,
        trade_id: TradeId,
        chain: &str,
        deadline_secs: u64,
    ) -> Result<Option<Preimage>, CoordinatorError> {
        let trade = self.trade(trade_id)?;
        let leg_type = leg_for_chain(&trade, chain)?;
        let (secret_hash, from_block) = {
            let cell = self.cell(trade_id)?;
            let swap = cell.lock()?;
            let state = swap.htlc().ok_or(PreconditionFailure::MethodMismatch)?;
            (
                state
                    .secret_hash
                    .ok_or(PreconditionFailure::MissingSecretHash)?,
                state.chain(leg_type).created_block.unwrap_or(0),
            )
        };
        let secret = self.backend(chain)?.evm()?.wait_for_claimed_secret(
            B256::from(secret_hash),
            from_block,
            Duration::from_secs(deadline_secs),
        )?;
        if let Some(preimage) = secret {
            self.set_revealed_secret(trade_id, &preimage)?;
            return Ok(Some(preimage));
        }
        Ok(None)
    }

    /// Shared refund bookkeeping: leg row, trade state, event, cell.
    pub(crate) fn finish_refund(
        &self,
        trade_id: TradeId,
        leg_type: LegType,
        refund_txid: &str,
    ) -> Result<(), CoordinatorError> {
        let mut leg = self
            .store
            .leg(trade_id, leg_type)?
            .ok_or(CoordinatorError::Invariant("trade without leg row"))?;
        leg.refund_txid = Some(refund_txid.to_string());
        leg.state = LegState::Refunded;
        self.store.upsert_leg(leg)?;
        self.store
            .update_trade_state(trade_id, TradeState::Refunded, None)?;
        self.remove_cell(trade_id);
        self.events.publish(SwapEvent::SwapRefunded {
            trade_id,
            reason: "timelock refund".to_string(),
        });
        Ok(())
    }
}
