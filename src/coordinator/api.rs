//! The Swap Coordinator API.
//!
//! Owns the in-memory registry of active swaps keyed by trade-id and drives
//! each trade through its state machine. Every operation is serialised per
//! trade: the trade's cell mutex is held across the whole transition
//! (load, validate, crypto, persist, emit). The coordinator never blocks
//! waiting for the counterparty inline; progress is event-driven via the
//! message handlers and the housekeeping sweep.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{atomic::AtomicBool, Arc, Mutex, RwLock},
};

use alloy_primitives::{Address as EvmAddress, B256, U256};
use bitcoin::{
    hashes::{sha256, Hash},
    Address, Amount, OutPoint, PublicKey,
};

use super::{
    config::CoordinatorConfig,
    error::{CoordinatorError, PreconditionFailure, ProtocolViolation},
    swap::{
        ActiveSwap, ChainMusigData, FundingSide, LegMethodData, SwapMethodState, SwapPair,
        SwapRole,
    },
};
use crate::{
    chains::{bitcoin::BitcoinBackend, ChainBackend, ChainFamily, ChainParams, ChainTx},
    events::{EventBus, SwapEvent},
    messenger::{message_deadline, Messenger},
    protocol::{
        contract, evm, htlc,
        messages::{
            FundingInfo, HtlcSecretHash, MessageEnvelope, NonceExchange, OrderInfo, OrderTake,
            PartialSigExchange, PubkeyExchange, SwapMessage, SwapMethod, TradeId,
        },
        musig,
    },
    store::{
        records::{
            LegRole, LegState, LegType, SecretOrigin, SecretRecord, SwapLeg, Trade, TradeRole,
            TradeState,
        },
        SwapStore,
    },
    utill::{
        from_hex, from_hex_array, generate_keypair, generate_preimage, now_ts, to_hex,
        DEFAULT_TX_FEE_RATE,
    },
    wallet::Wallet,
};

/// Result of broadcasting a funding transaction.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FundResult {
    pub txid: String,
    pub vout: u32,
}

/// Owned snapshot of a trade's externally visible state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SwapStatus {
    pub trade: Trade,
    pub legs: Vec<SwapLeg>,
    pub swap_type: SwapPair,
    pub secret_hash: Option<String>,
    pub secret_revealed: bool,
}

/// The coordinator. One instance per daemon; everything it needs is
/// injected at construction, it never reads a singleton.
pub struct SwapCoordinator {
    pub config: CoordinatorConfig,
    pub(crate) chain_params: HashMap<String, ChainParams>,
    pub(crate) backends: HashMap<String, Arc<ChainBackend>>,
    pub store: Arc<SwapStore>,
    pub(crate) wallet: RwLock<Option<Wallet>>,
    pub(crate) messenger: Messenger,
    pub events: EventBus,
    /// trade-id -> exclusively locked working set. The outer lock is only
    /// written on insert and remove.
    pub(crate) active: RwLock<HashMap<TradeId, Arc<Mutex<ActiveSwap>>>>,
    pub shutdown: AtomicBool,
}

impl SwapCoordinator {
    pub fn init(
        config: CoordinatorConfig,
        chain_params: Vec<ChainParams>,
        backends: HashMap<String, Arc<ChainBackend>>,
        store: Arc<SwapStore>,
        wallet: Option<Wallet>,
    ) -> Arc<Self> {
        let messenger = Messenger::new(store.clone());
        Arc::new(Self {
            config,
            chain_params: chain_params
                .into_iter()
                .map(|p| (p.symbol.clone(), p))
                .collect(),
            backends,
            store,
            wallet: RwLock::new(wallet),
            messenger,
            events: EventBus::new(),
            active: RwLock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Wallet lock/unlock events propagate through here.
    pub fn set_wallet(&self, wallet: Option<Wallet>) {
        if let Ok(mut guard) = self.wallet.write() {
            *guard = wallet;
        }
    }

    pub(crate) fn with_wallet<T>(
        &self,
        f: impl FnOnce(&Wallet) -> Result<T, CoordinatorError>,
    ) -> Result<T, CoordinatorError> {
        let guard = self.wallet.read()?;
        match guard.as_ref() {
            Some(wallet) => f(wallet),
            None => Err(PreconditionFailure::WalletLocked.into()),
        }
    }

    pub(crate) fn params(&self, chain: &str) -> Result<&ChainParams, CoordinatorError> {
        self.chain_params
            .get(chain)
            .ok_or_else(|| PreconditionFailure::UnknownChain(chain.to_string()).into())
    }

    pub(crate) fn backend(&self, chain: &str) -> Result<Arc<ChainBackend>, CoordinatorError> {
        self.backends
            .get(chain)
            .cloned()
            .ok_or_else(|| PreconditionFailure::UnknownChain(chain.to_string()).into())
    }

    pub(crate) fn cell(&self, trade_id: TradeId) -> Result<Arc<Mutex<ActiveSwap>>, CoordinatorError> {
        self.active
            .read()?
            .get(&trade_id)
            .cloned()
            .ok_or_else(|| PreconditionFailure::UnknownTrade.into())
    }

    pub(crate) fn insert_cell(
        &self,
        trade_id: TradeId,
        swap: ActiveSwap,
    ) -> Result<Arc<Mutex<ActiveSwap>>, CoordinatorError> {
        let mut active = self.active.write()?;
        if active.contains_key(&trade_id) {
            return Err(PreconditionFailure::DuplicateSwap.into());
        }
        let cell = Arc::new(Mutex::new(swap));
        active.insert(trade_id, cell.clone());
        Ok(cell)
    }

    pub(crate) fn remove_cell(&self, trade_id: TradeId) {
        if let Ok(mut active) = self.active.write() {
            active.remove(&trade_id);
        }
    }

    pub(crate) fn trade(&self, trade_id: TradeId) -> Result<Trade, CoordinatorError> {
        self.store
            .trade(trade_id)?
            .ok_or_else(|| PreconditionFailure::UnknownTrade.into())
    }

    fn counterparty(&self, trade: &Trade) -> String {
        match trade.our_role {
            TradeRole::Maker => trade.taker_peer_id.clone(),
            TradeRole::Taker => trade.maker_peer_id.clone(),
        }
    }

    /// Emit one direct message to the trade's counterparty. The deadline is
    /// the configured default, clamped to the responder-side timelock once
    /// one is known.
    pub(crate) fn send_to_peer(
        &self,
        trade: &Trade,
        payload: SwapMessage,
        timestamp_override: Option<u64>,
    ) -> Result<(), CoordinatorError> {
        let mut envelope = MessageEnvelope::new(trade.id, &self.config.peer_id, payload)
            .with_order_id(&trade.order_id);
        if let Some(timestamp) = timestamp_override {
            envelope.timestamp = timestamp;
        }
        let timelock_ts = self
            .store
            .leg(trade.id, LegType::Request)?
            .and_then(|leg| leg.timeout_timestamp);
        let deadline = message_deadline(now_ts(), self.config.message_deadline_secs, timelock_ts);
        self.messenger
            .send_direct(&self.counterparty(trade), trade.id, deadline, envelope)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Trade creation
    // ------------------------------------------------------------------

    /// Taker-side entry: commit to a peer's order, creating the trade and
    /// announcing the take on the broadcast layer.
    pub fn take_order(
        &self,
        order_id: &str,
        method: SwapMethod,
    ) -> Result<TradeId, CoordinatorError> {
        let order = self
            .store
            .order(order_id)?
            .ok_or(PreconditionFailure::UnknownOrder)?;
        if order.ours || order.cancelled {
            return Err(PreconditionFailure::InvalidOffer("order not takeable").into());
        }
        let trade_id = TradeId::new_random();
        self.create_swap(trade_id, &order.order, &self.config.peer_id, TradeRole::Taker, method)?;

        let trade = self.trade(trade_id)?;
        let take = SwapMessage::OrderTake(OrderTake {
            trade_id,
            order_id: order_id.to_string(),
            taker_peer_id: self.config.peer_id.clone(),
            method,
            offer_amount: order.order.offer_amount,
            request_amount: order.order.request_amount,
        });
        // The take rides broadcast; the maker answers on the direct path.
        self.messenger.broadcast(
            MessageEnvelope::new(trade_id, &self.config.peer_id, take.clone())
                .with_order_id(order_id),
        )?;
        self.send_to_peer(&trade, take, None)?;
        Ok(trade_id)
    }

    /// Maker-side entry, driven by an incoming order take (or the RPC).
    /// Generates the swap keypair (and the hashlock secret for HTLC trades),
    /// persists the new swap and emits the opening message.
    pub fn initiate_swap(
        &self,
        trade_id: TradeId,
        order_id: &str,
        taker_peer_id: &str,
        method: SwapMethod,
    ) -> Result<PublicKey, CoordinatorError> {
        let order = self
            .store
            .order(order_id)?
            .ok_or(PreconditionFailure::UnknownOrder)?;
        if !order.ours {
            return Err(PreconditionFailure::NotOurOrder.into());
        }
        if order.cancelled {
            return Err(PreconditionFailure::InvalidOffer("order cancelled").into());
        }
        let pubkey = self.create_swap(trade_id, &order.order, taker_peer_id, TradeRole::Maker, method)?;
        let trade = self.trade(trade_id)?;

        match method {
            SwapMethod::Musig2 => {
                let (offer_addr, request_addr) = self.local_wallet_addrs(trade_id)?;
                self.send_to_peer(
                    &trade,
                    SwapMessage::PubkeyExchange(PubkeyExchange {
                        pubkey_hex: to_hex(&pubkey.to_bytes()),
                        offer_wallet_addr: offer_addr,
                        request_wallet_addr: request_addr,
                    }),
                    None,
                )?;
            }
            SwapMethod::Htlc => {
                let secret = self
                    .store
                    .secret(trade_id)?
                    .ok_or(CoordinatorError::Invariant("htlc swap without secret row"))?;
                let (offer_addr, request_addr) = self.local_wallet_addrs(trade_id)?;
                // The envelope timestamp doubles as the shared timelock
                // anchor, so both sides derive identical EVM swap-ids.
                self.send_to_peer(
                    &trade,
                    SwapMessage::HtlcSecretHash(HtlcSecretHash {
                        secret_hash_hex: secret.secret_hash.clone(),
                        pubkey_hex: to_hex(&pubkey.to_bytes()),
                        offer_wallet_addr: offer_addr,
                        request_wallet_addr: request_addr,
                    }),
                    Some(secret.created_at),
                )?;
            }
        }
        self.events.publish(SwapEvent::SwapInitialized { trade_id });
        Ok(pubkey)
    }

    /// Responder-side mirror of [Self::initiate_swap]: requires the
    /// initiator's public key, and their secret hash for HTLC trades.
    pub fn respond_to_swap(
        &self,
        trade_id: TradeId,
        order_id: &str,
        remote_pubkey_hex: &str,
        secret_hash_hex: Option<&str>,
        secret_anchor_ts: Option<u64>,
        remote_offer_addr: Option<String>,
        remote_request_addr: Option<String>,
        method: SwapMethod,
    ) -> Result<PublicKey, CoordinatorError> {
        if method == SwapMethod::Htlc && secret_hash_hex.is_none() {
            return Err(PreconditionFailure::MissingSecretHash.into());
        }
        // The trade may already exist from take_order; otherwise this is a
        // fresh response to a direct approach.
        let pubkey = match self.store.trade(trade_id)? {
            Some(trade) => {
                let cell = self.cell(trade_id)?;
                let pubkey = cell.lock()?.local_pubkey;
                if trade.method != method {
                    return Err(PreconditionFailure::MethodMismatch.into());
                }
                pubkey
            }
            None => {
                let order = self
                    .store
                    .order(order_id)?
                    .ok_or(PreconditionFailure::UnknownOrder)?;
                self.create_swap(trade_id, &order.order, &self.config.peer_id, TradeRole::Taker, method)?
            }
        };

        if let Some(hash_hex) = secret_hash_hex {
            let hash = from_hex_array::<32>(hash_hex)
                .map_err(|_| ProtocolViolation::PeerProtocolViolation("malformed secret hash"))?;
            self.set_remote_secret_hash(
                trade_id,
                &hash,
                secret_anchor_ts.unwrap_or_else(now_ts),
                remote_offer_addr.clone(),
                remote_request_addr.clone(),
            )?;
        }

        let remote = from_hex(remote_pubkey_hex)
            .map_err(|_| ProtocolViolation::PeerProtocolViolation("malformed pubkey hex"))?;
        self.set_remote_pubkey(trade_id, &remote, remote_offer_addr, remote_request_addr)?;

        // Answer with our own key and receive addresses.
        let trade = self.trade(trade_id)?;
        let (offer_addr, request_addr) = self.local_wallet_addrs(trade_id)?;
        self.send_to_peer(
            &trade,
            SwapMessage::PubkeyExchange(PubkeyExchange {
                pubkey_hex: to_hex(&pubkey.to_bytes()),
                offer_wallet_addr: offer_addr,
                request_wallet_addr: request_addr,
            }),
            None,
        )?;
        Ok(pubkey)
    }

    /// Shared trade construction: rows, legs, secret (HTLC maker side) and
    /// the in-memory working set.
    fn create_swap(
        &self,
        trade_id: TradeId,
        order: &OrderInfo,
        taker_peer_id: &str,
        our_role: TradeRole,
        method: SwapMethod,
    ) -> Result<PublicKey, CoordinatorError> {
        if self.active.read()?.contains_key(&trade_id) {
            return Err(PreconditionFailure::DuplicateSwap.into());
        }
        if order.offer_amount == 0 || order.request_amount == 0 {
            return Err(PreconditionFailure::InvalidOffer("zero amount").into());
        }
        let offer_family = self.params(&order.offer_chain)?.family;
        let request_family = self.params(&order.request_chain)?.family;
        if method == SwapMethod::Musig2
            && (offer_family == ChainFamily::Evm || request_family == ChainFamily::Evm)
        {
            return Err(
                PreconditionFailure::InvalidOffer("musig2 requires bitcoin-family chains").into(),
            );
        }

        let (pubkey, privkey) = generate_keypair();
        let mut trade = Trade::new(trade_id, order, taker_peer_id, our_role, method);
        match our_role {
            TradeRole::Maker => trade.maker_pubkey = Some(to_hex(&pubkey.to_bytes())),
            TradeRole::Taker => trade.taker_pubkey = Some(to_hex(&pubkey.to_bytes())),
        }
        self.store.create_trade(trade)?;
        // The swap key must survive a restart or the refund paths are lost.
        self.store
            .put_swap_key(trade_id, &to_hex(&privkey.secret_bytes()))?;

        let role: SwapRole = our_role.into();
        let (offer_role, request_role) = match role {
            SwapRole::Initiator => (LegRole::Sender, LegRole::Receiver),
            SwapRole::Responder => (LegRole::Receiver, LegRole::Sender),
        };
        self.store.upsert_leg(SwapLeg::new(
            trade_id,
            LegType::Offer,
            &order.offer_chain,
            offer_role,
        ))?;
        self.store.upsert_leg(SwapLeg::new(
            trade_id,
            LegType::Request,
            &order.request_chain,
            request_role,
        ))?;

        let mut swap = ActiveSwap {
            trade_id,
            order_id: order.order_id.clone(),
            role,
            method: SwapMethodState::new(method),
            local_privkey: privkey,
            local_pubkey: pubkey,
            remote_pubkey: None,
            local_funding: FundingSide::default(),
            remote_funding: FundingSide::default(),
            local_offer_wallet_addr: None,
            local_request_wallet_addr: None,
            remote_offer_wallet_addr: None,
            remote_request_wallet_addr: None,
            created_at: now_ts(),
        };
        self.allocate_wallet_addrs(&mut swap, order)?;

        // The HTLC initiator mints the secret here; sha256 of it is the
        // hashlock both escrows share.
        if method == SwapMethod::Htlc && role == SwapRole::Initiator {
            let preimage = generate_preimage();
            let hash = sha256::Hash::hash(&preimage).to_byte_array();
            if let Some(state) = swap.htlc_mut() {
                state.secret = Some(preimage);
                state.secret_hash = Some(hash);
            }
            self.store.put_secret(SecretRecord {
                trade_id,
                secret_hash: to_hex(&hash),
                secret: Some(to_hex(&preimage)),
                created_by: SecretOrigin::Us,
                their_offer_wallet_addr: None,
                their_request_wallet_addr: None,
                created_at: now_ts(),
            })?;
        }

        self.insert_cell(trade_id, swap)?;
        log::info!(
            "[{}] swap created as {:?} ({} {} -> {} {})",
            trade_id,
            role,
            order.offer_amount,
            order.offer_chain,
            order.request_amount,
            order.request_chain
        );
        Ok(pubkey)
    }

    /// Allocate our receive addresses on both chains of the pair.
    fn allocate_wallet_addrs(
        &self,
        swap: &mut ActiveSwap,
        order: &OrderInfo,
    ) -> Result<(), CoordinatorError> {
        for (chain, slot) in [
            (&order.offer_chain, LegType::Offer),
            (&order.request_chain, LegType::Request),
        ] {
            let params = self.params(chain)?;
            let address = match params.family {
                ChainFamily::Bitcoin => self.with_wallet(|wallet| {
                    Ok(wallet
                        .new_swap_address(&self.store, chain, params.network, Some(swap.trade_id))?
                        .to_string())
                })?,
                ChainFamily::Evm => {
                    self.with_wallet(|wallet| Ok(format!("{:#x}", wallet.evm_address()?)))?
                }
            };
            match slot {
                LegType::Offer => swap.local_offer_wallet_addr = Some(address),
                LegType::Request => swap.local_request_wallet_addr = Some(address),
            }
        }
        Ok(())
    }

    fn local_wallet_addrs(&self, trade_id: TradeId) -> Result<(String, String), CoordinatorError> {
        let cell = self.cell(trade_id)?;
        let swap = cell.lock()?;
        Ok((
            swap.local_offer_wallet_addr.clone().unwrap_or_default(),
            swap.local_request_wallet_addr.clone().unwrap_or_default(),
        ))
    }

    // ------------------------------------------------------------------
    // Key and escrow setup
    // ------------------------------------------------------------------

    /// Store the counterparty's swap key. Once both keys are known the
    /// escrow programs of both chains are derived and the trade advances to
    /// `accepted`. Receiving the same key twice is a no-op; a conflicting
    /// key is a protocol violation.
    pub fn set_remote_pubkey(
        &self,
        trade_id: TradeId,
        pubkey_bytes: &[u8],
        remote_offer_addr: Option<String>,
        remote_request_addr: Option<String>,
    ) -> Result<(), CoordinatorError> {
        let remote = PublicKey::from_slice(pubkey_bytes)
            .map_err(|_| ProtocolViolation::PeerProtocolViolation("unparseable pubkey"))?;
        let cell = self.cell(trade_id)?;
        let mut swap = cell.lock()?;

        match swap.remote_pubkey {
            Some(existing) if existing == remote => return Ok(()),
            Some(_) => return Err(ProtocolViolation::PubKeyMismatch.into()),
            None => swap.remote_pubkey = Some(remote),
        }
        if remote_offer_addr.is_some() {
            swap.remote_offer_wallet_addr = remote_offer_addr;
        }
        if remote_request_addr.is_some() {
            swap.remote_request_wallet_addr = remote_request_addr;
        }

        let mut trade = self.trade(trade_id)?;
        match trade.our_role {
            TradeRole::Maker => trade.taker_pubkey = Some(to_hex(&remote.to_bytes())),
            TradeRole::Taker => trade.maker_pubkey = Some(to_hex(&remote.to_bytes())),
        }
        let trade = self.store.update_trade(trade)?;

        self.derive_escrows(&trade, &mut swap)?;
        if trade.state == TradeState::Init {
            self.store
                .update_trade_state(trade_id, TradeState::Accepted, None)?;
        }
        self.events.publish(SwapEvent::PubkeyReceived { trade_id });
        Ok(())
    }

    /// HTLC responder path: store the initiator's hashlock and the shared
    /// timelock anchor.
    pub fn set_remote_secret_hash(
        &self,
        trade_id: TradeId,
        secret_hash: &[u8; 32],
        anchor_ts: u64,
        their_offer_addr: Option<String>,
        their_request_addr: Option<String>,
    ) -> Result<(), CoordinatorError> {
        let cell = self.cell(trade_id)?;
        let mut swap = cell.lock()?;
        if let Some(state) = swap.htlc_mut() {
            match state.secret_hash {
                Some(existing) if existing == *secret_hash => return Ok(()),
                Some(_) => {
                    return Err(ProtocolViolation::SecretHashMismatch.into());
                }
                None => state.secret_hash = Some(*secret_hash),
            }
        } else {
            return Err(PreconditionFailure::MethodMismatch.into());
        }
        self.store.put_secret(SecretRecord {
            trade_id,
            secret_hash: to_hex(secret_hash),
            secret: None,
            created_by: SecretOrigin::Them,
            their_offer_wallet_addr: their_offer_addr,
            their_request_wallet_addr: their_request_addr,
            created_at: anchor_ts,
        })?;
        Ok(())
    }

    /// Derive the escrow program of each chain once both keys are known.
    pub(crate) fn derive_escrows(
        &self,
        trade: &Trade,
        swap: &mut ActiveSwap,
    ) -> Result<(), CoordinatorError> {
        let remote = match swap.remote_pubkey {
            Some(remote) => remote,
            None => return Ok(()),
        };
        let local = swap.local_pubkey;
        let (maker_pub, taker_pub) = match trade.our_role {
            TradeRole::Maker => (local, remote),
            TradeRole::Taker => (remote, local),
        };

        for leg_type in [LegType::Offer, LegType::Request] {
            let chain = leg_chain(trade, leg_type).to_string();
            let params = self.params(&chain)?;
            let mut leg = self
                .store
                .leg(trade.id, leg_type)?
                .ok_or(CoordinatorError::Invariant("trade without leg row"))?;
            let prior_data = leg
                .method_data
                .as_deref()
                .and_then(LegMethodData::from_json)
                .unwrap_or_default();
            let sender_wallet_addr = swap_addr(swap, trade, leg_type, true);
            let receiver_wallet_addr = swap_addr(swap, trade, leg_type, false);
            // The leg's funder refunds through the timelock path.
            let (sender_pub, receiver_pub) = match leg_type {
                LegType::Offer => (maker_pub, taker_pub),
                LegType::Request => (taker_pub, maker_pub),
            };

            match (&mut swap.method, params.family) {
                (SwapMethodState::Musig2(state), ChainFamily::Bitcoin) => {
                    let (funder_xonly, _) = sender_pub.inner.x_only_public_key();
                    let csv_delta = self.config.refund_csv_delta;
                    let leaf = contract::create_refund_leaf(csv_delta, &funder_xonly);
                    let merkle_root = contract::refund_leaf_merkle_root(&leaf);
                    let ctx = musig::key_agg_tweaked(&local, &remote, &merkle_root)?;
                    let output_key = musig::aggregated_xonly(&ctx)?;
                    let spk = contract::p2tr_script_pubkey(output_key);

                    let data = state.chain_mut(leg_type);
                    data.key_agg = Some(ctx);
                    data.agg_xonly = Some(output_key);
                    data.escrow_spk = Some(spk.clone());
                    data.refund_leaf = Some(leaf.clone());

                    leg.funding_address = self
                        .backend(&chain)?
                        .bitcoin()?
                        .address_of_script(&spk)
                        .map(|a| a.to_string())
                        .ok();
                    leg.timeout_height = Some(csv_delta as u32);
                    // Session fields survive re-derivation (recovery path).
                    leg.method_data = Some(
                        LegMethodData {
                            escrow_spk: Some(to_hex(spk.as_bytes())),
                            refund_leaf: Some(to_hex(leaf.as_bytes())),
                            sender_wallet_addr: sender_wallet_addr.clone(),
                            receiver_wallet_addr: receiver_wallet_addr.clone(),
                            ..prior_data.clone()
                        }
                        .to_json(),
                    );
                }
                (SwapMethodState::Musig2(_), ChainFamily::Evm) => {
                    return Err(CoordinatorError::Invariant("musig2 trade on evm chain"));
                }
                (SwapMethodState::Htlc(state), ChainFamily::Bitcoin) => {
                    let secret_hash = state
                        .secret_hash
                        .ok_or(CoordinatorError::PreconditionNotMet("secret hash not known"))?;
                    let timeout = match leg_type {
                        LegType::Offer => self.config.initiator_timelock_blocks,
                        LegType::Request => self.config.responder_timelock_blocks,
                    };
                    let script = htlc::create_htlc_redeemscript(
                        &secret_hash,
                        &receiver_pub,
                        &sender_pub,
                        timeout,
                    );
                    let spk = contract::redeemscript_to_scriptpubkey(&script);

                    let data = state.chain_mut(leg_type);
                    data.redeem_script = Some(script.clone());
                    data.escrow_spk = Some(spk.clone());
                    data.timelock_blocks = Some(timeout);

                    leg.funding_address = self
                        .backend(&chain)?
                        .bitcoin()?
                        .address_of_script(&spk)
                        .map(|a| a.to_string())
                        .ok();
                    leg.timeout_height = Some(timeout as u32);
                    leg.method_data = Some(
                        LegMethodData {
                            escrow_spk: Some(to_hex(spk.as_bytes())),
                            redeem_script: Some(to_hex(script.as_bytes())),
                            sender_wallet_addr: sender_wallet_addr.clone(),
                            receiver_wallet_addr: receiver_wallet_addr.clone(),
                            ..Default::default()
                        }
                        .to_json(),
                    );
                }
                (SwapMethodState::Htlc(state), ChainFamily::Evm) => {
                    let secret_hash = state
                        .secret_hash
                        .ok_or(CoordinatorError::PreconditionNotMet("secret hash not known"))?;
                    let secret = self
                        .store
                        .secret(trade.id)?
                        .ok_or(CoordinatorError::Invariant("htlc trade without secret row"))?;
                    let timelock_ts = secret.created_at
                        + match leg_type {
                            LegType::Offer => self.config.initiator_timelock_secs,
                            LegType::Request => self.config.responder_timelock_secs,
                        };
                    let amount = leg_amount(trade, leg_type)?;
                    let sender_addr =
                        evm_addr_of(sender_wallet_addr.clone(), "sender")?;
                    let receiver_addr =
                        evm_addr_of(receiver_wallet_addr.clone(), "receiver")?;
                    let swap_id = evm::compute_swap_id(
                        sender_addr,
                        receiver_addr,
                        EvmAddress::ZERO,
                        U256::from(amount),
                        B256::from(secret_hash),
                        U256::from(timelock_ts),
                    );
                    // Keep the original scan start across re-derivation, or a
                    // restart could skip past an already-emitted claim event.
                    let created_block = prior_data
                        .created_block
                        .or_else(|| self.backend(&chain).ok()?.evm().ok()?.block_number().ok());

                    let data = state.chain_mut(leg_type);
                    data.evm_swap_id = Some(swap_id);
                    data.timelock_ts = Some(timelock_ts);
                    data.created_block = created_block;

                    leg.timeout_timestamp = Some(timelock_ts);
                    leg.funding_address = params.htlc_contract.clone();
                    leg.method_data = Some(
                        LegMethodData {
                            evm_swap_id: Some(format!("{:#x}", swap_id)),
                            created_block,
                            sender_wallet_addr: sender_wallet_addr.clone(),
                            receiver_wallet_addr: receiver_wallet_addr.clone(),
                            ..Default::default()
                        }
                        .to_json(),
                    );
                }
            }
            if leg.state == LegState::Init {
                leg.state = LegState::Pending;
            }
            self.store.upsert_leg(leg)?;
        }
        Ok(())
    }

    /// Persist the public half of a chain's MuSig2 session into its leg
    /// blob, so a restart resumes the signing session where it stopped.
    fn persist_musig_session(
        &self,
        trade_id: TradeId,
        leg_type: LegType,
        data: &ChainMusigData,
    ) -> Result<(), CoordinatorError> {
        let mut leg = self
            .store
            .leg(trade_id, leg_type)?
            .ok_or(CoordinatorError::Invariant("trade without leg row"))?;
        let mut blob = leg
            .method_data
            .as_deref()
            .and_then(LegMethodData::from_json)
            .unwrap_or_default();
        blob.local_nonce = data.pub_nonce.as_ref().map(|n| to_hex(&n.serialize()));
        blob.remote_nonce = data.remote_nonce.as_ref().map(|n| to_hex(&n.serialize()));
        blob.local_partial = data.local_partial.map(|p| to_hex(&p.serialize()));
        blob.remote_partial = data.remote_partial.map(|p| to_hex(&p.serialize()));
        blob.sighash = data.sighash.map(|s| to_hex(&s));
        leg.method_data = Some(blob.to_json());
        Ok(self.store.upsert_leg(leg)?)
    }

    // ------------------------------------------------------------------
    // MuSig2 signing session
    // ------------------------------------------------------------------

    /// Generate the per-chain nonces and send them to the peer. Idempotent:
    /// repeated calls return the already generated public nonces.
    pub fn generate_nonces(&self, trade_id: TradeId) -> Result<([u8; 66], [u8; 66]), CoordinatorError> {
        let cell = self.cell(trade_id)?;
        let mut swap = cell.lock()?;
        let privkey = swap.local_privkey;
        let state = swap
            .musig_mut()
            .ok_or(PreconditionFailure::MethodMismatch)?;

        let mut fresh = false;
        for leg_type in [LegType::Offer, LegType::Request] {
            let data = state.chain_mut(leg_type);
            let ctx = data
                .key_agg
                .clone()
                .ok_or(PreconditionFailure::MissingPubKey)?;
            if data.pub_nonce.is_none() {
                let (sec_nonce, pub_nonce) = musig::generate_nonce_pair(&ctx, &privkey)?;
                data.sec_nonce = Some(sec_nonce);
                data.pub_nonce = Some(pub_nonce);
                fresh = true;
                self.persist_musig_session(trade_id, leg_type, data)?;
            }
        }
        let offer_nonce = state.offer.pub_nonce.as_ref().expect("set above").serialize();
        let request_nonce = state
            .request
            .pub_nonce
            .as_ref()
            .expect("set above")
            .serialize();
        drop(swap);

        if fresh {
            self.events.publish(SwapEvent::NoncesGenerated { trade_id });
        }
        let trade = self.trade(trade_id)?;
        self.send_to_peer(
            &trade,
            SwapMessage::NonceExchange(NonceExchange {
                offer_nonce_hex: to_hex(&offer_nonce),
                request_nonce_hex: to_hex(&request_nonce),
            }),
            None,
        )?;
        Ok((offer_nonce, request_nonce))
    }

    /// Accept the counterparty's nonces. Only exactly 66-byte nonces pass;
    /// anything else is rejected without state change.
    pub fn set_remote_nonces(
        &self,
        trade_id: TradeId,
        offer_nonce: &[u8],
        request_nonce: &[u8],
    ) -> Result<(), CoordinatorError> {
        if offer_nonce.len() != 66 || request_nonce.len() != 66 {
            return Err(ProtocolViolation::InvalidNonce.into());
        }
        let offer = musig::nonce_from_bytes(offer_nonce)
            .map_err(|_| ProtocolViolation::InvalidNonce)?;
        let request = musig::nonce_from_bytes(request_nonce)
            .map_err(|_| ProtocolViolation::InvalidNonce)?;

        let cell = self.cell(trade_id)?;
        let mut swap = cell.lock()?;
        let state = swap
            .musig_mut()
            .ok_or(PreconditionFailure::MethodMismatch)?;
        for (leg_type, nonce) in [(LegType::Offer, offer), (LegType::Request, request)] {
            let data = state.chain_mut(leg_type);
            match &data.remote_nonce {
                Some(existing) if *existing == nonce => {}
                // A restarted peer re-negotiates with fresh nonces. That is
                // fine until we have signed; afterwards it is a violation.
                Some(_) if data.local_partial.is_some() => {
                    return Err(ProtocolViolation::PeerProtocolViolation(
                        "nonce replacement after signing",
                    )
                    .into())
                }
                _ => {
                    data.remote_nonce = Some(nonce);
                    self.persist_musig_session(trade_id, leg_type, data)?;
                }
            }
        }
        drop(swap);
        self.events.publish(SwapEvent::NoncesReceived { trade_id });
        Ok(())
    }

    /// Record a funding outpoint for either side and advance leg and trade
    /// state accordingly.
    pub fn set_funding_tx(
        &self,
        trade_id: TradeId,
        txid: &str,
        vout: u32,
        is_local: bool,
    ) -> Result<(), CoordinatorError> {
        let cell = self.cell(trade_id)?;
        let mut swap = cell.lock()?;
        let side = if is_local {
            &mut swap.local_funding
        } else {
            &mut swap.remote_funding
        };
        match &side.txid {
            Some(existing) if existing.as_str() == txid && side.vout == Some(vout) => {
                return Ok(())
            }
            Some(_) if !is_local => {
                return Err(ProtocolViolation::PeerProtocolViolation(
                    "conflicting funding info",
                )
                .into())
            }
            Some(_) => {
                return Err(CoordinatorError::Invariant("local funding already recorded"))
            }
            None => {
                side.txid = Some(txid.to_string());
                side.vout = Some(vout);
            }
        }
        let leg_type = if is_local {
            swap.local_leg()
        } else {
            swap.remote_leg()
        };
        drop(swap);

        let trade = self.trade(trade_id)?;
        let mut leg = self
            .store
            .leg(trade_id, leg_type)?
            .ok_or(CoordinatorError::Invariant("trade without leg row"))?;
        leg.funding_txid = Some(txid.to_string());
        leg.funding_vout = Some(vout);
        if leg.state == LegState::Init || leg.state == LegState::Pending {
            leg.state = LegState::Funding;
        }
        self.store.upsert_leg(leg)?;

        if trade.state == TradeState::Accepted {
            self.store
                .update_trade_state(trade_id, TradeState::Funding, None)?;
        }

        if is_local {
            self.send_to_peer(
                &trade,
                SwapMessage::FundingInfo(FundingInfo {
                    txid: txid.to_string(),
                    vout,
                }),
                None,
            )?;
            self.events.publish(SwapEvent::FundingBroadcast {
                trade_id,
                chain: leg_chain(&trade, leg_type).to_string(),
                txid: txid.to_string(),
            });
        } else {
            self.events.publish(SwapEvent::FundingReceived {
                trade_id,
                chain: leg_chain(&trade, leg_type).to_string(),
                txid: txid.to_string(),
            });
        }
        Ok(())
    }

    /// Poll the backends for both funding outputs, updating confirmation
    /// counts and advancing leg/trade state when thresholds are crossed.
    pub fn update_confirmations(&self, trade_id: TradeId) -> Result<(u32, u32), CoordinatorError> {
        let trade = self.trade(trade_id)?;
        let cell = self.cell(trade_id)?;
        let required = self.config.required_confirms;
        let mut counts = [0u32; 2];

        for (slot, is_local) in [(0usize, true), (1usize, false)] {
            let (leg_type, txid) = {
                let swap = cell.lock()?;
                let leg_type = if is_local {
                    swap.local_leg()
                } else {
                    swap.remote_leg()
                };
                let txid = if is_local {
                    swap.local_funding.txid.clone()
                } else {
                    swap.remote_funding.txid.clone()
                };
                (leg_type, txid)
            };
            let txid = match txid {
                Some(txid) => txid,
                None => continue,
            };
            let chain = leg_chain(&trade, leg_type).to_string();
            let confirmation = self.backend(&chain)?.get_confirmations(&txid)?;
            let confirms = confirmation.map(|c| c.confirmations).unwrap_or(0);
            counts[slot] = confirms;

            {
                let mut swap = cell.lock()?;
                if is_local {
                    swap.local_funding.confirms = confirms;
                } else {
                    swap.remote_funding.confirms = confirms;
                }
            }
            let mut leg = self
                .store
                .leg(trade_id, leg_type)?
                .ok_or(CoordinatorError::Invariant("trade without leg row"))?;
            leg.funding_confirms = confirms;
            if confirms >= required && leg.state == LegState::Funding {
                leg.state = LegState::Funded;
            }
            self.store.upsert_leg(leg)?;
        }

        // The trade is funded only when both legs are.
        let legs = self.store.legs(trade_id)?;
        if let (Some(offer), Some(request)) = (
            legs.iter().find(|l| l.leg_type == LegType::Offer),
            legs.iter().find(|l| l.leg_type == LegType::Request),
        ) {
            let joined = Trade::join_leg_states(trade.state, offer.state, request.state);
            if joined != trade.state {
                self.store.update_trade_state(trade_id, joined, None)?;
            }
        }
        Ok((counts[0], counts[1]))
    }

    /// The BIP-341 key-path sighash each chain's cooperative sweep commits
    /// to. Construction is deterministic, so both participants derive the
    /// same pair independently.
    pub fn spend_sighashes(&self, trade_id: TradeId) -> Result<([u8; 32], [u8; 32]), CoordinatorError> {
        let trade = self.trade(trade_id)?;
        let cell = self.cell(trade_id)?;
        let mut swap = cell.lock()?;
        let mut sighashes = [[0u8; 32]; 2];
        for (slot, leg_type) in [(0usize, LegType::Offer), (1usize, LegType::Request)] {
            let (sweep, prevouts) = self.build_sweep_for_leg(&trade, &swap, leg_type)?;
            let sighash = contract::taproot_keyspend_sighash(&sweep, &prevouts, 0)?;
            sighashes[slot] = sighash;
            if let Some(state) = swap.musig_mut() {
                let data = state.chain_mut(leg_type);
                data.sighash = Some(sighash);
                self.persist_musig_session(trade_id, leg_type, data)?;
            }
        }
        Ok((sighashes[0], sighashes[1]))
    }

    /// Produce our MuSig2 partial signature for each chain against the given
    /// sighashes. Requires nonces on both chains, both funding outpoints,
    /// and a confirmed local funding. After this point failure cannot roll
    /// back on-chain state, only revert the trade to `failed`.
    pub fn create_partial_signatures(
        &self,
        trade_id: TradeId,
        offer_sighash: [u8; 32],
        request_sighash: [u8; 32],
    ) -> Result<([u8; 32], [u8; 32]), CoordinatorError> {
        let (expected_offer, expected_request) = self.spend_sighashes(trade_id)?;
        if offer_sighash != expected_offer || request_sighash != expected_request {
            return Err(ProtocolViolation::SighashMismatch.into());
        }

        let trade = self.trade(trade_id)?;
        let cell = self.cell(trade_id)?;
        let mut swap = cell.lock()?;
        if swap.local_funding.txid.is_none() || swap.remote_funding.txid.is_none() {
            return Err(PreconditionFailure::MissingFunding.into());
        }
        if swap.local_funding.confirms < self.config.required_confirms {
            return Err(PreconditionFailure::InvalidState {
                state: trade.state,
                action: "sign before local funding confirmed",
            }
            .into());
        }
        let privkey = swap.local_privkey;
        let state = swap
            .musig_mut()
            .ok_or(PreconditionFailure::MethodMismatch)?;
        if !state.nonces_complete() {
            return Err(PreconditionFailure::MissingNonce.into());
        }

        let mut partials = [[0u8; 32]; 2];
        for (slot, leg_type, sighash) in [
            (0usize, LegType::Offer, offer_sighash),
            (1usize, LegType::Request, request_sighash),
        ] {
            let data = state.chain_mut(leg_type);
            if let Some(existing) = &data.local_partial {
                partials[slot] = existing.serialize();
                continue;
            }
            let ctx = data
                .key_agg
                .clone()
                .ok_or(PreconditionFailure::MissingPubKey)?;
            let local_nonce = data
                .pub_nonce
                .clone()
                .ok_or(PreconditionFailure::MissingNonce)?;
            let remote_nonce = data
                .remote_nonce
                .clone()
                .ok_or(PreconditionFailure::MissingNonce)?;
            let agg_nonce = musig::aggregate_nonces(&local_nonce, &remote_nonce);
            let sec_nonce = data
                .sec_nonce
                .take()
                .ok_or(CoordinatorError::Invariant("secret nonce already consumed"))?;
            let partial = musig::partial_sign(&ctx, &privkey, sec_nonce, &agg_nonce, &sighash)?;
            data.local_partial = Some(partial);
            partials[slot] = partial.serialize();
            self.persist_musig_session(trade_id, leg_type, data)?;
        }
        drop(swap);

        self.events.publish(SwapEvent::PartialSigsCreated { trade_id });
        self.send_to_peer(
            &trade,
            SwapMessage::PartialSig(PartialSigExchange {
                offer_partial_sig_hex: to_hex(&partials[0]),
                request_partial_sig_hex: to_hex(&partials[1]),
            }),
            None,
        )?;
        Ok((partials[0], partials[1]))
    }

    /// Store the counterparty's partial signatures, verifying them against
    /// the chain sighashes when those are already known.
    pub fn set_remote_partial_sigs(
        &self,
        trade_id: TradeId,
        offer_sig: &[u8],
        request_sig: &[u8],
    ) -> Result<(), CoordinatorError> {
        let offer = musig::partial_sig_from_bytes(offer_sig)
            .map_err(|_| ProtocolViolation::InvalidPartialSig)?;
        let request = musig::partial_sig_from_bytes(request_sig)
            .map_err(|_| ProtocolViolation::InvalidPartialSig)?;

        let cell = self.cell(trade_id)?;
        let mut invalid = false;
        {
            let mut swap = cell.lock()?;
            let remote_pubkey = swap
                .remote_pubkey
                .ok_or(PreconditionFailure::MissingPubKey)?;
            let state = swap
                .musig_mut()
                .ok_or(PreconditionFailure::MethodMismatch)?;

            for (leg_type, partial) in [(LegType::Offer, offer), (LegType::Request, request)] {
                let data = state.chain_mut(leg_type);
                match &data.remote_partial {
                    Some(existing) if *existing == partial => continue,
                    Some(_) => {
                        return Err(ProtocolViolation::PeerProtocolViolation(
                            "conflicting partial signatures",
                        )
                        .into())
                    }
                    None => {}
                }
                // Verification needs the chain's sighash; when the partials
                // arrive early it happens at combine time instead.
                if let (Some(sighash), Some(ctx), Some(local_nonce), Some(remote_nonce)) = (
                    data.sighash,
                    data.key_agg.as_ref(),
                    data.pub_nonce.as_ref(),
                    data.remote_nonce.as_ref(),
                ) {
                    let agg_nonce = musig::aggregate_nonces(local_nonce, remote_nonce);
                    if musig::verify_partial(
                        ctx,
                        partial,
                        &agg_nonce,
                        &remote_pubkey,
                        remote_nonce,
                        &sighash,
                    )
                    .is_err()
                    {
                        invalid = true;
                        break;
                    }
                }
                data.remote_partial = Some(partial);
                self.persist_musig_session(trade_id, leg_type, data)?;
            }
        }
        if invalid {
            self.fail_swap(trade_id, "invalid_partial_sig")?;
            return Err(ProtocolViolation::InvalidPartialSig.into());
        }
        self.events
            .publish(SwapEvent::RemotePartialSigsReceived { trade_id });
        Ok(())
    }

    /// Combine the local and remote partial signatures for one chain into a
    /// broadcast-ready BIP-340 signature.
    pub fn combine_signatures(
        &self,
        trade_id: TradeId,
        redeem_chain: &str,
        remote_sig_bytes: &[u8],
    ) -> Result<[u8; 64], CoordinatorError> {
        let trade = self.trade(trade_id)?;
        let leg_type = leg_for_chain(&trade, redeem_chain)?;
        let remote_partial = musig::partial_sig_from_bytes(remote_sig_bytes)
            .map_err(|_| ProtocolViolation::InvalidPartialSig)?;

        let cell = self.cell(trade_id)?;
        let (ctx, sighash, local_partial, remote_pubkey, remote_nonce, agg_nonce) = {
            let swap = cell.lock()?;
            let remote_pubkey = swap
                .remote_pubkey
                .ok_or(PreconditionFailure::MissingPubKey)?;
            let state = swap.musig().ok_or(PreconditionFailure::MethodMismatch)?;
            let data = state.chain(leg_type);
            let ctx = data
                .key_agg
                .clone()
                .ok_or(PreconditionFailure::MissingPubKey)?;
            let sighash = data
                .sighash
                .ok_or(PreconditionFailure::MissingPartialSig)?;
            let local_partial = data
                .local_partial
                .ok_or(PreconditionFailure::MissingPartialSig)?;
            let local_nonce = data
                .pub_nonce
                .clone()
                .ok_or(PreconditionFailure::MissingNonce)?;
            let remote_nonce = data
                .remote_nonce
                .clone()
                .ok_or(PreconditionFailure::MissingNonce)?;
            let agg_nonce = musig::aggregate_nonces(&local_nonce, &remote_nonce);
            (
                ctx,
                sighash,
                local_partial,
                remote_pubkey,
                remote_nonce,
                agg_nonce,
            )
        };

        if musig::verify_partial(
            &ctx,
            remote_partial,
            &agg_nonce,
            &remote_pubkey,
            &remote_nonce,
            &sighash,
        )
        .is_err()
        {
            self.fail_swap(trade_id, "invalid_partial_sig")?;
            return Err(ProtocolViolation::InvalidPartialSig.into());
        }

        Ok(musig::combine_partials(
            &ctx,
            &agg_nonce,
            [local_partial, remote_partial],
            &sighash,
        )?)
    }

    /// Complete the happy path on the chain where we are the receiver:
    /// combine signatures, broadcast the sweep and close the trade.
    pub fn redeem_swap(&self, trade_id: TradeId) -> Result<String, CoordinatorError> {
        let trade = self.trade(trade_id)?;
        if trade.state != TradeState::Funded {
            return Err(PreconditionFailure::InvalidState {
                state: trade.state,
                action: "redeem",
            }
            .into());
        }
        let cell = self.cell(trade_id)?;
        let (leg_type, remote_partial) = {
            let swap = cell.lock()?;
            let leg_type = swap.remote_leg();
            let state = swap.musig().ok_or(PreconditionFailure::MethodMismatch)?;
            let remote = state
                .chain(leg_type)
                .remote_partial
                .ok_or(PreconditionFailure::MissingPartialSig)?;
            (leg_type, remote)
        };
        let chain = leg_chain(&trade, leg_type).to_string();

        // Make sure the chain sighashes are computed before combining.
        self.spend_sighashes(trade_id)?;
        let final_sig =
            self.combine_signatures(trade_id, &chain, &remote_partial.serialize())?;

        let (mut sweep, _) = {
            let swap = cell.lock()?;
            self.build_sweep_for_leg(&trade, &swap, leg_type)?
        };
        contract::apply_keyspend_witness(&mut sweep, 0, &final_sig);
        let txid = self
            .backend(&chain)?
            .broadcast(&ChainTx::Bitcoin(sweep))?;
        log::info!("[{}] swept escrow on {}: {}", trade_id, chain, txid);
        self.complete_swap(trade_id, &txid)?;
        Ok(txid)
    }

    /// Terminal success transition.
    pub fn complete_swap(&self, trade_id: TradeId, redeem_txid: &str) -> Result<(), CoordinatorError> {
        let cell = self.cell(trade_id)?;
        let leg_type = cell.lock()?.remote_leg();
        let mut leg = self
            .store
            .leg(trade_id, leg_type)?
            .ok_or(CoordinatorError::Invariant("trade without leg row"))?;
        leg.redeem_txid = Some(redeem_txid.to_string());
        leg.state = LegState::Redeemed;
        self.store.upsert_leg(leg)?;
        self.store
            .update_trade_state(trade_id, TradeState::Redeemed, None)?;
        self.remove_cell(trade_id);
        self.events.publish(SwapEvent::SwapRedeemed {
            trade_id,
            txid: redeem_txid.to_string(),
        });
        Ok(())
    }

    /// Unrecoverable crypto or validation failure: freeze the trade with a
    /// reason and halt automatic action. Persisted state is kept for
    /// forensics; refund paths stay available.
    pub fn fail_swap(&self, trade_id: TradeId, reason: &str) -> Result<(), CoordinatorError> {
        log::error!("[{}] swap failed: {}", trade_id, reason);
        self.store
            .update_trade_state(trade_id, TradeState::Failed, Some(reason.to_string()))?;
        self.events.publish(SwapEvent::SwapFailed {
            trade_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Counterparty walked away before any on-chain commitment.
    pub fn abort_swap(&self, trade_id: TradeId, reason: &str) -> Result<(), CoordinatorError> {
        let trade = self.trade(trade_id)?;
        if !matches!(trade.state, TradeState::Init | TradeState::Accepted) {
            return Err(PreconditionFailure::InvalidState {
                state: trade.state,
                action: "abort",
            }
            .into());
        }
        self.store
            .update_trade_state(trade_id, TradeState::Aborted, Some(reason.to_string()))?;
        self.remove_cell(trade_id);
        Ok(())
    }

    /// Build the cooperative sweep of one chain's escrow. Deterministic:
    /// fixed fee rate, fixed output order, both sides agree byte for byte.
    fn build_sweep_for_leg(
        &self,
        trade: &Trade,
        swap: &ActiveSwap,
        leg_type: LegType,
    ) -> Result<(bitcoin::Transaction, Vec<bitcoin::TxOut>), CoordinatorError> {
        let chain = leg_chain(trade, leg_type);
        let params = self.params(chain)?;
        let state = swap.musig().ok_or(PreconditionFailure::MethodMismatch)?;
        let data = state.chain(leg_type);
        let escrow_spk = data
            .escrow_spk
            .clone()
            .ok_or(PreconditionFailure::MissingPubKey)?;

        let funding = if leg_type == swap.local_leg() {
            &swap.local_funding
        } else {
            &swap.remote_funding
        };
        let txid = funding
            .txid
            .as_ref()
            .ok_or(PreconditionFailure::MissingFunding)?;
        let vout = funding.vout.ok_or(PreconditionFailure::MissingFunding)?;
        let outpoint = OutPoint {
            txid: BitcoinBackend::parse_txid(txid)?,
            vout,
        };
        let escrow_value = Amount::from_sat(leg_amount(trade, leg_type)? as u64);

        // Sweep target: the receiver's wallet address on this chain.
        let receiver_addr = if leg_type == swap.remote_leg() {
            local_addr_on(swap, leg_type)
        } else {
            remote_addr_on(swap, leg_type)
        }
        .ok_or(PreconditionFailure::MissingPubKey)?;
        let receiver_spk = parse_btc_address(&receiver_addr, params)?.script_pubkey();
        let dao_spk = params
            .dao_address
            .as_ref()
            .and_then(|addr| parse_btc_address(addr, params).ok())
            .map(|a| a.script_pubkey());

        let miner_fee =
            contract::calculate_miner_fee(DEFAULT_TX_FEE_RATE, contract::SWEEP_TX_VBYTE_SIZE);
        let sweep = contract::create_sweep_tx(
            outpoint,
            escrow_value,
            receiver_spk,
            dao_spk,
            miner_fee,
        )?;
        let prevouts = vec![bitcoin::TxOut {
            value: escrow_value,
            script_pubkey: escrow_spk,
        }];
        Ok((sweep, prevouts))
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn get_swap_type(&self, trade_id: TradeId) -> Result<SwapPair, CoordinatorError> {
        let trade = self.trade(trade_id)?;
        let offer = self.params(&trade.offer_chain)?.family;
        let request = self.params(&trade.request_chain)?.family;
        Ok(match (offer, request) {
            (ChainFamily::Bitcoin, ChainFamily::Bitcoin) => SwapPair::BitcoinToBitcoin,
            (ChainFamily::Bitcoin, ChainFamily::Evm) => SwapPair::BitcoinToEvm,
            (ChainFamily::Evm, ChainFamily::Bitcoin) => SwapPair::EvmToBitcoin,
            (ChainFamily::Evm, ChainFamily::Evm) => SwapPair::EvmToEvm,
        })
    }

    pub fn swap_status(&self, trade_id: TradeId) -> Result<SwapStatus, CoordinatorError> {
        let trade = self.trade(trade_id)?;
        let legs = self.store.legs(trade_id)?;
        let secret = self.store.secret(trade_id)?;
        Ok(SwapStatus {
            swap_type: self.get_swap_type(trade_id)?,
            secret_hash: secret.as_ref().map(|s| s.secret_hash.clone()),
            secret_revealed: secret.map(|s| s.secret.is_some()).unwrap_or(false),
            trade,
            legs,
        })
    }

    pub fn list_swaps(&self) -> Result<Vec<Trade>, CoordinatorError> {
        Ok(self.store.all_trades()?)
    }
}

// ----------------------------------------------------------------------
// Free helpers shared with the handler and recovery modules
// ----------------------------------------------------------------------

pub(crate) fn leg_chain(trade: &Trade, leg_type: LegType) -> &str {
    match leg_type {
        LegType::Offer => &trade.offer_chain,
        LegType::Request => &trade.request_chain,
    }
}

pub(crate) fn leg_for_chain(trade: &Trade, chain: &str) -> Result<LegType, CoordinatorError> {
    if trade.offer_chain == chain {
        Ok(LegType::Offer)
    } else if trade.request_chain == chain {
        Ok(LegType::Request)
    } else {
        Err(PreconditionFailure::UnknownChain(chain.to_string()).into())
    }
}

pub(crate) fn leg_amount(trade: &Trade, leg_type: LegType) -> Result<u128, CoordinatorError> {
    let amount = match leg_type {
        LegType::Offer => trade.offer_amount,
        LegType::Request => trade.request_amount,
    };
    if amount == 0 {
        return Err(PreconditionFailure::InvalidOffer("zero amount").into());
    }
    Ok(amount)
}

/// Our wallet address on the chain of a leg.
pub(crate) fn local_addr_on(swap: &ActiveSwap, leg_type: LegType) -> Option<String> {
    match leg_type {
        LegType::Offer => swap.local_offer_wallet_addr.clone(),
        LegType::Request => swap.local_request_wallet_addr.clone(),
    }
}

/// The counterparty's wallet address on the chain of a leg.
pub(crate) fn remote_addr_on(swap: &ActiveSwap, leg_type: LegType) -> Option<String> {
    match leg_type {
        LegType::Offer => swap.remote_offer_wallet_addr.clone(),
        LegType::Request => swap.remote_request_wallet_addr.clone(),
    }
}

/// Wallet address of a leg's sender (`true`) or receiver (`false`).
pub(crate) fn swap_addr(
    swap: &ActiveSwap,
    trade: &Trade,
    leg_type: LegType,
    sender: bool,
) -> Option<String> {
    let sender_role = match leg_type {
        LegType::Offer => TradeRole::Maker,
        LegType::Request => TradeRole::Taker,
    };
    let want_local = (trade.our_role == sender_role) == sender;
    if want_local {
        local_addr_on(swap, leg_type)
    } else {
        remote_addr_on(swap, leg_type)
    }
}

pub(crate) fn evm_addr_of(
    addr: Option<String>,
    which: &'static str,
) -> Result<EvmAddress, CoordinatorError> {
    let addr = addr.ok_or(CoordinatorError::PreconditionNotMet("missing evm wallet address"))?;
    evm::parse_address(&addr).map_err(|_| {
        CoordinatorError::Protocol(ProtocolViolation::PeerProtocolViolation(match which {
            "sender" => "malformed sender evm address",
            _ => "malformed receiver evm address",
        }))
    })
}

pub(crate) fn parse_btc_address(
    addr: &str,
    params: &ChainParams,
) -> Result<Address, CoordinatorError> {
    Address::from_str(addr)
        .map_err(|_| {
            CoordinatorError::Protocol(ProtocolViolation::PeerProtocolViolation(
                "malformed wallet address",
            ))
        })?
        .require_network(params.network)
        .map_err(|_| {
            CoordinatorError::Protocol(ProtocolViolation::PeerProtocolViolation(
                "wallet address on wrong network",
            ))
        })
}

