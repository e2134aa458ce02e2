//! The persistence gateway.
//!
//! A single CBOR file holds every durable table: trades, swap legs, secrets,
//! orders, peers, wallet address indices and the messenger's pending
//! deliveries. All access goes through [SwapStore]; invariants (terminal
//! freeze, state machine edges, the two-legs rule, the secret hash law) are
//! enforced here so the coordinator never needs raw access.
//!
//! Every mutating call persists before returning, under the same lock that
//! applied the mutation. A state transition and its side-effect rows are
//! written in one call, so crash recovery only ever sees complete
//! transitions.

pub mod error;
pub mod records;

use std::{
    collections::HashMap,
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
    sync::Mutex,
};

use bitcoin::hashes::{sha256, Hash};
use serde::{Deserialize, Serialize};

use self::{
    error::StoreError,
    records::{
        LegType, OrderRecord, PeerRecord, PendingDelivery, SecretRecord, SwapLeg, Trade,
        TradeState, WalletAddressRecord,
    },
};
use crate::{
    protocol::messages::TradeId,
    utill::{from_hex_array, now_ts, to_hex},
};

/// The tables, as serialized to disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreInner {
    trades: HashMap<TradeId, Trade>,
    legs: HashMap<TradeId, Vec<SwapLeg>>,
    secrets: HashMap<TradeId, SecretRecord>,
    orders: HashMap<String, OrderRecord>,
    peers: HashMap<String, PeerRecord>,
    wallet_addresses: Vec<WalletAddressRecord>,
    pending_deliveries: Vec<PendingDelivery>,
    /// Next external wallet address index per chain.
    address_indices: HashMap<String, u32>,
    /// Per-trade swap secret keys, hex. Required to resume signing and to
    /// reach the refund paths after a restart.
    swap_keys: HashMap<TradeId, String>,
}

/// Gateway over the durable swap state.
#[derive(Debug)]
pub struct SwapStore {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl SwapStore {
    /// Open an existing store file, or initialize an empty one.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let inner = if path.exists() && fs::metadata(path)?.len() > 0 {
            let bytes = fs::read(path)?;
            serde_cbor::from_slice::<StoreInner>(&bytes)?
        } else {
            StoreInner::default()
        };
        let store = Self {
            path: path.to_path_buf(),
            inner: Mutex::new(inner),
        };
        store.persist(&*store.inner.lock()?)?;
        Ok(store)
    }

    /// Write the tables to a temp file, then rename over the live one, so a
    /// crash mid-write never corrupts the store.
    fn persist(&self, inner: &StoreInner) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)?;
            let writer = BufWriter::new(file);
            serde_cbor::to_writer(writer, inner)?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    // ------- trades -------

    pub fn create_trade(&self, trade: Trade) -> Result<(), StoreError> {
        let mut inner = self.inner.lock()?;
        if inner.trades.contains_key(&trade.id) {
            return Err(StoreError::Duplicate("trade already exists"));
        }
        inner.trades.insert(trade.id, trade);
        self.persist(&inner)
    }

    pub fn trade(&self, trade_id: TradeId) -> Result<Option<Trade>, StoreError> {
        Ok(self.inner.lock()?.trades.get(&trade_id).cloned())
    }

    pub fn all_trades(&self) -> Result<Vec<Trade>, StoreError> {
        Ok(self.inner.lock()?.trades.values().cloned().collect())
    }

    pub fn non_terminal_trades(&self) -> Result<Vec<Trade>, StoreError> {
        Ok(self
            .inner
            .lock()?
            .trades
            .values()
            .filter(|t| !t.state.is_terminal())
            .cloned()
            .collect())
    }

    /// Apply a full trade update. Rejects any change to a terminal row and
    /// any state change off the state machine edges; stamps `updated_at` and
    /// `completed_at`.
    pub fn update_trade(&self, mut trade: Trade) -> Result<Trade, StoreError> {
        let mut inner = self.inner.lock()?;
        let existing = inner
            .trades
            .get(&trade.id)
            .ok_or(StoreError::NotFound("trade"))?;
        // Terminal rows are frozen, with the single exception of a failed
        // trade resolving to refunded once its refund broadcasts land.
        if existing.state.is_terminal()
            && !(existing.state == TradeState::Failed && trade.state == TradeState::Refunded)
        {
            return Err(StoreError::Invariant("terminal trade is immutable"));
        }
        if trade.state != existing.state && !existing.state.can_advance_to(trade.state) {
            return Err(StoreError::Invariant("illegal trade state transition"));
        }
        trade.updated_at = now_ts();
        if trade.state.is_terminal() && trade.completed_at.is_none() {
            trade.completed_at = Some(trade.updated_at);
        }
        inner.trades.insert(trade.id, trade.clone());
        self.persist(&inner)?;
        Ok(trade)
    }

    /// Advance only the state of a trade, with the same edge checks.
    pub fn update_trade_state(
        &self,
        trade_id: TradeId,
        state: TradeState,
        failure_reason: Option<String>,
    ) -> Result<Trade, StoreError> {
        let mut trade = self
            .trade(trade_id)?
            .ok_or(StoreError::NotFound("trade"))?;
        if trade.state == state {
            return Ok(trade);
        }
        trade.state = state;
        if failure_reason.is_some() {
            trade.failure_reason = failure_reason;
        }
        self.update_trade(trade)
    }

    // ------- swap legs -------

    /// Insert or update one leg. At most one leg per (trade, leg_type); the
    /// trade must exist.
    pub fn upsert_leg(&self, leg: SwapLeg) -> Result<(), StoreError> {
        let mut inner = self.inner.lock()?;
        if !inner.trades.contains_key(&leg.trade_id) {
            return Err(StoreError::NotFound("trade for leg"));
        }
        let legs = inner.legs.entry(leg.trade_id).or_default();
        match legs.iter_mut().find(|l| l.leg_type == leg.leg_type) {
            Some(existing) => *existing = leg,
            None => {
                if legs.len() >= 2 {
                    return Err(StoreError::Invariant("trade already has two legs"));
                }
                legs.push(leg);
            }
        }
        self.persist(&inner)
    }

    pub fn legs(&self, trade_id: TradeId) -> Result<Vec<SwapLeg>, StoreError> {
        Ok(self.inner.lock()?.legs.get(&trade_id).cloned().unwrap_or_default())
    }

    pub fn leg(&self, trade_id: TradeId, leg_type: LegType) -> Result<Option<SwapLeg>, StoreError> {
        Ok(self
            .legs(trade_id)?
            .into_iter()
            .find(|l| l.leg_type == leg_type))
    }

    // ------- secrets -------

    /// Store a secret row. When the preimage is present it must hash to the
    /// stored secret hash.
    pub fn put_secret(&self, record: SecretRecord) -> Result<(), StoreError> {
        check_secret_invariant(&record)?;
        let mut inner = self.inner.lock()?;
        inner.secrets.insert(record.trade_id, record);
        self.persist(&inner)
    }

    pub fn secret(&self, trade_id: TradeId) -> Result<Option<SecretRecord>, StoreError> {
        Ok(self.inner.lock()?.secrets.get(&trade_id).cloned())
    }

    /// Attach a revealed preimage to an existing secret row.
    pub fn set_revealed_secret(
        &self,
        trade_id: TradeId,
        preimage: &[u8; 32],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock()?;
        let record = inner
            .secrets
            .get_mut(&trade_id)
            .ok_or(StoreError::NotFound("secret"))?;
        let mut updated = record.clone();
        updated.secret = Some(to_hex(preimage));
        check_secret_invariant(&updated)?;
        *record = updated;
        self.persist(&inner)
    }

    // ------- orders -------

    pub fn put_order(&self, record: OrderRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock()?;
        inner.orders.insert(record.order.order_id.clone(), record);
        self.persist(&inner)
    }

    pub fn order(&self, order_id: &str) -> Result<Option<OrderRecord>, StoreError> {
        Ok(self.inner.lock()?.orders.get(order_id).cloned())
    }

    pub fn cancel_order(&self, order_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock()?;
        let record = inner
            .orders
            .get_mut(order_id)
            .ok_or(StoreError::NotFound("order"))?;
        record.cancelled = true;
        record.updated_at = now_ts();
        self.persist(&inner)
    }

    pub fn live_orders(&self) -> Result<Vec<OrderRecord>, StoreError> {
        Ok(self
            .inner
            .lock()?
            .orders
            .values()
            .filter(|o| !o.cancelled)
            .cloned()
            .collect())
    }

    // ------- peers -------

    pub fn upsert_peer(&self, record: PeerRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock()?;
        inner.peers.insert(record.peer_id.clone(), record);
        self.persist(&inner)
    }

    pub fn peer(&self, peer_id: &str) -> Result<Option<PeerRecord>, StoreError> {
        Ok(self.inner.lock()?.peers.get(peer_id).cloned())
    }

    pub fn all_peers(&self) -> Result<Vec<PeerRecord>, StoreError> {
        Ok(self.inner.lock()?.peers.values().cloned().collect())
    }

    /// Mark a peer suspect for a trade after a delivery deadline expired.
    pub fn mark_peer_suspect(&self, peer_id: &str, trade_id: TradeId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock()?;
        let peer = inner
            .peers
            .get_mut(peer_id)
            .ok_or(StoreError::NotFound("peer"))?;
        if !peer.suspect_trades.contains(&trade_id) {
            peer.suspect_trades.push(trade_id);
        }
        self.persist(&inner)
    }

    // ------- wallet addresses -------

    /// Claim the next external address index for a chain.
    pub fn next_address_index(&self, chain: &str) -> Result<u32, StoreError> {
        let mut inner = self.inner.lock()?;
        let index = inner.address_indices.entry(chain.to_string()).or_insert(0);
        let claimed = *index;
        *index += 1;
        self.persist(&inner)?;
        Ok(claimed)
    }

    pub fn record_wallet_address(&self, record: WalletAddressRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock()?;
        inner.wallet_addresses.push(record);
        self.persist(&inner)
    }

    // ------- swap keys -------

    pub fn put_swap_key(&self, trade_id: TradeId, privkey_hex: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock()?;
        inner.swap_keys.insert(trade_id, privkey_hex.to_string());
        self.persist(&inner)
    }

    pub fn swap_key(&self, trade_id: TradeId) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock()?.swap_keys.get(&trade_id).cloned())
    }

    pub fn wallet_address_for(
        &self,
        trade_id: TradeId,
        chain: &str,
    ) -> Result<Option<WalletAddressRecord>, StoreError> {
        Ok(self
            .inner
            .lock()?
            .wallet_addresses
            .iter()
            .find(|r| r.trade_id == Some(trade_id) && r.chain == chain)
            .cloned())
    }

    // ------- pending deliveries -------

    pub fn push_pending_delivery(&self, delivery: PendingDelivery) -> Result<(), StoreError> {
        let mut inner = self.inner.lock()?;
        // Replace a pending copy of the same message rather than queueing a
        // duplicate: deliveries are idempotent but retries are not free.
        inner.pending_deliveries.retain(|d| {
            !(d.peer_id == delivery.peer_id
                && d.trade_id == delivery.trade_id
                && d.envelope.payload == delivery.envelope.payload)
        });
        inner.pending_deliveries.push(delivery);
        self.persist(&inner)
    }

    pub fn pending_deliveries(&self) -> Result<Vec<PendingDelivery>, StoreError> {
        Ok(self.inner.lock()?.pending_deliveries.clone())
    }

    pub fn remove_pending_delivery(&self, delivery: &PendingDelivery) -> Result<(), StoreError> {
        let mut inner = self.inner.lock()?;
        inner.pending_deliveries.retain(|d| d != delivery);
        self.persist(&inner)
    }

    /// Drop deliveries past their deadline, returning what was dropped so
    /// the affected trades can be marked for refund evaluation.
    pub fn prune_expired_deliveries(&self, now: u64) -> Result<Vec<PendingDelivery>, StoreError> {
        let mut inner = self.inner.lock()?;
        let (expired, live): (Vec<_>, Vec<_>) = inner
            .pending_deliveries
            .drain(..)
            .partition(|d| d.deadline <= now);
        inner.pending_deliveries = live;
        self.persist(&inner)?;
        Ok(expired)
    }
}

fn check_secret_invariant(record: &SecretRecord) -> Result<(), StoreError> {
    if let Some(secret_hex) = &record.secret {
        let secret = from_hex_array::<32>(secret_hex)
            .map_err(|_| StoreError::Invariant("secret must be 32 bytes of hex"))?;
        let hash = from_hex_array::<32>(&record.secret_hash)
            .map_err(|_| StoreError::Invariant("secret hash must be 32 bytes of hex"))?;
        if sha256::Hash::hash(&secret).to_byte_array() != hash {
            return Err(StoreError::Invariant("secret does not hash to secret_hash"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::messages::{OrderInfo, SwapMethod};
    use crate::store::records::{LegRole, LegState, SecretOrigin, TradeRole};

    fn temp_store() -> SwapStore {
        static COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let unique = COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("crosswap-store-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        SwapStore::open(&dir.join(format!("store-{}.cbor", unique))).unwrap()
    }

    fn dummy_order() -> OrderInfo {
        OrderInfo {
            order_id: "ord-1".into(),
            maker_peer_id: "peerA".into(),
            offer_chain: "BTC".into(),
            offer_amount: 100_000,
            request_chain: "LTC".into(),
            request_amount: 5_000_000_000,
            method: SwapMethod::Musig2,
            created_at: now_ts(),
        }
    }

    fn dummy_trade(id: TradeId) -> Trade {
        Trade::new(id, &dummy_order(), "peerB", TradeRole::Maker, SwapMethod::Musig2)
    }

    #[test]
    fn test_trade_crud_and_duplicate() {
        let store = temp_store();
        let id = TradeId::new_random();
        store.create_trade(dummy_trade(id)).unwrap();
        assert!(matches!(
            store.create_trade(dummy_trade(id)),
            Err(StoreError::Duplicate(_))
        ));
        assert_eq!(store.trade(id).unwrap().unwrap().state, TradeState::Init);
        assert_eq!(store.non_terminal_trades().unwrap().len(), 1);
    }

    #[test]
    fn test_state_edges_enforced() {
        let store = temp_store();
        let id = TradeId::new_random();
        store.create_trade(dummy_trade(id)).unwrap();

        // Skipping accepted is rejected.
        assert!(store
            .update_trade_state(id, TradeState::Funded, None)
            .is_err());

        store
            .update_trade_state(id, TradeState::Accepted, None)
            .unwrap();
        store
            .update_trade_state(id, TradeState::Funding, None)
            .unwrap();
        store.update_trade_state(id, TradeState::Funded, None).unwrap();
        let done = store
            .update_trade_state(id, TradeState::Redeemed, None)
            .unwrap();
        assert!(done.completed_at.is_some());

        // Terminal rows are frozen.
        assert!(matches!(
            store.update_trade_state(id, TradeState::Refunded, None),
            Err(StoreError::Invariant(_))
        ));
    }

    #[test]
    fn test_two_legs_invariant() {
        let store = temp_store();
        let id = TradeId::new_random();
        store.create_trade(dummy_trade(id)).unwrap();

        let offer = SwapLeg::new(id, LegType::Offer, "BTC", LegRole::Sender);
        let request = SwapLeg::new(id, LegType::Request, "LTC", LegRole::Receiver);
        store.upsert_leg(offer.clone()).unwrap();
        store.upsert_leg(request).unwrap();
        assert_eq!(store.legs(id).unwrap().len(), 2);

        // Updating an existing leg does not create a third row.
        let mut updated = offer;
        updated.state = LegState::Funding;
        store.upsert_leg(updated).unwrap();
        assert_eq!(store.legs(id).unwrap().len(), 2);
        assert_eq!(
            store.leg(id, LegType::Offer).unwrap().unwrap().state,
            LegState::Funding
        );
    }

    #[test]
    fn test_secret_hash_invariant() {
        let store = temp_store();
        let id = TradeId::new_random();
        store.create_trade(dummy_trade(id)).unwrap();

        let preimage = [9u8; 32];
        let hash = sha256::Hash::hash(&preimage).to_byte_array();
        let record = SecretRecord {
            trade_id: id,
            secret_hash: to_hex(&hash),
            secret: None,
            created_by: SecretOrigin::Us,
            their_offer_wallet_addr: None,
            their_request_wallet_addr: None,
            created_at: now_ts(),
        };
        store.put_secret(record).unwrap();

        // A wrong preimage is rejected, the right one accepted.
        assert!(store.set_revealed_secret(id, &[1u8; 32]).is_err());
        store.set_revealed_secret(id, &preimage).unwrap();
        assert_eq!(
            store.secret(id).unwrap().unwrap().secret,
            Some(to_hex(&preimage))
        );
    }

    #[test]
    fn test_store_reload_roundtrip() {
        let dir = std::env::temp_dir().join(format!("crosswap-reload-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("reload.cbor");
        let _ = std::fs::remove_file(&path);

        let id = TradeId::new_random();
        {
            let store = SwapStore::open(&path).unwrap();
            store.create_trade(dummy_trade(id)).unwrap();
            store
                .upsert_leg(SwapLeg::new(id, LegType::Offer, "BTC", LegRole::Sender))
                .unwrap();
        }
        let reopened = SwapStore::open(&path).unwrap();
        assert!(reopened.trade(id).unwrap().is_some());
        assert_eq!(reopened.legs(id).unwrap().len(), 1);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_pending_delivery_dedup_and_expiry() {
        let store = temp_store();
        let id = TradeId::new_random();
        let envelope = crate::protocol::messages::MessageEnvelope::new(
            id,
            "peerA",
            crate::protocol::messages::SwapMessage::OrderCancel(
                crate::protocol::messages::OrderCancel {
                    order_id: "ord-1".into(),
                },
            ),
        );
        let delivery = PendingDelivery {
            peer_id: "peerB".into(),
            trade_id: id,
            deadline: now_ts() + 60,
            envelope: envelope.clone(),
            attempts: 1,
        };
        store.push_pending_delivery(delivery.clone()).unwrap();
        store.push_pending_delivery(delivery).unwrap();
        assert_eq!(store.pending_deliveries().unwrap().len(), 1);

        let expired = store.prune_expired_deliveries(now_ts() + 120).unwrap();
        assert_eq!(expired.len(), 1);
        assert!(store.pending_deliveries().unwrap().is_empty());
    }

    #[test]
    fn test_address_index_allocation() {
        let store = temp_store();
        assert_eq!(store.next_address_index("BTC").unwrap(), 0);
        assert_eq!(store.next_address_index("BTC").unwrap(), 1);
        assert_eq!(store.next_address_index("LTC").unwrap(), 0);
    }
}
