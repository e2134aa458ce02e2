#![allow(dead_code)]
//! Shared scaffolding for the protocol tests: two in-process coordinators
//! wired back to back, with message ferrying in place of sockets.
//!
//! Chain backends point at a closed port, so anything that needs a live
//! chain (confirmation polls, broadcasts) fails softly; the tests drive
//! those transitions through the store, which is exactly what a chain
//! observer would do.

use std::{collections::HashMap, sync::Arc};

use crosswap::{
    chains::{ChainBackend, ChainFamily, ChainParams},
    coordinator::{CoordinatorConfig, SwapCoordinator},
    protocol::messages::{OrderInfo, SwapMethod, TradeId},
    store::{
        records::{LegState, LegType, OrderRecord, TradeState},
        SwapStore,
    },
    utill::now_ts,
    wallet::Wallet,
};

pub const MAKER_PHRASE: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
pub const TAKER_PHRASE: &str =
    "legal winner thank year wave sausage worth useful legal winner thank yellow";

pub const MAKER_PEER: &str = "peer-maker";
pub const TAKER_PEER: &str = "peer-taker";

fn chain_set() -> Vec<ChainParams> {
    ["BTC", "LTC"]
        .iter()
        .map(|symbol| ChainParams {
            symbol: symbol.to_string(),
            family: ChainFamily::Bitcoin,
            backend_url: "http://127.0.0.1:1".to_string(),
            network: bitcoin::Network::Regtest,
            dao_address: None,
            chain_id: None,
            htlc_contract: None,
            required_confirms: 1,
        })
        .collect()
}

fn unique_store(tag: &str) -> Arc<SwapStore> {
    static COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
    let unique = COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("crosswap-tests-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    Arc::new(SwapStore::open(&dir.join(format!("{}-{}.cbor", tag, unique))).unwrap())
}

pub fn spawn_coordinator(peer_id: &str, phrase: &str, store: Arc<SwapStore>) -> Arc<SwapCoordinator> {
    let chains = chain_set();
    let backends: HashMap<String, Arc<ChainBackend>> = chains
        .iter()
        .map(|p| {
            (
                p.symbol.clone(),
                Arc::new(ChainBackend::from_params(p).unwrap()),
            )
        })
        .collect();
    let mut config = CoordinatorConfig::default();
    config.peer_id = peer_id.to_string();
    // The tests drive confirmations through the store.
    config.required_confirms = 0;
    let wallet = Wallet::from_mnemonic(phrase, "").unwrap();
    SwapCoordinator::init(config, chains, backends, store, Some(wallet))
}

/// A maker and a taker with independent stores, both knowing the same order.
pub fn trading_pair(method: SwapMethod) -> (Arc<SwapCoordinator>, Arc<SwapCoordinator>, String) {
    let maker = spawn_coordinator(MAKER_PEER, MAKER_PHRASE, unique_store("maker"));
    let taker = spawn_coordinator(TAKER_PEER, TAKER_PHRASE, unique_store("taker"));

    let order_id = format!("ord-{}", TradeId::new_random());
    let order = OrderInfo {
        order_id: order_id.clone(),
        maker_peer_id: MAKER_PEER.to_string(),
        offer_chain: "BTC".to_string(),
        offer_amount: 100_000,
        request_chain: "LTC".to_string(),
        request_amount: 5_000_000_000,
        method,
        created_at: now_ts(),
    };
    maker
        .store
        .put_order(OrderRecord {
            order: order.clone(),
            ours: true,
            cancelled: false,
            updated_at: now_ts(),
        })
        .unwrap();
    taker
        .store
        .put_order(OrderRecord {
            order,
            ours: false,
            cancelled: false,
            updated_at: now_ts(),
        })
        .unwrap();
    (maker, taker, order_id)
}

/// Deliver everything queued at `from` into `to`'s handler. Returns how
/// many envelopes moved.
pub fn ferry(from: &SwapCoordinator, to: &SwapCoordinator) -> usize {
    let deliveries = from.store.pending_deliveries().unwrap();
    for delivery in &deliveries {
        from.store.remove_pending_delivery(delivery).unwrap();
        let _ = to.handle_envelope(delivery.envelope.clone());
    }
    deliveries.len()
}

/// Ferry both directions until no messages remain in flight.
pub fn ferry_until_quiet(a: &SwapCoordinator, b: &SwapCoordinator) {
    for _ in 0..32 {
        let moved = ferry(a, b) + ferry(b, a);
        if moved == 0 {
            return;
        }
    }
    panic!("message ferry did not converge");
}

/// Record both funding transactions and push both trades to `funded`, the
/// way a confirmed chain observation would.
pub fn simulate_both_funded(
    maker: &SwapCoordinator,
    taker: &SwapCoordinator,
    trade_id: TradeId,
) {
    maker
        .set_funding_tx(trade_id, &"11".repeat(32), 0, true)
        .unwrap();
    ferry_until_quiet(maker, taker);
    taker
        .set_funding_tx(trade_id, &"22".repeat(32), 1, true)
        .unwrap();
    ferry_until_quiet(maker, taker);

    for coordinator in [maker, taker] {
        for leg_type in [LegType::Offer, LegType::Request] {
            let mut leg = coordinator.store.leg(trade_id, leg_type).unwrap().unwrap();
            leg.funding_confirms = 1;
            leg.state = LegState::Funded;
            coordinator.store.upsert_leg(leg).unwrap();
        }
        coordinator
            .store
            .update_trade_state(trade_id, TradeState::Funded, None)
            .unwrap();
    }
}
