//! The happy-path MuSig2 swap between two in-process coordinators:
//! order take, key exchange, escrow agreement, nonce exchange, funding,
//! partial signatures and final signature combination on both chains.

mod test_framework;

use crosswap::{
    protocol::{messages::SwapMethod, musig},
    store::records::{LegType, TradeState},
};
use test_framework::*;

#[test]
fn test_standard_musig2_swap() {
    let (maker, taker, order_id) = trading_pair(SwapMethod::Musig2);

    // Taker commits to the order; the ferry carries the take to the maker,
    // the maker's key back, and the taker's key in return.
    let trade_id = taker.take_order(&order_id, SwapMethod::Musig2).unwrap();
    ferry_until_quiet(&maker, &taker);

    let maker_trade = maker.store.trade(trade_id).unwrap().unwrap();
    let taker_trade = taker.store.trade(trade_id).unwrap().unwrap();
    assert_eq!(maker_trade.state, TradeState::Accepted);
    assert_eq!(taker_trade.state, TradeState::Accepted);
    assert_eq!(maker_trade.maker_pubkey, taker_trade.maker_pubkey);
    assert_eq!(maker_trade.taker_pubkey, taker_trade.taker_pubkey);

    // Both sides must derive the same escrow program on each chain.
    for leg_type in [LegType::Offer, LegType::Request] {
        let maker_leg = maker.store.leg(trade_id, leg_type).unwrap().unwrap();
        let taker_leg = taker.store.leg(trade_id, leg_type).unwrap().unwrap();
        assert!(maker_leg.funding_address.is_some());
        assert_eq!(maker_leg.funding_address, taker_leg.funding_address);
    }

    // Nonces both ways. Generation is idempotent.
    let (offer_nonce_1, request_nonce_1) = maker.generate_nonces(trade_id).unwrap();
    let (offer_nonce_2, request_nonce_2) = maker.generate_nonces(trade_id).unwrap();
    assert_eq!(offer_nonce_1, offer_nonce_2);
    assert_eq!(request_nonce_1, request_nonce_2);
    ferry_until_quiet(&maker, &taker);

    // Funding on both chains, then confirmation.
    simulate_both_funded(&maker, &taker, trade_id);

    // Both participants construct the spending transactions independently
    // and must agree on every sighash.
    let maker_sighashes = maker.spend_sighashes(trade_id).unwrap();
    let taker_sighashes = taker.spend_sighashes(trade_id).unwrap();
    assert_eq!(maker_sighashes, taker_sighashes);

    // Partial signatures cross in one message per side.
    let (maker_offer_sig, _maker_request_sig) = maker
        .create_partial_signatures(trade_id, maker_sighashes.0, maker_sighashes.1)
        .unwrap();
    ferry_until_quiet(&maker, &taker);
    let (_taker_offer_sig, taker_request_sig) = taker
        .create_partial_signatures(trade_id, taker_sighashes.0, taker_sighashes.1)
        .unwrap();
    ferry_until_quiet(&maker, &taker);

    // The maker receives on the request chain, the taker on the offer
    // chain; each can combine a broadcast-ready BIP-340 signature.
    let maker_final = maker
        .combine_signatures(trade_id, "LTC", &taker_request_sig)
        .unwrap();
    let taker_final = taker
        .combine_signatures(trade_id, "BTC", &maker_offer_sig)
        .unwrap();
    assert_eq!(maker_final.len(), 64);
    assert_eq!(taker_final.len(), 64);
    assert_ne!(maker_final, taker_final);
}

#[test]
fn test_duplicate_pubkey_exchange_is_noop() {
    let (maker, taker, order_id) = trading_pair(SwapMethod::Musig2);
    let trade_id = taker.take_order(&order_id, SwapMethod::Musig2).unwrap();

    // Capture the maker's opening key message and deliver it twice.
    ferry(&taker, &maker);
    let queued = maker.store.pending_deliveries().unwrap();
    assert_eq!(queued.len(), 1);
    let envelope = queued[0].envelope.clone();
    maker.store.remove_pending_delivery(&queued[0]).unwrap();

    taker.handle_envelope(envelope.clone()).unwrap();
    let state_after_first = taker.store.trade(trade_id).unwrap().unwrap().state;
    taker.handle_envelope(envelope).unwrap();
    let state_after_second = taker.store.trade(trade_id).unwrap().unwrap().state;

    assert_eq!(state_after_first, TradeState::Accepted);
    assert_eq!(state_after_second, TradeState::Accepted);
    assert_eq!(taker.store.legs(trade_id).unwrap().len(), 2);

    // The mandatory invariant: both nonces survive unchanged, no state flap.
    let (nonce_1, _) = taker.generate_nonces(trade_id).unwrap();
    let (nonce_2, _) = taker.generate_nonces(trade_id).unwrap();
    assert_eq!(nonce_1, nonce_2);
    let _ = musig::nonce_from_bytes(&nonce_1).unwrap();
}
