//! Crash recovery: a coordinator restarts mid-swap on top of its persisted
//! store and resumes the signing session without losing the trade.

mod test_framework;

use crosswap::{
    protocol::messages::SwapMethod,
    store::records::{LegType, TradeState},
};
use test_framework::*;

#[test]
fn test_recovery_resumes_funded_musig_swap() {
    let (maker, taker, order_id) = trading_pair(SwapMethod::Musig2);
    let trade_id = taker.take_order(&order_id, SwapMethod::Musig2).unwrap();
    ferry_until_quiet(&maker, &taker);

    maker.generate_nonces(trade_id).unwrap();
    ferry_until_quiet(&maker, &taker);
    simulate_both_funded(&maker, &taker, trade_id);

    // The maker signs and sends its partials, then "crashes".
    let sighashes = maker.spend_sighashes(trade_id).unwrap();
    let (maker_offer_sig, _) = maker
        .create_partial_signatures(trade_id, sighashes.0, sighashes.1)
        .unwrap();
    let maker_store = maker.store.clone();
    drop(maker);

    // A fresh process over the same store rehydrates the swap.
    let maker2 = spawn_coordinator(MAKER_PEER, MAKER_PHRASE, maker_store);
    assert_eq!(maker2.startup_sweep().unwrap(), 1);

    let trade = maker2.store.trade(trade_id).unwrap().unwrap();
    assert_eq!(trade.state, TradeState::Funded);

    // The re-derived escrow programs match what was agreed before the crash.
    for leg_type in [LegType::Offer, LegType::Request] {
        let maker_leg = maker2.store.leg(trade_id, leg_type).unwrap().unwrap();
        let taker_leg = taker.store.leg(trade_id, leg_type).unwrap().unwrap();
        assert_eq!(maker_leg.funding_address, taker_leg.funding_address);
    }

    // The recovered session still agrees on every sighash.
    let recovered_sighashes = maker2.spend_sighashes(trade_id).unwrap();
    assert_eq!(recovered_sighashes, sighashes);

    // The counterparty's partials arrive after the restart; the recovered
    // coordinator can finish the signing session.
    let taker_sighashes = taker.spend_sighashes(trade_id).unwrap();
    let (taker_offer_sig, taker_request_sig) = taker
        .create_partial_signatures(trade_id, taker_sighashes.0, taker_sighashes.1)
        .unwrap();
    ferry_until_quiet(&maker2, &taker);

    let final_sig = maker2
        .combine_signatures(trade_id, "LTC", &taker_request_sig)
        .unwrap();
    assert_eq!(final_sig.len(), 64);

    // And the taker side never noticed the crash.
    let taker_final = taker
        .combine_signatures(trade_id, "BTC", &maker_offer_sig)
        .unwrap();
    assert_eq!(taker_final.len(), 64);
    let _ = taker_offer_sig;
}

#[test]
fn test_recovery_skips_terminal_trades() {
    let (maker, taker, order_id) = trading_pair(SwapMethod::Musig2);
    let trade_id = taker.take_order(&order_id, SwapMethod::Musig2).unwrap();
    ferry_until_quiet(&maker, &taker);

    taker.abort_swap(trade_id, "counterparty walked away").unwrap();
    assert_eq!(
        taker.store.trade(trade_id).unwrap().unwrap().state,
        TradeState::Aborted
    );

    let taker_store = taker.store.clone();
    drop(taker);
    let taker2 = spawn_coordinator(TAKER_PEER, TAKER_PHRASE, taker_store);
    assert_eq!(taker2.startup_sweep().unwrap(), 0);
    // Terminal trades stay terminal and get no working set.
    assert!(taker2.recover_swap(trade_id).is_ok());
}
