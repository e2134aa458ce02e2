//! The HTLC swap path between two in-process coordinators: hashlock
//! exchange, escrow agreement with the mandatory timelock asymmetry,
//! funding order, secret reveal and refund eligibility.

mod test_framework;

use crosswap::{
    coordinator::TimeoutAction,
    protocol::messages::SwapMethod,
    store::records::{LegState, LegType, TradeState},
    utill::from_hex_array,
};
use test_framework::*;

#[test]
fn test_htlc_setup_and_secret_reveal() {
    let (maker, taker, order_id) = trading_pair(SwapMethod::Htlc);

    let trade_id = taker.take_order(&order_id, SwapMethod::Htlc).unwrap();
    ferry_until_quiet(&maker, &taker);

    assert_eq!(
        maker.store.trade(trade_id).unwrap().unwrap().state,
        TradeState::Accepted
    );
    assert_eq!(
        taker.store.trade(trade_id).unwrap().unwrap().state,
        TradeState::Accepted
    );

    // Both sides agree on the hashlock; only the maker knows the preimage.
    let maker_secret = maker.store.secret(trade_id).unwrap().unwrap();
    let taker_secret = taker.store.secret(trade_id).unwrap().unwrap();
    assert_eq!(maker_secret.secret_hash, taker_secret.secret_hash);
    assert!(maker_secret.secret.is_some());
    assert!(taker_secret.secret.is_none());

    // Escrow programs agree, and the initiator's timelock strictly exceeds
    // the responder's so the responder always sees the preimage in time.
    let mut timeouts = Vec::new();
    for leg_type in [LegType::Offer, LegType::Request] {
        let maker_leg = maker.store.leg(trade_id, leg_type).unwrap().unwrap();
        let taker_leg = taker.store.leg(trade_id, leg_type).unwrap().unwrap();
        assert!(maker_leg.funding_address.is_some());
        assert_eq!(maker_leg.funding_address, taker_leg.funding_address);
        timeouts.push(maker_leg.timeout_height.unwrap());
    }
    assert!(timeouts[0] > timeouts[1], "T_init must exceed T_resp");

    // The canonical funding order: the initiator may not fund first.
    assert!(maker.fund_swap(trade_id).is_err());

    simulate_both_funded(&maker, &taker, trade_id);

    // Only the initiator may reveal.
    assert!(taker.reveal_secret(trade_id).is_err());
    let preimage = maker.reveal_secret(trade_id).unwrap();
    assert_eq!(
        preimage,
        from_hex_array::<32>(maker_secret.secret.as_deref().unwrap()).unwrap()
    );

    // The reveal reaches the responder and passes the hash check.
    ferry_until_quiet(&maker, &taker);
    let taker_secret = taker.store.secret(trade_id).unwrap().unwrap();
    assert_eq!(
        taker_secret.secret.as_deref(),
        maker_secret.secret.as_deref()
    );

    // A duplicate reveal is a no-op.
    let before = taker.store.trade(trade_id).unwrap().unwrap();
    maker.reveal_secret(trade_id).unwrap();
    ferry_until_quiet(&maker, &taker);
    let after = taker.store.trade(trade_id).unwrap().unwrap();
    assert_eq!(before.state, after.state);
}

#[test]
fn test_htlc_timeout_sweep_reports_refunds() {
    let (maker, taker, order_id) = trading_pair(SwapMethod::Htlc);
    let trade_id = taker.take_order(&order_id, SwapMethod::Htlc).unwrap();
    ferry_until_quiet(&maker, &taker);
    simulate_both_funded(&maker, &taker, trade_id);

    // Nothing is eligible while the timelocks run.
    assert!(taker.check_timeouts().unwrap().is_empty());

    // Simulate the responder's timelock elapsing on its funded leg: enough
    // confirmations accumulate past the CSV delta.
    let mut leg = taker.store.leg(trade_id, LegType::Request).unwrap().unwrap();
    let timeout = leg.timeout_height.unwrap();
    leg.funding_confirms = timeout + 1;
    leg.state = LegState::Funded;
    taker.store.upsert_leg(leg.clone()).unwrap();

    let actions = taker.check_timeouts().unwrap();
    assert_eq!(actions.len(), 1);
    assert!(matches!(
        &actions[0],
        TimeoutAction::RefundEligible { trade_id: id, chain } if *id == trade_id && chain == "LTC"
    ));

    // Deep past the margin the sweep escalates to a required refund.
    leg.funding_confirms = timeout + 100;
    taker.store.upsert_leg(leg).unwrap();
    let actions = taker.check_timeouts().unwrap();
    assert!(matches!(
        &actions[0],
        TimeoutAction::RefundRequired { trade_id: id, .. } if *id == trade_id
    ));

    // The maker's sweep watches its own leg only, which is still live.
    assert!(maker.check_timeouts().unwrap().is_empty());
}
