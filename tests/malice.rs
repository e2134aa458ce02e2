//! Misbehaving counterparty scenarios: a partial signature that fails the
//! MuSig2 partial-verify predicate, and conflicting re-sends of an already
//! applied message.

mod test_framework;

use crosswap::{
    protocol::messages::{
        MessageEnvelope, NonceExchange, PartialSigExchange, PubkeyExchange, SwapMessage,
        SwapMethod,
    },
    store::records::TradeState,
};
use test_framework::*;

#[test]
fn test_invalid_partial_signature_fails_trade() {
    let (maker, taker, order_id) = trading_pair(SwapMethod::Musig2);
    let trade_id = taker.take_order(&order_id, SwapMethod::Musig2).unwrap();
    ferry_until_quiet(&maker, &taker);

    taker.generate_nonces(trade_id).unwrap();
    ferry_until_quiet(&maker, &taker);
    simulate_both_funded(&maker, &taker, trade_id);

    // The taker computes its sighashes so incoming partials verify on
    // arrival.
    taker.spend_sighashes(trade_id).unwrap();

    // A syntactically valid but cryptographically wrong partial signature.
    let envelope = MessageEnvelope::new(
        trade_id,
        MAKER_PEER,
        SwapMessage::PartialSig(PartialSigExchange {
            offer_partial_sig_hex: "01".repeat(32),
            request_partial_sig_hex: "01".repeat(32),
        }),
    );
    assert!(taker.handle_envelope(envelope).is_err());

    let trade = taker.store.trade(trade_id).unwrap().unwrap();
    assert_eq!(trade.state, TradeState::Failed);
    assert_eq!(trade.failure_reason.as_deref(), Some("invalid_partial_sig"));
    assert!(trade.completed_at.is_some());

    // The failed trade is frozen against everything except refund.
    assert!(taker
        .store
        .update_trade_state(trade_id, TradeState::Redeemed, None)
        .is_err());
    assert!(taker
        .store
        .update_trade_state(trade_id, TradeState::Refunded, None)
        .is_ok());
}

#[test]
fn test_conflicting_pubkey_is_rejected() {
    let (maker, taker, order_id) = trading_pair(SwapMethod::Musig2);
    let trade_id = taker.take_order(&order_id, SwapMethod::Musig2).unwrap();
    ferry_until_quiet(&maker, &taker);

    // A different key for the same trade is a protocol violation, not an
    // idempotent re-send.
    let (other_key, _) = crosswap::utill::generate_keypair();
    let envelope = MessageEnvelope::new(
        trade_id,
        MAKER_PEER,
        SwapMessage::PubkeyExchange(PubkeyExchange {
            pubkey_hex: crosswap::utill::to_hex(&other_key.to_bytes()),
            offer_wallet_addr: "bcrt1qother".into(),
            request_wallet_addr: "bcrt1qother2".into(),
        }),
    );
    assert!(taker.handle_envelope(envelope).is_err());
    assert_eq!(
        taker.store.trade(trade_id).unwrap().unwrap().state,
        TradeState::Failed
    );
}

#[test]
fn test_nonce_replacement_after_signing_is_rejected() {
    let (maker, taker, order_id) = trading_pair(SwapMethod::Musig2);
    let trade_id = taker.take_order(&order_id, SwapMethod::Musig2).unwrap();
    ferry_until_quiet(&maker, &taker);

    taker.generate_nonces(trade_id).unwrap();
    ferry_until_quiet(&maker, &taker);
    simulate_both_funded(&maker, &taker, trade_id);

    let sighashes = taker.spend_sighashes(trade_id).unwrap();
    taker
        .create_partial_signatures(trade_id, sighashes.0, sighashes.1)
        .unwrap();

    // Once we signed, replacement nonces can no longer be accepted.
    let (fresh_offer, fresh_request) = {
        // Any well-formed foreign nonces will do.
        let (other, other_sec) = crosswap::utill::generate_keypair();
        let ctx = crosswap::protocol::musig::key_agg_untweaked(&other, &other).unwrap();
        let (_, nonce_a) =
            crosswap::protocol::musig::generate_nonce_pair(&ctx, &other_sec).unwrap();
        let (_, nonce_b) =
            crosswap::protocol::musig::generate_nonce_pair(&ctx, &other_sec).unwrap();
        (nonce_a.serialize(), nonce_b.serialize())
    };
    let envelope = MessageEnvelope::new(
        trade_id,
        MAKER_PEER,
        SwapMessage::NonceExchange(NonceExchange {
            offer_nonce_hex: crosswap::utill::to_hex(&fresh_offer),
            request_nonce_hex: crosswap::utill::to_hex(&fresh_request),
        }),
    );
    assert!(taker.handle_envelope(envelope).is_err());
}
