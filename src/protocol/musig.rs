//! MuSig2 signing sessions for the 2-of-2 Taproot escrows.
//!
//! Both participants reuse one secp256k1 keypair across both chains, but key
//! aggregation, nonces and sighashes are all per-chain. The aggregated key is
//! tweaked per BIP-341 with a single refund leaf as the script tree, so the
//! cooperative spend stays on the key path while each funder keeps a
//! unilateral CSV refund.

use bitcoin::{
    key::Secp256k1,
    secp256k1::{
        rand::{rngs::OsRng, RngCore},
        schnorr, Message, SecretKey, XOnlyPublicKey,
    },
    PublicKey,
};
use musig2::{AggNonce, CompactSignature, KeyAggContext, PartialSignature, PubNonce, SecNonce};

use super::error::ProtocolError;

/// Order two compressed public keys lexicographically, as the key
/// aggregation coefficient ordering demands.
pub fn sort_pubkeys(key1: PublicKey, key2: PublicKey) -> (PublicKey, PublicKey) {
    if key1.inner.serialize()[..] < key2.inner.serialize()[..] {
        (key1, key2)
    } else {
        (key2, key1)
    }
}

fn to_musig_pubkey(key: &PublicKey) -> Result<musig2::secp256k1::PublicKey, ProtocolError> {
    musig2::secp256k1::PublicKey::from_slice(&key.inner.serialize())
        .map_err(|_| ProtocolError::Decode("invalid public key bytes"))
}

fn to_musig_seckey(key: &SecretKey) -> Result<musig2::secp256k1::SecretKey, ProtocolError> {
    musig2::secp256k1::SecretKey::from_slice(&key.secret_bytes())
        .map_err(|_| ProtocolError::Decode("invalid secret key bytes"))
}

/// Aggregate the two swap keys without any taproot tweak. The x-only form of
/// this key is the taproot internal key the refund leaf commits to.
pub fn key_agg_untweaked(
    key1: &PublicKey,
    key2: &PublicKey,
) -> Result<KeyAggContext, ProtocolError> {
    let (first, second) = sort_pubkeys(*key1, *key2);
    Ok(KeyAggContext::new([
        to_musig_pubkey(&first)?,
        to_musig_pubkey(&second)?,
    ])?)
}

/// Aggregate the two swap keys and apply the BIP-341 tweak committing to the
/// given script-tree merkle root. Signatures produced under this context are
/// valid key-path spends of the escrow output.
pub fn key_agg_tweaked(
    key1: &PublicKey,
    key2: &PublicKey,
    merkle_root: &[u8; 32],
) -> Result<KeyAggContext, ProtocolError> {
    Ok(key_agg_untweaked(key1, key2)?.with_taproot_tweak(merkle_root)?)
}

/// The x-only aggregated key of a context, as a bitcoin type.
pub fn aggregated_xonly(ctx: &KeyAggContext) -> Result<XOnlyPublicKey, ProtocolError> {
    let aggregated: musig2::secp256k1::PublicKey = ctx.aggregated_pubkey();
    let compressed = aggregated.serialize();
    XOnlyPublicKey::from_slice(&compressed[1..33])
        .map_err(|_| ProtocolError::Decode("invalid aggregated key"))
}

/// Generate a fresh secret/public nonce pair for one chain.
///
/// The nonce seed comes from the OS rng and is additionally bound to the
/// local secret key and the aggregated key. The message cannot be bound here:
/// nonces are exchanged before the spending transactions (and therefore the
/// sighashes) exist.
pub fn generate_nonce_pair(
    ctx: &KeyAggContext,
    seckey: &SecretKey,
) -> Result<(SecNonce, PubNonce), ProtocolError> {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let aggregated: musig2::secp256k1::PublicKey = ctx.aggregated_pubkey();
    let secnonce = SecNonce::build(seed)
        .with_seckey(to_musig_seckey(seckey)?)
        .with_aggregated_pubkey(aggregated)
        .build();
    let pubnonce = secnonce.public_nonce();
    Ok((secnonce, pubnonce))
}

/// Sum the two public nonces of a chain into the aggregated nonce.
pub fn aggregate_nonces(local: &PubNonce, remote: &PubNonce) -> AggNonce {
    AggNonce::sum([local, remote])
}

/// Produce our partial signature for one chain. Consumes the secret nonce:
/// a second signature under the same nonce would leak the secret key.
pub fn partial_sign(
    ctx: &KeyAggContext,
    seckey: &SecretKey,
    secnonce: SecNonce,
    agg_nonce: &AggNonce,
    sighash: &[u8; 32],
) -> Result<PartialSignature, ProtocolError> {
    Ok(musig2::sign_partial(
        ctx,
        to_musig_seckey(seckey)?,
        secnonce,
        agg_nonce,
        sighash,
    )?)
}

/// The MuSig2 partial-verify predicate: checks a counterparty's partial
/// signature against their public key, their nonce and the chain's sighash.
pub fn verify_partial(
    ctx: &KeyAggContext,
    partial: PartialSignature,
    agg_nonce: &AggNonce,
    signer_pubkey: &PublicKey,
    signer_nonce: &PubNonce,
    sighash: &[u8; 32],
) -> Result<(), ProtocolError> {
    Ok(musig2::verify_partial(
        ctx,
        partial,
        agg_nonce,
        to_musig_pubkey(signer_pubkey)?,
        signer_nonce,
        sighash,
    )?)
}

/// Combine both partial signatures into the final 64-byte BIP-340 signature
/// and verify it against the tweaked aggregated key before returning it.
pub fn combine_partials(
    ctx: &KeyAggContext,
    agg_nonce: &AggNonce,
    partials: [PartialSignature; 2],
    sighash: &[u8; 32],
) -> Result<[u8; 64], ProtocolError> {
    let signature: CompactSignature =
        musig2::aggregate_partial_signatures(ctx, agg_nonce, partials, sighash)?;
    let serialized = signature.serialize();
    verify_schnorr(&serialized, sighash, &aggregated_xonly(ctx)?)?;
    Ok(serialized)
}

/// BIP-340 verification of a final signature, through the bitcoin secp
/// context so the exact consensus rules apply.
pub fn verify_schnorr(
    signature: &[u8; 64],
    sighash: &[u8; 32],
    pubkey: &XOnlyPublicKey,
) -> Result<(), ProtocolError> {
    let secp = Secp256k1::verification_only();
    let signature = schnorr::Signature::from_slice(signature)?;
    let message = Message::from_digest_slice(sighash)?;
    Ok(secp.verify_schnorr(&signature, &message, pubkey)?)
}

pub fn nonce_from_bytes(bytes: &[u8]) -> Result<PubNonce, ProtocolError> {
    PubNonce::from_bytes(bytes).map_err(|_| ProtocolError::Decode("malformed public nonce"))
}

pub fn partial_sig_from_bytes(bytes: &[u8]) -> Result<PartialSignature, ProtocolError> {
    PartialSignature::from_slice(bytes)
        .map_err(|_| ProtocolError::Decode("malformed partial signature"))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utill::generate_keypair;

    fn two_keypairs() -> ((PublicKey, SecretKey), (PublicKey, SecretKey)) {
        (generate_keypair(), generate_keypair())
    }

    #[test]
    fn test_pubkey_ordering_is_stable() {
        let ((pub1, _), (pub2, _)) = two_keypairs();
        let (a1, b1) = sort_pubkeys(pub1, pub2);
        let (a2, b2) = sort_pubkeys(pub2, pub1);
        assert_eq!((a1, b1), (a2, b2));
        assert!(a1.inner.serialize()[..] < b1.inner.serialize()[..]);
    }

    #[test]
    fn test_aggregation_is_symmetric() {
        let ((pub1, _), (pub2, _)) = two_keypairs();
        let agg1 = aggregated_xonly(&key_agg_untweaked(&pub1, &pub2).unwrap()).unwrap();
        let agg2 = aggregated_xonly(&key_agg_untweaked(&pub2, &pub1).unwrap()).unwrap();
        assert_eq!(agg1, agg2);
    }

    #[test]
    fn test_two_party_signing_session() {
        let ((pub1, sec1), (pub2, sec2)) = two_keypairs();
        let merkle_root = [7u8; 32];
        let ctx = key_agg_tweaked(&pub1, &pub2, &merkle_root).unwrap();
        let sighash = [42u8; 32];

        let (secnonce1, pubnonce1) = generate_nonce_pair(&ctx, &sec1).unwrap();
        let (secnonce2, pubnonce2) = generate_nonce_pair(&ctx, &sec2).unwrap();
        let agg_nonce = aggregate_nonces(&pubnonce1, &pubnonce2);

        let partial1 = partial_sign(&ctx, &sec1, secnonce1, &agg_nonce, &sighash).unwrap();
        let partial2 = partial_sign(&ctx, &sec2, secnonce2, &agg_nonce, &sighash).unwrap();

        verify_partial(&ctx, partial1, &agg_nonce, &pub1, &pubnonce1, &sighash).unwrap();
        verify_partial(&ctx, partial2, &agg_nonce, &pub2, &pubnonce2, &sighash).unwrap();

        let final_sig = combine_partials(&ctx, &agg_nonce, [partial1, partial2], &sighash).unwrap();
        verify_schnorr(&final_sig, &sighash, &aggregated_xonly(&ctx).unwrap()).unwrap();
    }

    #[test]
    fn test_bad_partial_is_rejected() {
        let ((pub1, sec1), (pub2, sec2)) = two_keypairs();
        let ctx = key_agg_untweaked(&pub1, &pub2).unwrap();
        let sighash = [1u8; 32];
        let other_sighash = [2u8; 32];

        let (secnonce1, pubnonce1) = generate_nonce_pair(&ctx, &sec1).unwrap();
        let (secnonce2, pubnonce2) = generate_nonce_pair(&ctx, &sec2).unwrap();
        let agg_nonce = aggregate_nonces(&pubnonce1, &pubnonce2);

        let _honest = partial_sign(&ctx, &sec1, secnonce1, &agg_nonce, &sighash).unwrap();
        // Signed against the wrong message. Partial verification must fail.
        let dishonest = partial_sign(&ctx, &sec2, secnonce2, &agg_nonce, &other_sighash).unwrap();
        assert!(verify_partial(&ctx, dishonest, &agg_nonce, &pub2, &pubnonce2, &sighash).is_err());
    }

    #[test]
    fn test_nonce_wire_length() {
        let ((pub1, sec1), (pub2, _)) = two_keypairs();
        let ctx = key_agg_untweaked(&pub1, &pub2).unwrap();
        let (_, pubnonce) = generate_nonce_pair(&ctx, &sec1).unwrap();
        assert_eq!(pubnonce.serialize().len(), 66);
        assert!(nonce_from_bytes(&pubnonce.serialize()).is_ok());
        assert!(nonce_from_bytes(&[0u8; 65]).is_err());
    }
}
