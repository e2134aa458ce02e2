//! Escrow transaction construction for Bitcoin-family chains.
//!
//! Three transaction shapes exist per escrow:
//! - the funding transaction paying into the escrow output (P2TR for the
//!   2-of-2 method, P2WSH for the hashlock method); built by the wallet,
//!   only its escrow output is constructed here,
//! - the cooperative sweep draining the escrow to the counterparty's wallet
//!   address with a fixed-ratio DAO fee output,
//! - the unilateral refund returning the escrow to its funder after a
//!   relative timelock (taproot script path or the P2WSH timelock branch).

use bitcoin::{
    absolute::LockTime,
    ecdsa::Signature as EcdsaSignature,
    hashes::Hash,
    key::{Keypair, Secp256k1, TweakedPublicKey},
    secp256k1::{Message, SecretKey},
    sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType},
    taproot::{ControlBlock, LeafVersion, TapNodeHash, TaprootBuilder, TaprootSpendInfo},
    transaction::Version,
    Amount, OutPoint, PublicKey, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
    XOnlyPublicKey,
};

use super::error::ProtocolError;
use crate::protocol::musig;

/// Virtual size of a one-input key-path sweep with two outputs. Used for fee
/// calculation from the backend's sat/vB estimate.
pub const SWEEP_TX_VBYTE_SIZE: u64 = 131;

/// Virtual size of a one-input script-path (or P2WSH branch) refund with one
/// output.
pub const REFUND_TX_VBYTE_SIZE: u64 = 147;

/// Outputs below this are uneconomical to create.
pub const DUST_LIMIT: u64 = 546;

/// DAO fee in parts per million of the swept amount.
pub const DAO_FEE_PPM: u64 = 2_000;

/// Absolute miner fee from a fee rate and a virtual size.
pub fn calculate_miner_fee(fee_rate_sat_vb: u64, tx_vbyte_size: u64) -> Amount {
    Amount::from_sat(fee_rate_sat_vb.max(1) * tx_vbyte_size)
}

/// The DAO cut of a swept escrow. Returns zero when the cut would be dust.
pub fn calculate_dao_fee(escrow_value: Amount) -> Amount {
    let fee = escrow_value.to_sat() * DAO_FEE_PPM / 1_000_000;
    if fee < DUST_LIMIT {
        Amount::ZERO
    } else {
        Amount::from_sat(fee)
    }
}

/// Convert a redeemscript into its P2WSH scriptpubkey.
pub fn redeemscript_to_scriptpubkey(redeemscript: &Script) -> ScriptBuf {
    ScriptBuf::new_p2wsh(&redeemscript.wscript_hash())
}

/// The P2TR scriptpubkey for an already-tweaked output key.
pub fn p2tr_script_pubkey(output_key: XOnlyPublicKey) -> ScriptBuf {
    ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(output_key))
}

/// The taproot refund leaf: after `csv_delta` blocks the funder may reclaim
/// the escrow with a single signature.
pub fn create_refund_leaf(csv_delta: u16, funder_key: &XOnlyPublicKey) -> ScriptBuf {
    bitcoin::blockdata::script::Builder::new()
        .push_int(csv_delta as i64)
        .push_opcode(bitcoin::blockdata::opcodes::all::OP_CSV)
        .push_opcode(bitcoin::blockdata::opcodes::all::OP_DROP)
        .push_x_only_key(funder_key)
        .push_opcode(bitcoin::blockdata::opcodes::all::OP_CHECKSIG)
        .into_script()
}

/// Merkle root of the single-leaf script tree the aggregated key commits to.
pub fn refund_leaf_merkle_root(leaf: &Script) -> [u8; 32] {
    TapNodeHash::from_script(leaf, LeafVersion::TapScript).to_byte_array()
}

/// Full spend info for the escrow's script tree, needed to assemble the
/// control block of a script-path refund.
pub fn escrow_spend_info(
    internal_key: XOnlyPublicKey,
    leaf: &ScriptBuf,
) -> Result<TaprootSpendInfo, ProtocolError> {
    let secp = Secp256k1::new();
    TaprootBuilder::new()
        .add_leaf(0, leaf.clone())
        .map_err(|_| ProtocolError::Protocol("refund leaf rejected by taproot builder"))?
        .finalize(&secp, internal_key)
        .map_err(|_| ProtocolError::Protocol("taproot builder not finalizable"))
}

/// Derive the escrow scriptpubkey of one chain for a MuSig2 swap: the
/// tweaked aggregated key with the funder's refund leaf committed.
pub fn musig_escrow_script_pubkey(
    local_key: &PublicKey,
    remote_key: &PublicKey,
    funder_key: &XOnlyPublicKey,
    csv_delta: u16,
) -> Result<(ScriptBuf, ScriptBuf), ProtocolError> {
    let leaf = create_refund_leaf(csv_delta, funder_key);
    let merkle_root = refund_leaf_merkle_root(&leaf);
    let ctx = musig::key_agg_tweaked(local_key, remote_key, &merkle_root)?;
    let output_key = musig::aggregated_xonly(&ctx)?;
    Ok((p2tr_script_pubkey(output_key), leaf))
}

/// Create the cooperative sweep transaction draining an escrow to the
/// receiver, with the DAO cut split out when an address is configured and
/// the cut is not dust.
pub fn create_sweep_tx(
    escrow_outpoint: OutPoint,
    escrow_value: Amount,
    receiver_spk: ScriptBuf,
    dao_spk: Option<ScriptBuf>,
    miner_fee: Amount,
) -> Result<Transaction, ProtocolError> {
    let dao_fee = match &dao_spk {
        Some(_) => calculate_dao_fee(escrow_value),
        None => Amount::ZERO,
    };
    let receiver_value = escrow_value
        .checked_sub(dao_fee)
        .and_then(|v| v.checked_sub(miner_fee))
        .ok_or(ProtocolError::Protocol("escrow value below fees"))?;
    if receiver_value.to_sat() < DUST_LIMIT {
        return Err(ProtocolError::Protocol("sweep output would be dust"));
    }

    let mut output = vec![TxOut {
        value: receiver_value,
        script_pubkey: receiver_spk,
    }];
    if dao_fee > Amount::ZERO {
        output.push(TxOut {
            value: dao_fee,
            script_pubkey: dao_spk.expect("dao fee is zero without an address"),
        });
    }

    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: escrow_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output,
    })
}

/// Create the claim transaction spending an HTLC output through its
/// hashlock branch. No relative timelock applies on this path.
pub fn create_htlc_claim_tx(
    escrow_outpoint: OutPoint,
    escrow_value: Amount,
    receiver_spk: ScriptBuf,
    miner_fee: Amount,
) -> Result<Transaction, ProtocolError> {
    let claim_value = escrow_value
        .checked_sub(miner_fee)
        .ok_or(ProtocolError::Protocol("escrow value below fees"))?;
    if claim_value.to_sat() < DUST_LIMIT {
        return Err(ProtocolError::Protocol("claim output would be dust"));
    }
    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: escrow_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: claim_value,
            script_pubkey: receiver_spk,
        }],
    })
}

/// Create the unilateral refund transaction. The input sequence encodes the
/// relative timelock, so the transaction is only valid `csv_delta` blocks
/// after the escrow confirmed.
pub fn create_refund_tx(
    escrow_outpoint: OutPoint,
    escrow_value: Amount,
    refund_spk: ScriptBuf,
    csv_delta: u16,
    miner_fee: Amount,
) -> Result<Transaction, ProtocolError> {
    let refund_value = escrow_value
        .checked_sub(miner_fee)
        .ok_or(ProtocolError::Protocol("escrow value below fees"))?;
    if refund_value.to_sat() < DUST_LIMIT {
        return Err(ProtocolError::Protocol("refund output would be dust"));
    }
    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: escrow_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::from_height(csv_delta),
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: refund_value,
            script_pubkey: refund_spk,
        }],
    })
}

/// BIP-341 key-path sighash of one input.
pub fn taproot_keyspend_sighash(
    transaction: &Transaction,
    prevouts: &[TxOut],
    input_index: usize,
) -> Result<[u8; 32], ProtocolError> {
    let sighash = SighashCache::new(transaction).taproot_key_spend_signature_hash(
        input_index,
        &Prevouts::All(prevouts),
        TapSighashType::Default,
    )?;
    Ok(sighash.to_byte_array())
}

/// BIP-341 script-path sighash of one input, for the refund leaf.
pub fn taproot_scriptspend_sighash(
    transaction: &Transaction,
    prevouts: &[TxOut],
    input_index: usize,
    leaf: &Script,
) -> Result<[u8; 32], ProtocolError> {
    let leaf_hash = bitcoin::TapLeafHash::from_script(leaf, LeafVersion::TapScript);
    let sighash = SighashCache::new(transaction).taproot_script_spend_signature_hash(
        input_index,
        &Prevouts::All(prevouts),
        leaf_hash,
        TapSighashType::Default,
    )?;
    Ok(sighash.to_byte_array())
}

/// Segwit v0 sighash of a P2WSH input.
pub fn p2wsh_sighash(
    transaction: &Transaction,
    redeemscript: &Script,
    funding_value: Amount,
    input_index: usize,
) -> Result<[u8; 32], ProtocolError> {
    let sighash = SighashCache::new(transaction).p2wsh_signature_hash(
        input_index,
        redeemscript,
        funding_value,
        EcdsaSighashType::All,
    )?;
    Ok(sighash.to_byte_array())
}

/// ECDSA-sign a P2WSH input against its redeemscript.
pub fn sign_p2wsh_input(
    transaction: &Transaction,
    redeemscript: &Script,
    funding_value: Amount,
    input_index: usize,
    privkey: &SecretKey,
) -> Result<EcdsaSignature, ProtocolError> {
    let sighash = p2wsh_sighash(transaction, redeemscript, funding_value, input_index)?;
    let secp = Secp256k1::new();
    let message = Message::from_digest_slice(&sighash)?;
    Ok(EcdsaSignature {
        signature: secp.sign_ecdsa(&message, privkey),
        sighash_type: EcdsaSighashType::All,
    })
}

/// Verify a counterparty's ECDSA signature on a P2WSH input.
pub fn verify_p2wsh_sig(
    transaction: &Transaction,
    redeemscript: &Script,
    funding_value: Amount,
    input_index: usize,
    pubkey: &PublicKey,
    signature: &EcdsaSignature,
) -> Result<(), ProtocolError> {
    let sighash = p2wsh_sighash(transaction, redeemscript, funding_value, input_index)?;
    let secp = Secp256k1::new();
    let message = Message::from_digest_slice(&sighash)?;
    Ok(secp.verify_ecdsa(&message, &signature.signature, &pubkey.inner)?)
}

/// Single-key schnorr signature for the script-path refund leaf.
pub fn sign_refund_leaf(sighash: &[u8; 32], privkey: &SecretKey) -> Result<[u8; 64], ProtocolError> {
    let secp = Secp256k1::new();
    let keypair = Keypair::from_secret_key(&secp, privkey);
    let message = Message::from_digest_slice(sighash)?;
    let signature = secp.sign_schnorr(&message, &keypair);
    Ok(*signature.as_ref())
}

/// Attach a finished key-path signature. Default sighash type keeps the
/// witness at exactly 64 bytes.
pub fn apply_keyspend_witness(transaction: &mut Transaction, input_index: usize, sig: &[u8; 64]) {
    let mut witness = Witness::new();
    witness.push(sig);
    transaction.input[input_index].witness = witness;
}

/// Attach the script-path refund witness: `[sig, leaf, control block]`.
pub fn apply_scriptpath_refund_witness(
    transaction: &mut Transaction,
    input_index: usize,
    sig: &[u8; 64],
    leaf: &ScriptBuf,
    control_block: &ControlBlock,
) {
    let mut witness = Witness::new();
    witness.push(sig);
    witness.push(leaf.to_bytes());
    witness.push(control_block.serialize());
    transaction.input[input_index].witness = witness;
}
