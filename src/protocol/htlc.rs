//! Bitcoin-family HTLC escrows.
//!
//! The escrow is a P2WSH output. Its redeem script pays to the receiver on
//! presentation of the sha256 preimage, or back to the sender after a
//! relative timelock:
//!
//! ```text
//! opcodes                  | stack after execution
//!                          |
//!                          | <sig> <pub> <preimage> 1   (claim path)
//!                          | <sig> <pub> 0              (refund path)
//! OP_IF                    |
//!     OP_SHA256            | <sig> <pub> <hash>
//!     H(X)                 | <sig> <pub> <hash> H(X)
//!     OP_EQUALVERIFY       | <sig> <pub>
//!     OP_DUP OP_HASH160    | <sig> <pub> <pkh>
//!     <receiver_pkh>       | <sig> <pub> <pkh> <pkh'>
//!     OP_EQUALVERIFY       | <sig> <pub>
//!     OP_CHECKSIG          | true|false
//! OP_ELSE                  |
//!     <timeout>            | <sig> <pub> <timeout>
//!     OP_CSV OP_DROP       | <sig> <pub>
//!     OP_DUP OP_HASH160    | <sig> <pub> <pkh>
//!     <sender_pkh>         | <sig> <pub> <pkh> <pkh'>
//!     OP_EQUALVERIFY       | <sig> <pub>
//!     OP_CHECKSIG          | true|false
//! OP_ENDIF                 |
//! ```
//!
//! The claim witness publishes the preimage on-chain, which is exactly what
//! hands the counterparty its claim on the other leg.

use std::convert::TryInto;

use bitcoin::{
    blockdata::{
        opcodes,
        script::{Builder, Instruction, Script},
    },
    ecdsa::Signature as EcdsaSignature,
    hashes::{sha256, Hash},
    PublicKey, ScriptBuf, Transaction, Witness,
};

use super::error::ProtocolError;
use crate::protocol::messages::Preimage;

/// Build the HTLC redeem script for one chain of a swap.
#[rustfmt::skip]
pub fn create_htlc_redeemscript(
    secret_hash: &[u8; 32],
    receiver_key: &PublicKey,
    sender_key: &PublicKey,
    timeout: u16,
) -> ScriptBuf {
    Builder::new()
        .push_opcode(opcodes::all::OP_IF)
            .push_opcode(opcodes::all::OP_SHA256)
            .push_slice(secret_hash)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_DUP)
            .push_opcode(opcodes::all::OP_HASH160)
            .push_slice(receiver_key.pubkey_hash().to_byte_array())
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_CHECKSIG)
        .push_opcode(opcodes::all::OP_ELSE)
            .push_int(timeout as i64)
            .push_opcode(opcodes::all::OP_CSV)
            .push_opcode(opcodes::all::OP_DROP)
            .push_opcode(opcodes::all::OP_DUP)
            .push_opcode(opcodes::all::OP_HASH160)
            .push_slice(sender_key.pubkey_hash().to_byte_array())
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_CHECKSIG)
        .push_opcode(opcodes::all::OP_ENDIF)
        .into_script()
}

/// Read the sha256 hashlock value back out of an HTLC redeem script.
pub fn read_secret_hash(redeemscript: &Script) -> Result<[u8; 32], ProtocolError> {
    match nth_instruction(redeemscript, 2)? {
        Instruction::PushBytes(bytes) if bytes.len() == 32 => Ok(bytes
            .as_bytes()
            .try_into()
            .expect("length checked just above")),
        _ => Err(ProtocolError::Protocol(
            "hashlock value missing from redeemscript",
        )),
    }
}

/// Read the relative timeout back out of an HTLC redeem script.
pub fn read_timeout(redeemscript: &Script) -> Result<u16, ProtocolError> {
    match nth_instruction(redeemscript, 10)? {
        Instruction::PushBytes(bytes) => match bytes.len() {
            1 => Ok(bytes.as_bytes()[0] as u16),
            2 => Ok(u16::from_le_bytes(
                bytes.as_bytes().try_into().expect("length checked"),
            )),
            _ => Err(ProtocolError::Protocol(
                "can't read timeout value from redeemscript",
            )),
        },
        Instruction::Op(opcode) => {
            if let opcodes::Class::PushNum(n) = opcode.classify(opcodes::ClassifyContext::Legacy) {
                n.try_into().map_err(|_| {
                    ProtocolError::Protocol("can't read timeout value from redeemscript")
                })
            } else {
                Err(ProtocolError::Protocol(
                    "can't read timeout value from redeemscript",
                ))
            }
        }
    }
}

/// Read the receiver's pubkey-hash (the hashlock branch key).
pub fn read_receiver_pubkey_hash(redeemscript: &Script) -> Result<[u8; 20], ProtocolError> {
    read_pkh_at(redeemscript, 6)
}

/// Read the sender's pubkey-hash (the refund branch key).
pub fn read_sender_pubkey_hash(redeemscript: &Script) -> Result<[u8; 20], ProtocolError> {
    read_pkh_at(redeemscript, 15)
}

fn read_pkh_at(redeemscript: &Script, index: usize) -> Result<[u8; 20], ProtocolError> {
    match nth_instruction(redeemscript, index)? {
        Instruction::PushBytes(bytes) if bytes.len() == 20 => Ok(bytes
            .as_bytes()
            .try_into()
            .expect("length checked just above")),
        _ => Err(ProtocolError::Protocol(
            "pubkey hash missing from redeemscript",
        )),
    }
}

fn nth_instruction(script: &Script, index: usize) -> Result<Instruction<'_>, ProtocolError> {
    script
        .instructions()
        .nth(index)
        .ok_or(ProtocolError::Protocol("redeemscript too short"))?
        .map_err(ProtocolError::Script)
}

/// Check a redeem script matches the template for the given parameters.
pub fn validate_htlc_redeemscript(
    redeemscript: &Script,
    secret_hash: &[u8; 32],
    receiver_key: &PublicKey,
    sender_key: &PublicKey,
    minimum_timeout: u16,
) -> Result<(), ProtocolError> {
    let timeout = read_timeout(redeemscript)?;
    if timeout < minimum_timeout {
        return Err(ProtocolError::Protocol("timeout too short"));
    }
    let expected = create_htlc_redeemscript(secret_hash, receiver_key, sender_key, timeout);
    if redeemscript.as_bytes() != expected.as_bytes() {
        return Err(ProtocolError::Protocol(
            "redeemscript not matching htlc template",
        ));
    }
    Ok(())
}

/// Witness for the hashlock branch: publishes the preimage.
pub fn create_claim_witness(
    signature: &EcdsaSignature,
    pubkey: &PublicKey,
    preimage: &Preimage,
    redeemscript: &Script,
) -> Witness {
    let mut witness = Witness::new();
    witness.push(signature.serialize());
    witness.push(pubkey.to_bytes());
    witness.push(preimage);
    witness.push([1u8]);
    witness.push(redeemscript.to_bytes());
    witness
}

/// Witness for the timelock branch. The spending input must carry a
/// relative-locktime sequence of at least the script's timeout.
pub fn create_refund_witness(
    signature: &EcdsaSignature,
    pubkey: &PublicKey,
    redeemscript: &Script,
) -> Witness {
    let mut witness = Witness::new();
    witness.push(signature.serialize());
    witness.push(pubkey.to_bytes());
    witness.push(Vec::<u8>::new());
    witness.push(redeemscript.to_bytes());
    witness
}

/// Scan a spending transaction's witnesses for a 32-byte item hashing to the
/// expected value. This is how the responder learns the secret on
/// Bitcoin-family chains once the initiator claims.
pub fn extract_preimage_from_tx(
    transaction: &Transaction,
    secret_hash: &[u8; 32],
) -> Option<Preimage> {
    for input in &transaction.input {
        for item in input.witness.iter() {
            if item.len() == 32 && sha256::Hash::hash(item).to_byte_array() == *secret_hash {
                return Some(item.try_into().expect("length checked just above"));
            }
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utill::generate_keypair;
    use bitcoin::{
        absolute::LockTime, hashes::Hash, transaction::Version, OutPoint, ScriptBuf, Sequence,
        TxIn, TxOut,
    };
    use std::str::FromStr;

    #[test]
    fn test_htlc_script_generation() {
        let secret = [0xabu8; 32];
        let secret_hash = sha256::Hash::hash(&secret).to_byte_array();

        let receiver = PublicKey::from_str(
            "032e58afe51f9ed8ad3cc7897f634d881fdbe49a81564629ded8156bebd2ffd1af",
        )
        .unwrap();
        let sender = PublicKey::from_str(
            "039b6347398505f5ec93826dc61c19f47c66c0283ee9be980e29ce325a0f4679ef",
        )
        .unwrap();

        let script = create_htlc_redeemscript(&secret_hash, &receiver, &sender, 144);

        // Hand-assembled expectation: OP_IF OP_SHA256 <32:hash> OP_EQUALVERIFY
        // OP_DUP OP_HASH160 <20:pkh> OP_EQUALVERIFY OP_CHECKSIG OP_ELSE
        // <0x9000 le> OP_CSV OP_DROP OP_DUP OP_HASH160 <20:pkh> OP_EQUALVERIFY
        // OP_CHECKSIG OP_ENDIF
        let expected = "63a820".to_owned()
            + &crate::utill::to_hex(&secret_hash)
            + "8876a914"
            + &crate::utill::to_hex(&receiver.pubkey_hash().to_byte_array())
            + "88ac67"
            + "029000"
            + "b27576a914"
            + &crate::utill::to_hex(&sender.pubkey_hash().to_byte_array())
            + "88ac68";
        assert_eq!(format!("{:x}", script), expected);

        // Read-back accessors agree with the inputs.
        assert_eq!(read_secret_hash(&script).unwrap(), secret_hash);
        assert_eq!(read_timeout(&script).unwrap(), 144);
        assert_eq!(
            read_receiver_pubkey_hash(&script).unwrap(),
            receiver.pubkey_hash().to_byte_array()
        );
        assert_eq!(
            read_sender_pubkey_hash(&script).unwrap(),
            sender.pubkey_hash().to_byte_array()
        );

        validate_htlc_redeemscript(&script, &secret_hash, &receiver, &sender, 20).unwrap();
        assert!(validate_htlc_redeemscript(&script, &secret_hash, &receiver, &sender, 200).is_err());
        assert!(validate_htlc_redeemscript(&script, &[0u8; 32], &receiver, &sender, 20).is_err());
    }

    #[test]
    fn test_small_timeout_uses_pushnum() {
        let (receiver, _) = generate_keypair();
        let (sender, _) = generate_keypair();
        let script = create_htlc_redeemscript(&[1u8; 32], &receiver, &sender, 16);
        assert_eq!(read_timeout(&script).unwrap(), 16);
    }

    #[test]
    fn test_preimage_extraction_from_claim_witness() {
        let (receiver, receiver_sec) = generate_keypair();
        let (sender, _) = generate_keypair();
        let preimage: Preimage = [0x5au8; 32];
        let secret_hash = sha256::Hash::hash(&preimage).to_byte_array();
        let script = create_htlc_redeemscript(&secret_hash, &receiver, &sender, 72);

        // A dummy ecdsa signature is enough: extraction only inspects lengths
        // and hashes, not signature validity.
        let secp = bitcoin::key::Secp256k1::new();
        let message = bitcoin::secp256k1::Message::from_digest_slice(&[3u8; 32]).unwrap();
        let signature = EcdsaSignature {
            signature: secp.sign_ecdsa(&message, &receiver_sec),
            sighash_type: bitcoin::EcdsaSighashType::All,
        };

        let witness = create_claim_witness(&signature, &receiver, &preimage, &script);
        let spending_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::from_str(
                    "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456:0",
                )
                .unwrap(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ZERO,
                witness,
            }],
            output: vec![TxOut {
                value: bitcoin::Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::new(),
            }],
        };

        assert_eq!(
            extract_preimage_from_tx(&spending_tx, &secret_hash),
            Some(preimage)
        );
        assert_eq!(extract_preimage_from_tx(&spending_tx, &[9u8; 32]), None);

        // A refund witness carries no preimage.
        let mut refund_tx = spending_tx;
        refund_tx.input[0].witness = create_refund_witness(&signature, &receiver, &script);
        assert_eq!(extract_preimage_from_tx(&refund_tx, &secret_hash), None);
    }
}
