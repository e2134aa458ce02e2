//! EVM HTLC escrows.
//!
//! On EVM chains the escrow is an entry in a pre-deployed swap contract. A
//! swap is opened with `newSwap(receiver, token, amount, secretHash,
//! timelock)` (token = zero address for the native coin), claimed with the
//! sha256 preimage and refunded by the opener after the absolute unix
//! timelock. The contract identifies an entry by its swap-id:
//!
//! `keccak256(abi.encodePacked(initiator, receiver, token, amount,
//! secretHash, timelock))`
//!
//! Claiming emits `Claimed(secretHash, secret)`, which is how the
//! counterparty learns the preimage on EVM chains.

use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_sol_types::{sol, SolCall, SolEvent, SolValue};
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};

use super::error::ProtocolError;

sol! {
    function newSwap(address receiver, address token, uint256 amount, bytes32 secretHash, uint256 timelock) returns (bytes32 swapId);
    function claim(bytes32 swapId, bytes32 secret);
    function refund(bytes32 swapId);
    function getSwap(bytes32 swapId) returns (address initiator, address receiver, address token, uint256 amount, bytes32 secretHash, uint256 timelock, uint8 state);

    event Claimed(bytes32 indexed secretHash, bytes32 secret);
    event Refunded(bytes32 indexed secretHash);
}

/// Gas limits for the three contract calls. The contract's code paths are
/// small and fixed, so static limits are sufficient.
pub const NEW_SWAP_GAS_LIMIT: u64 = 150_000;
pub const CLAIM_GAS_LIMIT: u64 = 100_000;
pub const REFUND_GAS_LIMIT: u64 = 100_000;

/// Lifecycle of a contract-side swap entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvmHtlcStatus {
    Unknown,
    Open,
    Claimed,
    Refunded,
}

impl EvmHtlcStatus {
    pub fn from_contract_state(state: u8) -> Self {
        match state {
            1 => Self::Open,
            2 => Self::Claimed,
            3 => Self::Refunded,
            _ => Self::Unknown,
        }
    }
}

/// Derive the contract's swap-id for a set of escrow parameters.
pub fn compute_swap_id(
    initiator: Address,
    receiver: Address,
    token: Address,
    amount: U256,
    secret_hash: B256,
    timelock: U256,
) -> B256 {
    let packed = (initiator, receiver, token, amount, secret_hash, timelock).abi_encode_packed();
    keccak256(packed)
}

pub fn encode_new_swap(
    receiver: Address,
    token: Address,
    amount: U256,
    secret_hash: B256,
    timelock: U256,
) -> Vec<u8> {
    newSwapCall {
        receiver,
        token,
        amount,
        secretHash: secret_hash,
        timelock,
    }
    .abi_encode()
}

pub fn encode_claim(swap_id: B256, secret: B256) -> Vec<u8> {
    claimCall {
        swapId: swap_id,
        secret,
    }
    .abi_encode()
}

pub fn encode_refund(swap_id: B256) -> Vec<u8> {
    refundCall { swapId: swap_id }.abi_encode()
}

pub fn encode_get_swap(swap_id: B256) -> Vec<u8> {
    getSwapCall { swapId: swap_id }.abi_encode()
}

/// Topic0 of the contract's `Claimed(bytes32 indexed, bytes32)` event.
pub fn claimed_event_topic() -> B256 {
    Claimed::SIGNATURE_HASH
}

/// Pull the revealed secret out of a `Claimed` log: topic1 is the secret
/// hash, the single data word is the secret itself.
pub fn decode_claimed_log(topics: &[B256], data: &[u8]) -> Option<(B256, [u8; 32])> {
    if topics.len() != 2 || topics[0] != Claimed::SIGNATURE_HASH || data.len() != 32 {
        return None;
    }
    let mut secret = [0u8; 32];
    secret.copy_from_slice(data);
    Some((topics[1], secret))
}

/// Decode the seven return words of `getSwap`. A zero initiator means the
/// contract has no entry under this id.
pub fn decode_get_swap_return(data: &[u8]) -> Result<(Address, EvmHtlcStatus), ProtocolError> {
    if data.len() != 7 * 32 {
        return Err(ProtocolError::Decode("malformed getSwap return data"));
    }
    let initiator = Address::from_slice(&data[12..32]);
    let state = data[6 * 32 + 31];
    Ok((initiator, EvmHtlcStatus::from_contract_state(state)))
}

/// Parse an EVM address, with or without the `0x` prefix.
pub fn parse_address(raw: &str) -> Result<Address, ProtocolError> {
    let trimmed = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes =
        crate::utill::from_hex(trimmed).map_err(|_| ProtocolError::Decode("invalid evm address"))?;
    if bytes.len() != 20 {
        return Err(ProtocolError::Decode("invalid evm address"));
    }
    Ok(Address::from_slice(&bytes))
}

/// The EVM account address of a secp256k1 public key.
pub fn evm_address_from_pubkey(pubkey: &bitcoin::PublicKey) -> Address {
    let uncompressed = pubkey.inner.serialize_uncompressed();
    let digest = keccak256(&uncompressed[1..]);
    Address::from_slice(&digest[12..])
}

/// An unsigned legacy (pre-EIP-1559) transaction. Legacy transactions are
/// accepted by every EVM chain, which keeps the signer chain-agnostic.
#[derive(Debug, Clone)]
pub struct EvmTxRequest {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
}

/// RLP-encode and sign a legacy transaction with EIP-155 replay protection,
/// returning the raw bytes for `eth_sendRawTransaction`.
pub fn sign_legacy_tx(
    request: &EvmTxRequest,
    chain_id: u64,
    seckey: &SecretKey,
) -> Result<Vec<u8>, ProtocolError> {
    let unsigned_fields = vec![
        rlp_uint(request.nonce as u128),
        rlp_uint_256(request.gas_price),
        rlp_uint(request.gas_limit as u128),
        rlp_bytes(request.to.as_slice()),
        rlp_uint_256(request.value),
        rlp_bytes(&request.data),
        rlp_uint(chain_id as u128),
        rlp_uint(0),
        rlp_uint(0),
    ];
    let sighash = keccak256(rlp_list(&unsigned_fields));

    let secp = Secp256k1::new();
    let message = Message::from_digest_slice(sighash.as_slice())?;
    let signature = secp.sign_ecdsa_recoverable(&message, seckey);
    let (recovery_id, compact) = signature.serialize_compact();

    let v = recovery_id.to_i32() as u128 + 35 + 2 * chain_id as u128;
    let r = strip_leading_zeros(&compact[..32]);
    let s = strip_leading_zeros(&compact[32..]);

    let signed_fields = vec![
        rlp_uint(request.nonce as u128),
        rlp_uint_256(request.gas_price),
        rlp_uint(request.gas_limit as u128),
        rlp_bytes(request.to.as_slice()),
        rlp_uint_256(request.value),
        rlp_bytes(&request.data),
        rlp_uint(v),
        rlp_bytes(r),
        rlp_bytes(s),
    ];
    Ok(rlp_list(&signed_fields))
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn rlp_uint(value: u128) -> Vec<u8> {
    if value == 0 {
        return vec![0x80];
    }
    let bytes = value.to_be_bytes();
    rlp_bytes(strip_leading_zeros(&bytes))
}

fn rlp_uint_256(value: U256) -> Vec<u8> {
    if value.is_zero() {
        return vec![0x80];
    }
    let bytes = value.to_be_bytes::<32>();
    rlp_bytes(strip_leading_zeros(&bytes))
}

fn rlp_bytes(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() == 1 && bytes[0] < 0x80 {
        return bytes.to_vec();
    }
    let mut out = rlp_length_prefix(bytes.len(), 0x80);
    out.extend_from_slice(bytes);
    out
}

fn rlp_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload: Vec<u8> = items.iter().flatten().copied().collect();
    let mut out = rlp_length_prefix(payload.len(), 0xc0);
    out.extend_from_slice(&payload);
    out
}

fn rlp_length_prefix(length: usize, offset: u8) -> Vec<u8> {
    if length < 56 {
        vec![offset + length as u8]
    } else {
        let length_bytes = length.to_be_bytes();
        let stripped = strip_leading_zeros(&length_bytes);
        let mut out = vec![offset + 55 + stripped.len() as u8];
        out.extend_from_slice(stripped);
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utill::{from_hex_array, generate_keypair};

    fn sample_params() -> (Address, Address, Address, U256, B256, U256) {
        (
            parse_address("0x1111111111111111111111111111111111111111").unwrap(),
            parse_address("0x2222222222222222222222222222222222222222").unwrap(),
            Address::ZERO,
            U256::from(1_000_000_000_000_000_000u128),
            B256::from([0xabu8; 32]),
            U256::from(1_700_100_000u64),
        )
    }

    #[test]
    fn test_swap_id_is_keccak_of_packed_params() {
        let (initiator, receiver, token, amount, secret_hash, timelock) = sample_params();

        // Hand-packed: 20 + 20 + 20 + 32 + 32 + 32 bytes.
        let mut packed = Vec::new();
        packed.extend_from_slice(initiator.as_slice());
        packed.extend_from_slice(receiver.as_slice());
        packed.extend_from_slice(token.as_slice());
        packed.extend_from_slice(&amount.to_be_bytes::<32>());
        packed.extend_from_slice(secret_hash.as_slice());
        packed.extend_from_slice(&timelock.to_be_bytes::<32>());
        assert_eq!(packed.len(), 156);

        let swap_id = compute_swap_id(initiator, receiver, token, amount, secret_hash, timelock);
        assert_eq!(swap_id, keccak256(&packed));
    }

    #[test]
    fn test_call_encodings_carry_selector_and_args() {
        let (_, receiver, token, amount, secret_hash, timelock) = sample_params();
        let data = encode_new_swap(receiver, token, amount, secret_hash, timelock);
        // 4-byte selector + 5 words.
        assert_eq!(data.len(), 4 + 5 * 32);
        assert_eq!(&data[4 + 12..4 + 32], receiver.as_slice());

        let claim = encode_claim(B256::from([1u8; 32]), B256::from([2u8; 32]));
        assert_eq!(claim.len(), 4 + 2 * 32);

        let refund = encode_refund(B256::from([1u8; 32]));
        assert_eq!(refund.len(), 4 + 32);
    }

    #[test]
    fn test_claimed_log_decoding() {
        let secret = [9u8; 32];
        let secret_hash = B256::from([3u8; 32]);
        let topics = vec![claimed_event_topic(), secret_hash];
        let decoded = decode_claimed_log(&topics, &secret).unwrap();
        assert_eq!(decoded, (secret_hash, secret));

        // Wrong topic0 or malformed data are both ignored.
        assert!(decode_claimed_log(&[B256::ZERO, secret_hash], &secret).is_none());
        assert!(decode_claimed_log(&topics, &[0u8; 31]).is_none());
    }

    #[test]
    fn test_get_swap_return_decoding() {
        let mut data = vec![0u8; 7 * 32];
        data[12..32].copy_from_slice(&[7u8; 20]);
        data[7 * 32 - 1] = 2;
        let (initiator, status) = decode_get_swap_return(&data).unwrap();
        assert_eq!(initiator, Address::from_slice(&[7u8; 20]));
        assert_eq!(status, EvmHtlcStatus::Claimed);
        assert!(decode_get_swap_return(&data[..64]).is_err());
    }

    #[test]
    fn test_evm_address_derivation() {
        // Well-known test vector: privkey 0x01.
        let seckey = SecretKey::from_slice(&from_hex_array::<32>(
            "0000000000000000000000000000000000000000000000000000000000000001",
        )
        .unwrap())
        .unwrap();
        let secp = Secp256k1::new();
        let pubkey = bitcoin::PublicKey {
            compressed: true,
            inner: bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &seckey),
        };
        assert_eq!(
            evm_address_from_pubkey(&pubkey),
            parse_address("0x7e5f4552091a69125d5dfcb7b8c2659029395bdf").unwrap()
        );
    }

    #[test]
    fn test_legacy_tx_signing_is_recoverable() {
        let (pubkey, seckey) = generate_keypair();
        let request = EvmTxRequest {
            nonce: 3,
            gas_price: U256::from(20_000_000_000u64),
            gas_limit: CLAIM_GAS_LIMIT,
            to: parse_address("0x2222222222222222222222222222222222222222").unwrap(),
            value: U256::ZERO,
            data: encode_claim(B256::from([1u8; 32]), B256::from([2u8; 32])),
        };
        let chain_id = 1337u64;
        let raw = sign_legacy_tx(&request, chain_id, &seckey).unwrap();

        // The signed payload must be an RLP list wrapping the unsigned one.
        assert!(raw[0] >= 0xc0);

        // Re-derive the sighash and recover the signer.
        let unsigned_fields = vec![
            rlp_uint(request.nonce as u128),
            rlp_uint_256(request.gas_price),
            rlp_uint(request.gas_limit as u128),
            rlp_bytes(request.to.as_slice()),
            rlp_uint_256(request.value),
            rlp_bytes(&request.data),
            rlp_uint(chain_id as u128),
            rlp_uint(0),
            rlp_uint(0),
        ];
        let sighash = keccak256(rlp_list(&unsigned_fields));
        let secp = Secp256k1::new();
        let message = Message::from_digest_slice(sighash.as_slice()).unwrap();
        let signature = secp.sign_ecdsa_recoverable(&message, &seckey);
        let recovered = secp.recover_ecdsa(&message, &signature).unwrap();
        assert_eq!(recovered, pubkey.inner);
    }

    #[test]
    fn test_rlp_primitives() {
        assert_eq!(rlp_uint(0), vec![0x80]);
        assert_eq!(rlp_uint(0x7f), vec![0x7f]);
        assert_eq!(rlp_uint(0x80), vec![0x81, 0x80]);
        assert_eq!(rlp_bytes(b""), vec![0x80]);
        assert_eq!(rlp_bytes(b"a"), vec![b'a']);
        let long = vec![1u8; 60];
        let encoded = rlp_bytes(&long);
        assert_eq!(encoded[0], 0xb8);
        assert_eq!(encoded[1], 60);
        assert_eq!(rlp_list(&[]), vec![0xc0]);
    }
}
