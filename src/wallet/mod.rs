//! The thin HD wallet accessor the coordinator consumes.
//!
//! The full wallet service lives outside the core; this module covers the
//! narrow surface a swap needs: a BIP-39 seed, BIP-84 receive addresses on
//! Bitcoin-family chains, the BIP-44 account key for EVM chains, and funding
//! transaction construction from backend-reported coins.
//!
//! The wallet is injected into the coordinator through
//! `set_wallet(Option<Wallet>)`; a `None` there is the locked state.

pub mod error;

use bip39::Mnemonic;
use bitcoin::{
    absolute::LockTime,
    bip32::{DerivationPath, Xpriv},
    hashes::Hash,
    key::Secp256k1,
    secp256k1::{Message, SecretKey},
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    Address, Amount, CompressedPublicKey, Network, OutPoint, PublicKey, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Witness,
};

use self::error::WalletError;
use crate::{
    chains::bitcoin::{BitcoinBackend, UtxoEntry},
    protocol::evm::evm_address_from_pubkey,
    store::{records::WalletAddressRecord, SwapStore},
    utill::DEFAULT_TX_FEE_RATE,
};

/// How many unused external addresses are scanned past the last allocated
/// index when gathering coins.
const ADDRESS_GAP_LIMIT: u32 = 20;

/// Virtual size estimate per p2wpkh input / output, for funding fee math.
const P2WPKH_INPUT_VBYTES: u64 = 68;
const TX_OVERHEAD_VBYTES: u64 = 11;
const OUTPUT_VBYTES: u64 = 31;

/// One spendable coin selected for a funding transaction.
#[derive(Debug, Clone)]
pub struct SpendableCoin {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub address_index: u32,
}

/// The in-memory wallet. Holds only key material; coins are read from the
/// chain backend on demand.
pub struct Wallet {
    master_key: Xpriv,
}

impl Wallet {
    /// Restore from a BIP-39 phrase.
    pub fn from_mnemonic(phrase: &str, passphrase: &str) -> Result<Self, WalletError> {
        let mnemonic: Mnemonic = phrase.parse()?;
        let seed = mnemonic.to_seed(passphrase);
        // The xpriv network byte only affects base58 display, never derivation.
        let master_key = Xpriv::new_master(Network::Bitcoin, &seed)?;
        Ok(Self { master_key })
    }

    /// Generate a fresh wallet, returning the backup phrase.
    pub fn generate() -> Result<(Mnemonic, Self), WalletError> {
        let mnemonic = Mnemonic::generate(12)?;
        let phrase = mnemonic.to_string();
        let wallet = Self::from_mnemonic(&phrase, "")?;
        Ok((mnemonic, wallet))
    }

    fn derive(&self, path: &str) -> Result<SecretKey, WalletError> {
        let secp = Secp256k1::new();
        let path: DerivationPath = path
            .parse()
            .map_err(|_| WalletError::General("malformed derivation path"))?;
        Ok(self.master_key.derive_priv(&secp, &path)?.private_key)
    }

    /// External BIP-84 keypair at the given index.
    pub fn keypair_at(&self, index: u32) -> Result<(PublicKey, SecretKey), WalletError> {
        let seckey = self.derive(&format!("m/84'/0'/0'/0/{}", index))?;
        let secp = Secp256k1::new();
        let pubkey = PublicKey {
            compressed: true,
            inner: bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &seckey),
        };
        Ok((pubkey, seckey))
    }

    /// P2WPKH receive address at an external index.
    pub fn address_at(&self, index: u32, network: Network) -> Result<Address, WalletError> {
        let (pubkey, _) = self.keypair_at(index)?;
        let compressed = CompressedPublicKey(pubkey.inner);
        Ok(Address::p2wpkh(&compressed, network))
    }

    /// Allocate a fresh receive address for a swap and record it.
    pub fn new_swap_address(
        &self,
        store: &SwapStore,
        chain: &str,
        network: Network,
        trade_id: Option<crate::protocol::messages::TradeId>,
    ) -> Result<Address, WalletError> {
        let index = store.next_address_index(chain)?;
        let address = self.address_at(index, network)?;
        store.record_wallet_address(WalletAddressRecord {
            chain: chain.to_string(),
            address: address.to_string(),
            index,
            trade_id,
        })?;
        Ok(address)
    }

    /// The BIP-44 EVM account key (one account, every EVM chain).
    pub fn evm_keypair(&self) -> Result<(PublicKey, SecretKey), WalletError> {
        let seckey = self.derive("m/44'/60'/0'/0/0")?;
        let secp = Secp256k1::new();
        let pubkey = PublicKey {
            compressed: true,
            inner: bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &seckey),
        };
        Ok((pubkey, seckey))
    }

    pub fn evm_address(&self) -> Result<alloy_primitives::Address, WalletError> {
        let (pubkey, _) = self.evm_keypair()?;
        Ok(evm_address_from_pubkey(&pubkey))
    }

    /// Gather confirmed coins across the allocated address range plus the
    /// gap limit.
    pub fn list_spendable_coins(
        &self,
        backend: &BitcoinBackend,
        scan_until_index: u32,
    ) -> Result<Vec<SpendableCoin>, WalletError> {
        let mut coins = Vec::new();
        for index in 0..scan_until_index + ADDRESS_GAP_LIMIT {
            let address = self.address_at(index, backend.network())?;
            for utxo in backend.list_utxos(&address)? {
                if !utxo.status.confirmed {
                    continue;
                }
                coins.push(spendable_from_entry(&utxo, index)?);
            }
        }
        Ok(coins)
    }

    /// Build and sign a funding transaction paying `amount` to the escrow
    /// scriptpubkey, with change back to a fresh address.
    pub fn build_funding_tx(
        &self,
        backend: &BitcoinBackend,
        store: &SwapStore,
        chain: &str,
        escrow_spk: ScriptBuf,
        amount: Amount,
    ) -> Result<(Transaction, u32), WalletError> {
        let fee_rate = backend
            .estimate_fee_rate()
            .unwrap_or(DEFAULT_TX_FEE_RATE);
        let scan_until = store.next_address_index(chain)?;
        let coins = self.list_spendable_coins(backend, scan_until)?;
        let (selected, fee) = select_coins(&coins, amount, fee_rate)?;

        let total_in: Amount = selected
            .iter()
            .map(|c| c.value)
            .fold(Amount::ZERO, |acc, v| acc + v);
        let change = total_in - amount - fee;

        let mut output = vec![TxOut {
            value: amount,
            script_pubkey: escrow_spk.clone(),
        }];
        if change.to_sat() >= crate::protocol::contract::DUST_LIMIT {
            let change_address = self.new_swap_address(store, chain, backend.network(), None)?;
            output.push(TxOut {
                value: change,
                script_pubkey: change_address.script_pubkey(),
            });
        }

        let mut transaction = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: selected
                .iter()
                .map(|c| TxIn {
                    previous_output: c.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output,
        };

        self.sign_p2wpkh_inputs(&mut transaction, &selected)?;

        let escrow_vout = transaction
            .output
            .iter()
            .position(|o| o.script_pubkey == escrow_spk)
            .expect("escrow output inserted above") as u32;
        Ok((transaction, escrow_vout))
    }

    fn sign_p2wpkh_inputs(
        &self,
        transaction: &mut Transaction,
        coins: &[SpendableCoin],
    ) -> Result<(), WalletError> {
        let secp = Secp256k1::new();
        for (index, coin) in coins.iter().enumerate() {
            let (pubkey, seckey) = self.keypair_at(coin.address_index)?;
            let compressed = CompressedPublicKey(pubkey.inner);
            let spk = ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash());
            let sighash = SighashCache::new(&*transaction)
                .p2wpkh_signature_hash(index, &spk, coin.value, EcdsaSighashType::All)
                .map_err(|_| WalletError::General("funding sighash failed"))?;
            let message = Message::from_digest_slice(&sighash.to_byte_array())?;
            let signature = bitcoin::ecdsa::Signature {
                signature: secp.sign_ecdsa(&message, &seckey),
                sighash_type: EcdsaSighashType::All,
            };
            let mut witness = Witness::new();
            witness.push(signature.serialize());
            witness.push(pubkey.to_bytes());
            transaction.input[index].witness = witness;
        }
        Ok(())
    }
}

fn spendable_from_entry(utxo: &UtxoEntry, address_index: u32) -> Result<SpendableCoin, WalletError> {
    Ok(SpendableCoin {
        outpoint: OutPoint {
            txid: BitcoinBackend::parse_txid(&utxo.txid)?,
            vout: utxo.vout,
        },
        value: Amount::from_sat(utxo.value),
        address_index,
    })
}

/// Largest-first coin selection: deterministic and keeps the input count
/// (and so the fee) small.
fn select_coins(
    coins: &[SpendableCoin],
    target: Amount,
    fee_rate: u64,
) -> Result<(Vec<SpendableCoin>, Amount), WalletError> {
    let mut sorted: Vec<SpendableCoin> = coins.to_vec();
    sorted.sort_by(|a, b| b.value.cmp(&a.value));

    let mut selected = Vec::new();
    let mut total = Amount::ZERO;
    for coin in sorted {
        total = total + coin.value;
        selected.push(coin);
        let fee = funding_fee(selected.len() as u64, 2, fee_rate);
        if total >= target + fee {
            return Ok((selected, fee));
        }
    }
    Err(WalletError::InsufficientFunds {
        required: target.to_sat(),
        available: total.to_sat(),
    })
}

fn funding_fee(inputs: u64, outputs: u64, fee_rate: u64) -> Amount {
    Amount::from_sat(
        fee_rate.max(1) * (TX_OVERHEAD_VBYTES + inputs * P2WPKH_INPUT_VBYTES + outputs * OUTPUT_VBYTES),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    const TEST_PHRASE: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_derivation_is_deterministic() {
        let wallet1 = Wallet::from_mnemonic(TEST_PHRASE, "").unwrap();
        let wallet2 = Wallet::from_mnemonic(TEST_PHRASE, "").unwrap();
        assert_eq!(
            wallet1.address_at(0, Network::Regtest).unwrap(),
            wallet2.address_at(0, Network::Regtest).unwrap()
        );
        assert_ne!(
            wallet1.address_at(0, Network::Regtest).unwrap(),
            wallet1.address_at(1, Network::Regtest).unwrap()
        );
        // A passphrase changes the seed.
        let hardened = Wallet::from_mnemonic(TEST_PHRASE, "hunter2").unwrap();
        assert_ne!(
            wallet1.address_at(0, Network::Regtest).unwrap(),
            hardened.address_at(0, Network::Regtest).unwrap()
        );
    }

    #[test]
    fn test_evm_account_is_stable() {
        let wallet = Wallet::from_mnemonic(TEST_PHRASE, "").unwrap();
        assert_eq!(wallet.evm_address().unwrap(), wallet.evm_address().unwrap());
        let (pubkey, seckey) = wallet.evm_keypair().unwrap();
        let secp = Secp256k1::new();
        assert_eq!(
            pubkey.inner,
            bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &seckey)
        );
    }

    #[test]
    fn test_coin_selection() {
        let coin = |sats: u64, index: u32| SpendableCoin {
            outpoint: OutPoint::from_str(
                "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456:0",
            )
            .unwrap(),
            value: Amount::from_sat(sats),
            address_index: index,
        };
        let coins = vec![coin(10_000, 0), coin(50_000, 1), coin(2_000, 2)];

        // One big coin covers target and fee.
        let (selected, fee) = select_coins(&coins, Amount::from_sat(40_000), 2).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].value, Amount::from_sat(50_000));
        assert_eq!(fee, funding_fee(1, 2, 2));

        // Insufficient total is an error carrying the shortfall.
        match select_coins(&coins, Amount::from_sat(100_000), 2) {
            Err(WalletError::InsufficientFunds {
                required,
                available,
            }) => {
                assert_eq!(required, 100_000);
                assert_eq!(available, 62_000);
            }
            other => panic!("unexpected selection result: {:?}", other.map(|_| ())),
        }
    }
}
