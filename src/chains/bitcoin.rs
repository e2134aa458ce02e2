//! Esplora-style REST client for Bitcoin-family chains.
//!
//! Any explorer implementing the standard endpoint set works (blocks tip,
//! tx status, outspends, address utxos, fee estimates, broadcast). One
//! instance per chain symbol; the client holds no mutable state.

use bitcoin::{consensus::encode, Address, Amount, Network, OutPoint, Script, Transaction, Txid};
use serde::Deserialize;

use super::{error::BackendError, ChainTip, TxConfirmation};
use crate::utill::{from_hex, to_hex};

const HTTP_TIMEOUT_SECS: u64 = 30;

/// A confirmed or pending coin on an address, as the explorer reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct UtxoEntry {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub status: TxStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    #[serde(default)]
    pub block_height: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct OutspendEntry {
    spent: bool,
    #[serde(default)]
    txid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BlockInfo {
    height: u64,
    timestamp: u64,
}

/// REST client over one explorer instance.
#[derive(Debug)]
pub struct BitcoinBackend {
    base_url: String,
    network: Network,
}

impl BitcoinBackend {
    pub fn new(base_url: &str, network: Network) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            network,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    fn get(&self, path: &str) -> Result<minreq::Response, BackendError> {
        let response = minreq::get(format!("{}{}", self.base_url, path))
            .with_timeout(HTTP_TIMEOUT_SECS)
            .send()?;
        if response.status_code == 404 {
            return Err(BackendError::InvalidResponse("not found"));
        }
        if response.status_code < 200 || response.status_code > 299 {
            return Err(BackendError::Rpc {
                code: response.status_code as i64,
                message: response.as_str().unwrap_or("").to_string(),
            });
        }
        Ok(response)
    }

    pub fn tip_height(&self) -> Result<u64, BackendError> {
        self.get("/blocks/tip/height")?
            .as_str()?
            .trim()
            .parse::<u64>()
            .map_err(|_| BackendError::InvalidResponse("non-numeric tip height"))
    }

    pub fn tip(&self) -> Result<ChainTip, BackendError> {
        let hash = self.get("/blocks/tip/hash")?.as_str()?.trim().to_string();
        let block: BlockInfo = self.get(&format!("/block/{}", hash))?.json()?;
        Ok(ChainTip {
            height: block.height,
            timestamp: block.timestamp,
        })
    }

    pub fn get_confirmations(&self, txid: &str) -> Result<Option<TxConfirmation>, BackendError> {
        let status = match self.get(&format!("/tx/{}/status", txid)) {
            Ok(response) => response.json::<TxStatus>()?,
            Err(BackendError::InvalidResponse("not found")) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !status.confirmed {
            return Ok(Some(TxConfirmation {
                confirmations: 0,
                block_height: None,
            }));
        }
        let tip = self.tip_height()?;
        let height = status
            .block_height
            .ok_or(BackendError::InvalidResponse("confirmed tx without height"))?;
        Ok(Some(TxConfirmation {
            confirmations: tip.saturating_sub(height) as u32 + 1,
            block_height: Some(height),
        }))
    }

    pub fn get_transaction(&self, txid: &str) -> Result<Option<Transaction>, BackendError> {
        let hex = match self.get(&format!("/tx/{}/hex", txid)) {
            Ok(response) => response.as_str()?.trim().to_string(),
            Err(BackendError::InvalidResponse("not found")) => return Ok(None),
            Err(e) => return Err(e),
        };
        let bytes =
            from_hex(&hex).map_err(|_| BackendError::InvalidResponse("malformed tx hex"))?;
        Ok(Some(encode::deserialize::<Transaction>(&bytes)?))
    }

    /// The transaction spending `outpoint`, if any. This is how the peer's
    /// sweep (and the preimage inside it) is observed.
    pub fn get_spending_tx(&self, outpoint: &OutPoint) -> Result<Option<Transaction>, BackendError> {
        let outspend: OutspendEntry = self
            .get(&format!("/tx/{}/outspend/{}", outpoint.txid, outpoint.vout))?
            .json()?;
        match (outspend.spent, outspend.txid) {
            (true, Some(txid)) => self.get_transaction(&txid),
            _ => Ok(None),
        }
    }

    pub fn broadcast(&self, transaction: &Transaction) -> Result<String, BackendError> {
        let hex = to_hex(&encode::serialize(transaction));
        let response = minreq::post(format!("{}/tx", self.base_url))
            .with_timeout(HTTP_TIMEOUT_SECS)
            .with_body(hex)
            .send()?;
        if response.status_code < 200 || response.status_code > 299 {
            return Err(BackendError::Rpc {
                code: response.status_code as i64,
                message: response.as_str().unwrap_or("").to_string(),
            });
        }
        Ok(response.as_str()?.trim().to_string())
    }

    /// Fee estimate in sat/vB for a two-block confirmation target.
    pub fn estimate_fee_rate(&self) -> Result<u64, BackendError> {
        let estimates: std::collections::HashMap<String, f64> =
            self.get("/fee-estimates")?.json()?;
        Ok(pick_fee_rate(&estimates))
    }

    pub fn list_utxos(&self, address: &Address) -> Result<Vec<UtxoEntry>, BackendError> {
        Ok(self.get(&format!("/address/{}/utxo", address))?.json()?)
    }

    /// Render a script program as an address on this chain's network.
    pub fn address_of_script(&self, script_pubkey: &Script) -> Result<Address, BackendError> {
        Address::from_script(script_pubkey, self.network)
            .map_err(|_| BackendError::InvalidResponse("unencodable script pubkey"))
    }

    /// Total confirmed balance of an address.
    pub fn address_balance(&self, address: &Address) -> Result<Amount, BackendError> {
        let confirmed: u64 = self
            .list_utxos(address)?
            .iter()
            .filter(|u| u.status.confirmed)
            .map(|u| u.value)
            .sum();
        Ok(Amount::from_sat(confirmed))
    }

    pub fn parse_txid(txid: &str) -> Result<Txid, BackendError> {
        txid.parse::<Txid>()
            .map_err(|_| BackendError::InvalidResponse("malformed txid"))
    }
}

/// Choose the sat/vB rate for a two-block target, rounding up, with a floor
/// of one.
fn pick_fee_rate(estimates: &std::collections::HashMap<String, f64>) -> u64 {
    let rate = estimates
        .get("2")
        .or_else(|| estimates.get("3"))
        .or_else(|| estimates.get("1"))
        .copied()
        .unwrap_or(crate::utill::DEFAULT_TX_FEE_RATE as f64);
    (rate.ceil() as u64).max(1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fee_rate_selection() {
        let mut estimates = std::collections::HashMap::new();
        estimates.insert("2".to_string(), 12.4f64);
        assert_eq!(pick_fee_rate(&estimates), 13);

        estimates.clear();
        estimates.insert("3".to_string(), 0.3f64);
        assert_eq!(pick_fee_rate(&estimates), 1);

        estimates.clear();
        assert_eq!(pick_fee_rate(&estimates), crate::utill::DEFAULT_TX_FEE_RATE);
    }

    #[test]
    fn test_base_url_normalization() {
        let backend = BitcoinBackend::new("http://localhost:3002/", Network::Regtest);
        assert_eq!(backend.base_url, "http://localhost:3002");
    }
}
