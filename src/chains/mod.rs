//! Uniform interface over per-chain backend clients.
//!
//! One [ChainBackend] instance exists per supported chain symbol. The
//! coordinator only speaks the capability set defined here: broadcast,
//! confirmation lookup, fee estimation, tip observation and (EVM) event
//! scans. Dispatch is a closed variant over the chain family; clients are
//! stateless and shared read-only.

pub mod bitcoin;
pub mod error;
pub mod evm;

use std::{collections::HashMap, path::Path, sync::Arc};

use ::bitcoin::Network;

use self::{bitcoin::BitcoinBackend, error::BackendError, evm::EvmBackend};
use crate::utill::{parse_field, parse_toml_sections};

/// The two chain families the daemon can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Bitcoin,
    Evm,
}

impl std::str::FromStr for ChainFamily {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitcoin" => Ok(Self::Bitcoin),
            "evm" => Ok(Self::Evm),
            other => Err(format!("unknown chain family: {}", other)),
        }
    }
}

/// Static description of one configured chain.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub symbol: String,
    pub family: ChainFamily,
    pub backend_url: String,
    /// Bitcoin-family only: address network.
    pub network: Network,
    /// Bitcoin-family only: DAO fee destination for cooperative sweeps.
    pub dao_address: Option<String>,
    /// EVM only: numeric chain id for replay protection.
    pub chain_id: Option<u64>,
    /// EVM only: deployed swap contract address.
    pub htlc_contract: Option<String>,
    pub required_confirms: u32,
}

impl ChainParams {
    /// Load all `[SYMBOL]` sections of a chains.toml file.
    pub fn load_all(path: &Path) -> std::io::Result<Vec<ChainParams>> {
        let sections = parse_toml_sections(path)?;
        let mut params = Vec::with_capacity(sections.len());
        for (symbol, map) in sections {
            let family = map
                .get("family")
                .and_then(|f| f.parse::<ChainFamily>().ok())
                .unwrap_or(ChainFamily::Bitcoin);
            params.push(ChainParams {
                symbol,
                family,
                backend_url: map.get("url").cloned().unwrap_or_default(),
                network: map
                    .get("network")
                    .and_then(|n| n.parse::<Network>().ok())
                    .unwrap_or(Network::Regtest),
                dao_address: map.get("dao_address").cloned(),
                chain_id: map.get("chain_id").and_then(|c| c.parse::<u64>().ok()),
                htlc_contract: map.get("htlc_contract").cloned(),
                required_confirms: parse_field(map.get("required_confirms"), 1),
            });
        }
        Ok(params)
    }
}

/// A family-specific transaction ready for broadcast.
#[derive(Debug, Clone)]
pub enum ChainTx {
    Bitcoin(::bitcoin::Transaction),
    /// Raw signed transaction bytes.
    Evm(Vec<u8>),
}

/// Chain head as seen by the backend.
#[derive(Debug, Clone, Copy)]
pub struct ChainTip {
    pub height: u64,
    pub timestamp: u64,
}

/// Confirmation state of a broadcast transaction.
#[derive(Debug, Clone, Copy)]
pub struct TxConfirmation {
    pub confirmations: u32,
    pub block_height: Option<u64>,
}

/// Uniform backend over the chain families.
#[derive(Debug)]
pub enum ChainBackend {
    Bitcoin(BitcoinBackend),
    Evm(EvmBackend),
}

impl ChainBackend {
    pub fn from_params(params: &ChainParams) -> Result<Self, BackendError> {
        match params.family {
            ChainFamily::Bitcoin => Ok(Self::Bitcoin(BitcoinBackend::new(
                &params.backend_url,
                params.network,
            ))),
            ChainFamily::Evm => EvmBackend::from_params(params).map(Self::Evm),
        }
    }

    pub fn family(&self) -> ChainFamily {
        match self {
            Self::Bitcoin(_) => ChainFamily::Bitcoin,
            Self::Evm(_) => ChainFamily::Evm,
        }
    }

    pub fn bitcoin(&self) -> Result<&BitcoinBackend, BackendError> {
        match self {
            Self::Bitcoin(backend) => Ok(backend),
            Self::Evm(_) => Err(BackendError::InvalidResponse(
                "bitcoin operation on evm chain",
            )),
        }
    }

    pub fn evm(&self) -> Result<&EvmBackend, BackendError> {
        match self {
            Self::Evm(backend) => Ok(backend),
            Self::Bitcoin(_) => Err(BackendError::InvalidResponse(
                "evm operation on bitcoin chain",
            )),
        }
    }

    /// Broadcast a family-specific transaction, returning its txid/hash.
    pub fn broadcast(&self, transaction: &ChainTx) -> Result<String, BackendError> {
        match (self, transaction) {
            (Self::Bitcoin(backend), ChainTx::Bitcoin(tx)) => backend.broadcast(tx),
            (Self::Evm(backend), ChainTx::Evm(raw)) => backend.send_raw_transaction(raw),
            _ => Err(BackendError::InvalidResponse(
                "transaction family does not match backend",
            )),
        }
    }

    pub fn get_confirmations(&self, txid: &str) -> Result<Option<TxConfirmation>, BackendError> {
        match self {
            Self::Bitcoin(backend) => backend.get_confirmations(txid),
            Self::Evm(backend) => backend.get_confirmations(txid),
        }
    }

    pub fn tip(&self) -> Result<ChainTip, BackendError> {
        match self {
            Self::Bitcoin(backend) => backend.tip(),
            Self::Evm(backend) => backend.tip(),
        }
    }

    /// Fee estimate in the chain's native rate unit: sat/vB for
    /// Bitcoin-family, wei gas price for EVM.
    pub fn estimate_fee_rate(&self) -> Result<u64, BackendError> {
        match self {
            Self::Bitcoin(backend) => backend.estimate_fee_rate(),
            Self::Evm(backend) => backend.gas_price_wei(),
        }
    }
}

/// Build one backend per configured chain, keyed by symbol.
pub fn build_backends(
    all_params: &[ChainParams],
) -> Result<HashMap<String, Arc<ChainBackend>>, BackendError> {
    let mut backends = HashMap::new();
    for params in all_params {
        backends.insert(
            params.symbol.clone(),
            Arc::new(ChainBackend::from_params(params)?),
        );
    }
    Ok(backends)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_chain_params_loading() {
        let dir = std::env::temp_dir().join(format!("crosswap-chains-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("chains.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"[BTC]
family = "bitcoin"
url = "http://localhost:3002"
network = "regtest"
dao_address = "bcrt1qdaoaddress"
required_confirms = 2

[ETH]
family = "evm"
url = "http://localhost:8545"
chain_id = 1337
htlc_contract = "0x4242424242424242424242424242424242424242"
"#
        )
        .unwrap();

        let params = ChainParams::load_all(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].symbol, "BTC");
        assert_eq!(params[0].family, ChainFamily::Bitcoin);
        assert_eq!(params[0].required_confirms, 2);
        assert_eq!(params[1].family, ChainFamily::Evm);
        assert_eq!(params[1].chain_id, Some(1337));
        assert_eq!(params[1].required_confirms, 1);
    }
}
