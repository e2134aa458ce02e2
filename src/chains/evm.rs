//! JSON-RPC client for EVM chains.
//!
//! Speaks the standard `eth_*` method set over HTTP. Contract interaction is
//! limited to the deployed swap contract: opening, claiming, refunding and
//! inspecting HTLC entries, plus scanning for the `Claimed` event that
//! publishes the preimage.

use std::{thread::sleep, time::Duration, time::Instant};

use alloy_primitives::{Address, B256, U256};
use bitcoin::secp256k1::SecretKey;
use serde_json::{json, Value};

use super::{error::BackendError, ChainParams, ChainTip, TxConfirmation};
use crate::{
    protocol::evm::{
        decode_claimed_log, decode_get_swap_return, encode_get_swap, parse_address, sign_legacy_tx,
        claimed_event_topic, EvmHtlcStatus, EvmTxRequest,
    },
    utill::{from_hex, to_hex},
};

const HTTP_TIMEOUT_SECS: u64 = 30;

/// Poll interval of the `Claimed` event observer.
#[cfg(feature = "integration-test")]
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(200);
#[cfg(not(feature = "integration-test"))]
const EVENT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// JSON-RPC client over one EVM node.
#[derive(Debug)]
pub struct EvmBackend {
    url: String,
    chain_id: u64,
    htlc_contract: Address,
}

impl EvmBackend {
    pub fn new(url: &str, chain_id: u64, htlc_contract: Address) -> Self {
        Self {
            url: url.to_string(),
            chain_id,
            htlc_contract,
        }
    }

    pub fn from_params(params: &ChainParams) -> Result<Self, BackendError> {
        let contract = params
            .htlc_contract
            .as_deref()
            .ok_or(BackendError::InvalidResponse("missing htlc contract"))?;
        let contract = parse_address(contract)
            .map_err(|_| BackendError::InvalidResponse("malformed htlc contract address"))?;
        let chain_id = params
            .chain_id
            .ok_or(BackendError::InvalidResponse("missing evm chain id"))?;
        Ok(Self::new(&params.backend_url, chain_id, contract))
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn htlc_contract(&self) -> Address {
        self.htlc_contract
    }

    fn rpc(&self, method: &str, params: Value) -> Result<Value, BackendError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = minreq::post(&self.url)
            .with_timeout(HTTP_TIMEOUT_SECS)
            .with_header("Content-Type", "application/json")
            .with_json(&request)?
            .send()?;
        let body: Value = response.json()?;
        if let Some(error) = body.get("error") {
            return Err(BackendError::Rpc {
                code: error["code"].as_i64().unwrap_or(0),
                message: error["message"].as_str().unwrap_or("").to_string(),
            });
        }
        Ok(body["result"].clone())
    }

    pub fn block_number(&self) -> Result<u64, BackendError> {
        parse_quantity(&self.rpc("eth_blockNumber", json!([]))?)
    }

    pub fn tip(&self) -> Result<ChainTip, BackendError> {
        let block = self.rpc("eth_getBlockByNumber", json!(["latest", false]))?;
        Ok(ChainTip {
            height: parse_quantity(&block["number"])?,
            timestamp: parse_quantity(&block["timestamp"])?,
        })
    }

    pub fn gas_price_wei(&self) -> Result<u64, BackendError> {
        parse_quantity(&self.rpc("eth_gasPrice", json!([]))?)
    }

    pub fn transaction_count(&self, address: Address) -> Result<u64, BackendError> {
        parse_quantity(&self.rpc(
            "eth_getTransactionCount",
            json!([format!("{:#x}", address), "pending"]),
        )?)
    }

    pub fn get_confirmations(&self, tx_hash: &str) -> Result<Option<TxConfirmation>, BackendError> {
        let receipt = self.rpc("eth_getTransactionReceipt", json!([tx_hash]))?;
        if receipt.is_null() {
            return Ok(None);
        }
        if parse_quantity(&receipt["status"])? != 1 {
            return Err(BackendError::InvalidResponse("transaction reverted"));
        }
        let block = parse_quantity(&receipt["blockNumber"])?;
        let tip = self.block_number()?;
        Ok(Some(TxConfirmation {
            confirmations: tip.saturating_sub(block) as u32 + 1,
            block_height: Some(block),
        }))
    }

    pub fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, BackendError> {
        let result = self.rpc(
            "eth_sendRawTransaction",
            json!([format!("0x{}", to_hex(raw))]),
        )?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or(BackendError::InvalidResponse("non-string tx hash"))
    }

    pub fn call(&self, to: Address, data: &[u8]) -> Result<Vec<u8>, BackendError> {
        let result = self.rpc(
            "eth_call",
            json!([{ "to": format!("{:#x}", to), "data": format!("0x{}", to_hex(data)) }, "latest"]),
        )?;
        let hex = result
            .as_str()
            .ok_or(BackendError::InvalidResponse("non-string call result"))?;
        from_hex(hex.trim_start_matches("0x"))
            .map_err(|_| BackendError::InvalidResponse("malformed call result"))
    }

    /// Sign a contract call with the given account key and broadcast it.
    pub fn send_contract_call(
        &self,
        seckey: &SecretKey,
        from: Address,
        data: Vec<u8>,
        value: U256,
        gas_limit: u64,
    ) -> Result<String, BackendError> {
        let request = EvmTxRequest {
            nonce: self.transaction_count(from)?,
            gas_price: U256::from(self.gas_price_wei()?),
            gas_limit,
            to: self.htlc_contract,
            value,
            data,
        };
        let raw = sign_legacy_tx(&request, self.chain_id, seckey)
            .map_err(|_| BackendError::InvalidResponse("transaction signing failed"))?;
        self.send_raw_transaction(&raw)
    }

    /// Contract-side status of an HTLC entry.
    pub fn htlc_status(&self, swap_id: B256) -> Result<EvmHtlcStatus, BackendError> {
        let data = self.call(self.htlc_contract, &encode_get_swap(swap_id))?;
        let (_, status) = decode_get_swap_return(&data)
            .map_err(|_| BackendError::InvalidResponse("malformed getSwap return"))?;
        Ok(status)
    }

    /// One `eth_getLogs` sweep for a `Claimed` event under the given secret
    /// hash. Returns the revealed secret when found.
    pub fn find_claimed_secret(
        &self,
        secret_hash: B256,
        from_block: u64,
    ) -> Result<Option<[u8; 32]>, BackendError> {
        let logs = self.rpc(
            "eth_getLogs",
            json!([{
                "address": format!("{:#x}", self.htlc_contract),
                "fromBlock": format!("{:#x}", from_block),
                "toBlock": "latest",
                "topics": [
                    format!("{:#x}", claimed_event_topic()),
                    format!("{:#x}", secret_hash),
                ],
            }]),
        )?;
        let logs = logs
            .as_array()
            .ok_or(BackendError::InvalidResponse("non-array logs result"))?;
        for log in logs {
            let topics = log["topics"]
                .as_array()
                .ok_or(BackendError::InvalidResponse("log without topics"))?
                .iter()
                .filter_map(|t| t.as_str())
                .filter_map(parse_b256)
                .collect::<Vec<_>>();
            let data = log["data"].as_str().unwrap_or("0x");
            let data = from_hex(data.trim_start_matches("0x"))
                .map_err(|_| BackendError::InvalidResponse("malformed log data"))?;
            if let Some((_, secret)) = decode_claimed_log(&topics, &data) {
                return Ok(Some(secret));
            }
        }
        Ok(None)
    }

    /// Block until a `Claimed` event reveals the secret or the deadline
    /// passes. This is the long-running observer behind `wait_for_evm_secret`.
    pub fn wait_for_claimed_secret(
        &self,
        secret_hash: B256,
        from_block: u64,
        deadline: Duration,
    ) -> Result<Option<[u8; 32]>, BackendError> {
        let started = Instant::now();
        loop {
            if let Some(secret) = self.find_claimed_secret(secret_hash, from_block)? {
                return Ok(Some(secret));
            }
            if started.elapsed() >= deadline {
                return Ok(None);
            }
            sleep(EVENT_POLL_INTERVAL);
        }
    }

    /// Native-coin balance of an account.
    pub fn balance(&self, address: Address) -> Result<U256, BackendError> {
        let result = self.rpc(
            "eth_getBalance",
            json!([format!("{:#x}", address), "latest"]),
        )?;
        let hex = result
            .as_str()
            .ok_or(BackendError::InvalidResponse("non-string balance"))?;
        U256::from_str_radix(hex.trim_start_matches("0x"), 16)
            .map_err(|_| BackendError::InvalidResponse("malformed balance"))
    }
}

fn parse_b256(raw: &str) -> Option<B256> {
    let bytes = from_hex(raw.trim_start_matches("0x")).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    Some(B256::from_slice(&bytes))
}

/// Parse a JSON-RPC quantity (`0x`-prefixed hex number).
fn parse_quantity(value: &Value) -> Result<u64, BackendError> {
    let raw = value
        .as_str()
        .ok_or(BackendError::InvalidResponse("non-string quantity"))?;
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|_| BackendError::InvalidResponse("malformed quantity"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&json!("0x10")).unwrap(), 16);
        assert_eq!(parse_quantity(&json!("0x0")).unwrap(), 0);
        assert!(parse_quantity(&json!(16)).is_err());
        assert!(parse_quantity(&json!("0xzz")).is_err());
    }

    #[test]
    fn test_parse_b256() {
        let hex = format!("0x{}", "ab".repeat(32));
        assert_eq!(parse_b256(&hex).unwrap(), B256::from([0xabu8; 32]));
        assert!(parse_b256("0x1234").is_none());
    }
}
