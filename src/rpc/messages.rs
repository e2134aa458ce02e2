//! JSON-RPC 2.0 request and response shapes, with the parameter structs of
//! every swap method.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::messages::{SwapMethod, TradeId};

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
    pub id: Value,
}

impl RpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i64, message: &str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.to_string(),
            }),
            id,
        }
    }
}

// ------- per-method parameter shapes -------

#[derive(Debug, Deserialize)]
pub struct TradeIdParams {
    pub trade_id: TradeId,
}

#[derive(Debug, Deserialize)]
pub struct SwapInitParams {
    #[serde(default)]
    pub trade_id: Option<TradeId>,
    pub order_id: String,
    #[serde(default)]
    pub taker_peer_id: Option<String>,
    pub method: SwapMethod,
}

#[derive(Debug, Deserialize)]
pub struct SetFundingParams {
    pub trade_id: TradeId,
    pub txid: String,
    pub vout: u32,
    #[serde(default = "default_true")]
    pub is_local: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SignParams {
    pub trade_id: TradeId,
    #[serde(default)]
    pub offer_sighash: Option<String>,
    #[serde(default)]
    pub request_sighash: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChainActionParams {
    pub trade_id: TradeId,
    pub chain: String,
}

#[derive(Debug, Deserialize)]
pub struct RefundParams {
    pub trade_id: TradeId,
    #[serde(default)]
    pub chain: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExtractSecretParams {
    pub trade_id: TradeId,
    pub chain: String,
    pub txid: String,
}

#[derive(Debug, Deserialize)]
pub struct WaitSecretParams {
    pub trade_id: TradeId,
    pub chain: String,
    #[serde(default = "default_wait_secs")]
    pub deadline_secs: u64,
}

fn default_wait_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize)]
pub struct SetSecretParams {
    pub trade_id: TradeId,
    pub secret_hex: String,
}

#[derive(Debug, Deserialize)]
pub struct ChainOnlyParams {
    pub chain: String,
}

#[derive(Debug, Deserialize)]
pub struct ComputeSwapIdParams {
    pub initiator: String,
    pub receiver: String,
    #[serde(default)]
    pub token: Option<String>,
    pub amount: String,
    pub secret_hash: String,
    pub timelock: u64,
}

#[derive(Debug, Deserialize)]
pub struct OrderCreateParams {
    pub order_id: String,
    pub offer_chain: String,
    pub offer_amount: String,
    pub request_chain: String,
    pub request_amount: String,
    pub method: SwapMethod,
}

#[derive(Debug, Deserialize)]
pub struct OrderIdParams {
    pub order_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TakeOrderParams {
    pub order_id: String,
    pub method: SwapMethod,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_request_parsing() {
        let raw = r#"{"jsonrpc":"2.0","method":"swap_status","params":{"trade_id":"000102030405060708090a0b0c0d0e0f"},"id":7}"#;
        let request: RpcRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.method, "swap_status");
        let params: TradeIdParams = serde_json::from_value(request.params).unwrap();
        assert_eq!(
            params.trade_id.to_hex(),
            "000102030405060708090a0b0c0d0e0f"
        );
    }

    #[test]
    fn test_response_shapes() {
        let ok = RpcResponse::result(serde_json::json!(1), serde_json::json!({"x": 2}));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert!(json.get("error").is_none());

        let err = RpcResponse::error(serde_json::json!(1), METHOD_NOT_FOUND, "no such method");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error"]["code"], -32601);
        assert!(json.get("result").is_none());
    }
}
