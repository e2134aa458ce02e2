//! The JSON-RPC server.
//!
//! Serves JSON-RPC 2.0 over HTTP POST on a plain TcpListener, and streams
//! asynchronous swap events as newline-delimited JSON on `GET /events`
//! (the WebSocket upgrade proper belongs to the enclosing edge).

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{atomic::Ordering::Relaxed, Arc},
    thread,
    time::Duration,
};

use serde_json::{json, Value};

use super::messages::*;
use crate::{
    coordinator::SwapCoordinator,
    protocol::{
        evm,
        messages::{MessageEnvelope, OrderInfo, SwapMessage, TradeId},
    },
    store::records::OrderRecord,
    utill::{from_hex_array, now_ts, to_hex},
};

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Bind the RPC listener and serve requests until shutdown. Returns the
/// serving thread.
pub fn start_rpc_server_thread(
    coordinator: Arc<SwapCoordinator>,
) -> std::io::Result<thread::JoinHandle<()>> {
    let listener = TcpListener::bind(("127.0.0.1", coordinator.config.rpc_port))?;
    listener.set_nonblocking(true)?;
    log::info!("[{}] RPC socket binding successful", coordinator.config.rpc_port);

    thread::Builder::new().name("rpc".to_string()).spawn(move || {
        while !coordinator.shutdown.load(Relaxed) {
            match listener.accept() {
                Ok((socket, address)) => {
                    log::debug!("RPC request from: {}", address);
                    let coordinator = coordinator.clone();
                    let _ = thread::Builder::new()
                        .name(format!("rpc-{}", address))
                        .spawn(move || {
                            if let Err(e) = handle_http(&coordinator, socket) {
                                log::debug!("RPC connection error: {:?}", e);
                            }
                        });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(200));
                }
                Err(e) => {
                    log::error!("RPC accept failed: {}", e);
                    thread::sleep(Duration::from_millis(200));
                }
            }
        }
    })
}

fn handle_http(
    coordinator: &Arc<SwapCoordinator>,
    mut socket: TcpStream,
) -> std::io::Result<()> {
    socket.set_read_timeout(Some(Duration::from_secs(30)))?;
    let (method, path, body) = match read_http_request(&mut socket) {
        Ok(request) => request,
        Err(_) => {
            return write_http_response(
                &mut socket,
                400,
                &serde_json::to_vec(&RpcResponse::error(
                    Value::Null,
                    INVALID_REQUEST,
                    "malformed http request",
                ))
                .unwrap_or_default(),
            );
        }
    };

    if method == "GET" && path.starts_with("/events") {
        return stream_events(coordinator, socket);
    }
    if method != "POST" {
        return write_http_response(
            &mut socket,
            405,
            &serde_json::to_vec(&RpcResponse::error(
                Value::Null,
                INVALID_REQUEST,
                "only POST and GET /events are served",
            ))
            .unwrap_or_default(),
        );
    }

    let response = match serde_json::from_slice::<RpcRequest>(&body) {
        Err(_) => RpcResponse::error(Value::Null, PARSE_ERROR, "parse error"),
        Ok(request) if request.jsonrpc != JSONRPC_VERSION => {
            RpcResponse::error(request.id, INVALID_REQUEST, "jsonrpc must be \"2.0\"")
        }
        Ok(request) => {
            let id = request.id.clone();
            match dispatch(coordinator, &request.method, request.params) {
                Ok(result) => RpcResponse::result(id, result),
                Err((code, message)) => RpcResponse::error(id, code, &message),
            }
        }
    };
    write_http_response(&mut socket, 200, &serde_json::to_vec(&response)?)
}

/// Forward every published event to this subscriber as one JSON line.
fn stream_events(coordinator: &Arc<SwapCoordinator>, mut socket: TcpStream) -> std::io::Result<()> {
    socket.set_read_timeout(None)?;
    socket.write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nTransfer-Encoding: identity\r\n\r\n",
    )?;
    let receiver = coordinator.events.subscribe();
    loop {
        match receiver.recv_timeout(Duration::from_secs(1)) {
            Ok(event) => {
                let mut line = serde_json::to_vec(&event)?;
                line.push(b'\n');
                socket.write_all(&line)?;
                socket.flush()?;
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                if coordinator.shutdown.load(Relaxed) {
                    return Ok(());
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

fn read_http_request(socket: &mut TcpStream) -> Result<(String, String, Vec<u8>), crate::error::NetError> {
    let mut buffer = Vec::new();
    let mut byte = [0u8; 1];
    // Read the head byte-wise up to the blank line; bodies are small.
    while !buffer.ends_with(b"\r\n\r\n") {
        let n = socket.read(&mut byte)?;
        if n == 0 {
            return Err(crate::error::NetError::ReachedEOF);
        }
        buffer.push(byte[0]);
        if buffer.len() > MAX_BODY_BYTES {
            return Err(crate::error::NetError::FrameTooLarge(buffer.len() as u32));
        }
    }
    let head = String::from_utf8_lossy(&buffer).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let content_length = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .next()
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(crate::error::NetError::FrameTooLarge(content_length as u32));
    }
    let mut body = vec![0u8; content_length];
    socket.read_exact(&mut body)?;
    Ok((method, path, body))
}

fn write_http_response(socket: &mut TcpStream, status: u16, body: &[u8]) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        405 => "Method Not Allowed",
        _ => "Error",
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        status,
        reason,
        body.len()
    );
    socket.write_all(head.as_bytes())?;
    socket.write_all(body)?;
    socket.flush()
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, (i64, String)> {
    serde_json::from_value(params).map_err(|e| (INVALID_PARAMS, format!("invalid params: {}", e)))
}

fn internal<E: std::fmt::Debug>(error: E) -> (i64, String) {
    (INTERNAL_ERROR, format!("{:?}", error))
}

fn coordinator_error(error: crate::coordinator::CoordinatorError) -> (i64, String) {
    (error.rpc_error_code(), format!("{:?}", error))
}

fn dispatch(
    coordinator: &Arc<SwapCoordinator>,
    method: &str,
    params: Value,
) -> Result<Value, (i64, String)> {
    match method {
        "swap_init" | "swap_initCrossChain" => {
            let params: SwapInitParams = parse_params(params)?;
            let order = coordinator
                .store
                .order(&params.order_id)
                .map_err(internal)?
                .ok_or((INVALID_PARAMS, "unknown order".to_string()))?;
            if order.ours {
                let trade_id = params
                    .trade_id
                    .ok_or((INVALID_PARAMS, "trade_id required for own order".to_string()))?;
                let taker = params
                    .taker_peer_id
                    .ok_or((INVALID_PARAMS, "taker_peer_id required for own order".to_string()))?;
                let pubkey = coordinator
                    .initiate_swap(trade_id, &params.order_id, &taker, params.method)
                    .map_err(coordinator_error)?;
                if method == "swap_initCrossChain" {
                    coordinator.events.publish(
                        crate::events::SwapEvent::CrossChainSwapInitialized { trade_id },
                    );
                }
                Ok(json!({ "trade_id": trade_id, "pubkey": to_hex(&pubkey.to_bytes()) }))
            } else {
                let trade_id = coordinator
                    .take_order(&params.order_id, params.method)
                    .map_err(coordinator_error)?;
                if method == "swap_initCrossChain" {
                    coordinator.events.publish(
                        crate::events::SwapEvent::CrossChainSwapInitialized { trade_id },
                    );
                }
                Ok(json!({ "trade_id": trade_id }))
            }
        }
        "swap_exchangeNonce" => {
            let params: TradeIdParams = parse_params(params)?;
            let (offer, request) = coordinator
                .generate_nonces(params.trade_id)
                .map_err(coordinator_error)?;
            Ok(json!({
                "offer_nonce_hex": to_hex(&offer),
                "request_nonce_hex": to_hex(&request),
            }))
        }
        "swap_getAddress" => {
            let params: TradeIdParams = parse_params(params)?;
            let legs = coordinator
                .store
                .legs(params.trade_id)
                .map_err(internal)?;
            let address_of = |leg_type| {
                legs.iter()
                    .find(|l| l.leg_type == leg_type)
                    .and_then(|l| l.funding_address.clone())
            };
            Ok(json!({
                "offer_address": address_of(crate::store::records::LegType::Offer),
                "request_address": address_of(crate::store::records::LegType::Request),
            }))
        }
        "swap_setFunding" => {
            let params: SetFundingParams = parse_params(params)?;
            coordinator
                .set_funding_tx(params.trade_id, &params.txid, params.vout, params.is_local)
                .map_err(coordinator_error)?;
            Ok(json!(true))
        }
        "swap_checkFunding" => {
            let params: TradeIdParams = parse_params(params)?;
            let (local, remote) = coordinator
                .update_confirmations(params.trade_id)
                .map_err(coordinator_error)?;
            Ok(json!({ "local_confirms": local, "remote_confirms": remote }))
        }
        "swap_fund" => {
            let params: TradeIdParams = parse_params(params)?;
            let result = coordinator
                .fund_swap(params.trade_id)
                .map_err(coordinator_error)?;
            Ok(serde_json::to_value(result).map_err(internal)?)
        }
        "swap_sign" => {
            let params: SignParams = parse_params(params)?;
            let (offer_sighash, request_sighash) =
                match (&params.offer_sighash, &params.request_sighash) {
                    (Some(offer), Some(request)) => (
                        from_hex_array::<32>(offer)
                            .map_err(|e| (INVALID_PARAMS, e.to_string()))?,
                        from_hex_array::<32>(request)
                            .map_err(|e| (INVALID_PARAMS, e.to_string()))?,
                    ),
                    _ => coordinator
                        .spend_sighashes(params.trade_id)
                        .map_err(coordinator_error)?,
                };
            let (offer_sig, request_sig) = coordinator
                .create_partial_signatures(params.trade_id, offer_sighash, request_sighash)
                .map_err(coordinator_error)?;
            Ok(json!({
                "offer_partial_sig_hex": to_hex(&offer_sig),
                "request_partial_sig_hex": to_hex(&request_sig),
            }))
        }
        "swap_redeem" => {
            let params: TradeIdParams = parse_params(params)?;
            let txid = coordinator
                .redeem_swap(params.trade_id)
                .map_err(coordinator_error)?;
            Ok(json!({ "redeem_txid": txid }))
        }
        "swap_status" => {
            let params: TradeIdParams = parse_params(params)?;
            let status = coordinator
                .swap_status(params.trade_id)
                .map_err(coordinator_error)?;
            Ok(serde_json::to_value(status).map_err(internal)?)
        }
        "swap_list" => {
            let trades = coordinator.list_swaps().map_err(coordinator_error)?;
            Ok(serde_json::to_value(trades).map_err(internal)?)
        }
        "swap_recover" => {
            let params: TradeIdParams = parse_params(params)?;
            coordinator
                .recover_swap(params.trade_id)
                .map_err(coordinator_error)?;
            Ok(json!(true))
        }
        "swap_timeout" | "swap_checkTimeouts" => {
            let actions = coordinator.check_timeouts().map_err(coordinator_error)?;
            Ok(serde_json::to_value(actions).map_err(internal)?)
        }
        "swap_refund" => {
            let params: RefundParams = parse_params(params)?;
            let txid = coordinator
                .refund_swap(params.trade_id, params.chain.as_deref())
                .map_err(coordinator_error)?;
            Ok(json!({ "refund_txid": txid }))
        }
        "swap_htlcRevealSecret" => {
            let params: TradeIdParams = parse_params(params)?;
            let preimage = coordinator
                .reveal_secret(params.trade_id)
                .map_err(coordinator_error)?;
            Ok(json!({ "secret_hex": to_hex(&preimage) }))
        }
        "swap_htlcGetSecret" => {
            let params: TradeIdParams = parse_params(params)?;
            let secret = coordinator
                .store
                .secret(params.trade_id)
                .map_err(internal)?;
            Ok(serde_json::to_value(secret).map_err(internal)?)
        }
        "swap_htlcClaim" => {
            let params: ChainActionParams = parse_params(params)?;
            let txid = coordinator
                .claim_htlc(params.trade_id, &params.chain)
                .map_err(coordinator_error)?;
            Ok(json!({ "claim_txid": txid }))
        }
        "swap_htlcRefund" => {
            let params: ChainActionParams = parse_params(params)?;
            let txid = coordinator
                .refund_htlc(params.trade_id, &params.chain)
                .map_err(coordinator_error)?;
            Ok(json!({ "refund_txid": txid }))
        }
        "swap_htlcExtractSecret" => {
            let params: ExtractSecretParams = parse_params(params)?;
            let preimage = coordinator
                .extract_secret_from_tx(params.trade_id, &params.txid, &params.chain)
                .map_err(coordinator_error)?;
            Ok(json!({ "secret_hex": to_hex(&preimage) }))
        }
        "swap_evmCreate" => {
            let params: ChainActionParams = parse_params(params)?;
            let tx_hash = coordinator
                .create_evm_htlc(params.trade_id, &params.chain)
                .map_err(coordinator_error)?;
            Ok(json!({ "tx_hash": tx_hash }))
        }
        "swap_evmClaim" => {
            let params: ChainActionParams = parse_params(params)?;
            let tx_hash = coordinator
                .claim_evm_htlc(params.trade_id, &params.chain)
                .map_err(coordinator_error)?;
            Ok(json!({ "tx_hash": tx_hash }))
        }
        "swap_evmRefund" => {
            let params: ChainActionParams = parse_params(params)?;
            let tx_hash = coordinator
                .refund_evm_htlc(params.trade_id, &params.chain)
                .map_err(coordinator_error)?;
            Ok(json!({ "tx_hash": tx_hash }))
        }
        "swap_evmStatus" => {
            let params: ChainActionParams = parse_params(params)?;
            let status = coordinator
                .get_evm_htlc_status(params.trade_id, &params.chain)
                .map_err(coordinator_error)?;
            Ok(serde_json::to_value(status).map_err(internal)?)
        }
        "swap_evmWaitSecret" => {
            let params: WaitSecretParams = parse_params(params)?;
            let secret = coordinator
                .wait_for_evm_secret(params.trade_id, &params.chain, params.deadline_secs)
                .map_err(coordinator_error)?;
            Ok(json!({ "secret_hex": secret.map(|s| to_hex(&s)) }))
        }
        "swap_evmSetSecret" => {
            let params: SetSecretParams = parse_params(params)?;
            let preimage = from_hex_array::<32>(&params.secret_hex)
                .map_err(|e| (INVALID_PARAMS, e.to_string()))?;
            coordinator
                .set_revealed_secret(params.trade_id, &preimage)
                .map_err(coordinator_error)?;
            Ok(json!(true))
        }
        "swap_evmGetContracts" => {
            let contracts: serde_json::Map<String, Value> = coordinator
                .chain_params
                .values()
                .filter_map(|p| {
                    p.htlc_contract
                        .as_ref()
                        .map(|c| (p.symbol.clone(), json!(c)))
                })
                .collect();
            Ok(Value::Object(contracts))
        }
        "swap_evmGetContract" => {
            let params: ChainOnlyParams = parse_params(params)?;
            let contract = coordinator
                .chain_params
                .get(&params.chain)
                .and_then(|p| p.htlc_contract.clone());
            Ok(json!({ "contract": contract }))
        }
        "swap_evmComputeSwapID" => {
            let params: ComputeSwapIdParams = parse_params(params)?;
            let initiator = evm::parse_address(&params.initiator)
                .map_err(|_| (INVALID_PARAMS, "malformed initiator".to_string()))?;
            let receiver = evm::parse_address(&params.receiver)
                .map_err(|_| (INVALID_PARAMS, "malformed receiver".to_string()))?;
            let token = match &params.token {
                Some(token) => evm::parse_address(token)
                    .map_err(|_| (INVALID_PARAMS, "malformed token".to_string()))?,
                None => alloy_primitives::Address::ZERO,
            };
            let amount = params
                .amount
                .parse::<u128>()
                .map_err(|_| (INVALID_PARAMS, "malformed amount".to_string()))?;
            let secret_hash = from_hex_array::<32>(&params.secret_hash)
                .map_err(|e| (INVALID_PARAMS, e.to_string()))?;
            let swap_id = evm::compute_swap_id(
                initiator,
                receiver,
                token,
                alloy_primitives::U256::from(amount),
                alloy_primitives::B256::from(secret_hash),
                alloy_primitives::U256::from(params.timelock),
            );
            Ok(json!({ "swap_id": format!("{:#x}", swap_id) }))
        }
        "swap_getSwapType" => {
            let params: TradeIdParams = parse_params(params)?;
            let swap_type = coordinator
                .get_swap_type(params.trade_id)
                .map_err(coordinator_error)?;
            Ok(serde_json::to_value(swap_type).map_err(internal)?)
        }
        "orders_create" => {
            let params: OrderCreateParams = parse_params(params)?;
            let order = OrderInfo {
                order_id: params.order_id.clone(),
                maker_peer_id: coordinator.config.peer_id.clone(),
                offer_chain: params.offer_chain,
                offer_amount: params
                    .offer_amount
                    .parse::<u128>()
                    .map_err(|_| (INVALID_PARAMS, "malformed offer amount".to_string()))?,
                request_chain: params.request_chain,
                request_amount: params
                    .request_amount
                    .parse::<u128>()
                    .map_err(|_| (INVALID_PARAMS, "malformed request amount".to_string()))?,
                method: params.method,
                created_at: now_ts(),
            };
            coordinator
                .store
                .put_order(OrderRecord {
                    order: order.clone(),
                    ours: true,
                    cancelled: false,
                    updated_at: now_ts(),
                })
                .map_err(internal)?;
            let envelope = MessageEnvelope::new(
                TradeId::new_random(),
                &coordinator.config.peer_id,
                SwapMessage::OrderAnnounce(order),
            )
            .with_order_id(&params.order_id);
            coordinator.messenger.broadcast(envelope).map_err(internal)?;
            Ok(json!(true))
        }
        "orders_cancel" => {
            let params: OrderIdParams = parse_params(params)?;
            coordinator
                .store
                .cancel_order(&params.order_id)
                .map_err(internal)?;
            let envelope = MessageEnvelope::new(
                TradeId::new_random(),
                &coordinator.config.peer_id,
                SwapMessage::OrderCancel(crate::protocol::messages::OrderCancel {
                    order_id: params.order_id.clone(),
                }),
            )
            .with_order_id(&params.order_id);
            coordinator.messenger.broadcast(envelope).map_err(internal)?;
            Ok(json!(true))
        }
        "orders_list" => {
            let orders = coordinator.store.live_orders().map_err(internal)?;
            Ok(serde_json::to_value(orders).map_err(internal)?)
        }
        "orders_take" => {
            let params: TakeOrderParams = parse_params(params)?;
            let trade_id = coordinator
                .take_order(&params.order_id, params.method)
                .map_err(coordinator_error)?;
            Ok(json!({ "trade_id": trade_id }))
        }
        _ => Err((METHOD_NOT_FOUND, format!("method not found: {}", method))),
    }
}
