use clap::{Parser, Subcommand};
use serde_json::{json, Value};

/// Crosswap Operator CLI
///
/// Thin JSON-RPC client for a running crosswapd instance. Every subcommand
/// maps onto one RPC method; the raw JSON result is printed to stdout.
#[derive(Parser, Debug)]
#[clap(version = option_env ! ("CARGO_PKG_VERSION").unwrap_or("unknown"),
author = option_env ! ("CARGO_PKG_AUTHORS").unwrap_or(""))]
struct Cli {
    /// RPC address of the daemon.
    #[clap(long, short = 'r', default_value = "127.0.0.1:7703")]
    rpc: String,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create and announce an order.
    OrderCreate {
        order_id: String,
        offer_chain: String,
        offer_amount: String,
        request_chain: String,
        request_amount: String,
        #[clap(default_value = "musig2")]
        method: String,
    },
    /// Cancel one of our orders.
    OrderCancel { order_id: String },
    /// List live orders.
    OrderList,
    /// Take a peer's order, opening a trade.
    OrderTake {
        order_id: String,
        #[clap(default_value = "musig2")]
        method: String,
    },
    /// Show a trade's status.
    Status { trade_id: String },
    /// List all trades.
    List,
    /// Escrow addresses of a trade.
    GetAddress { trade_id: String },
    /// Exchange MuSig2 nonces for a trade.
    ExchangeNonce { trade_id: String },
    /// Fund our leg of a trade.
    Fund { trade_id: String },
    /// Poll funding confirmations.
    CheckFunding { trade_id: String },
    /// Create and send our partial signatures.
    Sign { trade_id: String },
    /// Combine signatures and sweep our receiving escrow.
    Redeem { trade_id: String },
    /// Reveal the HTLC secret to the counterparty.
    RevealSecret { trade_id: String },
    /// Claim an HTLC output with the known secret.
    HtlcClaim { trade_id: String, chain: String },
    /// Refund a trade (optionally a specific chain).
    Refund {
        trade_id: String,
        #[clap(long)]
        chain: Option<String>,
    },
    /// Evaluate refund timelocks across all trades.
    CheckTimeouts,
    /// Rehydrate a trade from the store.
    Recover { trade_id: String },
    /// Wait for the EVM Claimed event to reveal the secret.
    EvmWaitSecret {
        trade_id: String,
        chain: String,
        #[clap(default_value = "600")]
        deadline_secs: u64,
    },
    /// Contract-side status of an EVM HTLC entry.
    EvmStatus { trade_id: String, chain: String },
}

fn main() {
    let cli = Cli::parse();
    let (method, params) = match &cli.command {
        Command::OrderCreate {
            order_id,
            offer_chain,
            offer_amount,
            request_chain,
            request_amount,
            method,
        } => (
            "orders_create",
            json!({
                "order_id": order_id,
                "offer_chain": offer_chain,
                "offer_amount": offer_amount,
                "request_chain": request_chain,
                "request_amount": request_amount,
                "method": method,
            }),
        ),
        Command::OrderCancel { order_id } => ("orders_cancel", json!({ "order_id": order_id })),
        Command::OrderList => ("orders_list", json!({})),
        Command::OrderTake { order_id, method } => (
            "orders_take",
            json!({ "order_id": order_id, "method": method }),
        ),
        Command::Status { trade_id } => ("swap_status", json!({ "trade_id": trade_id })),
        Command::List => ("swap_list", json!({})),
        Command::GetAddress { trade_id } => ("swap_getAddress", json!({ "trade_id": trade_id })),
        Command::ExchangeNonce { trade_id } => {
            ("swap_exchangeNonce", json!({ "trade_id": trade_id }))
        }
        Command::Fund { trade_id } => ("swap_fund", json!({ "trade_id": trade_id })),
        Command::CheckFunding { trade_id } => {
            ("swap_checkFunding", json!({ "trade_id": trade_id }))
        }
        Command::Sign { trade_id } => ("swap_sign", json!({ "trade_id": trade_id })),
        Command::Redeem { trade_id } => ("swap_redeem", json!({ "trade_id": trade_id })),
        Command::RevealSecret { trade_id } => {
            ("swap_htlcRevealSecret", json!({ "trade_id": trade_id }))
        }
        Command::HtlcClaim { trade_id, chain } => (
            "swap_htlcClaim",
            json!({ "trade_id": trade_id, "chain": chain }),
        ),
        Command::Refund { trade_id, chain } => (
            "swap_refund",
            json!({ "trade_id": trade_id, "chain": chain }),
        ),
        Command::CheckTimeouts => ("swap_checkTimeouts", json!({})),
        Command::Recover { trade_id } => ("swap_recover", json!({ "trade_id": trade_id })),
        Command::EvmWaitSecret {
            trade_id,
            chain,
            deadline_secs,
        } => (
            "swap_evmWaitSecret",
            json!({ "trade_id": trade_id, "chain": chain, "deadline_secs": deadline_secs }),
        ),
        Command::EvmStatus { trade_id, chain } => (
            "swap_evmStatus",
            json!({ "trade_id": trade_id, "chain": chain }),
        ),
    };

    let request = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1,
    });
    let response = minreq::post(format!("http://{}/", cli.rpc))
        .with_header("Content-Type", "application/json")
        .with_json(&request)
        .expect("request serialization cannot fail")
        .send();

    match response {
        Ok(response) => match response.json::<Value>() {
            Ok(body) => {
                if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
                    eprintln!("RPC error: {}", error);
                    std::process::exit(1);
                }
                println!(
                    "{}",
                    serde_json::to_string_pretty(&body["result"]).unwrap_or_default()
                );
            }
            Err(e) => {
                eprintln!("malformed RPC response: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("cannot reach daemon at {}: {}", cli.rpc, e);
            std::process::exit(1);
        }
    }
}
