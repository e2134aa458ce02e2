use clap::Parser;
use crosswap::{
    chains::{build_backends, ChainParams},
    coordinator::{start_swap_server, CoordinatorConfig, CoordinatorError, SwapCoordinator},
    rpc::start_rpc_server_thread,
    store::SwapStore,
    utill::{get_swapd_dir, setup_logger},
    wallet::Wallet,
};
use std::{path::PathBuf, sync::Arc};

/// Crosswap Swap Daemon
///
/// Drives peer-to-peer atomic swaps between Bitcoin-family and EVM chains.
/// Requires reachable chain backends for every chain configured in
/// chains.toml (an esplora-style REST endpoint for Bitcoin-family chains, a
/// JSON-RPC endpoint plus a deployed swap contract for EVM chains).
///
/// On first start a wallet seed phrase is generated and written into the
/// data directory; back it up before funding anything.
///
/// The daemon is operated with the crosswap-cli app.
///
/// This is early beta, and there are known and unknown bugs.
#[derive(Parser, Debug)]
#[clap(version = option_env ! ("CARGO_PKG_VERSION").unwrap_or("unknown"),
author = option_env ! ("CARGO_PKG_AUTHORS").unwrap_or(""))]
struct Cli {
    /// Optional data directory. Default value : "~/.crosswap/swapd"
    #[clap(long, short = 'd')]
    data_directory: Option<PathBuf>,
    /// Our advertised peer identity. Overrides the config file value.
    #[clap(long, short = 'p')]
    peer_id: Option<String>,
}

fn main() -> Result<(), CoordinatorError> {
    let args = Cli::parse();
    let data_dir = args.data_directory.unwrap_or_else(get_swapd_dir);
    setup_logger(log::LevelFilter::Info, Some(data_dir.clone()));

    let mut config = CoordinatorConfig::new(Some(&data_dir.join("config.toml")))?;
    if let Some(peer_id) = args.peer_id {
        config.peer_id = peer_id;
    }
    if config.peer_id.is_empty() {
        config.peer_id = format!("crosswap-{}", config.network_port);
    }

    let chains_path = data_dir.join("chains.toml");
    if !chains_path.exists() {
        std::fs::create_dir_all(&data_dir)?;
        std::fs::write(
            &chains_path,
            "[BTC]\nfamily = \"bitcoin\"\nurl = \"http://127.0.0.1:3002\"\nnetwork = \"regtest\"\n",
        )?;
        log::warn!(
            "no chains.toml found, wrote a regtest sample at {}",
            chains_path.display()
        );
    }
    let chain_params = ChainParams::load_all(&chains_path)?;
    let backends = build_backends(&chain_params)?;

    let store = Arc::new(SwapStore::open(&data_dir.join("swap_store.cbor"))?);

    let seed_path = data_dir.join("wallet.seed");
    let wallet = if seed_path.exists() {
        let phrase = std::fs::read_to_string(&seed_path)?;
        Wallet::from_mnemonic(phrase.trim(), "")?
    } else {
        let (mnemonic, wallet) = Wallet::generate()?;
        std::fs::write(&seed_path, mnemonic.to_string())?;
        log::warn!(
            "generated a new wallet seed at {} -- back it up now",
            seed_path.display()
        );
        wallet
    };

    let coordinator = SwapCoordinator::init(config, chain_params, backends, store, Some(wallet));

    let _rpc_thread = start_rpc_server_thread(coordinator.clone())?;
    start_swap_server(coordinator)?;
    Ok(())
}
