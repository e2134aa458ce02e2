//! The JSON-RPC 2.0 surface of the daemon.

pub mod messages;
pub mod server;

pub use server::start_rpc_server_thread;
