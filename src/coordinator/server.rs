//! The daemon's long-running threads: the P2P message listener and the
//! housekeeping heartbeat.

use std::{
    net::{TcpListener, TcpStream},
    sync::{atomic::Ordering::Relaxed, Arc},
    thread,
    time::Duration,
};

use super::{api::SwapCoordinator, error::CoordinatorError};
use crate::{
    protocol::messages::MessageEnvelope,
    utill::{read_message, HEART_BEAT_INTERVAL_SECS},
};

/// Accept-loop poll interval while checking the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Run the swap daemon: recover persisted swaps, start the heartbeat and
/// serve inbound swap messages until shutdown. Blocks the calling thread.
pub fn start_swap_server(coordinator: Arc<SwapCoordinator>) -> Result<(), CoordinatorError> {
    coordinator.startup_sweep()?;

    let heartbeat = {
        let coordinator = coordinator.clone();
        thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || {
                while !coordinator.shutdown.load(Relaxed) {
                    coordinator.housekeeping();
                    thread::sleep(Duration::from_secs(HEART_BEAT_INTERVAL_SECS));
                }
            })?
    };

    let listener = TcpListener::bind(("0.0.0.0", coordinator.config.network_port))?;
    listener.set_nonblocking(true)?;
    log::info!(
        "[{}] swap message listener bound",
        coordinator.config.network_port
    );

    let mut handlers: Vec<thread::JoinHandle<()>> = Vec::new();
    while !coordinator.shutdown.load(Relaxed) {
        match listener.accept() {
            Ok((socket, address)) => {
                log::debug!("peer connection from {}", address);
                let coordinator = coordinator.clone();
                let handle = thread::Builder::new()
                    .name(format!("peer-{}", address))
                    .spawn(move || handle_connection(coordinator, socket))?;
                handlers.push(handle);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                log::error!("listener accept failed: {}", e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
        handlers.retain(|h| !h.is_finished());
    }

    for handle in handlers {
        let _ = handle.join();
    }
    let _ = heartbeat.join();
    log::info!("swap server shut down");
    Ok(())
}

/// One inbound connection carries one or more framed envelopes; the stream
/// closes on the first malformed frame.
fn handle_connection(coordinator: Arc<SwapCoordinator>, mut socket: TcpStream) {
    let _ = socket.set_read_timeout(Some(Duration::from_secs(60)));
    loop {
        let envelope: MessageEnvelope = match read_message(&mut socket) {
            Ok(envelope) => envelope,
            Err(crate::error::NetError::ReachedEOF) => return,
            Err(e) => {
                log::debug!("peer stream closed: {:?}", e);
                return;
            }
        };
        if let Err(e) = coordinator.handle_envelope(envelope) {
            log::warn!("inbound message rejected: {:?}", e);
        }
    }
}
