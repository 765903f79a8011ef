//! Server-initiated connections to remote applications.
//!
//! The SIP engine asks for one of these when it has work for an
//! application that is not connected, e.g. an outdial. The session dials
//! the address, sends its authenticate immediately, and reports
//! `outbound_ready` / `outbound_failed` keyed by the transaction that is
//! waiting.

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::client::ClientDirection;
use crate::server::ControlPlane;

/// Dials `host:port` and runs the authenticate-first handshake
pub(crate) fn connect(plane: Arc<ControlPlane>, host: String, port: u16, pending_tx_id: String) {
    tokio::spawn(async move {
        let target = format!("{}:{}", host, port);
        let stream = match TcpStream::connect(target.as_str()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("unable to connect to {}: {}", target, e);
                plane
                    .dialog_controller()
                    .outbound_failed(&pending_tx_id, &e.to_string())
                    .await;
                return;
            }
        };

        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("connection to {} lost before start: {}", target, e);
                plane
                    .dialog_controller()
                    .outbound_failed(&pending_tx_id, &e.to_string())
                    .await;
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY: {}", e);
        }

        debug!(
            "successfully connected to {} for transaction {}",
            peer_addr, pending_tx_id
        );
        plane.spawn_session(stream, peer_addr, ClientDirection::Outbound, Some(pending_tx_id));
    });
}
