//! Control plane wiring.
//!
//! [`ControlPlane`] owns the configuration, the router, and the engine
//! controllers, and carries the command path from client sessions down
//! into the SIP engine, recording correlations before every dispatch.
//! [`ControlPlane::start`] binds the TCP listener and returns a
//! [`ServerHandle`] for shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::SipEventAdapter;
use crate::client::session::ClientSession;
use crate::client::{outbound, ClientDirection, ClientHandle, ClientId};
use crate::codec::message;
use crate::config::ControlPlaneConfig;
use crate::engine::{DialogController, ProxyController, ProxyOptions};
use crate::error::{Error, Result};
use crate::router::ClientRouter;

/// The client-facing control plane of the signaling server
///
/// Create one with [`ControlPlane::new`], hand
/// [`adapter`](ControlPlane::adapter) to the SIP engine, then
/// [`start`](ControlPlane::start) it to begin accepting application
/// connections.
pub struct ControlPlane {
    config: ControlPlaneConfig,
    router: Arc<ClientRouter>,
    dialog: Arc<dyn DialogController>,
    proxy: Arc<dyn ProxyController>,
    /// Live connection tasks, for teardown at shutdown
    sessions: DashMap<ClientId, JoinHandle<()>>,
}

impl ControlPlane {
    /// Validates the configuration and wires the control plane together
    pub fn new(
        config: ControlPlaneConfig,
        dialog: Arc<dyn DialogController>,
        proxy: Arc<dyn ProxyController>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            router: Arc::new(ClientRouter::new()),
            dialog,
            proxy,
            sessions: DashMap::new(),
        }))
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<ClientRouter> {
        &self.router
    }

    pub(crate) fn dialog_controller(&self) -> &Arc<dyn DialogController> {
        &self.dialog
    }

    /// The callback surface the SIP engine drives
    pub fn adapter(&self) -> SipEventAdapter {
        SipEventAdapter::new(self.router.clone())
    }

    /// Binds the listener and starts accepting clients
    pub async fn start(self: Arc<Self>) -> Result<ServerHandle> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| Error::BindFailed(self.config.listen_addr, e))?;
        let local_addr = listener.local_addr()?;
        info!("control plane listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let plane = self.clone();
        let acceptor = tokio::spawn(async move {
            plane.accept_loop(listener, shutdown_rx).await;
        });

        Ok(ServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            acceptor,
            plane: self,
        })
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("acceptor stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("received connection from client at {}", peer_addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("failed to set TCP_NODELAY: {}", e);
                        }
                        self.clone()
                            .spawn_session(stream, peer_addr, ClientDirection::Inbound, None);
                    }
                    Err(e) => {
                        error!("accept failed: {}", e);
                    }
                }
            }
        }
    }

    /// Dial out to a remote application on behalf of the SIP engine
    ///
    /// The engine hears the outcome through its `outbound_ready` /
    /// `outbound_failed` callbacks, keyed by `pending_tx_id`.
    pub fn connect_client(self: Arc<Self>, host: &str, port: u16, pending_tx_id: &str) {
        outbound::connect(self, host.to_string(), port, pending_tx_id.to_string());
    }

    pub(crate) fn spawn_session(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        direction: ClientDirection,
        pending_tx_id: Option<String>,
    ) {
        let plane = self.clone();
        let id = ClientId::new();
        let key = id.clone();
        let task = tokio::spawn(async move {
            let session_id = id.clone();
            ClientSession::run(id, stream, peer_addr, direction, pending_tx_id, plane.clone()).await;
            plane.sessions.remove(&session_id);
        });
        self.sessions.insert(key, task);
    }

    // ------------------------------------------------------------------
    // Command path: client -> engine, with correlation bookkeeping. Every
    // command records its api-request binding (and, for requests, a fresh
    // app-transaction binding) before the engine sees it, so responses
    // coming back through the adapter always find their client.
    // ------------------------------------------------------------------

    pub(crate) async fn send_request_outside_dialog(
        &self,
        client: &Arc<ClientHandle>,
        client_msg_id: &str,
        start_line: &str,
        headers: &str,
        body: &str,
        route_url: Option<&str>,
    ) -> anyhow::Result<String> {
        let tx_id = Uuid::new_v4().to_string();
        // an ACK never opens a transaction
        if !start_line.starts_with("ACK") {
            self.router.add_app_tx(client, &tx_id);
        }
        self.router.add_api_req(client, client_msg_id);
        let result = self
            .dialog
            .send_request_outside_dialog(client_msg_id, &tx_id, start_line, headers, body, route_url)
            .await;
        if result.is_err() {
            self.release_command(client_msg_id, Some(&tx_id));
        }
        result.map(|_| tx_id)
    }

    pub(crate) async fn send_request_inside_dialog(
        &self,
        client: &Arc<ClientHandle>,
        client_msg_id: &str,
        dialog_id: &str,
        start_line: &str,
        headers: &str,
        body: &str,
    ) -> anyhow::Result<String> {
        let tx_id = Uuid::new_v4().to_string();
        if !start_line.starts_with("ACK") {
            self.router.add_app_tx(client, &tx_id);
        }
        self.router.add_api_req(client, client_msg_id);
        let result = self
            .dialog
            .send_request_inside_dialog(client_msg_id, &tx_id, dialog_id, start_line, headers, body)
            .await;
        if result.is_err() {
            self.release_command(client_msg_id, Some(&tx_id));
        }
        result.map(|_| tx_id)
    }

    pub(crate) async fn respond_to_sip_request(
        &self,
        client: &Arc<ClientHandle>,
        client_msg_id: &str,
        tx_id: &str,
        start_line: &str,
        headers: &str,
        body: &str,
    ) -> anyhow::Result<()> {
        self.router.add_api_req(client, client_msg_id);
        let result = self
            .dialog
            .respond_to_sip_request(client_msg_id, tx_id, start_line, headers, body)
            .await;
        match &result {
            Ok(()) => {
                // A final response closes the network transaction, except a
                // 2xx to an INVITE, whose binding the ACK clears later.
                if let Some(status) = message::response_status(start_line) {
                    let invite = message::cseq_method(headers)
                        .is_some_and(|m| m.eq_ignore_ascii_case("INVITE"));
                    if status >= 200 && (!invite || status >= 300) {
                        self.router.remove_net_tx(tx_id);
                    }
                }
            }
            Err(_) => self.release_command(client_msg_id, None),
        }
        result
    }

    pub(crate) async fn send_cancel_request(
        &self,
        client: &Arc<ClientHandle>,
        client_msg_id: &str,
        tx_id: &str,
        start_line: &str,
        headers: &str,
        body: &str,
    ) -> anyhow::Result<()> {
        self.router.add_api_req(client, client_msg_id);
        let result = self
            .dialog
            .send_cancel_request(client_msg_id, tx_id, start_line, headers, body)
            .await;
        if result.is_err() {
            self.release_command(client_msg_id, None);
        }
        result
    }

    pub(crate) async fn proxy_request(
        &self,
        client: &Arc<ClientHandle>,
        client_msg_id: &str,
        tx_id: &str,
        options: ProxyOptions,
        destinations: Vec<String>,
        headers: &str,
    ) -> anyhow::Result<()> {
        self.router.add_api_req(client, client_msg_id);
        let result = self
            .proxy
            .proxy_request(client_msg_id, tx_id, options, destinations, headers)
            .await;
        match result {
            Ok(()) => {
                // the proxy core owns the transaction from here
                self.router.remove_net_tx(tx_id);
                Ok(())
            }
            Err(e) => {
                self.release_command(client_msg_id, None);
                Err(e)
            }
        }
    }

    /// Roll back correlation state for a command the engine refused
    fn release_command(&self, client_msg_id: &str, tx_id: Option<&str>) {
        self.router.remove_api_req(client_msg_id);
        if let Some(tx_id) = tx_id {
            self.router.remove_app_tx(tx_id);
        }
    }
}

/// Running server, returned by [`ControlPlane::start`]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
    plane: Arc<ControlPlane>,
}

impl ServerHandle {
    /// The address the listener actually bound, useful with port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the acceptor, then drops every live session
    ///
    /// Sessions are closed by socket drop; frames still sitting in their
    /// queues are discarded. There is no graceful drain.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.acceptor.await {
            warn!("acceptor task ended abnormally: {}", e);
        }
        for entry in self.plane.sessions.iter() {
            entry.value().abort();
        }
        self.plane.sessions.clear();
        info!("control plane stopped");
        Ok(())
    }
}
