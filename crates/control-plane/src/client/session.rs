//! Per-connection session.
//!
//! A session owns the socket for one client. The read half feeds a frame
//! decoder and walks the initial → authenticated → closed state machine;
//! the write half is driven by a separate task draining the handle's
//! frame queue, which keeps deliveries on one socket in posting order.
//! When the session ends, the owning reference to the [`ClientHandle`]
//! drops and the router's weak entries stop resolving.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{ClientDirection, ClientHandle, ClientId, ClientState};
use crate::codec::frame::FrameDecoder;
use crate::codec::message::{self, ControlMessage, Verb};
use crate::engine::ProxyOptions;
use crate::error::{Error, Result};
use crate::server::ControlPlane;

const READ_CHUNK_SIZE: usize = 8192;

pub(crate) struct ClientSession {
    handle: Arc<ClientHandle>,
    plane: Arc<ControlPlane>,
    /// Outbound only: the SIP transaction waiting on this connection
    pending_tx_id: Option<String>,
    /// Outbound only: id of the authenticate we sent, to match the answer
    auth_msg_id: Option<String>,
}

impl ClientSession {
    /// Drives a connection to completion
    pub(crate) async fn run(
        id: ClientId,
        stream: TcpStream,
        peer_addr: SocketAddr,
        direction: ClientDirection,
        pending_tx_id: Option<String>,
        plane: Arc<ControlPlane>,
    ) {
        let (read_half, write_half) = stream.into_split();
        let (handle, frames) = ClientHandle::new(id, peer_addr, direction);
        let writer = spawn_writer(write_half, frames, handle.id().clone());

        plane.router().join(&handle);
        info!("client {} connected from {}", handle.id(), peer_addr);

        let client_id = handle.id().clone();
        let mut session = ClientSession {
            handle,
            plane: plane.clone(),
            pending_tx_id,
            auth_msg_id: None,
        };

        if direction == ClientDirection::Outbound {
            session.send_authenticate();
        }

        if let Err(e) = session.read_loop(read_half).await {
            if e.is_connection_closed() {
                debug!("client {}: connection closed: {}", client_id, e);
            } else {
                warn!("client {}: session ended: {}", client_id, e);
            }
        }

        session.handle.set_state(ClientState::Closed);
        plane.router().leave(&session.handle);
        info!("client {} disconnected", client_id);

        // drop the owning reference so the writer drains and exits
        drop(session);
        let _ = writer.await;
    }

    async fn read_loop(&mut self, mut read_half: OwnedReadHalf) -> Result<()> {
        let mut decoder = FrameDecoder::new();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        let auth_deadline = tokio::time::Instant::now() + self.plane.config().auth_timeout;

        loop {
            // an unauthenticated peer only gets a short grace period
            let n = if self.handle.state() == ClientState::Initial {
                match tokio::time::timeout_at(auth_deadline, read_half.read(&mut chunk)).await {
                    Ok(read) => read?,
                    Err(_) => {
                        warn!("client {}: authentication timeout", self.handle.id());
                        if let Some(tx_id) = self.pending_tx_id.clone() {
                            self.plane
                                .dialog_controller()
                                .outbound_failed(&tx_id, "authentication timeout")
                                .await;
                        }
                        return Err(Error::AuthenticationTimeout);
                    }
                }
            } else {
                read_half.read(&mut chunk).await?
            };

            if n == 0 {
                debug!("client {}: peer closed the connection", self.handle.id());
                return Ok(());
            }

            decoder.extend(&chunk[..n]);
            loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) => {
                        if !self.handle_frame(&frame).await {
                            return Ok(());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("client {}: {}", self.handle.id(), e);
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Handles one frame; returns false when the session must close
    async fn handle_frame(&mut self, frame: &[u8]) -> bool {
        let msg = match ControlMessage::parse(frame) {
            Ok(msg) => msg,
            Err(e) => {
                error!("client {}: {}", self.handle.id(), e);
                return false;
            }
        };

        if msg.verb.is_empty() {
            error!("client {}: invalid message", self.handle.id());
            self.respond(&msg.msg_id, false, Some("Invalid message format"));
            return false;
        }
        let Some(verb) = msg.verb() else {
            error!("client {}: unknown message type '{}'", self.handle.id(), msg.verb);
            self.respond(&msg.msg_id, false, Some("Unknown message type"));
            return false;
        };

        match (self.handle.state(), verb) {
            (ClientState::Initial, Verb::Authenticate) if !self.handle.is_outbound() => {
                self.handle_authenticate(&msg)
            }
            (ClientState::Initial, Verb::Response) if self.handle.is_outbound() => {
                self.handle_outbound_auth_response(&msg).await
            }
            (ClientState::Initial, _) => {
                self.respond(&msg.msg_id, false, Some("authentication required"));
                false
            }
            (ClientState::Authenticated, Verb::Route) => self.handle_route(&msg),
            (ClientState::Authenticated, Verb::Sip) => self.handle_sip(&msg).await,
            (ClientState::Authenticated, Verb::Proxy) => self.handle_proxy(&msg).await,
            (ClientState::Authenticated, Verb::Authenticate) => {
                self.respond(&msg.msg_id, false, Some("already authenticated"));
                true
            }
            (ClientState::Authenticated, Verb::Response) => {
                debug!(
                    "client {}: ignoring unexpected response frame",
                    self.handle.id()
                );
                true
            }
            (ClientState::Closed, _) => false,
        }
    }

    fn respond(&self, client_msg_id: &str, ok: bool, detail: Option<&str>) {
        self.handle
            .send(&message::format_response(client_msg_id, ok, detail));
    }

    fn handle_authenticate(&mut self, msg: &ControlMessage) -> bool {
        let secret = msg.args.first().map(String::as_str).unwrap_or_default();
        if secret.is_empty() || secret != self.plane.config().shared_secret {
            info!("client {}: secret validation failed", self.handle.id());
            self.respond(&msg.msg_id, false, Some("incorrect secret"));
            return false;
        }

        if let Some(app_name) = msg.args.get(1).filter(|name| !name.is_empty()) {
            self.handle.set_app_name(app_name);
            self.plane.router().register_service(&self.handle, app_name);
        }

        self.handle.set_state(ClientState::Authenticated);
        let hostports = self.plane.config().advertised_hostports.join(",");
        self.respond(&msg.msg_id, true, Some(&hostports));
        info!("client {} authenticated", self.handle.id());
        true
    }

    /// Outbound handshake: we sent the authenticate, the remote app answers
    async fn handle_outbound_auth_response(&mut self, msg: &ControlMessage) -> bool {
        let in_reply_to = msg.args.first().map(String::as_str);
        let accepted = in_reply_to == self.auth_msg_id.as_deref()
            && msg.args.get(1).map(String::as_str) == Some("OK");

        if accepted {
            self.handle.set_state(ClientState::Authenticated);
            info!("outbound client {} is ready", self.handle.id());
            if let Some(tx_id) = &self.pending_tx_id {
                self.plane.dialog_controller().outbound_ready(tx_id).await;
            }
            true
        } else {
            warn!(
                "outbound client {}: authentication rejected",
                self.handle.id()
            );
            if let Some(tx_id) = &self.pending_tx_id {
                self.plane
                    .dialog_controller()
                    .outbound_failed(tx_id, "authentication rejected")
                    .await;
            }
            false
        }
    }

    fn send_authenticate(&mut self) {
        let (msg_id, payload) =
            message::format_authenticate_request(&self.plane.config().shared_secret);
        self.auth_msg_id = Some(msg_id);
        self.handle.send(&payload);
    }

    fn handle_route(&self, msg: &ControlMessage) -> bool {
        let Some(verb) = msg.args.first().filter(|verb| !verb.is_empty()) else {
            self.respond(&msg.msg_id, false, Some("Route request is missing a verb"));
            return false;
        };
        if !self.plane.router().register_verb(&self.handle, verb) {
            self.respond(
                &msg.msg_id,
                false,
                Some("Route request includes unsupported verb"),
            );
            return false;
        }
        self.respond(&msg.msg_id, true, None);
        true
    }

    /// Classifies a `sip` command by its start-line and populated fields
    async fn handle_sip(&self, msg: &ControlMessage) -> bool {
        if msg.args.len() < 2 {
            self.respond(&msg.msg_id, false, Some("Invalid message format"));
            return false;
        }
        let tx_id = msg.args[0].as_str();
        let dialog_id = msg.args[1].as_str();
        let route_url = msg.args.get(2).map(String::as_str).filter(|url| !url.is_empty());

        debug!(
            "client {}: sip command, transaction id '{}', dialog id '{}'",
            self.handle.id(),
            tx_id,
            dialog_id
        );

        if msg.start_line.starts_with("SIP/") {
            // a response the client is emitting to a request we routed it
            if tx_id.is_empty() {
                error!(
                    "client {}: sip response without a transaction id",
                    self.handle.id()
                );
                self.respond(&msg.msg_id, false, Some("transaction id missing"));
                return false;
            }
            if let Err(e) = self
                .plane
                .respond_to_sip_request(
                    &self.handle,
                    &msg.msg_id,
                    tx_id,
                    &msg.start_line,
                    &msg.headers,
                    &msg.body,
                )
                .await
            {
                warn!("client {}: respond failed: {}", self.handle.id(), e);
            }
        } else if !dialog_id.is_empty() {
            debug!(
                "client {}: sending a request inside dialog {}",
                self.handle.id(),
                dialog_id
            );
            if let Err(e) = self
                .plane
                .send_request_inside_dialog(
                    &self.handle,
                    &msg.msg_id,
                    dialog_id,
                    &msg.start_line,
                    &msg.headers,
                    &msg.body,
                )
                .await
            {
                warn!("client {}: in-dialog request failed: {}", self.handle.id(), e);
            }
        } else if !tx_id.is_empty() {
            if msg.start_line.starts_with("CANCEL") {
                debug!(
                    "client {}: sending a CANCEL inside transaction {}",
                    self.handle.id(),
                    tx_id
                );
                if let Err(e) = self
                    .plane
                    .send_cancel_request(
                        &self.handle,
                        &msg.msg_id,
                        tx_id,
                        &msg.start_line,
                        &msg.headers,
                        &msg.body,
                    )
                    .await
                {
                    warn!("client {}: cancel failed: {}", self.handle.id(), e);
                }
            } else {
                // CANCEL is the only request that targets a live transaction
                self.respond(
                    &msg.msg_id,
                    false,
                    Some("only CANCEL may address a transaction"),
                );
            }
        } else {
            // a Call-ID may place the request into a dialog the engine
            // already knows about
            if let Some(call_id) = message::header_value(&msg.headers, "Call-ID") {
                if let Some(dialog_id) = self
                    .plane
                    .dialog_controller()
                    .find_dialog_by_call_id(call_id)
                    .await
                {
                    debug!(
                        "client {}: request joins dialog {} via Call-ID",
                        self.handle.id(),
                        dialog_id
                    );
                    if let Err(e) = self
                        .plane
                        .send_request_inside_dialog(
                            &self.handle,
                            &msg.msg_id,
                            &dialog_id,
                            &msg.start_line,
                            &msg.headers,
                            &msg.body,
                        )
                        .await
                    {
                        warn!(
                            "client {}: in-dialog request failed: {}",
                            self.handle.id(),
                            e
                        );
                    }
                    return true;
                }
            }
            debug!(
                "client {}: sending a request outside of a dialog",
                self.handle.id()
            );
            if let Err(e) = self
                .plane
                .send_request_outside_dialog(
                    &self.handle,
                    &msg.msg_id,
                    &msg.start_line,
                    &msg.headers,
                    &msg.body,
                    route_url,
                )
                .await
            {
                warn!("client {}: request failed: {}", self.handle.id(), e);
            }
        }
        true
    }

    /// Parses the positional `proxy` arguments and hands the transaction
    /// to the proxy core
    async fn handle_proxy(&self, msg: &ControlMessage) -> bool {
        // tx-id, four flags, two timeouts, then at least one destination
        if msg.args.len() < 8 {
            error!("client {}: invalid proxy request: {:?}", self.handle.id(), msg.args);
            self.respond(
                &msg.msg_id,
                false,
                Some("Invalid proxy request: not enough information provided"),
            );
            return false;
        }
        if msg.args[1..7].iter().any(|token| token.is_empty()) {
            self.respond(&msg.msg_id, false, Some("Invalid proxy request: empty option"));
            return true;
        }

        let tx_id = msg.args[0].as_str();
        let options = ProxyOptions {
            remain_in_dialog: msg.args[1] == "remainInDialog",
            full_response: msg.args[2] == "fullResponse",
            follow_redirects: msg.args[3] == "followRedirects",
            simultaneous: msg.args[4] == "simultaneous",
            provisional_timeout: msg.args[5].clone(),
            final_timeout: msg.args[6].clone(),
        };
        let destinations: Vec<String> = msg.args[7..].to_vec();

        if let Err(e) = self
            .plane
            .proxy_request(
                &self.handle,
                &msg.msg_id,
                tx_id,
                options,
                destinations,
                &msg.headers,
            )
            .await
        {
            warn!("client {}: proxy request failed: {}", self.handle.id(), e);
        }
        true
    }
}

fn spawn_writer(
    mut write_half: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    client_id: ClientId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = write_half.write_all(&frame).await {
                // no retry; the read side notices the dead socket and
                // tears the session down
                warn!("client {}: write failed: {}", client_id, e);
                break;
            }
        }
    })
}
