//! Client identity and the send-side handle.
//!
//! A [`ClientHandle`] is the face of one connected application. The
//! connection task owns the only strong reference; the router keeps `Weak`
//! handles, so a client that disconnects simply stops resolving and is
//! compacted out of the indexes on the next pass. Everything queued through
//! the handle is drained by the connection's writer task, which preserves
//! per-socket frame order.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::codec::frame::encode_frame;
use crate::codec::message::CRLF;
use crate::engine::SipMessageInfo;

pub(crate) mod outbound;
pub(crate) mod session;

/// Unique identifier for a connected client
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(format!("client_{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

/// Who opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientDirection {
    /// The application connected to our listener
    Inbound,
    /// We dialed out to the application on behalf of the SIP engine
    Outbound,
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connected, authenticate handshake not yet complete
    Initial,
    /// Handshake done, commands are accepted
    Authenticated,
    /// Connection is gone; any remaining references resolve to nothing
    Closed,
}

const STATE_INITIAL: u8 = 0;
const STATE_AUTHENTICATED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Send-side handle for one connected application
pub struct ClientHandle {
    id: ClientId,
    peer_addr: SocketAddr,
    direction: ClientDirection,
    state: AtomicU8,
    app_name: Mutex<Option<String>>,
    frames: mpsc::UnboundedSender<Bytes>,
}

impl ClientHandle {
    /// Creates the handle plus the frame queue its writer task drains
    pub(crate) fn new(
        id: ClientId,
        peer_addr: SocketAddr,
        direction: ClientDirection,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            id,
            peer_addr,
            direction,
            state: AtomicU8::new(STATE_INITIAL),
            app_name: Mutex::new(None),
            frames: tx,
        });
        (handle, rx)
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn direction(&self) -> ClientDirection {
        self.direction
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == ClientDirection::Outbound
    }

    pub fn state(&self) -> ClientState {
        match self.state.load(Ordering::Relaxed) {
            STATE_INITIAL => ClientState::Initial,
            STATE_AUTHENTICATED => ClientState::Authenticated,
            _ => ClientState::Closed,
        }
    }

    pub(crate) fn set_state(&self, state: ClientState) {
        let raw = match state {
            ClientState::Initial => STATE_INITIAL,
            ClientState::Authenticated => STATE_AUTHENTICATED,
            ClientState::Closed => STATE_CLOSED,
        };
        self.state.store(raw, Ordering::Relaxed);
    }

    /// The app name declared at authentication time, if any
    pub fn app_name(&self) -> Option<String> {
        self.app_name.lock().ok().and_then(|name| name.clone())
    }

    pub(crate) fn set_app_name(&self, name: &str) {
        if let Ok(mut slot) = self.app_name.lock() {
            *slot = Some(name.to_string());
        }
    }

    /// Queues a payload for delivery
    ///
    /// Frames on one socket go out in the order they were queued here. A
    /// send after the connection died is dropped; the router will stop
    /// handing this client out once the owning task is gone.
    pub fn send(&self, payload: &str) {
        if self.frames.send(encode_frame(payload.as_bytes())).is_err() {
            warn!("client {}: dropping frame, connection writer is gone", self.id);
        }
    }

    /// Delivers an inbound SIP request or response
    pub fn send_sip_message(&self, tx_id: &str, dialog_id: &str, raw: &str, info: &SipMessageInfo) {
        let payload = format!(
            "{}|sip|{}|{}|{}|{}{}",
            Uuid::new_v4(),
            info.to_meta(),
            tx_id,
            dialog_id,
            CRLF,
            raw
        );
        self.send(&payload);
    }

    /// Delivers an api response, optionally with streaming tail data
    pub fn send_api_response(&self, client_msg_id: &str, text: &str, additional: &str) {
        let mut payload = format!("{}|response|{}|{}", Uuid::new_v4(), client_msg_id, text);
        if !additional.is_empty() {
            payload.push('|');
            payload.push_str(additional);
        }
        self.send(&payload);
    }

    /// Delivers a call detail record
    pub fn send_cdr(&self, cdr_meta: &str, raw: &str) {
        self.send(&format!("{}|{}{}{}", Uuid::new_v4(), cdr_meta, CRLF, raw));
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handle() -> (Arc<ClientHandle>, mpsc::UnboundedReceiver<Bytes>) {
        ClientHandle::new(
            ClientId::new(),
            SocketAddr::from(([127, 0, 0, 1], 4000)),
            ClientDirection::Inbound,
        )
    }

    #[test]
    fn test_state_transitions() {
        let (handle, _rx) = test_handle();
        assert_eq!(handle.state(), ClientState::Initial);
        handle.set_state(ClientState::Authenticated);
        assert_eq!(handle.state(), ClientState::Authenticated);
        handle.set_state(ClientState::Closed);
        assert_eq!(handle.state(), ClientState::Closed);
    }

    #[test]
    fn test_send_frames_are_length_prefixed_in_order() {
        let (handle, mut rx) = test_handle();
        handle.send("first");
        handle.send("second");
        let one = rx.try_recv().expect("first frame");
        let two = rx.try_recv().expect("second frame");
        assert_eq!(one.as_ref(), b"5#first");
        assert_eq!(two.as_ref(), b"6#second");
    }

    #[test]
    fn test_api_response_tail_is_optional() {
        let (handle, mut rx) = test_handle();
        handle.send_api_response("m1", "OK", "");
        handle.send_api_response("m1", "OK", "tx-1|continue");
        let bare = String::from_utf8(rx.try_recv().expect("frame").to_vec()).expect("utf8");
        let tailed = String::from_utf8(rx.try_recv().expect("frame").to_vec()).expect("utf8");
        assert!(bare.ends_with("|response|m1|OK"));
        assert!(tailed.ends_with("|response|m1|OK|tx-1|continue"));
    }

    #[test]
    fn test_sip_frame_shape() {
        use crate::engine::{MessageSource, SipMessageInfo};
        let (handle, mut rx) = test_handle();
        let info = SipMessageInfo::new(MessageSource::Network, "203.0.113.9", 5060, "udp");
        handle.send_sip_message("t1", "d1", "BYE sip:a@b SIP/2.0\r\n\r\n", &info);
        let frame = String::from_utf8(rx.try_recv().expect("frame").to_vec()).expect("utf8");
        let payload = frame.split_once('#').expect("length prefix").1;
        let (meta, raw) = payload.split_once("\r\n").expect("meta line");
        assert!(meta.ends_with("|t1|d1|"));
        assert!(raw.starts_with("BYE "));
    }
}
