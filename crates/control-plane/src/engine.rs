//! Seams to the SIP engine.
//!
//! The control plane neither parses SIP nor runs transaction state
//! machines. Commands flow down through the [`DialogController`] and
//! [`ProxyController`] traits, and events come back up through the
//! [`SipEventAdapter`](crate::adapter::SipEventAdapter). Engine failures
//! are opaque to the control plane, so trait methods report them as
//! `anyhow::Result`.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of the server a SIP message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageSource {
    /// Received from the SIP network
    Network,
    /// Originated by a connected application
    Application,
}

impl fmt::Display for MessageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageSource::Network => write!(f, "network"),
            MessageSource::Application => write!(f, "application"),
        }
    }
}

/// Transport-level details of a SIP message
///
/// Serialized into the meta section of every SIP frame delivered to a
/// client, so applications can see where a message entered the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipMessageInfo {
    pub source: MessageSource,
    pub address: String,
    pub port: u16,
    pub protocol: String,
    pub received_at: DateTime<Utc>,
}

impl SipMessageInfo {
    /// Stamps the message with the current time
    pub fn new(source: MessageSource, address: &str, port: u16, protocol: &str) -> Self {
        Self {
            source,
            address: address.to_string(),
            port,
            protocol: protocol.to_string(),
            received_at: Utc::now(),
        }
    }

    /// Pipe-joined wire form used inside delivered frames
    pub fn to_meta(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.source,
            self.address,
            self.port,
            self.protocol,
            self.received_at.timestamp_millis()
        )
    }
}

/// Options parsed from the positional flags of a `proxy` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyOptions {
    /// Stay in the signaling path for the life of the dialog
    pub remain_in_dialog: bool,
    /// Deliver every response to the client, not just the final one
    pub full_response: bool,
    /// Chase 3xx responses instead of reporting them
    pub follow_redirects: bool,
    /// Fork to all destinations at once rather than serially
    pub simultaneous: bool,
    /// Engine-interpreted provisional timeout, e.g. `4s`
    pub provisional_timeout: String,
    /// Engine-interpreted final timeout
    pub final_timeout: String,
}

/// Command surface of the SIP engine's dialog layer
///
/// Implemented by the transaction/dialog engine sitting below the control
/// plane. All SIP-level outcomes (responses, timeouts) are reported
/// asynchronously through the event adapter, not through these return
/// values.
#[async_trait]
pub trait DialogController: Send + Sync {
    /// Send a request that starts a new transaction outside any dialog.
    ///
    /// `tx_id` was minted by the control plane and is already recorded in
    /// its app-transaction index; the engine allocates the dialog id and
    /// reports both back through the api-response path.
    async fn send_request_outside_dialog(
        &self,
        client_msg_id: &str,
        tx_id: &str,
        start_line: &str,
        headers: &str,
        body: &str,
        route_url: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Send a request on an established dialog
    async fn send_request_inside_dialog(
        &self,
        client_msg_id: &str,
        tx_id: &str,
        dialog_id: &str,
        start_line: &str,
        headers: &str,
        body: &str,
    ) -> anyhow::Result<()>;

    /// Respond to a network-originated request previously routed to a client
    async fn respond_to_sip_request(
        &self,
        client_msg_id: &str,
        tx_id: &str,
        start_line: &str,
        headers: &str,
        body: &str,
    ) -> anyhow::Result<()>;

    /// Cancel a pending client-originated transaction
    async fn send_cancel_request(
        &self,
        client_msg_id: &str,
        tx_id: &str,
        start_line: &str,
        headers: &str,
        body: &str,
    ) -> anyhow::Result<()>;

    /// Map a Call-ID to an established dialog, if the engine knows one
    async fn find_dialog_by_call_id(&self, call_id: &str) -> Option<String>;

    /// An outbound connection requested by the engine finished its
    /// authenticate handshake and can take traffic
    async fn outbound_ready(&self, tx_id: &str);

    /// An outbound connection could not be established; the engine should
    /// release the transaction that was waiting on it
    async fn outbound_failed(&self, tx_id: &str, reason: &str);
}

/// Command surface of the SIP engine's proxy core
#[async_trait]
pub trait ProxyController: Send + Sync {
    /// Take over a network transaction and proxy it to `destinations`
    async fn proxy_request(
        &self,
        client_msg_id: &str,
        tx_id: &str,
        options: ProxyOptions,
        destinations: Vec<String>,
        headers: &str,
    ) -> anyhow::Result<()>;
}
