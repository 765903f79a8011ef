//! Inbound edge of the SIP engine.
//!
//! The engine invokes these callbacks as SIP traffic arrives; each one
//! resolves a target client through the router and queues a serialized
//! frame on that client's connection. Returning `false` tells the engine
//! nobody can take the message, and it answers on the wire as it sees fit
//! (typically 503).

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::engine::SipMessageInfo;
use crate::router::ClientRouter;

/// Callback surface handed to the SIP engine
#[derive(Clone)]
pub struct SipEventAdapter {
    router: Arc<ClientRouter>,
}

impl SipEventAdapter {
    pub fn new(router: Arc<ClientRouter>) -> Self {
        Self { router }
    }

    /// New request from the network outside any dialog
    ///
    /// Selects a client round-robin over the verb registrations, binds the
    /// network transaction to it, and forwards the message.
    pub fn on_request_outside_dialog(
        &self,
        verb: &str,
        tx_id: &str,
        raw: &str,
        info: &SipMessageInfo,
    ) -> bool {
        let Some(client) = self.router.select_for_request_outside_dialog(verb) else {
            return false;
        };
        self.router.add_net_tx(&client, tx_id);
        client.send_sip_message(tx_id, "", raw, info);
        true
    }

    /// Request on an established dialog
    ///
    /// `invite_tx_id` is the id of the transaction that created the dialog
    /// and is consulted only for ACK, which terminates that transaction
    /// instead of opening a new one. A BYE from the network ends the
    /// dialog once it has been forwarded.
    pub fn on_request_inside_dialog(
        &self,
        tx_id: &str,
        dialog_id: &str,
        method: &str,
        raw: &str,
        info: &SipMessageInfo,
        invite_tx_id: Option<&str>,
    ) -> bool {
        if method.eq_ignore_ascii_case("ACK") {
            return self.route_ack(tx_id, dialog_id, raw, info, invite_tx_id);
        }

        let Some(client) = self.router.select_for_dialog(dialog_id) else {
            warn!(
                "client managing dialog has disconnected: {}",
                dialog_id
            );
            return false;
        };
        self.router.add_net_tx(&client, tx_id);
        client.send_sip_message(tx_id, dialog_id, raw, info);

        if method.eq_ignore_ascii_case("BYE") {
            self.router.remove_dialog(dialog_id);
        }
        true
    }

    fn route_ack(
        &self,
        tx_id: &str,
        dialog_id: &str,
        raw: &str,
        info: &SipMessageInfo,
        invite_tx_id: Option<&str>,
    ) -> bool {
        let client = self
            .router
            .select_for_dialog(dialog_id)
            .or_else(|| invite_tx_id.and_then(|id| self.router.find_for_net_tx(id)));
        let Some(client) = client else {
            warn!(
                "client managing dialog has disconnected: {}",
                dialog_id
            );
            return false;
        };
        client.send_sip_message(tx_id, dialog_id, raw, info);
        if let Some(invite_tx_id) = invite_tx_id {
            // the ACK closes out the INVITE transaction
            self.router.remove_net_tx(invite_tx_id);
        }
        true
    }

    /// Response to a transaction a client originated
    ///
    /// A final response releases the app-transaction binding, strictly
    /// after the frame has been queued so a follow-up command on the same
    /// transaction cannot race ahead of it. A final response to a BYE
    /// also ends the dialog.
    pub fn on_response_inside_transaction(
        &self,
        tx_id: &str,
        dialog_id: &str,
        status: u16,
        method: &str,
        raw: &str,
        info: &SipMessageInfo,
    ) -> bool {
        let Some(client) = self.router.find_for_app_tx(tx_id) else {
            warn!(
                "client managing transaction has disconnected: {}",
                tx_id
            );
            return false;
        };
        client.send_sip_message(tx_id, dialog_id, raw, info);

        if status >= 200 {
            self.router.remove_app_tx(tx_id);
        }
        if method.eq_ignore_ascii_case("BYE") {
            self.router.remove_dialog(dialog_id);
        }
        true
    }

    /// Asynchronous response to a client api request
    ///
    /// A `|continue` marker in `additional` keeps the binding alive for
    /// further responses; otherwise it is released as this response is
    /// delivered.
    pub fn on_api_response(&self, client_msg_id: &str, text: &str, additional: &str) -> bool {
        let Some(client) = self.router.find_for_api_req(client_msg_id) else {
            self.router.remove_api_req(client_msg_id);
            warn!(
                "client that sent api request has disconnected: {}",
                client_msg_id
            );
            return false;
        };
        if !additional.contains("|continue") {
            self.router.remove_api_req(client_msg_id);
        }
        client.send_api_response(client_msg_id, text, additional);
        true
    }

    /// The engine confirmed a dialog for a transaction
    ///
    /// A promotion for a transaction the router has never seen indicates a
    /// bug upstream; it is logged and dropped rather than taking the
    /// process down.
    pub fn on_dialog_established(&self, tx_id: &str, dialog_id: &str) {
        if let Err(e) = self.router.bind_dialog_to_transaction(tx_id, dialog_id) {
            error!("{}", e);
        }
    }

    /// Deliver a call detail record for a dialog
    pub fn on_cdr_event(&self, dialog_id: &str, cdr_meta: &str, raw: &str) -> bool {
        let Some(client) = self.router.find_for_dialog(dialog_id) else {
            info!("dropping cdr for untracked dialog {}", dialog_id);
            return false;
        };
        client.send_cdr(cdr_meta, raw);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientDirection, ClientHandle, ClientId};
    use crate::engine::MessageSource;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn new_client(port: u16) -> (Arc<ClientHandle>, UnboundedReceiver<Bytes>) {
        ClientHandle::new(
            ClientId::new(),
            SocketAddr::from(([127, 0, 0, 1], port)),
            ClientDirection::Inbound,
        )
    }

    fn info() -> SipMessageInfo {
        SipMessageInfo::new(MessageSource::Network, "198.51.100.7", 5060, "udp")
    }

    fn recv_text(rx: &mut UnboundedReceiver<Bytes>) -> String {
        String::from_utf8(rx.try_recv().expect("frame").to_vec()).expect("utf8")
    }

    fn setup() -> (SipEventAdapter, Arc<ClientRouter>) {
        let router = Arc::new(ClientRouter::new());
        (SipEventAdapter::new(router.clone()), router)
    }

    #[test]
    fn test_request_outside_dialog_binds_and_forwards() {
        let (adapter, router) = setup();
        let (a, mut ra) = new_client(1);
        router.join(&a);
        assert!(router.register_verb(&a, "invite"));

        let raw = "INVITE sip:bob@example.com SIP/2.0\r\n\r\n";
        assert!(adapter.on_request_outside_dialog("INVITE", "nt1", raw, &info()));

        let frame = recv_text(&mut ra);
        assert!(frame.contains("|sip|"));
        assert!(frame.contains("|nt1||"));
        assert!(frame.ends_with(raw));
        assert_eq!(router.find_for_net_tx("nt1").expect("bound").id(), a.id());
    }

    #[test]
    fn test_request_outside_dialog_without_clients_is_refused() {
        let (adapter, _router) = setup();
        assert!(!adapter.on_request_outside_dialog("invite", "nt1", "INVITE", &info()));
    }

    #[test]
    fn test_bye_inside_dialog_tears_the_dialog_down() {
        let (adapter, router) = setup();
        let (z, mut rz) = new_client(1);
        router.join(&z);
        router.add_net_tx(&z, "tx1");
        router.bind_dialog_to_transaction("tx1", "d2").expect("bind");

        let raw = "BYE sip:bob@example.com SIP/2.0\r\n\r\n";
        assert!(adapter.on_request_inside_dialog("tx2", "d2", "BYE", raw, &info(), None));
        assert!(recv_text(&mut rz).ends_with(raw));

        // the dialog is gone; further in-dialog traffic has no home
        assert!(!adapter.on_request_inside_dialog("tx3", "d2", "INFO", "INFO", &info(), None));
    }

    #[test]
    fn test_ack_prefers_dialog_and_clears_invite_transaction() {
        let (adapter, router) = setup();
        let (a, mut ra) = new_client(1);
        router.join(&a);
        router.add_net_tx(&a, "invite-tx");
        router
            .bind_dialog_to_transaction("invite-tx", "d1")
            .expect("bind");

        assert!(adapter.on_request_inside_dialog(
            "ack-tx",
            "d1",
            "ACK",
            "ACK sip:a@b SIP/2.0\r\n\r\n",
            &info(),
            Some("invite-tx"),
        ));
        assert!(recv_text(&mut ra).starts_with(char::is_numeric));
        assert!(router.find_for_net_tx("invite-tx").is_none());
        // the dialog itself survives the ACK
        assert!(router.find_for_dialog("d1").is_some());
    }

    #[test]
    fn test_ack_falls_back_to_invite_transaction() {
        let (adapter, router) = setup();
        let (a, mut ra) = new_client(1);
        router.join(&a);
        router.add_net_tx(&a, "invite-tx");
        // no dialog binding at all, e.g. the 2xx raced the promotion

        assert!(adapter.on_request_inside_dialog(
            "ack-tx",
            "d1",
            "ACK",
            "ACK sip:a@b SIP/2.0\r\n\r\n",
            &info(),
            Some("invite-tx"),
        ));
        assert!(!recv_text(&mut ra).is_empty());
        assert!(router.find_for_net_tx("invite-tx").is_none());
    }

    #[test]
    fn test_final_response_releases_app_transaction() {
        let (adapter, router) = setup();
        let (a, mut ra) = new_client(1);
        router.join(&a);
        router.add_app_tx(&a, "at1");

        // provisional leaves the binding in place
        assert!(adapter.on_response_inside_transaction(
            "at1",
            "d1",
            180,
            "INVITE",
            "SIP/2.0 180 Ringing\r\n\r\n",
            &info(),
        ));
        assert!(router.find_for_app_tx("at1").is_some());

        // final releases it, after the frame is queued
        assert!(adapter.on_response_inside_transaction(
            "at1",
            "d1",
            200,
            "INVITE",
            "SIP/2.0 200 OK\r\n\r\n",
            &info(),
        ));
        assert!(router.find_for_app_tx("at1").is_none());
        assert!(recv_text(&mut ra).contains("180 Ringing"));
        assert!(recv_text(&mut ra).contains("200 OK"));
    }

    #[test]
    fn test_bye_response_removes_dialog() {
        let (adapter, router) = setup();
        let (a, _ra) = new_client(1);
        router.join(&a);
        router.add_app_tx(&a, "bye-tx");
        router.add_net_tx(&a, "orig-tx");
        router
            .bind_dialog_to_transaction("orig-tx", "d1")
            .expect("bind");

        assert!(adapter.on_response_inside_transaction(
            "bye-tx",
            "d1",
            200,
            "BYE",
            "SIP/2.0 200 OK\r\n\r\n",
            &info(),
        ));
        assert!(router.find_for_dialog("d1").is_none());
    }

    #[test]
    fn test_streaming_api_response_retains_binding_until_last() {
        let (adapter, router) = setup();
        let (a, mut ra) = new_client(1);
        router.join(&a);
        router.add_api_req(&a, "m1");

        assert!(adapter.on_api_response("m1", "OK", "resp-1|continue"));
        assert!(router.find_for_api_req("m1").is_some());

        assert!(adapter.on_api_response("m1", "OK", "resp-2"));
        assert!(router.find_for_api_req("m1").is_none());

        assert!(recv_text(&mut ra).ends_with("|response|m1|OK|resp-1|continue"));
        assert!(recv_text(&mut ra).ends_with("|response|m1|OK|resp-2"));

        // the stream is over; a straggler has nowhere to go
        assert!(!adapter.on_api_response("m1", "OK", "resp-3"));
    }

    #[test]
    fn test_dialog_established_for_unknown_transaction_is_dropped() {
        let (adapter, router) = setup();
        adapter.on_dialog_established("ghost-tx", "d1");
        assert_eq!(router.stats().dialogs, 0);
    }

    #[test]
    fn test_cdr_routed_by_dialog() {
        let (adapter, router) = setup();
        let (a, mut ra) = new_client(1);
        router.join(&a);
        router.add_net_tx(&a, "tx1");
        router.bind_dialog_to_transaction("tx1", "d1").expect("bind");

        assert!(adapter.on_cdr_event("d1", "cdr:stop|normal", "BYE sip:a@b SIP/2.0\r\n\r\n"));
        let frame = recv_text(&mut ra);
        assert!(frame.contains("|cdr:stop|normal\r\n"));

        assert!(!adapter.on_cdr_event("unknown-dialog", "cdr:stop|normal", "raw"));
    }
}
