//! Shared routing core.
//!
//! Every cross-reference table between clients, verbs, app names,
//! transactions, dialogs and api requests lives here, guarded by one
//! coarse lock. Critical sections never block and never call out; the
//! correctness of dialog promotion depends on seeing the transaction
//! tables and the dialog table atomically, so the indexes are not sharded.
//!
//! The router holds only `Weak` references to clients. The owning `Arc`
//! belongs to the connection task; once that drops, lookups resolve to
//! `None` and the dead entry is compacted out on the next selection pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::client::{ClientHandle, ClientId};
use crate::error::{Error, Result};

/// SIP methods clients may register for
const SUPPORTED_VERBS: &[&str] = &[
    "invite",
    "register",
    "subscribe",
    "notify",
    "options",
    "info",
    "message",
    "update",
    "refer",
    "publish",
    "prack",
    "bye",
    "cancel",
];

/// Snapshot of the size of every index, for leak hunting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub clients: usize,
    pub verb_registrations: usize,
    pub services: usize,
    pub dialogs: usize,
    pub dialog_app_names: usize,
    pub net_transactions: usize,
    pub app_transactions: usize,
    pub api_requests: usize,
}

#[derive(Default)]
struct RouterInner {
    /// Connected clients by id
    clients: HashMap<ClientId, Weak<ClientHandle>>,
    /// verb -> clients willing to take that method, in registration order
    verb_registrations: HashMap<String, Vec<Weak<ClientHandle>>>,
    /// verb -> round-robin offset into the registration list
    verb_offsets: HashMap<String, usize>,
    /// app name -> clients advertising it, for dialog failover
    services: HashMap<String, Vec<Weak<ClientHandle>>>,
    /// dialog id -> client currently bound to the dialog
    dialogs: HashMap<String, Weak<ClientHandle>>,
    /// dialog id -> app name, consulted when the bound client vanishes
    dialog_app_names: HashMap<String, String>,
    /// network transaction id -> responsible client
    net_transactions: HashMap<String, Weak<ClientHandle>>,
    /// application transaction id -> originating client
    app_transactions: HashMap<String, Weak<ClientHandle>>,
    /// client message id -> client awaiting the api response
    api_requests: HashMap<String, Weak<ClientHandle>>,
}

impl RouterInner {
    fn points_at(entry: &Weak<ClientHandle>, id: &ClientId) -> bool {
        match entry.upgrade() {
            Some(client) => client.id() == id,
            // dead entries go too; scrubbing doubles as compaction
            None => true,
        }
    }

    fn scrub(&mut self, id: &ClientId) {
        for regs in self.verb_registrations.values_mut() {
            regs.retain(|entry| !Self::points_at(entry, id));
        }
        for peers in self.services.values_mut() {
            peers.retain(|entry| !Self::points_at(entry, id));
        }
        self.services.retain(|_, peers| !peers.is_empty());
        self.dialogs.retain(|_, entry| !Self::points_at(entry, id));
        self.net_transactions.retain(|_, entry| !Self::points_at(entry, id));
        self.app_transactions.retain(|_, entry| !Self::points_at(entry, id));
        self.api_requests.retain(|_, entry| !Self::points_at(entry, id));
    }
}

/// The shared routing core
pub struct ClientRouter {
    inner: Mutex<RouterInner>,
}

impl ClientRouter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RouterInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a newly connected client
    pub fn join(&self, client: &Arc<ClientHandle>) {
        let mut inner = self.lock();
        inner.clients.insert(client.id().clone(), Arc::downgrade(client));
        debug!(
            "added client {}, count of connected clients is now {}",
            client.id(),
            inner.clients.len()
        );
    }

    /// Drop a client and scrub it out of every index
    ///
    /// Eviction is otherwise lazy, but a departing client must not be
    /// returned by any routing call that races with its teardown. The
    /// dialog-to-app-name table is left alone so failover can still adopt
    /// the client's dialogs.
    pub fn leave(&self, client: &ClientHandle) {
        let mut inner = self.lock();
        inner.clients.remove(client.id());
        inner.scrub(client.id());
        debug!(
            "removed client {}, count of connected clients is now {}",
            client.id(),
            inner.clients.len()
        );
    }

    /// Register a client for inbound requests with the given SIP method
    ///
    /// Returns false when the verb is not a routable SIP method.
    pub fn register_verb(&self, client: &Arc<ClientHandle>, verb: &str) -> bool {
        let verb = verb.to_ascii_lowercase();
        if !SUPPORTED_VERBS.contains(&verb.as_str()) {
            warn!("client {} asked to route unsupported verb {}", client.id(), verb);
            return false;
        }
        let mut inner = self.lock();
        inner
            .verb_registrations
            .entry(verb.clone())
            .or_default()
            .push(Arc::downgrade(client));
        inner.verb_offsets.entry(verb.clone()).or_insert(0);
        debug!("added client {} for {} requests", client.id(), verb);
        true
    }

    /// Record that a client advertises an app name
    pub fn register_service(&self, client: &Arc<ClientHandle>, app_name: &str) {
        let mut inner = self.lock();
        inner
            .services
            .entry(app_name.to_string())
            .or_default()
            .push(Arc::downgrade(client));
        debug!("client {} provides service {}", client.id(), app_name);
    }

    /// Round-robin selection of a client for a request outside any dialog
    ///
    /// Dead registrations encountered during the probe are removed on the
    /// spot. After a successful selection the stored offset is one past
    /// the chosen entry, modulo the compacted registration count.
    pub fn select_for_request_outside_dialog(&self, verb: &str) -> Option<Arc<ClientHandle>> {
        let verb = verb.to_ascii_lowercase();
        let mut inner = self.lock();
        let inner = &mut *inner;

        let regs = inner.verb_registrations.get_mut(&verb)?;
        let n = regs.len();
        if n == 0 {
            info!("no connected clients found to handle incoming {} request", verb);
            return None;
        }

        let mut offset = inner.verb_offsets.get(&verb).copied().unwrap_or(0);
        if offset >= n {
            offset = 0;
        }
        debug!(
            "{} possible clients for {}, starting with offset {}",
            n, verb, offset
        );

        let mut tries = 0;
        while tries < n && !regs.is_empty() {
            if offset >= regs.len() {
                offset = 0;
            }
            match regs[offset].upgrade() {
                Some(client) => {
                    inner.verb_offsets.insert(verb, (offset + 1) % regs.len());
                    debug!("selected client at offset {}", offset);
                    return Some(client);
                }
                None => {
                    debug!("removing disconnected client while iterating");
                    regs.remove(offset);
                    tries += 1;
                }
            }
        }

        inner.verb_offsets.insert(verb.clone(), 0);
        info!("no connected clients found to handle incoming {} request", verb);
        None
    }

    /// Find the client bound to a dialog, failing over to a peer that
    /// advertises the same app name when the primary is gone
    ///
    /// A successful failover rebinds the dialog to the replacement.
    pub fn select_for_dialog(&self, dialog_id: &str) -> Option<Arc<ClientHandle>> {
        let mut inner = self.lock();
        let inner = &mut *inner;

        if let Some(entry) = inner.dialogs.get(dialog_id) {
            if let Some(client) = entry.upgrade() {
                return Some(client);
            }
        }

        // primary is disconnected; try another client running the same app
        let app_name = inner.dialog_app_names.get(dialog_id)?.clone();
        info!(
            "client managing dialog {} has disconnected, looking for another client for app {}",
            dialog_id, app_name
        );
        let peers = inner.services.get_mut(&app_name)?;
        let n = peers.len();
        if n == 0 {
            warn!("no other clients found for app {}", app_name);
            return None;
        }

        let mut offset = rand::thread_rng().gen_range(0..n);
        let mut tries = 0;
        while tries < n && !peers.is_empty() {
            if offset >= peers.len() {
                offset = 0;
            }
            match peers[offset].upgrade() {
                Some(client) => {
                    inner
                        .dialogs
                        .insert(dialog_id.to_string(), Arc::downgrade(&client));
                    info!(
                        "dialog {} adopted by {} for app {}",
                        dialog_id,
                        client.id(),
                        app_name
                    );
                    return Some(client);
                }
                None => {
                    peers.remove(offset);
                    tries += 1;
                }
            }
        }

        warn!("no other connected clients found for app {}", app_name);
        None
    }

    /// Dialog lookup without failover, for traffic that must not adopt
    pub fn find_for_dialog(&self, dialog_id: &str) -> Option<Arc<ClientHandle>> {
        self.lock().dialogs.get(dialog_id)?.upgrade()
    }

    pub fn find_for_net_tx(&self, tx_id: &str) -> Option<Arc<ClientHandle>> {
        self.lock().net_transactions.get(tx_id)?.upgrade()
    }

    pub fn find_for_app_tx(&self, tx_id: &str) -> Option<Arc<ClientHandle>> {
        self.lock().app_transactions.get(tx_id)?.upgrade()
    }

    pub fn find_for_api_req(&self, client_msg_id: &str) -> Option<Arc<ClientHandle>> {
        self.lock().api_requests.get(client_msg_id)?.upgrade()
    }

    pub fn add_net_tx(&self, client: &Arc<ClientHandle>, tx_id: &str) {
        let mut inner = self.lock();
        inner
            .net_transactions
            .insert(tx_id.to_string(), Arc::downgrade(client));
        debug!(
            "added network transaction {}, map size is now {}",
            tx_id,
            inner.net_transactions.len()
        );
    }

    pub fn remove_net_tx(&self, tx_id: &str) {
        let mut inner = self.lock();
        inner.net_transactions.remove(tx_id);
        debug!(
            "removed network transaction {}, map size is now {}",
            tx_id,
            inner.net_transactions.len()
        );
    }

    pub fn add_app_tx(&self, client: &Arc<ClientHandle>, tx_id: &str) {
        let mut inner = self.lock();
        inner
            .app_transactions
            .insert(tx_id.to_string(), Arc::downgrade(client));
        debug!(
            "added application transaction {}, map size is now {}",
            tx_id,
            inner.app_transactions.len()
        );
    }

    pub fn remove_app_tx(&self, tx_id: &str) {
        let mut inner = self.lock();
        inner.app_transactions.remove(tx_id);
        debug!(
            "removed application transaction {}, map size is now {}",
            tx_id,
            inner.app_transactions.len()
        );
    }

    pub fn add_api_req(&self, client: &Arc<ClientHandle>, client_msg_id: &str) {
        let mut inner = self.lock();
        inner
            .api_requests
            .insert(client_msg_id.to_string(), Arc::downgrade(client));
        debug!(
            "added api request {}, map size is now {}",
            client_msg_id,
            inner.api_requests.len()
        );
    }

    pub fn remove_api_req(&self, client_msg_id: &str) {
        let mut inner = self.lock();
        inner.api_requests.remove(client_msg_id);
        debug!(
            "removed api request {}, map size is now {}",
            client_msg_id,
            inner.api_requests.len()
        );
    }

    /// Copy a transaction's owner into the dialog table once the SIP
    /// engine confirms the dialog is established
    ///
    /// UAS dialogs come from the network-transaction table, UAC dialogs
    /// from the app-transaction table; a dialog elevated early by a
    /// reliable provisional response is left as is. A transaction found in
    /// none of the three is an engine-side bug and is reported as a
    /// consistency error.
    pub fn bind_dialog_to_transaction(&self, tx_id: &str, dialog_id: &str) -> Result<()> {
        let mut inner = self.lock();
        let inner = &mut *inner;

        let owner = if let Some(entry) = inner.net_transactions.get(tx_id) {
            debug!("dialog {} established by network transaction {}", dialog_id, tx_id);
            Some(entry.clone())
        } else if inner.dialogs.contains_key(dialog_id) {
            debug!("dialog {} was already established", dialog_id);
            None
        } else if let Some(entry) = inner.app_transactions.get(tx_id) {
            debug!("dialog {} established by application transaction {}", dialog_id, tx_id);
            Some(entry.clone())
        } else {
            return Err(Error::Consistency(format!(
                "dialog {} promoted for unknown transaction {}",
                dialog_id, tx_id
            )));
        };

        if let Some(owner) = owner {
            inner.dialogs.insert(dialog_id.to_string(), owner);
        }

        match inner.dialogs.get(dialog_id).and_then(Weak::upgrade) {
            Some(client) => {
                if let Some(app_name) = client.app_name() {
                    inner
                        .dialog_app_names
                        .insert(dialog_id.to_string(), app_name.clone());
                    debug!(
                        "dialog {} established for client app {}, count of tracked dialogs is {}",
                        dialog_id,
                        app_name,
                        inner.dialog_app_names.len()
                    );
                }
                Ok(())
            }
            None => {
                inner.dialogs.remove(dialog_id);
                warn!(
                    "client managing dialog {} disconnected during promotion",
                    dialog_id
                );
                Ok(())
            }
        }
    }

    /// Forget a dialog entirely, including its failover app name
    pub fn remove_dialog(&self, dialog_id: &str) {
        let mut inner = self.lock();
        if inner.dialogs.remove(dialog_id).is_none() {
            warn!("remove_dialog: dialog not found: {}", dialog_id);
        }
        inner.dialog_app_names.remove(dialog_id);
        info!(
            "removed dialog {}, count of tracked dialogs is now {}",
            dialog_id,
            inner.dialogs.len()
        );
    }

    /// Size of every index
    pub fn stats(&self) -> RouterStats {
        let inner = self.lock();
        RouterStats {
            clients: inner.clients.len(),
            verb_registrations: inner.verb_registrations.values().map(Vec::len).sum(),
            services: inner.services.values().map(Vec::len).sum(),
            dialogs: inner.dialogs.len(),
            dialog_app_names: inner.dialog_app_names.len(),
            net_transactions: inner.net_transactions.len(),
            app_transactions: inner.app_transactions.len(),
            api_requests: inner.api_requests.len(),
        }
    }

    /// Dump index sizes to the log
    pub fn log_storage_counts(&self) {
        let stats = self.stats();
        debug!("router storage counts: {:?}", stats);
    }
}

impl Default for ClientRouter {
    fn default() -> Self {
        Self::new()
    }
}
