//! A configured remote server and everything we know about it.
//!
//! Each server owns at most one live [`Connection`]. Connects and
//! reconnects are initiated here but scheduled by the node loop; disconnect
//! cleanup (pending requests, remote gates) also runs there so all registry
//! mutation stays on one task.

use crate::config::ServerEntry;
use crate::gate::is_valid_name;
use crate::net::{Connection, Correlator, DialInfo};
use crate::node::NodeEvent;
use crate::options::{parse_bool, OptionTable};
use gatemesh_core::secret::{dial_credential, expected_credential};
use gatemesh_core::{Document, Message, MeshError, MeshResult, PlayerSummary, RefreshPayload};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Per-server chat relay policy.
#[derive(Debug, Clone, Default)]
pub struct ChatPolicy {
    pub send_chat: bool,
    pub receive_chat: bool,
    pub send_filter: Option<String>,
    pub receive_filter: Option<String>,
}

fn filter_matches(filter: &Option<String>, message: &str) -> bool {
    match filter {
        Some(f) => message.contains(f.as_str()),
        None => true,
    }
}

pub struct Server {
    name: String,
    address: String,
    /// The remote node's shared key.
    key: String,
    enabled: AtomicBool,
    chat: Mutex<ChatPolicy>,
    connection: Mutex<Option<Connection>>,
    /// Set while a reconnect timer is pending, so disconnect storms don't
    /// stack timers.
    reconnect_scheduled: AtomicBool,
    /// Set by an explicit `disconnect(false)`; cleared by `connect`.
    reconnect_suppressed: AtomicBool,
    remote_version: Mutex<Option<String>>,
    remote_worlds: Mutex<BTreeSet<String>>,
    remote_players: Mutex<HashMap<String, PlayerSummary>>,
}

impl Server {
    pub fn from_entry(entry: &ServerEntry) -> MeshResult<Server> {
        if !is_valid_name(&entry.name) {
            return Err(MeshError::Validation(format!(
                "'{}' is not a valid server name",
                entry.name
            )));
        }
        Ok(Server {
            name: entry.name.clone(),
            address: entry.address.clone(),
            key: entry.key.clone(),
            enabled: AtomicBool::new(entry.enabled),
            chat: Mutex::new(ChatPolicy {
                send_chat: entry.send_chat,
                receive_chat: entry.receive_chat,
                send_filter: entry.send_chat_filter.clone(),
                receive_filter: entry.receive_chat_filter.clone(),
            }),
            connection: Mutex::new(None),
            reconnect_scheduled: AtomicBool::new(false),
            reconnect_suppressed: AtomicBool::new(false),
            remote_version: Mutex::new(None),
            remote_worlds: Mutex::new(BTreeSet::new()),
            remote_players: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// The credential an inbound peer must present to be bound to this
    /// server entry.
    pub fn expected_credential(&self, local_key: &str) -> String {
        expected_credential(&self.key, local_key)
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .unwrap()
            .as_ref()
            .map(Connection::is_authenticated)
            .unwrap_or(false)
    }

    fn has_live_connection(&self) -> bool {
        self.connection
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.state() != crate::net::LinkState::Closed)
            .unwrap_or(false)
    }

    /// Dial out if enabled and not already connected or connecting.
    pub fn connect(
        &self,
        local_key: &str,
        node_version: &str,
        handshake_timeout: Duration,
        events: mpsc::Sender<NodeEvent>,
    ) {
        if !self.is_enabled() || self.has_live_connection() {
            return;
        }
        self.reconnect_suppressed.store(false, Ordering::SeqCst);
        debug!(server = %self.name, address = %self.address, "dialing");
        let conn = Connection::dial(
            DialInfo {
                server: self.name.clone(),
                address: self.address.clone(),
                credential: dial_credential(local_key, &self.key),
                node_version: node_version.to_string(),
                handshake_timeout,
            },
            events,
        );
        *self.connection.lock().unwrap() = Some(conn);
    }

    /// Bind an inbound connection that already authenticated as this server.
    pub fn adopt_connection(&self, conn: Connection) {
        let mut slot = self.connection.lock().unwrap();
        if let Some(old) = slot.take() {
            old.close();
        }
        *slot = Some(conn);
    }

    /// Close the live connection. With `allow_reconnect` false the node
    /// loop will not schedule a retry.
    pub fn disconnect(&self, allow_reconnect: bool) {
        self.reconnect_suppressed
            .store(!allow_reconnect, Ordering::SeqCst);
        if let Some(conn) = self.connection.lock().unwrap().as_ref() {
            conn.close();
        }
    }

    pub fn connection(&self) -> Option<Connection> {
        self.connection.lock().unwrap().clone()
    }

    /// Try to claim the right to schedule a reconnect timer.
    pub fn claim_reconnect(&self) -> bool {
        if !self.is_enabled() || self.reconnect_suppressed.load(Ordering::SeqCst) {
            return false;
        }
        !self.reconnect_scheduled.swap(true, Ordering::SeqCst)
    }

    /// The pending reconnect timer fired.
    pub fn reconnect_due(&self) {
        self.reconnect_scheduled.store(false, Ordering::SeqCst);
    }

    pub fn on_connected(&self, version: &str) {
        info!(server = %self.name, version = %version, "server connected");
        *self.remote_version.lock().unwrap() = Some(version.to_string());
    }

    /// Clear the live-connection reference and the remote inventory.
    /// Idempotent. Returns `false` for a stale notification (one from a
    /// connection this server has already been handed a replacement for)
    /// so the caller skips cleanup.
    pub fn on_disconnected(&self) -> bool {
        {
            let mut slot = self.connection.lock().unwrap();
            if let Some(conn) = slot.as_ref() {
                if conn.state() != crate::net::LinkState::Closed {
                    return false;
                }
            }
            *slot = None;
        }
        *self.remote_version.lock().unwrap() = None;
        self.remote_worlds.lock().unwrap().clear();
        self.remote_players.lock().unwrap().clear();
        true
    }

    pub fn remote_version(&self) -> Option<String> {
        self.remote_version.lock().unwrap().clone()
    }

    /// Rebuild the remote world/player inventory from a refresh payload.
    /// (Remote gates live in the gate registry, rebuilt by the node loop.)
    pub fn apply_refresh(&self, data: &RefreshPayload) {
        let mut worlds = self.remote_worlds.lock().unwrap();
        worlds.clear();
        worlds.extend(data.worlds.iter().cloned());

        let mut players = self.remote_players.lock().unwrap();
        players.clear();
        for p in &data.players {
            players.insert(p.name.clone(), p.clone());
        }
    }

    pub fn remote_worlds(&self) -> Vec<String> {
        self.remote_worlds.lock().unwrap().iter().cloned().collect()
    }

    pub fn has_remote_world(&self, world: &str) -> bool {
        self.remote_worlds.lock().unwrap().contains(world)
    }

    pub fn add_remote_world(&self, world: &str) {
        self.remote_worlds.lock().unwrap().insert(world.to_string());
    }

    pub fn remove_remote_world(&self, world: &str) {
        self.remote_worlds.lock().unwrap().remove(world);
    }

    pub fn remote_players(&self) -> Vec<PlayerSummary> {
        self.remote_players.lock().unwrap().values().cloned().collect()
    }

    pub fn has_remote_player(&self, name: &str) -> bool {
        self.remote_players.lock().unwrap().contains_key(name)
    }

    pub fn player_joined(&self, name: &str, world: &str) {
        self.remote_players.lock().unwrap().insert(
            name.to_string(),
            PlayerSummary {
                name: name.to_string(),
                world: world.to_string(),
                display_name: None,
            },
        );
    }

    pub fn player_quit(&self, name: &str) {
        self.remote_players.lock().unwrap().remove(name);
    }

    pub fn can_send_chat(&self, message: &str) -> bool {
        let chat = self.chat.lock().unwrap();
        chat.send_chat && filter_matches(&chat.send_filter, message)
    }

    pub fn can_receive_chat(&self, message: &str) -> bool {
        let chat = self.chat.lock().unwrap();
        chat.receive_chat && filter_matches(&chat.receive_filter, message)
    }

    pub fn with_chat_policy<R>(&self, f: impl FnOnce(&mut ChatPolicy) -> R) -> R {
        f(&mut self.chat.lock().unwrap())
    }

    /// Send a message if authenticated; `NotConnected` otherwise.
    pub fn send(&self, message: Message) -> MeshResult<()> {
        match self.connection.lock().unwrap().as_ref() {
            Some(conn) => conn.send(message),
            None => Err(MeshError::NotConnected),
        }
    }

    pub fn send_if_connected(&self, message: Message) {
        let _ = self.send(message);
    }

    /// Invoke a remote API method and wait for its correlated response.
    ///
    /// Fails synchronously with `NotConnected` when the connection is not
    /// authenticated; nothing is registered, nothing queues.
    pub async fn api_call(
        &self,
        correlator: &std::sync::Arc<Correlator>,
        target: &str,
        method: &str,
        args: Document,
    ) -> MeshResult<Document> {
        if !self.is_connected() {
            return Err(MeshError::NotConnected);
        }
        let (id, rx) = correlator.register(&self.name);
        let request = Message::ApiRequest {
            id,
            target: target.to_string(),
            method: method.to_string(),
            args,
        };
        if let Err(e) = self.send(request) {
            correlator.abandon(id);
            return Err(e);
        }
        debug!(server = %self.name, id, target, method, "api request sent");
        rx.await.unwrap_or(Err(MeshError::NotConnected))
    }
}

/// The option table for a server's chat policy, built once at startup.
pub fn server_options() -> OptionTable<ChatPolicy> {
    OptionTable::new("server.option")
        .register(
            "sendChat",
            |p: &ChatPolicy| p.send_chat.to_string(),
            |p, v| {
                p.send_chat = parse_bool("sendChat", v)?;
                Ok(())
            },
        )
        .register(
            "receiveChat",
            |p: &ChatPolicy| p.receive_chat.to_string(),
            |p, v| {
                p.receive_chat = parse_bool("receiveChat", v)?;
                Ok(())
            },
        )
        .register(
            "sendChatFilter",
            |p: &ChatPolicy| p.send_filter.clone().unwrap_or_default(),
            |p, v| {
                p.send_filter = (!v.is_empty()).then(|| v.to_string());
                Ok(())
            },
        )
        .register(
            "receiveChatFilter",
            |p: &ChatPolicy| p.receive_filter.clone().unwrap_or_default(),
            |p, v| {
                p.receive_filter = (!v.is_empty()).then(|| v.to_string());
                Ok(())
            },
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(name: &str) -> ServerEntry {
        ServerEntry {
            name: name.into(),
            address: "127.0.0.1:0".into(),
            key: "beta-key".into(),
            enabled: true,
            send_chat: false,
            receive_chat: true,
            send_chat_filter: None,
            receive_chat_filter: Some("[mesh]".into()),
        }
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(Server::from_entry(&entry("beta")).is_ok());
        assert!(Server::from_entry(&entry("be.ta")).is_err());
        assert!(Server::from_entry(&entry("")).is_err());
    }

    #[test]
    fn chat_policy_filters() {
        let server = Server::from_entry(&entry("beta")).unwrap();
        assert!(!server.can_send_chat("hello"));
        assert!(server.can_receive_chat("[mesh] hello"));
        assert!(!server.can_receive_chat("hello"));
    }

    #[test]
    fn disconnect_clears_inventory() {
        let server = Server::from_entry(&entry("beta")).unwrap();
        server.apply_refresh(&RefreshPayload {
            version: "0.1.0".into(),
            worlds: vec!["overworld".into()],
            gates: Vec::new(),
            players: vec![PlayerSummary {
                name: "bob".into(),
                world: "overworld".into(),
                display_name: None,
            }],
        });
        assert!(server.has_remote_world("overworld"));
        assert!(server.has_remote_player("bob"));

        server.on_disconnected();
        assert!(!server.has_remote_world("overworld"));
        assert!(!server.has_remote_player("bob"));
        assert!(server.remote_version().is_none());
    }

    #[tokio::test]
    async fn api_call_without_connection_fails_fast() {
        let server = Server::from_entry(&entry("beta")).unwrap();
        let correlator = Arc::new(Correlator::new(Duration::from_secs(5)));

        let err = server
            .api_call(&correlator, "world", "getSeed", Document::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::NotConnected));
        // the failed call never registered a pending request
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn reconnect_claim_is_single_shot() {
        let server = Server::from_entry(&entry("beta")).unwrap();
        assert!(server.claim_reconnect());
        assert!(!server.claim_reconnect());
        server.reconnect_due();
        assert!(server.claim_reconnect());

        server.disconnect(false);
        server.reconnect_due();
        assert!(!server.claim_reconnect());
    }
}
