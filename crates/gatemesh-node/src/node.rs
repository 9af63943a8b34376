//! The node: owner of every registry, and the event loop that is the only
//! mutator of gate and reservation state.
//!
//! Connection tasks do I/O and nothing else; every decoded message and
//! every lifecycle change is posted here as a [`NodeEvent`] and handled on
//! this loop. Timers (countdowns, arrival windows, reconnects, keepalive)
//! are spawned tasks that post events back rather than blocking anything.

use crate::api;
use crate::config::ConfigFile;
use crate::economy::Economy;
use crate::gate::{gate_options, GateRegistry, LocalGate};
use crate::net::{listener, Correlator};
use crate::options::OptionTable;
use crate::permissions::Permissions;
use crate::registry::ServerRegistry;
use crate::reservation::Reservations;
use crate::server::{server_options, ChatPolicy, Server};
use crate::world::WorldStore;
use gatemesh_core::{Message, MeshError, MeshResult, RefreshPayload};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything that wakes the node loop.
#[derive(Debug)]
pub enum NodeEvent {
    /// A connection reached `Authenticated`.
    PeerConnected { server: String, version: String },
    /// A connection closed, voluntarily or not.
    PeerDisconnected { server: String },
    /// A decoded inbound message.
    PeerMessage { server: String, message: Message },
    /// A reconnect timer fired.
    ReconnectDue { server: String },
    /// An entity crossed into a local gate's portal region.
    EnteredGate { entity: u64, gate: String },
    CountdownTick { entity: u64, remaining_ms: u64 },
    CountdownExpired { entity: u64 },
    ArrivalWindowExpired { reservation: u64 },
    /// A local player said something.
    LocalChat { entity: u64, message: String },
    KeepaliveTick,
    Shutdown,
}

pub struct Node {
    pub settings: crate::config::Settings,
    pub worlds: Arc<WorldStore>,
    pub economy: Arc<Economy>,
    pub permissions: Arc<Permissions>,
    pub servers: Arc<ServerRegistry>,
    pub correlator: Arc<Correlator>,
    pub gates: GateRegistry,
    pub reservations: Reservations,
    gate_opts: OptionTable<LocalGate>,
    server_opts: OptionTable<ChatPolicy>,
    events_tx: mpsc::Sender<NodeEvent>,
    events_rx: Option<mpsc::Receiver<NodeEvent>>,
}

impl Node {
    pub fn new(config: &ConfigFile) -> MeshResult<Node> {
        let settings = config.settings();

        let worlds = Arc::new(WorldStore::new());
        for entry in &config.worlds {
            worlds.add_world(entry.build());
        }

        let economy = Arc::new(Economy::new());
        for entry in &config.balances {
            economy.set_balance(&entry.account, entry.amount);
        }

        let permissions = Arc::new(Permissions::new(
            config.permissions.iter().map(|e| e.build()).collect(),
        ));

        let servers = Arc::new(ServerRegistry::from_entries(&config.servers)?);

        let mut gates = GateRegistry::new();
        for entry in &config.gates {
            if !worlds.has_world(&entry.world) {
                return Err(MeshError::Validation(format!(
                    "gate '{}' references unknown world '{}'",
                    entry.name, entry.world
                )));
            }
            gates.add_local(entry.build()?)?;
        }

        let correlator = Arc::new(Correlator::new(settings.api_timeout));
        let (events_tx, events_rx) = mpsc::channel(1024);

        Ok(Node {
            settings,
            worlds,
            economy,
            permissions,
            servers,
            correlator,
            gates,
            reservations: Reservations::new(),
            gate_opts: gate_options(),
            server_opts: server_options(),
            events_tx,
            events_rx: Some(events_rx),
        })
    }

    /// Read a gate option by name.
    pub fn get_gate_option(&self, gate: &str, option: &str) -> MeshResult<String> {
        let gate = self
            .gates
            .local(gate)
            .ok_or_else(|| MeshError::Validation(format!("unknown gate '{gate}'")))?;
        self.gate_opts.get(gate, option)
    }

    /// Set a gate option by name; gated on `gate.option.<name>`.
    pub fn set_gate_option(
        &mut self,
        actor: &str,
        gate: &str,
        option: &str,
        value: &str,
    ) -> MeshResult<()> {
        let opts = &self.gate_opts;
        let permissions = &self.permissions;
        let gate = self
            .gates
            .local_mut(gate)
            .ok_or_else(|| MeshError::Validation(format!("unknown gate '{gate}'")))?;
        opts.set(permissions, actor, gate, option, value)
    }

    pub fn gate_option_names(&self) -> Vec<&str> {
        self.gate_opts.names()
    }

    /// Read a server chat-policy option by name.
    pub fn get_server_option(&self, server: &str, option: &str) -> MeshResult<String> {
        let server = self
            .servers
            .get(server)
            .ok_or_else(|| MeshError::Validation(format!("unknown server '{server}'")))?;
        server.with_chat_policy(|p| self.server_opts.get(p, option))
    }

    /// Set a server chat-policy option by name; gated on
    /// `server.option.<name>`.
    pub fn set_server_option(
        &self,
        actor: &str,
        server: &str,
        option: &str,
        value: &str,
    ) -> MeshResult<()> {
        let server = self
            .servers
            .get(server)
            .ok_or_else(|| MeshError::Validation(format!("unknown server '{server}'")))?;
        server.with_chat_policy(|p| self.server_opts.set(&self.permissions, actor, p, option, value))
    }

    /// A handle for posting events to this node's loop.
    pub fn events(&self) -> mpsc::Sender<NodeEvent> {
        self.events_tx.clone()
    }

    /// Run the listener, the peer connect schedule, and the event loop
    /// until a `Shutdown` event arrives.
    pub async fn run(mut self) -> MeshResult<()> {
        let mut events_rx = self
            .events_rx
            .take()
            .ok_or_else(|| MeshError::Validation("node already running".into()))?;

        let listener_ctx = listener::ListenerContext {
            registry: self.servers.clone(),
            local_key: self.settings.key.clone(),
            node_name: self.settings.name.clone(),
            node_version: self.settings.version.clone(),
            handshake_timeout: self.settings.handshake_timeout,
            events: self.events_tx.clone(),
        };
        let address = self.settings.address.clone();
        tokio::spawn(async move {
            if let Err(e) = listener::run(&address, listener_ctx).await {
                warn!(error = %e, "listener stopped");
            }
        });

        // First connect attempt per enabled server lands after the same
        // fixed delay reconnects use, giving the host time to settle.
        for server in self.servers.all() {
            if server.is_enabled() {
                self.schedule_reconnect(&server);
            }
        }

        let keepalive_events = self.events_tx.clone();
        let keepalive = self.settings.keepalive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keepalive);
            ticker.tick().await; // skip the immediate tick
            loop {
                ticker.tick().await;
                if keepalive_events.send(NodeEvent::KeepaliveTick).await.is_err() {
                    break;
                }
            }
        });

        info!(node = %self.settings.name, "node running");
        while let Some(event) = events_rx.recv().await {
            if matches!(event, NodeEvent::Shutdown) {
                break;
            }
            self.handle_event(event).await;
        }

        info!(node = %self.settings.name, "node stopped");
        Ok(())
    }

    pub async fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::PeerConnected { server, version } => {
                self.handle_peer_connected(&server, &version);
            }
            NodeEvent::PeerDisconnected { server } => {
                self.handle_peer_disconnected(&server);
            }
            NodeEvent::PeerMessage { server, message } => {
                self.handle_peer_message(&server, message).await;
            }
            NodeEvent::ReconnectDue { server } => {
                if let Some(server) = self.servers.get(&server) {
                    server.reconnect_due();
                    server.connect(
                        &self.settings.key,
                        &self.settings.version,
                        self.settings.handshake_timeout,
                        self.events_tx.clone(),
                    );
                }
            }
            NodeEvent::EnteredGate { entity, gate } => {
                self.trigger_entry(entity, &gate);
            }
            NodeEvent::CountdownTick {
                entity,
                remaining_ms,
            } => {
                self.countdown_tick(entity, remaining_ms);
            }
            NodeEvent::CountdownExpired { entity } => {
                self.countdown_expired(entity);
            }
            NodeEvent::ArrivalWindowExpired { reservation } => {
                self.arrival_window_expired(reservation);
            }
            NodeEvent::LocalChat { entity, message } => {
                self.relay_local_chat(entity, &message);
            }
            NodeEvent::KeepaliveTick => {
                self.keepalive_tick();
            }
            NodeEvent::Shutdown => {}
        }
    }

    fn handle_peer_connected(&mut self, server_name: &str, version: &str) {
        let Some(server) = self.servers.get(server_name) else {
            return;
        };
        server.on_connected(version);
        server.send_if_connected(Message::RefreshData(self.refresh_payload()));

        // Re-announce which of their gates our open gates feed into.
        let attaches: Vec<(String, String)> = self
            .gates
            .local_gates()
            .filter(|g| g.is_open())
            .filter_map(|g| {
                let dest = g.destination().ok()?;
                let remote = self.gates.get(dest)?.as_remote()?;
                if remote.server == server_name {
                    Some((remote.local_name(), g.full_name()))
                } else {
                    None
                }
            })
            .collect();
        for (to, from) in attaches {
            server.send_if_connected(Message::GateAttach { to, from });
        }
    }

    /// Disconnect cleanup; idempotent. Clears the live-connection
    /// reference, fails this server's pending requests, drops its remote
    /// gates, and schedules the reconnect.
    fn handle_peer_disconnected(&mut self, server_name: &str) {
        let Some(server) = self.servers.get(server_name) else {
            return;
        };
        if !server.on_disconnected() {
            debug!(server = %server_name, "stale disconnect from a replaced connection");
            return;
        }
        self.correlator.fail_all_for(server_name);
        let removed = self.gates.remove_for_server(server_name);
        if !removed.is_empty() {
            debug!(server = %server_name, count = removed.len(), "dropped remote gates");
        }
        self.schedule_reconnect(&server);
    }

    /// Schedule a reconnect after the fixed delay. Unbounded retry: every
    /// disconnect schedules the next attempt while the server is enabled.
    fn schedule_reconnect(&self, server: &Arc<Server>) {
        if !server.claim_reconnect() {
            return;
        }
        let name = server.name().to_string();
        let delay = self.settings.reconnect_interval;
        let events = self.events_tx.clone();
        debug!(server = %name, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(NodeEvent::ReconnectDue { server: name }).await;
        });
    }

    async fn handle_peer_message(&mut self, server_name: &str, message: Message) {
        let Some(server) = self.servers.get(server_name) else {
            return;
        };
        match message {
            Message::Ping { time } => {
                server.send_if_connected(Message::Pong { time });
            }
            Message::Pong { time } => {
                debug!(server = %server_name, time, "pong");
            }
            Message::ApiRequest {
                id,
                target,
                method,
                args,
            } => {
                let reply = match api::invoke(self, &target, &method, &args) {
                    Ok(result) => Message::ApiResponse {
                        id,
                        result: Some(result),
                        error: None,
                    },
                    Err(e) => Message::ApiResponse {
                        id,
                        result: None,
                        error: Some(e.to_string()),
                    },
                };
                server.send_if_connected(reply);
            }
            Message::ApiResponse { id, result, error } => {
                let outcome = match error {
                    Some(message) => Err(MeshError::Remote(message)),
                    None => Ok(result.unwrap_or_default()),
                };
                self.correlator.resolve(id, outcome);
            }
            Message::Refresh => {
                server.send_if_connected(Message::RefreshData(self.refresh_payload()));
            }
            Message::RefreshData(payload) => {
                server.apply_refresh(&payload);
                self.gates.remove_for_server(server_name);
                for summary in &payload.gates {
                    if let Err(e) = self.gates.add_remote(server_name, summary) {
                        warn!(server = %server_name, error = %e, "bad gate in refresh");
                    }
                }
                debug!(
                    server = %server_name,
                    worlds = payload.worlds.len(),
                    gates = payload.gates.len(),
                    "applied refresh"
                );
            }
            Message::GateAdded { name, kind } => {
                let summary = gatemesh_core::GateSummary { name, kind };
                if let Err(e) = self.gates.add_remote(server_name, &summary) {
                    warn!(server = %server_name, error = %e, "bad gate announcement");
                }
            }
            Message::GateRemoved { name } => {
                self.gates.remove(&format!("{server_name}.{name}"));
            }
            Message::GateAttach { to, from } => {
                let from_full = format!("{server_name}.{from}");
                match self.gates.local_mut(&to) {
                    Some(gate) => gate.attach(&from_full),
                    None => warn!(server = %server_name, gate = %to, "attach to unknown gate"),
                }
            }
            Message::GateDetach { to, from } => {
                let from_full = format!("{server_name}.{from}");
                if let Some(gate) = self.gates.local_mut(&to) {
                    gate.detach(&from_full);
                }
            }
            Message::Chat {
                player,
                world,
                message,
                to_gates,
            } => {
                self.relay_remote_chat(&server, &player, &world, &message, to_gates);
            }
            Message::PrivateMessage { from, to, message } => {
                self.deliver_private_message(server_name, &from, &to, &message);
            }
            Message::WorldLoad { world } => {
                server.add_remote_world(&world);
            }
            Message::WorldUnload { world } => {
                server.remove_remote_world(&world);
            }
            Message::PlayerJoin { name, world } => {
                server.player_joined(&name, &world);
            }
            Message::PlayerQuit { name } => {
                server.player_quit(&name);
            }
            Message::Reservation { reservation } => {
                self.receive_reservation(&server, &reservation);
            }
            Message::ReservationApproved { id } => {
                self.reservation_approved(id);
            }
            Message::ReservationDenied { id, reason } => {
                self.reservation_denied(id, &reason);
            }
            Message::ReservationArrived { id } => {
                self.reservation_arrived(id);
            }
            Message::Error { message } => {
                warn!(server = %server_name, "server complained: {message}");
            }
            Message::Handshake { .. } | Message::HandshakeAck { .. } => {
                warn!(server = %server_name, "handshake message on established connection");
                server.disconnect(true);
            }
        }
    }

    pub fn refresh_payload(&self) -> RefreshPayload {
        RefreshPayload {
            version: self.settings.version.clone(),
            worlds: self.worlds.world_names(),
            gates: self.gates.local_summaries(),
            players: self
                .worlds
                .players()
                .into_iter()
                .map(|(_, name, world)| gatemesh_core::PlayerSummary {
                    name,
                    world,
                    display_name: None,
                })
                .collect(),
        }
    }

    /// Ping links that have gone send-idle; cut links that have gone silent.
    fn keepalive_tick(&self) {
        let interval = self.settings.keepalive_interval;
        for server in self.servers.all() {
            let Some(conn) = server.connection() else {
                continue;
            };
            if !conn.is_authenticated() {
                continue;
            }
            if conn.idle_recv() > interval * 3 {
                warn!(server = %server.name(), "no keepalive received, disconnecting");
                server.disconnect(true);
                continue;
            }
            if conn.idle_send() >= interval {
                server.send_if_connected(Message::Ping { time: now_millis() });
            }
        }
    }

    /// Open a local gate and notify the destination's owner.
    pub fn open_gate(&mut self, full_name: &str) -> MeshResult<()> {
        let gate = self
            .gates
            .local_mut(full_name)
            .ok_or_else(|| MeshError::Validation(format!("unknown gate '{full_name}'")))?;
        gate.open()?;
        let from = gate.full_name();
        let dest = gate.destination()?.to_string();

        match self.gates.get(&dest) {
            Some(dest_gate) => {
                if let Some(remote) = dest_gate.as_remote() {
                    if let Some(server) = self.servers.get(&remote.server) {
                        server.send_if_connected(Message::GateAttach {
                            to: remote.local_name(),
                            from,
                        });
                    }
                } else {
                    let dest_name = dest_gate.full_name();
                    if let Some(local_dest) = self.gates.local_mut(&dest_name) {
                        local_dest.attach(&from);
                    }
                }
                Ok(())
            }
            None => Err(MeshError::Validation(format!(
                "unknown or offline gate '{dest}'"
            ))),
        }
    }

    /// Close a local gate and detach it from its destination.
    pub fn close_gate(&mut self, full_name: &str) -> MeshResult<()> {
        let gate = self
            .gates
            .local_mut(full_name)
            .ok_or_else(|| MeshError::Validation(format!("unknown gate '{full_name}'")))?;
        let dest = gate.destination().ok().map(str::to_string);
        let from = gate.full_name();
        gate.close();
        for entity in self.reservations.cancel_countdowns_for_gate(&from) {
            self.reservations.release_gate_lock(entity);
            self.notify_actor(entity, "teleport cancelled");
        }

        if let Some(dest) = dest {
            match self.gates.get(&dest) {
                Some(dest_gate) => {
                    if let Some(remote) = dest_gate.as_remote() {
                        if let Some(server) = self.servers.get(&remote.server) {
                            server.send_if_connected(Message::GateDetach {
                                to: remote.local_name(),
                                from,
                            });
                        }
                    } else {
                        let dest_name = dest_gate.full_name();
                        if let Some(local_dest) = self.gates.local_mut(&dest_name) {
                            local_dest.detach(&from);
                        }
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Broadcast a message to every connected server.
    fn broadcast(&self, message: Message) {
        for server in self.servers.all() {
            server.send_if_connected(message.clone());
        }
    }

    /// Register a freshly built local gate and announce it to the mesh.
    pub fn add_gate(&mut self, gate: LocalGate) -> MeshResult<()> {
        let summary = gate.summary();
        self.gates.add_local(gate)?;
        self.broadcast(Message::GateAdded {
            name: summary.name,
            kind: summary.kind,
        });
        Ok(())
    }

    /// Destroy a local gate: close it, drop it from the registry, and
    /// announce the removal.
    pub fn destroy_gate(&mut self, full_name: &str) -> MeshResult<()> {
        if self.gates.local(full_name).is_none() {
            return Err(MeshError::Validation(format!(
                "unknown gate '{full_name}'"
            )));
        }
        let _ = self.close_gate(full_name);
        self.gates.remove(full_name);
        self.broadcast(Message::GateRemoved {
            name: full_name.to_string(),
        });
        Ok(())
    }

    /// Bring a world up and announce it.
    pub fn load_world(&mut self, world: crate::world::World) {
        let name = world.name.clone();
        self.worlds.add_world(world);
        self.broadcast(Message::WorldLoad { world: name });
    }

    /// Take a world down: its gates are destroyed, then the unload is
    /// announced.
    pub fn unload_world(&mut self, name: &str) -> MeshResult<()> {
        let doomed: Vec<String> = self
            .gates
            .local_gates()
            .filter(|g| g.world() == name)
            .map(|g| g.full_name())
            .collect();
        for gate in doomed {
            let _ = self.destroy_gate(&gate);
        }
        if !self.worlds.remove_world(name) {
            return Err(MeshError::Validation(format!("unknown world '{name}'")));
        }
        self.broadcast(Message::WorldUnload {
            world: name.to_string(),
        });
        Ok(())
    }

    /// Announce a player coming online to every peer.
    pub fn announce_player_join(&self, name: &str, world: &str) {
        self.broadcast(Message::PlayerJoin {
            name: name.to_string(),
            world: world.to_string(),
        });
    }

    /// Announce a player going offline to every peer.
    pub fn announce_player_quit(&self, name: &str) {
        self.broadcast(Message::PlayerQuit {
            name: name.to_string(),
        });
    }

    /// One user-visible line to whoever triggered an operation.
    pub fn notify_actor(&self, entity: u64, message: impl Into<String>) {
        self.worlds.notify(entity, message);
    }

    pub(crate) fn deliver_private_message(&self, server_name: &str, from: &str, to: &str, message: &str) {
        match self.worlds.entity_by_name(to) {
            Some(id) => {
                self.worlds
                    .notify(id, format!("[{server_name}] {from} -> you: {message}"));
            }
            None => {
                debug!(server = %server_name, player = %to, "private message for unknown player");
            }
        }
    }

    /// Route a private message to a local player or to whichever server
    /// currently hosts the named player.
    pub fn send_private_message(
        &self,
        from_entity: u64,
        to_player: &str,
        message: &str,
    ) -> MeshResult<()> {
        let from = self
            .worlds
            .entity_name(from_entity)
            .ok_or_else(|| MeshError::Validation("only players can send messages".into()))?;

        if let Some(local) = self.worlds.entity_by_name(to_player) {
            self.worlds
                .notify(local, format!("{from} -> you: {message}"));
            return Ok(());
        }

        for server in self.servers.all() {
            if server.has_remote_player(to_player) {
                return server.send(Message::PrivateMessage {
                    from,
                    to: to_player.to_string(),
                    message: message.to_string(),
                });
            }
        }
        Err(MeshError::Validation(format!(
            "player '{to_player}' is not online anywhere"
        )))
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub const ALPHA_CONFIG: &str = r#"
        [node]
        name = "alpha"
        address = "127.0.0.1:0"
        key = "alpha-key"

        [network]
        reconnect_interval = 50
        api_timeout = 200
        arrival_window = 200
        gate_lock_expiration = 100

        [[servers]]
        name = "beta"
        address = "127.0.0.1:1"
        key = "beta-key"

        [[worlds]]
        name = "overworld"
        seed = 4242

        [[worlds]]
        name = "nether"
        seed = 777

        [[gates]]
        name = "east"
        world = "overworld"
        spawn = [100.0, 64.0, 0.0]
        links = ["overworld.west"]
        open = true

        [[gates]]
        name = "west"
        world = "overworld"
        spawn = [-100.0, 64.0, 0.0]

        [[balances]]
        account = "alice"
        amount = 100.0
    "#;

    pub fn test_node(config: &str) -> Node {
        let config = ConfigFile::parse(config).unwrap();
        Node::new(&config).unwrap()
    }

    pub fn alpha_node() -> Node {
        test_node(ALPHA_CONFIG)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use gatemesh_core::{GateKind, GateSummary, PlayerSummary};

    fn beta_refresh() -> RefreshPayload {
        RefreshPayload {
            version: "0.1.0".into(),
            worlds: vec!["overworld".into()],
            gates: vec![GateSummary {
                name: "overworld.arch".into(),
                kind: GateKind::Block,
            }],
            players: vec![PlayerSummary {
                name: "bob".into(),
                world: "overworld".into(),
                display_name: None,
            }],
        }
    }

    #[tokio::test]
    async fn refresh_builds_remote_inventory() {
        let mut node = alpha_node();
        node.handle_event(NodeEvent::PeerMessage {
            server: "beta".into(),
            message: Message::RefreshData(beta_refresh()),
        })
        .await;

        assert!(node.gates.get("beta.overworld.arch").is_some());
        let beta = node.servers.get("beta").unwrap();
        assert!(beta.has_remote_world("overworld"));
        assert!(beta.has_remote_player("bob"));
    }

    #[tokio::test]
    async fn disconnect_clears_pending_and_remote_gates() {
        let mut node = alpha_node();
        node.handle_event(NodeEvent::PeerMessage {
            server: "beta".into(),
            message: Message::RefreshData(beta_refresh()),
        })
        .await;

        let (_, rx) = node.correlator.register("beta");
        node.handle_event(NodeEvent::PeerDisconnected {
            server: "beta".into(),
        })
        .await;

        assert!(matches!(
            rx.await.unwrap().unwrap_err(),
            MeshError::NotConnected
        ));
        assert!(node.gates.get("beta.overworld.arch").is_none());
        assert!(!node.servers.get("beta").unwrap().has_remote_world("overworld"));
        // repeat is harmless
        node.handle_event(NodeEvent::PeerDisconnected {
            server: "beta".into(),
        })
        .await;
    }

    #[tokio::test]
    async fn gate_attach_and_detach_mark_incoming() {
        let mut node = alpha_node();
        node.handle_event(NodeEvent::PeerMessage {
            server: "beta".into(),
            message: Message::GateAttach {
                to: "overworld.east".into(),
                from: "overworld.arch".into(),
            },
        })
        .await;
        assert_eq!(
            node.gates
                .local("overworld.east")
                .unwrap()
                .incoming()
                .collect::<Vec<_>>(),
            vec!["beta.overworld.arch"]
        );

        node.handle_event(NodeEvent::PeerMessage {
            server: "beta".into(),
            message: Message::GateDetach {
                to: "overworld.east".into(),
                from: "overworld.arch".into(),
            },
        })
        .await;
        assert_eq!(
            node.gates.local("overworld.east").unwrap().incoming().count(),
            0
        );
    }

    #[tokio::test]
    async fn response_with_unknown_id_is_dropped_silently() {
        let mut node = alpha_node();
        node.handle_event(NodeEvent::PeerMessage {
            server: "beta".into(),
            message: Message::ApiResponse {
                id: 9999,
                result: Some(gatemesh_core::Document::new().with("result", 1)),
                error: None,
            },
        })
        .await;
        assert_eq!(node.correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn world_load_unload_tracked_per_server() {
        let mut node = alpha_node();
        node.handle_event(NodeEvent::PeerMessage {
            server: "beta".into(),
            message: Message::WorldLoad {
                world: "the_end".into(),
            },
        })
        .await;
        assert!(node.servers.get("beta").unwrap().has_remote_world("the_end"));

        node.handle_event(NodeEvent::PeerMessage {
            server: "beta".into(),
            message: Message::WorldUnload {
                world: "the_end".into(),
            },
        })
        .await;
        assert!(!node.servers.get("beta").unwrap().has_remote_world("the_end"));
    }

    #[tokio::test]
    async fn unload_world_destroys_its_gates() {
        let mut node = alpha_node();
        node.unload_world("overworld").unwrap();

        assert!(node.gates.local("overworld.east").is_none());
        assert!(node.gates.local("overworld.west").is_none());
        assert!(!node.worlds.has_world("overworld"));
        assert!(node.worlds.has_world("nether"));
        assert!(node.unload_world("overworld").is_err());
    }

    #[tokio::test]
    async fn add_and_destroy_gate() {
        let mut node = alpha_node();
        let gate = crate::gate::LocalGate::new(
            "spire",
            "nether",
            GateKind::Server,
            crate::world::Position::new(0.0, 80.0, 0.0),
        )
        .unwrap();
        node.add_gate(gate).unwrap();
        assert!(node.gates.local("nether.spire").is_some());

        node.destroy_gate("nether.spire").unwrap();
        assert!(node.gates.local("nether.spire").is_none());
        assert!(node.destroy_gate("nether.spire").is_err());
    }

    #[test]
    fn gate_options_by_name() {
        let mut node = alpha_node();
        node.set_gate_option("ops", "overworld.east", "sendServerCost", "12.5")
            .unwrap();
        assert_eq!(
            node.get_gate_option("overworld.east", "sendServerCost")
                .unwrap(),
            "12.5"
        );
        assert!(node
            .set_gate_option("ops", "overworld.east", "sendServerCost", "-1")
            .is_err());
        assert!(node
            .get_gate_option("overworld.east", "wormholeFactor")
            .is_err());
        assert!(node.gate_option_names().contains(&"countdown"));
    }

    #[test]
    fn server_options_by_name() {
        let node = alpha_node();
        assert_eq!(
            node.get_server_option("beta", "sendChat").unwrap(),
            "false"
        );
        node.set_server_option("ops", "beta", "sendChat", "true")
            .unwrap();
        node.set_server_option("ops", "beta", "sendChatFilter", "[mesh]")
            .unwrap();
        let beta = node.servers.get("beta").unwrap();
        assert!(beta.can_send_chat("[mesh] hello"));
        assert!(!beta.can_send_chat("hello"));
    }

    #[test]
    fn open_gate_requires_resolvable_destination() {
        let mut node = alpha_node();
        // west has no links
        assert!(node.open_gate("overworld.west").is_err());
        // east links to west; opening attaches
        assert!(node.open_gate("overworld.east").is_ok());
        assert_eq!(
            node.gates
                .local("overworld.west")
                .unwrap()
                .incoming()
                .collect::<Vec<_>>(),
            vec!["overworld.east"]
        );

        node.close_gate("overworld.east").unwrap();
        assert_eq!(
            node.gates.local("overworld.west").unwrap().incoming().count(),
            0
        );
    }
}
