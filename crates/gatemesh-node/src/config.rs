//! Node configuration: TOML file + CLI overrides.
//!
//! The file carries the node's own identity, network tuning knobs, and the
//! reloadable server/world/gate lists. Every knob has a default so a
//! minimal config is just a `[node]` section.

use crate::gate::{is_valid_name, GateCosts, LocalGate, Region};
use crate::permissions::PermissionRule;
use crate::world::{Position, World};
use gatemesh_core::{GateKind, MeshError, MeshResult};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub worlds: Vec<WorldEntry>,
    #[serde(default)]
    pub gates: Vec<GateEntry>,
    #[serde(default)]
    pub balances: Vec<BalanceEntry>,
    #[serde(default)]
    pub permissions: Vec<PermissionEntry>,
}

/// `[node]` section: who we are.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    pub name: String,
    #[serde(default = "default_listen")]
    pub address: String,
    /// This node's shared key; remote configs reference it in their server
    /// entries.
    pub key: String,
}

/// `[network]` section: timers and windows, all in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    #[serde(default = "default_api_timeout")]
    pub api_timeout: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
    #[serde(default = "default_arrival_window")]
    pub arrival_window: u64,
    #[serde(default = "default_gate_lock")]
    pub gate_lock_expiration: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            reconnect_interval: default_reconnect_interval(),
            handshake_timeout: default_handshake_timeout(),
            api_timeout: default_api_timeout(),
            keepalive_interval: default_keepalive_interval(),
            arrival_window: default_arrival_window(),
            gate_lock_expiration: default_gate_lock(),
        }
    }
}

/// `[[servers]]`: one configured remote peer.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub address: String,
    /// The remote node's key.
    pub key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub send_chat: bool,
    #[serde(default)]
    pub receive_chat: bool,
    #[serde(default)]
    pub send_chat_filter: Option<String>,
    #[serde(default)]
    pub receive_chat_filter: Option<String>,
}

/// `[[worlds]]`: one world hosted by this node.
#[derive(Debug, Clone, Deserialize)]
pub struct WorldEntry {
    pub name: String,
    #[serde(default)]
    pub seed: i64,
    #[serde(default)]
    pub time: i64,
    #[serde(default = "default_difficulty")]
    pub difficulty: String,
    #[serde(default)]
    pub spawn: [f64; 3],
}

/// `[[gates]]`: one local gate.
#[derive(Debug, Clone, Deserialize)]
pub struct GateEntry {
    pub name: String,
    pub world: String,
    #[serde(default = "default_gate_kind")]
    pub kind: String,
    #[serde(default)]
    pub spawn: [f64; 3],
    #[serde(default)]
    pub region_min: Option<[f64; 3]>,
    #[serde(default)]
    pub region_max: Option<[f64; 3]>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub open: bool,
    #[serde(default = "default_true")]
    pub send_next_link: bool,
    #[serde(default = "default_true")]
    pub multi_link: bool,
    #[serde(default)]
    pub send_local_cost: f64,
    #[serde(default)]
    pub send_world_cost: f64,
    #[serde(default)]
    pub send_server_cost: f64,
    #[serde(default)]
    pub receive_local_cost: f64,
    #[serde(default)]
    pub receive_world_cost: f64,
    #[serde(default)]
    pub receive_server_cost: f64,
    #[serde(default)]
    pub countdown: u64,
    #[serde(default = "default_countdown_interval")]
    pub countdown_interval: u64,
    #[serde(default = "default_countdown_radius")]
    pub countdown_radius: f64,
    #[serde(default)]
    pub send_chat: bool,
    #[serde(default)]
    pub receive_chat: bool,
    #[serde(default)]
    pub chat_send_proximity: f64,
    #[serde(default)]
    pub chat_receive_proximity: f64,
    #[serde(default)]
    pub trigger_vehicles: bool,
}

/// `[[balances]]`: starting funds for an account.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceEntry {
    pub account: String,
    pub amount: f64,
}

/// `[[permissions]]`: one permission rule, first match wins.
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionEntry {
    #[serde(default)]
    pub actor: Option<String>,
    pub node: String,
    pub allow: bool,
}

fn default_listen() -> String {
    "0.0.0.0:25560".to_string()
}
fn default_reconnect_interval() -> u64 {
    10_000
}
fn default_handshake_timeout() -> u64 {
    5_000
}
fn default_api_timeout() -> u64 {
    5_000
}
fn default_keepalive_interval() -> u64 {
    30_000
}
fn default_arrival_window() -> u64 {
    15_000
}
fn default_gate_lock() -> u64 {
    2_000
}
fn default_true() -> bool {
    true
}
fn default_difficulty() -> String {
    "normal".to_string()
}
fn default_gate_kind() -> String {
    "area".to_string()
}
fn default_countdown_interval() -> u64 {
    1_000
}
fn default_countdown_radius() -> f64 {
    5.0
}

/// Resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub name: String,
    pub address: String,
    pub key: String,
    pub version: String,
    pub reconnect_interval: Duration,
    pub handshake_timeout: Duration,
    pub api_timeout: Duration,
    pub keepalive_interval: Duration,
    pub arrival_window: Duration,
    pub gate_lock_expiration: Duration,
}

impl ConfigFile {
    pub fn load(path: &Path) -> MeshResult<Self> {
        info!(path = %path.display(), "loading config file");
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> MeshResult<Self> {
        let config: ConfigFile = toml::from_str(content)
            .map_err(|e| MeshError::Validation(format!("config parse error: {e}")))?;
        if !is_valid_name(&config.node.name) {
            return Err(MeshError::Validation(format!(
                "'{}' is not a valid node name",
                config.node.name
            )));
        }
        Ok(config)
    }

    pub fn settings(&self) -> Settings {
        Settings {
            name: self.node.name.clone(),
            address: self.node.address.clone(),
            key: self.node.key.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            reconnect_interval: Duration::from_millis(self.network.reconnect_interval),
            handshake_timeout: Duration::from_millis(self.network.handshake_timeout),
            api_timeout: Duration::from_millis(self.network.api_timeout),
            keepalive_interval: Duration::from_millis(self.network.keepalive_interval),
            arrival_window: Duration::from_millis(self.network.arrival_window),
            gate_lock_expiration: Duration::from_millis(self.network.gate_lock_expiration),
        }
    }
}

fn pos(v: [f64; 3]) -> Position {
    Position::new(v[0], v[1], v[2])
}

impl WorldEntry {
    pub fn build(&self) -> World {
        World {
            name: self.name.clone(),
            seed: self.seed,
            time: self.time,
            difficulty: self.difficulty.clone(),
            spawn: pos(self.spawn),
        }
    }
}

impl GateEntry {
    pub fn build(&self) -> MeshResult<LocalGate> {
        let kind = match self.kind.as_str() {
            "block" => GateKind::Block,
            "area" => GateKind::Area,
            "server" => GateKind::Server,
            other => {
                return Err(MeshError::Validation(format!(
                    "unknown gate kind '{other}'"
                )))
            }
        };
        let mut gate = LocalGate::new(&self.name, &self.world, kind, pos(self.spawn))?;
        if let (Some(min), Some(max)) = (self.region_min, self.region_max) {
            gate.region = Region {
                min: pos(min),
                max: pos(max),
            };
        }
        for link in &self.links {
            gate.add_link(link)?;
        }
        gate.send_next_link = self.send_next_link;
        gate.multi_link = self.multi_link;
        gate.countdown_ms = self.countdown;
        gate.countdown_interval_ms = self.countdown_interval.max(1);
        gate.countdown_radius = self.countdown_radius;
        gate.policy.costs = GateCosts {
            send_local: self.send_local_cost,
            send_world: self.send_world_cost,
            send_server: self.send_server_cost,
            receive_local: self.receive_local_cost,
            receive_world: self.receive_world_cost,
            receive_server: self.receive_server_cost,
        };
        gate.policy.send_chat = self.send_chat;
        gate.policy.receive_chat = self.receive_chat;
        gate.policy.chat_send_proximity = self.chat_send_proximity;
        gate.policy.chat_receive_proximity = self.chat_receive_proximity;
        gate.policy.trigger_vehicles = self.trigger_vehicles;
        if self.open {
            gate.open()?;
        }
        Ok(gate)
    }
}

impl PermissionEntry {
    pub fn build(&self) -> PermissionRule {
        PermissionRule {
            actor: self.actor.clone(),
            node: self.node.clone(),
            allow: self.allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [node]
        name = "alpha"
        address = "127.0.0.1:25560"
        key = "alpha-key"

        [network]
        api_timeout = 2500

        [[servers]]
        name = "beta"
        address = "127.0.0.1:25561"
        key = "beta-key"
        send_chat = true

        [[worlds]]
        name = "overworld"
        seed = 4242

        [[gates]]
        name = "east"
        world = "overworld"
        kind = "area"
        spawn = [100.0, 64.0, 0.0]
        links = ["beta.overworld.arch"]
        open = true
        send_server_cost = 10.0
        countdown = 3000

        [[balances]]
        account = "alice"
        amount = 100.0
    "#;

    #[test]
    fn parse_sample() {
        let config = ConfigFile::parse(SAMPLE).unwrap();
        assert_eq!(config.node.name, "alpha");
        assert_eq!(config.servers.len(), 1);
        assert!(config.servers[0].enabled);

        let settings = config.settings();
        assert_eq!(settings.api_timeout, Duration::from_millis(2500));
        assert_eq!(settings.reconnect_interval, Duration::from_millis(10_000));
    }

    #[test]
    fn gate_entry_builds_open_gate() {
        let config = ConfigFile::parse(SAMPLE).unwrap();
        let gate = config.gates[0].build().unwrap();
        assert!(gate.is_open());
        assert_eq!(gate.destination().unwrap(), "beta.overworld.arch");
        assert_eq!(gate.policy.costs.send_server, 10.0);
        assert_eq!(gate.countdown_ms, 3000);
    }

    #[test]
    fn bad_node_name_rejected() {
        let bad = SAMPLE.replace("name = \"alpha\"", "name = \"al.pha\"");
        assert!(ConfigFile::parse(&bad).is_err());
    }

    #[test]
    fn bad_gate_kind_rejected() {
        let config = ConfigFile::parse(SAMPLE).unwrap();
        let mut entry = config.gates[0].clone();
        entry.kind = "wormhole".into();
        assert!(entry.build().is_err());
    }
}
