//! The gate family and the process-wide gate registry.
//!
//! Gates come in three structural kinds (block-built, area, server-anchor)
//! and two locations (this node, a remote node), modeled as a tagged
//! variant rather than a hierarchy. Local gates carry the full policy
//! record; remote gates are nameplates owned by their server and dropped
//! when that server detaches them or disconnects.

use crate::options::{parse_bool, parse_cost, parse_millis, OptionTable};
use crate::world::Position;
use gatemesh_core::{GateKind, GateSummary, MeshError, MeshResult};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Maximum characters in a bare gate name.
pub const MAX_NAME_LEN: usize = 15;

/// `true` when `name` may be used for a gate or server: short, and free of
/// the characters that structure full names and permission nodes.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.contains(['.', '*'])
        && !name.contains(char::is_whitespace)
}

/// An axis-aligned portal region.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Region {
    pub min: Position,
    pub max: Position,
}

impl Region {
    pub fn contains(&self, p: &Position) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }
}

/// Six cost fields: send/receive crossed with how far the trip goes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GateCosts {
    pub send_local: f64,
    pub send_world: f64,
    pub send_server: f64,
    pub receive_local: f64,
    pub receive_world: f64,
    pub receive_server: f64,
}

/// Per-gate policy shared by every gate variant.
#[derive(Debug, Clone)]
pub struct GatePolicy {
    pub costs: GateCosts,
    /// Gate structure is protected from modification while the gate exists.
    pub protect: bool,
    pub trigger_players: bool,
    pub trigger_vehicles: bool,
    pub send_chat: bool,
    pub receive_chat: bool,
    pub send_chat_filter: Option<String>,
    pub receive_chat_filter: Option<String>,
    pub chat_send_proximity: f64,
    pub chat_receive_proximity: f64,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            costs: GateCosts::default(),
            protect: true,
            trigger_players: true,
            trigger_vehicles: false,
            send_chat: false,
            receive_chat: false,
            send_chat_filter: None,
            receive_chat_filter: None,
            chat_send_proximity: 0.0,
            chat_receive_proximity: 0.0,
        }
    }
}

fn filter_matches(filter: &Option<String>, message: &str) -> bool {
    match filter {
        Some(f) => message.contains(f.as_str()),
        None => true,
    }
}

/// A gate hosted on this node.
#[derive(Debug, Clone)]
pub struct LocalGate {
    name: String,
    world: String,
    kind: GateKind,
    pub spawn: Position,
    pub region: Region,
    open: bool,
    links: Vec<String>,
    /// The shared multi-link cursor: one per gate, advanced by departures,
    /// never per-reservation.
    outgoing: Option<String>,
    pub send_next_link: bool,
    pub multi_link: bool,
    /// Countdown before departure, in ms. Zero disables the countdown.
    pub countdown_ms: u64,
    pub countdown_interval_ms: u64,
    /// Moving farther than this from the spawn cancels a running countdown.
    pub countdown_radius: f64,
    pub policy: GatePolicy,
    incoming: BTreeSet<String>,
}

impl LocalGate {
    pub fn new(name: &str, world: &str, kind: GateKind, spawn: Position) -> MeshResult<Self> {
        if !is_valid_name(name) {
            return Err(MeshError::Validation(format!(
                "'{name}' is not a valid gate name"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            world: world.to_string(),
            kind,
            spawn,
            region: Region {
                min: spawn,
                max: spawn,
            },
            open: false,
            links: Vec::new(),
            outgoing: None,
            send_next_link: true,
            multi_link: true,
            countdown_ms: 0,
            countdown_interval_ms: 1000,
            countdown_radius: 5.0,
            policy: GatePolicy::default(),
            incoming: BTreeSet::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn world(&self) -> &str {
        &self.world
    }

    pub fn kind(&self) -> GateKind {
        self.kind
    }

    /// `world.name`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.world, self.name)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn links(&self) -> &[String] {
        &self.links
    }

    pub fn outgoing(&self) -> Option<&str> {
        self.outgoing.as_deref()
    }

    pub fn add_link(&mut self, to_full_name: &str) -> MeshResult<()> {
        if !self.links.is_empty() && !self.multi_link {
            return Err(MeshError::Validation(format!(
                "gate '{}' cannot accept multiple links",
                self.name
            )));
        }
        if self.links.iter().any(|l| l == to_full_name) {
            return Err(MeshError::Validation(format!(
                "gate '{}' is already linked to '{to_full_name}'",
                self.name
            )));
        }
        self.links.push(to_full_name.to_string());
        Ok(())
    }

    pub fn remove_link(&mut self, to_full_name: &str) -> MeshResult<()> {
        let idx = self
            .links
            .iter()
            .position(|l| l == to_full_name)
            .ok_or_else(|| {
                MeshError::Validation(format!(
                    "gate '{}' is not linked to '{to_full_name}'",
                    self.name
                ))
            })?;
        self.links.remove(idx);
        if self.outgoing.as_deref() == Some(to_full_name) {
            self.outgoing = None;
        }
        Ok(())
    }

    pub fn has_link(&self, to_full_name: &str) -> bool {
        self.links.iter().any(|l| l == to_full_name)
    }

    /// Advance the shared link cursor one step, round-robin.
    ///
    /// Every departure through a `send_next_link` gate calls this once, so
    /// concurrent departures interleave destinations. That interleaving is
    /// the designed behavior, not a race to fix.
    pub fn next_link(&mut self) -> MeshResult<()> {
        if self.links.len() == 1 && self.outgoing.as_deref() == Some(&self.links[0]) {
            return Ok(());
        }
        match &self.outgoing {
            Some(current) if self.has_link(current) => {
                let i = self.links.iter().position(|l| l == current).unwrap();
                self.outgoing = Some(self.links[(i + 1) % self.links.len()].clone());
            }
            _ => {
                if self.links.is_empty() {
                    return Err(MeshError::Validation("this gate has no links".into()));
                }
                self.outgoing = Some(self.links[0].clone());
            }
        }
        Ok(())
    }

    /// The currently selected destination's full name.
    pub fn destination(&self) -> MeshResult<&str> {
        match &self.outgoing {
            None if self.links.is_empty() => {
                Err(MeshError::Validation("this gate has no links".into()))
            }
            None => Err(MeshError::Validation("this gate has no link selected".into())),
            Some(out) if !self.has_link(out) => Err(MeshError::Validation(
                "this gate's selected link is invalid".into(),
            )),
            Some(out) => Ok(out.as_str()),
        }
    }

    /// Open the portal, selecting the first link when none is selected.
    pub fn open(&mut self) -> MeshResult<()> {
        if self.open {
            return Ok(());
        }
        if self.outgoing.is_none() || !self.has_link(self.outgoing.as_ref().unwrap()) {
            if self.links.is_empty() {
                return Err(MeshError::Validation("this gate has no links".into()));
            }
            self.outgoing = Some(self.links[0].clone());
        }
        self.open = true;
        Ok(())
    }

    pub fn close(&mut self) {
        self.open = false;
        self.incoming.clear();
    }

    /// Record that `from_full_name` now sends here.
    pub fn attach(&mut self, from_full_name: &str) {
        self.incoming.insert(from_full_name.to_string());
    }

    pub fn detach(&mut self, from_full_name: &str) {
        self.incoming.remove(from_full_name);
    }

    pub fn incoming(&self) -> impl Iterator<Item = &str> {
        self.incoming.iter().map(|s| s.as_str())
    }

    /// Cost to depart through this gate toward `dest`.
    pub fn send_cost(&self, dest: &Gate) -> f64 {
        match dest {
            Gate::Remote(_) => self.policy.costs.send_server,
            Gate::Local(g) if g.world == self.world => self.policy.costs.send_local,
            Gate::Local(_) => self.policy.costs.send_world,
        }
    }

    /// Cost to arrive at this gate from `origin`.
    pub fn receive_cost(&self, origin: &Gate) -> f64 {
        match origin {
            Gate::Remote(_) => self.policy.costs.receive_server,
            Gate::Local(g) if g.world == self.world => self.policy.costs.receive_local,
            Gate::Local(_) => self.policy.costs.receive_world,
        }
    }

    /// Receive-side cost for an origin that lives on another node.
    pub fn receive_cost_remote(&self) -> f64 {
        self.policy.costs.receive_server
    }

    pub fn can_send_chat(&self, message: &str) -> bool {
        self.policy.send_chat && filter_matches(&self.policy.send_chat_filter, message)
    }

    pub fn can_receive_chat(&self, message: &str) -> bool {
        self.policy.receive_chat && filter_matches(&self.policy.receive_chat_filter, message)
    }

    pub fn in_chat_send_proximity(&self, world: &str, pos: &Position) -> bool {
        self.policy.chat_send_proximity > 0.0
            && world == self.world
            && self.spawn.distance(pos) <= self.policy.chat_send_proximity
    }

    pub fn in_chat_receive_proximity(&self, world: &str, pos: &Position) -> bool {
        self.policy.chat_receive_proximity > 0.0
            && world == self.world
            && self.spawn.distance(pos) <= self.policy.chat_receive_proximity
    }

    pub fn summary(&self) -> GateSummary {
        GateSummary {
            name: format!("{}.{}", self.world, self.name),
            kind: self.kind,
        }
    }
}

/// A gate hosted on a remote node.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteGate {
    pub server: String,
    pub world: String,
    pub name: String,
    pub kind: GateKind,
}

impl RemoteGate {
    /// `server.world.name`
    pub fn full_name(&self) -> String {
        format!("{}.{}.{}", self.server, self.world, self.name)
    }

    /// The name the owning node knows this gate by (`world.name`).
    pub fn local_name(&self) -> String {
        format!("{}.{}", self.world, self.name)
    }

    fn from_summary(server: &str, summary: &GateSummary) -> MeshResult<Self> {
        let (world, name) = summary.name.split_once('.').ok_or_else(|| {
            MeshError::Protocol(format!("bad remote gate name '{}'", summary.name))
        })?;
        Ok(Self {
            server: server.to_string(),
            world: world.to_string(),
            name: name.to_string(),
            kind: summary.kind,
        })
    }
}

/// One member of the gate family.
#[derive(Debug, Clone)]
pub enum Gate {
    Local(LocalGate),
    Remote(RemoteGate),
}

impl Gate {
    pub fn full_name(&self) -> String {
        match self {
            Gate::Local(g) => g.full_name(),
            Gate::Remote(g) => g.full_name(),
        }
    }

    pub fn kind(&self) -> GateKind {
        match self {
            Gate::Local(g) => g.kind(),
            Gate::Remote(g) => g.kind,
        }
    }

    pub fn is_same_server(&self) -> bool {
        matches!(self, Gate::Local(_))
    }

    pub fn as_local(&self) -> Option<&LocalGate> {
        match self {
            Gate::Local(g) => Some(g),
            Gate::Remote(_) => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteGate> {
        match self {
            Gate::Local(_) => None,
            Gate::Remote(g) => Some(g),
        }
    }
}

/// Every gate this node knows about, local and remote, keyed by full name.
#[derive(Debug, Default)]
pub struct GateRegistry {
    gates: BTreeMap<String, Gate>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_local(&mut self, gate: LocalGate) -> MeshResult<()> {
        let full = gate.full_name();
        let clash = self
            .gates
            .keys()
            .any(|k| k.eq_ignore_ascii_case(&full));
        if clash {
            return Err(MeshError::Validation(format!(
                "a gate named '{}' already exists in world '{}'",
                gate.name(),
                gate.world()
            )));
        }
        debug!(gate = %full, "added local gate");
        self.gates.insert(full, Gate::Local(gate));
        Ok(())
    }

    /// Register a gate announced by a remote server.
    pub fn add_remote(&mut self, server: &str, summary: &GateSummary) -> MeshResult<()> {
        let gate = RemoteGate::from_summary(server, summary)?;
        let full = gate.full_name();
        debug!(gate = %full, "added remote gate");
        self.gates.insert(full, Gate::Remote(gate));
        Ok(())
    }

    pub fn remove(&mut self, full_name: &str) -> Option<Gate> {
        let removed = self.gates.remove(full_name);
        if removed.is_some() {
            debug!(gate = %full_name, "removed gate");
            // Anything attached through the removed gate loses its incoming
            // mark; links pointing at it stay and fail resolution instead.
            for gate in self.gates.values_mut() {
                if let Gate::Local(g) = gate {
                    g.detach(full_name);
                }
            }
        }
        removed
    }

    /// Drop every remote gate owned by `server`. Returns the removed names.
    pub fn remove_for_server(&mut self, server: &str) -> Vec<String> {
        let doomed: Vec<String> = self
            .gates
            .iter()
            .filter(|(_, g)| matches!(g, Gate::Remote(r) if r.server == server))
            .map(|(k, _)| k.clone())
            .collect();
        for name in &doomed {
            self.remove(name);
        }
        doomed
    }

    pub fn get(&self, full_name: &str) -> Option<&Gate> {
        self.gates.get(full_name)
    }

    /// Case-insensitive unique-prefix lookup, exact match winning.
    pub fn find(&self, name: &str) -> Option<&Gate> {
        if let Some(gate) = self.gates.get(name) {
            return Some(gate);
        }
        let lower = name.to_lowercase();
        let mut found = None;
        for (key, gate) in &self.gates {
            if key.to_lowercase().starts_with(&lower) {
                if found.is_some() {
                    return None;
                }
                found = Some(gate);
            }
        }
        found
    }

    pub fn local(&self, full_name: &str) -> Option<&LocalGate> {
        self.gates.get(full_name).and_then(Gate::as_local)
    }

    pub fn local_mut(&mut self, full_name: &str) -> Option<&mut LocalGate> {
        match self.gates.get_mut(full_name) {
            Some(Gate::Local(g)) => Some(g),
            _ => None,
        }
    }

    pub fn local_gates(&self) -> impl Iterator<Item = &LocalGate> {
        self.gates.values().filter_map(Gate::as_local)
    }

    pub fn local_summaries(&self) -> Vec<GateSummary> {
        self.local_gates().map(LocalGate::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

/// The option table for local gates, built once at node startup.
pub fn gate_options() -> OptionTable<LocalGate> {
    OptionTable::new("gate.option")
        .register(
            "sendLocalCost",
            |g: &LocalGate| g.policy.costs.send_local.to_string(),
            |g, v| {
                g.policy.costs.send_local = parse_cost("sendLocalCost", v)?;
                Ok(())
            },
        )
        .register(
            "sendWorldCost",
            |g: &LocalGate| g.policy.costs.send_world.to_string(),
            |g, v| {
                g.policy.costs.send_world = parse_cost("sendWorldCost", v)?;
                Ok(())
            },
        )
        .register(
            "sendServerCost",
            |g: &LocalGate| g.policy.costs.send_server.to_string(),
            |g, v| {
                g.policy.costs.send_server = parse_cost("sendServerCost", v)?;
                Ok(())
            },
        )
        .register(
            "receiveLocalCost",
            |g: &LocalGate| g.policy.costs.receive_local.to_string(),
            |g, v| {
                g.policy.costs.receive_local = parse_cost("receiveLocalCost", v)?;
                Ok(())
            },
        )
        .register(
            "receiveWorldCost",
            |g: &LocalGate| g.policy.costs.receive_world.to_string(),
            |g, v| {
                g.policy.costs.receive_world = parse_cost("receiveWorldCost", v)?;
                Ok(())
            },
        )
        .register(
            "receiveServerCost",
            |g: &LocalGate| g.policy.costs.receive_server.to_string(),
            |g, v| {
                g.policy.costs.receive_server = parse_cost("receiveServerCost", v)?;
                Ok(())
            },
        )
        .register(
            "sendNextLink",
            |g: &LocalGate| g.send_next_link.to_string(),
            |g, v| {
                g.send_next_link = parse_bool("sendNextLink", v)?;
                Ok(())
            },
        )
        .register(
            "multiLink",
            |g: &LocalGate| g.multi_link.to_string(),
            |g, v| {
                g.multi_link = parse_bool("multiLink", v)?;
                Ok(())
            },
        )
        .register(
            "protect",
            |g: &LocalGate| g.policy.protect.to_string(),
            |g, v| {
                g.policy.protect = parse_bool("protect", v)?;
                Ok(())
            },
        )
        .register(
            "countdown",
            |g: &LocalGate| g.countdown_ms.to_string(),
            |g, v| {
                g.countdown_ms = parse_millis("countdown", v)?;
                Ok(())
            },
        )
        .register(
            "countdownInterval",
            |g: &LocalGate| g.countdown_interval_ms.to_string(),
            |g, v| {
                let interval = parse_millis("countdownInterval", v)?;
                if interval == 0 {
                    return Err(MeshError::Validation(
                        "countdownInterval must be at least 1".into(),
                    ));
                }
                g.countdown_interval_ms = interval;
                Ok(())
            },
        )
        .register(
            "sendChat",
            |g: &LocalGate| g.policy.send_chat.to_string(),
            |g, v| {
                g.policy.send_chat = parse_bool("sendChat", v)?;
                Ok(())
            },
        )
        .register(
            "receiveChat",
            |g: &LocalGate| g.policy.receive_chat.to_string(),
            |g, v| {
                g.policy.receive_chat = parse_bool("receiveChat", v)?;
                Ok(())
            },
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(name: &str, world: &str) -> LocalGate {
        LocalGate::new(name, world, GateKind::Area, Position::default()).unwrap()
    }

    #[test]
    fn name_rules() {
        assert!(is_valid_name("east"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("a.b"));
        assert!(!is_valid_name("star*"));
        assert!(!is_valid_name("a name with spaces"));
        assert!(!is_valid_name("averyveryloooongname"));
        assert!(LocalGate::new("bad.name", "overworld", GateKind::Area, Position::default())
            .is_err());
    }

    #[test]
    fn round_robin_cursor() {
        let mut g = gate("hub", "overworld");
        g.add_link("overworld.b").unwrap();
        g.add_link("overworld.c").unwrap();

        g.next_link().unwrap();
        assert_eq!(g.destination().unwrap(), "overworld.b");
        g.next_link().unwrap();
        assert_eq!(g.destination().unwrap(), "overworld.c");
        g.next_link().unwrap();
        assert_eq!(g.destination().unwrap(), "overworld.b");
    }

    #[test]
    fn single_link_cursor_is_stable() {
        let mut g = gate("hub", "overworld");
        g.add_link("overworld.b").unwrap();
        g.next_link().unwrap();
        g.next_link().unwrap();
        assert_eq!(g.destination().unwrap(), "overworld.b");
    }

    #[test]
    fn destination_errors() {
        let mut g = gate("hub", "overworld");
        assert!(g.destination().is_err());

        g.add_link("overworld.b").unwrap();
        assert!(g.destination().is_err()); // no link selected yet

        g.next_link().unwrap();
        g.remove_link("overworld.b").unwrap();
        assert!(g.destination().is_err()); // links empty again
    }

    #[test]
    fn removing_selected_link_clears_cursor() {
        let mut g = gate("hub", "overworld");
        g.add_link("overworld.b").unwrap();
        g.add_link("overworld.c").unwrap();
        g.next_link().unwrap();
        g.remove_link("overworld.b").unwrap();
        assert!(g.outgoing().is_none());
        // next departure selects the first remaining link
        g.next_link().unwrap();
        assert_eq!(g.destination().unwrap(), "overworld.c");
    }

    #[test]
    fn multi_link_policy() {
        let mut g = gate("hub", "overworld");
        g.multi_link = false;
        g.add_link("overworld.b").unwrap();
        assert!(g.add_link("overworld.c").is_err());
    }

    #[test]
    fn cost_scope_selection() {
        let mut g = gate("hub", "overworld");
        g.policy.costs = GateCosts {
            send_local: 1.0,
            send_world: 2.0,
            send_server: 3.0,
            receive_local: 4.0,
            receive_world: 5.0,
            receive_server: 6.0,
        };

        let same_world = Gate::Local(gate("east", "overworld"));
        let other_world = Gate::Local(gate("spire", "nether"));
        let remote = Gate::Remote(RemoteGate {
            server: "beta".into(),
            world: "overworld".into(),
            name: "arch".into(),
            kind: GateKind::Area,
        });

        assert_eq!(g.send_cost(&same_world), 1.0);
        assert_eq!(g.send_cost(&other_world), 2.0);
        assert_eq!(g.send_cost(&remote), 3.0);
        assert_eq!(g.receive_cost(&same_world), 4.0);
        assert_eq!(g.receive_cost(&other_world), 5.0);
        assert_eq!(g.receive_cost(&remote), 6.0);
    }

    #[test]
    fn registry_uniqueness_per_world() {
        let mut reg = GateRegistry::new();
        reg.add_local(gate("east", "overworld")).unwrap();
        assert!(reg.add_local(gate("East", "overworld")).is_err());
        reg.add_local(gate("east", "nether")).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn prefix_find() {
        let mut reg = GateRegistry::new();
        reg.add_local(gate("east", "overworld")).unwrap();
        reg.add_local(gate("west", "overworld")).unwrap();

        assert!(reg.find("overworld.e").is_some());
        assert!(reg.find("OVERWORLD.EAST").is_some());
        assert!(reg.find("overworld.").is_none()); // ambiguous
        assert!(reg.find("nether.e").is_none());
    }

    #[test]
    fn remote_gates_follow_their_server() {
        let mut reg = GateRegistry::new();
        reg.add_remote(
            "beta",
            &GateSummary {
                name: "overworld.arch".into(),
                kind: GateKind::Block,
            },
        )
        .unwrap();
        reg.add_remote(
            "gamma",
            &GateSummary {
                name: "overworld.keep".into(),
                kind: GateKind::Area,
            },
        )
        .unwrap();

        assert!(reg.get("beta.overworld.arch").is_some());
        let removed = reg.remove_for_server("beta");
        assert_eq!(removed, vec!["beta.overworld.arch".to_string()]);
        assert!(reg.get("beta.overworld.arch").is_none());
        assert!(reg.get("gamma.overworld.keep").is_some());
    }

    #[test]
    fn remove_detaches_incoming() {
        let mut reg = GateRegistry::new();
        let mut a = gate("a", "overworld");
        a.add_link("overworld.b").unwrap();
        a.open().unwrap();
        reg.add_local(a).unwrap();
        let mut b = gate("b", "overworld");
        b.attach("overworld.a");
        reg.add_local(b).unwrap();

        reg.remove("overworld.a");
        assert_eq!(reg.local("overworld.b").unwrap().incoming().count(), 0);
    }
}
