//! Cross-server chat routing.
//!
//! A local chat line fans out two ways: servers whose policy relays all
//! chat get it unscoped, and open local gates within chat proximity of the
//! speaker relay it scoped to their destination gates. The receiving side
//! mirrors the split: unscoped chat reaches everyone (server policy
//! permitting), scoped chat only reaches players near the named gates.

use crate::node::Node;
use crate::server::Server;
use gatemesh_core::Message;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

impl Node {
    /// Relay a local player's chat line to the mesh.
    pub fn relay_local_chat(&self, entity: u64, message: &str) {
        let Some(player) = self.worlds.entity_name(entity) else {
            return;
        };
        let (Some(world), Some(pos)) = (
            self.worlds.entity_world(entity),
            self.worlds.entity_position(entity),
        ) else {
            return;
        };

        // server name -> None for "relay everything", or the peer-local
        // names of the gates the chat should surface near
        let mut targets: HashMap<String, Option<Vec<String>>> = HashMap::new();

        for server in self.servers.all() {
            if server.is_connected() && server.can_send_chat(message) {
                targets.insert(server.name().to_string(), None);
            }
        }

        for gate in self.gates.local_gates() {
            if !gate.is_open()
                || !gate.can_send_chat(message)
                || !gate.in_chat_send_proximity(&world, &pos)
            {
                continue;
            }
            let Ok(dest) = gate.destination() else {
                continue;
            };
            let Some(remote) = self.gates.get(dest).and_then(|g| g.as_remote().cloned()) else {
                continue;
            };
            match targets.entry(remote.server.clone()) {
                // a server already relaying everything needs no gate scope
                Entry::Occupied(mut entry) => {
                    if let Some(gates) = entry.get_mut() {
                        gates.push(remote.local_name());
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(Some(vec![remote.local_name()]));
                }
            }
        }

        if targets.is_empty() {
            debug!(player = %player, "no servers for chat relay");
            return;
        }
        for (server_name, to_gates) in targets {
            if let Some(server) = self.servers.get(&server_name) {
                server.send_if_connected(Message::Chat {
                    player: player.clone(),
                    world: world.clone(),
                    message: message.to_string(),
                    to_gates,
                });
            }
        }
    }

    /// Deliver chat that arrived from a peer.
    pub fn relay_remote_chat(
        &self,
        server: &Arc<Server>,
        player: &str,
        _world: &str,
        message: &str,
        to_gates: Option<Vec<String>>,
    ) {
        let line = format!("[{}] {player}: {message}", server.name());
        match to_gates {
            None => {
                if !server.can_receive_chat(message) {
                    debug!(server = %server.name(), "chat dropped by receive policy");
                    return;
                }
                for (id, _, _) in self.worlds.players() {
                    self.worlds.notify(id, line.clone());
                }
            }
            Some(gate_names) if !gate_names.is_empty() => {
                let mut recipients = Vec::new();
                for name in &gate_names {
                    let Some(gate) = self.gates.local(name) else {
                        continue;
                    };
                    if !gate.can_receive_chat(message) {
                        continue;
                    }
                    for (id, _, world) in self.worlds.players() {
                        if let Some(pos) = self.worlds.entity_position(id) {
                            if gate.in_chat_receive_proximity(&world, &pos)
                                && !recipients.contains(&id)
                            {
                                recipients.push(id);
                            }
                        }
                    }
                }
                for id in recipients {
                    self.worlds.notify(id, line.clone());
                }
            }
            Some(_) => {
                debug!(server = %server.name(), "chat with empty gate scope ignored");
            }
        }
    }
}
