//! The remote API backend: `server.*`, `world.*`, and `player.*` methods
//! invoked by peers through `apiRequest` messages.
//!
//! Each method takes a document of named arguments and answers with a
//! document carrying a `result` key; failures become error documents on
//! the wire. Methods here run on the node loop and must stay cheap.

use crate::node::Node;
use gatemesh_core::{Document, MeshError, MeshResult};
use tracing::debug;

pub fn invoke(node: &Node, target: &str, method: &str, args: &Document) -> MeshResult<Document> {
    debug!(target, method, "api invoke");
    match target {
        "server" => invoke_server(node, method, args),
        "world" => invoke_world(node, method, args),
        "player" => invoke_player(node, method, args),
        _ => Err(MeshError::Remote(format!("unknown API target '{target}'"))),
    }
}

fn invoke_server(node: &Node, method: &str, args: &Document) -> MeshResult<Document> {
    let mut out = Document::new();
    match method {
        "getName" => out.put("result", node.settings.name.as_str()),
        "getVersion" => out.put("result", node.settings.version.as_str()),
        "broadcast" => {
            let message = require_str(args, "message")?;
            let players = node.worlds.players();
            for (id, _, _) in &players {
                node.worlds.notify(*id, message);
            }
            out.put("result", players.len() as i32);
        }
        "dispatchCommand" => {
            let line = require_str(args, "commandLine")?;
            let handled = match line.split_once(' ') {
                Some(("say", rest)) => {
                    for (id, _, _) in node.worlds.players() {
                        node.worlds.notify(id, format!("[{}] {rest}", node.settings.name));
                    }
                    true
                }
                _ => false,
            };
            out.put("result", handled);
        }
        _ => {
            return Err(MeshError::Remote(format!(
                "unknown server method '{method}'"
            )))
        }
    }
    Ok(out)
}

fn invoke_world(node: &Node, method: &str, args: &Document) -> MeshResult<Document> {
    let name = require_str(args, "world")?;
    let world = node
        .worlds
        .world(name)
        .ok_or_else(|| MeshError::Remote(format!("world '{name}' is unknown")))?;

    let mut out = Document::new();
    match method {
        "getSeed" => out.put("result", world.seed),
        "getTime" => out.put("result", world.time),
        "getDifficulty" => out.put("result", world.difficulty.as_str()),
        _ => {
            return Err(MeshError::Remote(format!(
                "unknown world method '{method}'"
            )))
        }
    }
    Ok(out)
}

fn invoke_player(node: &Node, method: &str, args: &Document) -> MeshResult<Document> {
    let name = require_str(args, "player")?;
    let entity = node
        .worlds
        .entity_by_name(name)
        .ok_or_else(|| MeshError::Remote(format!("player '{name}' is unknown")))?;

    let mut out = Document::new();
    match method {
        "getLocation" => {
            let world = node.worlds.entity_world(entity).unwrap_or_default();
            let pos = node.worlds.entity_position(entity).unwrap_or_default();
            let location = Document::new()
                .with("world", world)
                .with("x", pos.x)
                .with("y", pos.y)
                .with("z", pos.z);
            out.put("result", location);
        }
        "sendMessage" => {
            let message = require_str(args, "message")?;
            node.worlds.notify(entity, message);
        }
        _ => {
            return Err(MeshError::Remote(format!(
                "unknown player method '{method}'"
            )))
        }
    }
    Ok(out)
}

fn require_str<'a>(args: &'a Document, key: &str) -> MeshResult<&'a str> {
    args.get_str(key)
        .ok_or_else(|| MeshError::Remote(format!("{key} is required")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::testutil::alpha_node;
    use crate::world::Position;
    use gatemesh_core::Value;

    #[tokio::test]
    async fn world_get_seed_returns_long() {
        let node = alpha_node();
        let args = Document::new().with("world", "overworld");
        let out = invoke(&node, "world", "getSeed", &args).unwrap();
        assert_eq!(out.get("result"), Some(&Value::Long(4242)));
    }

    #[tokio::test]
    async fn unknown_world_is_a_remote_error() {
        let node = alpha_node();
        let args = Document::new().with("world", "the_void");
        let err = invoke(&node, "world", "getSeed", &args).unwrap_err();
        assert!(matches!(err, MeshError::Remote(_)));

        let err = invoke(&node, "world", "getSeed", &Document::new()).unwrap_err();
        assert!(matches!(err, MeshError::Remote(_)));
    }

    #[tokio::test]
    async fn server_methods() {
        let node = alpha_node();
        let out = invoke(&node, "server", "getName", &Document::new()).unwrap();
        assert_eq!(out.get_str("result"), Some("alpha"));

        let alice = node
            .worlds
            .spawn_player("alice", "overworld", Position::default())
            .unwrap();
        let args = Document::new().with("message", "maintenance in 5m");
        let out = invoke(&node, "server", "broadcast", &args).unwrap();
        assert_eq!(out.get_int("result"), Some(1));
        assert_eq!(
            node.worlds.drain_messages(alice),
            vec!["maintenance in 5m".to_string()]
        );
    }

    #[tokio::test]
    async fn dispatch_command_say() {
        let node = alpha_node();
        let alice = node
            .worlds
            .spawn_player("alice", "overworld", Position::default())
            .unwrap();

        let args = Document::new().with("commandLine", "say hello mesh");
        let out = invoke(&node, "server", "dispatchCommand", &args).unwrap();
        assert_eq!(out.get_bool("result"), Some(true));
        assert_eq!(
            node.worlds.drain_messages(alice),
            vec!["[alpha] hello mesh".to_string()]
        );

        let args = Document::new().with("commandLine", "fly");
        let out = invoke(&node, "server", "dispatchCommand", &args).unwrap();
        assert_eq!(out.get_bool("result"), Some(false));
    }

    #[tokio::test]
    async fn player_location_and_message() {
        let node = alpha_node();
        node.worlds
            .spawn_player("alice", "overworld", Position::new(7.0, 64.0, -3.0))
            .unwrap();

        let args = Document::new().with("player", "alice");
        let out = invoke(&node, "player", "getLocation", &args).unwrap();
        let location = out.get_doc("result").unwrap();
        assert_eq!(location.get_str("world"), Some("overworld"));
        assert_eq!(location.get_double("x"), Some(7.0));

        let err = invoke(
            &node,
            "player",
            "getLocation",
            &Document::new().with("player", "ghost"),
        )
        .unwrap_err();
        assert!(matches!(err, MeshError::Remote(_)));
    }

    #[tokio::test]
    async fn unknown_target_rejected() {
        let node = alpha_node();
        let err = invoke(&node, "chunk", "load", &Document::new()).unwrap_err();
        assert!(matches!(err, MeshError::Remote(_)));
    }
}
