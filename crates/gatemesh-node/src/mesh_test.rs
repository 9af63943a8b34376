//! Two-node end-to-end exercise over real sockets: handshake, refresh,
//! remote API calls, and a cross-node teleport with a denial case.

use crate::config::ConfigFile;
use crate::node::{Node, NodeEvent};
use crate::world::Position;
use gatemesh_core::{Document, MeshError, Value};
use std::future::Future;
use std::time::Duration;

const ALPHA_PORT: u16 = 43117;
const BETA_PORT: u16 = 43118;

fn alpha_config() -> String {
    format!(
        r#"
        [node]
        name = "alpha"
        address = "127.0.0.1:{ALPHA_PORT}"
        key = "alpha-key"

        [network]
        reconnect_interval = 50
        api_timeout = 2000
        arrival_window = 2000

        [[servers]]
        name = "beta"
        address = "127.0.0.1:{BETA_PORT}"
        key = "beta-key"

        [[worlds]]
        name = "overworld"
        seed = 4242

        [[gates]]
        name = "east"
        world = "overworld"
        spawn = [100.0, 64.0, 0.0]
        links = ["beta.overworld.arch"]
        open = true
        send_server_cost = 10.0

        [[balances]]
        account = "alice"
        amount = 100.0

        [[balances]]
        account = "bob"
        amount = 20.0
    "#
    )
}

fn beta_config() -> String {
    // beta never dials first (long reconnect delay); it owns the arrival
    // gate and charges to receive
    format!(
        r#"
        [node]
        name = "beta"
        address = "127.0.0.1:{BETA_PORT}"
        key = "beta-key"

        [network]
        reconnect_interval = 60000

        [[servers]]
        name = "alpha"
        address = "127.0.0.1:{ALPHA_PORT}"
        key = "alpha-key"

        [[worlds]]
        name = "overworld"
        seed = 777

        [[gates]]
        name = "arch"
        world = "overworld"
        spawn = [0.0, 70.0, 0.0]
        receive_server_cost = 5.0

        [[balances]]
        account = "alice"
        amount = 50.0
    "#
    )
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn unknown_credential_is_rejected() {
    const PORT: u16 = 43121;
    let config = format!(
        r#"
        [node]
        name = "gatekeeper"
        address = "127.0.0.1:{PORT}"
        key = "gatekeeper-key"

        [network]
        reconnect_interval = 60000

        [[servers]]
        name = "trusted"
        address = "127.0.0.1:1"
        key = "trusted-key"
    "#
    );
    let node = Node::new(&ConfigFile::parse(&config).unwrap()).unwrap();
    tokio::spawn(node.run());

    // wait for the listener to bind
    let mut stream = None;
    for _ in 0..100 {
        if let Ok(s) = tokio::net::TcpStream::connect(("127.0.0.1", PORT)).await {
            stream = Some(s);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let mut stream = stream.expect("listener never came up");

    use gatemesh_core::{frame_encode, payload_decode, FrameDecoder, Message, PROTOCOL_VERSION};
    use tokio::io::AsyncWriteExt;

    let hello = Message::Handshake {
        protocol_version: PROTOCOL_VERSION,
        node_version: "0.1.0".into(),
        credential: gatemesh_core::secret::dial_credential("wrong-key", "gatekeeper-key"),
    };
    stream.write_all(&frame_encode(&hello).unwrap()).await.unwrap();

    let mut decoder = FrameDecoder::new();
    let answer = tokio::time::timeout(Duration::from_secs(5), async {
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 1024];
        loop {
            if let Some(frame) = decoder.next_frame().unwrap() {
                return payload_decode::<Message>(&frame).unwrap();
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed without an answer");
            decoder.push(&buf[..n]);
        }
    })
    .await
    .unwrap();

    assert_eq!(
        answer,
        Message::Error {
            message: "unknown key".into()
        }
    );
}

#[tokio::test]
async fn mesh_end_to_end() {
    let alpha = Node::new(&ConfigFile::parse(&alpha_config()).unwrap()).unwrap();
    let beta = Node::new(&ConfigFile::parse(&beta_config()).unwrap()).unwrap();

    let alpha_worlds = alpha.worlds.clone();
    let alpha_economy = alpha.economy.clone();
    let alpha_servers = alpha.servers.clone();
    let alpha_correlator = alpha.correlator.clone();
    let alpha_events = alpha.events();
    let beta_worlds = beta.worlds.clone();
    let beta_economy = beta.economy.clone();

    tokio::spawn(beta.run());
    tokio::spawn(alpha.run());

    // Handshake completes and refresh data lands (remote worlds are the
    // last thing set before remote gates, by the same handler).
    let servers = alpha_servers.clone();
    wait_until("alpha <-> beta link", move || {
        let servers = servers.clone();
        async move {
            servers
                .get("beta")
                .map(|s| s.is_connected() && s.has_remote_world("overworld"))
                .unwrap_or(false)
        }
    })
    .await;

    // Remote API: world.getSeed against the connected peer.
    let beta_handle = alpha_servers.get("beta").unwrap();
    let out = beta_handle
        .api_call(
            &alpha_correlator,
            "world",
            "getSeed",
            Document::new().with("world", "overworld"),
        )
        .await
        .unwrap();
    assert_eq!(out.get("result"), Some(&Value::Long(777)));

    let err = beta_handle
        .api_call(
            &alpha_correlator,
            "world",
            "getSeed",
            Document::new().with("world", "the_void"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Remote(_)));

    // Cross-node teleport: alice departs through east and materializes at
    // beta's arch gate; send cost charged on alpha, receive cost on beta.
    let alice = alpha_worlds
        .spawn_player("alice", "overworld", Position::new(100.0, 64.0, 0.0))
        .unwrap();
    alpha_events
        .send(NodeEvent::EnteredGate {
            entity: alice,
            gate: "overworld.east".into(),
        })
        .await
        .unwrap();

    let worlds = beta_worlds.clone();
    wait_until("alice arrives on beta", move || {
        let worlds = worlds.clone();
        async move { worlds.entity_by_name("alice").is_some() }
    })
    .await;

    let alice_on_beta = beta_worlds.entity_by_name("alice").unwrap();
    assert_eq!(
        beta_worlds.entity_position(alice_on_beta),
        Some(Position::new(0.0, 70.0, 0.0))
    );
    assert_eq!(alpha_economy.balance("alice"), 90.0);
    assert_eq!(beta_economy.balance("alice"), 45.0);
    assert_eq!(
        beta_worlds.drain_messages(alice_on_beta),
        vec!["arrived at 'overworld.arch'".to_string()]
    );

    // The handed-over entity is gone from alpha.
    let worlds = alpha_worlds.clone();
    wait_until("alice leaves alpha", move || {
        let worlds = worlds.clone();
        async move { worlds.entity_by_name("alice").is_none() }
    })
    .await;

    // Denial: bob can pay the send cost on alpha but has no funds on beta
    // for the receive cost; the deduction is refunded and the remote
    // reason is surfaced, once.
    let bob = alpha_worlds
        .spawn_player("bob", "overworld", Position::new(100.0, 64.0, 0.0))
        .unwrap();
    alpha_events
        .send(NodeEvent::EnteredGate {
            entity: bob,
            gate: "overworld.east".into(),
        })
        .await
        .unwrap();

    let mut messages = Vec::new();
    for _ in 0..250 {
        messages = alpha_worlds.drain_messages(bob);
        if !messages.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(messages, vec!["remote gate requires $5.00".to_string()]);

    assert!(alpha_worlds.entity_by_name("bob").is_some());
    assert!(beta_worlds.entity_by_name("bob").is_none());
    assert_eq!(alpha_economy.balance("bob"), 20.0);
}
