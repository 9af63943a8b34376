//! Accept loop for inbound mesh connections.
//!
//! An inbound socket is anonymous until its handshake credential matches a
//! configured server; then it becomes that server's live connection. An
//! unknown credential, a version mismatch, or silence past the handshake
//! deadline all end the socket with at most one error message.

use crate::net::connection::{read_one_message, Connection};
use crate::node::NodeEvent;
use crate::registry::ServerRegistry;
use gatemesh_core::{frame_encode, FrameDecoder, Message, MeshResult, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ListenerContext {
    pub registry: Arc<ServerRegistry>,
    pub local_key: String,
    pub node_name: String,
    pub node_version: String,
    pub handshake_timeout: Duration,
    pub events: mpsc::Sender<NodeEvent>,
}

/// Bind `addr` and accept inbound connections until the process stops.
pub async fn run(addr: &str, ctx: ListenerContext) -> MeshResult<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "listening for mesh connections");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            handle_inbound(stream, peer_addr, ctx).await;
        });
    }
}

async fn reject(mut stream: TcpStream, peer: SocketAddr, reason: &str) {
    warn!(peer = %peer, reason, "rejecting inbound connection");
    if let Ok(frame) = frame_encode(&Message::Error {
        message: reason.to_string(),
    }) {
        let _ = stream.write_all(&frame).await;
    }
}

async fn handle_inbound(mut stream: TcpStream, peer: SocketAddr, ctx: ListenerContext) {
    let mut decoder = FrameDecoder::new();
    let first = tokio::time::timeout(
        ctx.handshake_timeout,
        read_one_message(&mut stream, &mut decoder),
    )
    .await;

    let (protocol_version, node_version, credential) = match first {
        Ok(Ok(Message::Handshake {
            protocol_version,
            node_version,
            credential,
        })) => (protocol_version, node_version, credential),
        Ok(Ok(_)) => {
            reject(stream, peer, "expected handshake").await;
            return;
        }
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "inbound handshake failed");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, "no handshake received, closing");
            return;
        }
    };

    if protocol_version != PROTOCOL_VERSION {
        reject(stream, peer, "unsupported protocol version").await;
        return;
    }

    let server = match ctx.registry.match_credential(&credential, &ctx.local_key) {
        Some(server) => server,
        None => {
            reject(stream, peer, "unknown key").await;
            return;
        }
    };

    if !server.is_enabled() {
        reject(stream, peer, "server is disabled").await;
        return;
    }
    if server.is_connected() {
        reject(stream, peer, "already connected").await;
        return;
    }

    let ack = Message::HandshakeAck {
        protocol_version: PROTOCOL_VERSION,
        node_version: ctx.node_version.clone(),
        node_name: ctx.node_name.clone(),
    };
    let frame = match frame_encode(&ack) {
        Ok(f) => f,
        Err(e) => {
            warn!(peer = %peer, error = %e, "could not encode handshake ack");
            return;
        }
    };
    if stream.write_all(&frame).await.is_err() {
        return;
    }

    info!(server = %server.name(), peer = %peer, "accepted mesh connection");
    let conn = Connection::from_accepted(
        server.name().to_string(),
        stream,
        decoder,
        ctx.events.clone(),
    );
    server.adopt_connection(conn);
    let _ = ctx
        .events
        .send(NodeEvent::PeerConnected {
            server: server.name().to_string(),
            version: node_version,
        })
        .await;
}
