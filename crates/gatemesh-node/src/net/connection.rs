//! One physical socket to one remote server.
//!
//! A connection moves through `Connecting → Handshaking → Authenticated →
//! Closed`; any failure before `Closed` passes through an error that is
//! logged with its reason and then closes. Outbound messages funnel through
//! a single writer task, so send order is delivery order. Inbound frames
//! are decoded here but never acted on here; every message is handed to
//! the node loop.

use crate::node::NodeEvent;
use gatemesh_core::{frame_encode, payload_decode, FrameDecoder, Message, MeshError, MeshResult, PROTOCOL_VERSION};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Connection lifecycle states. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Handshaking,
    Authenticated,
    Closed,
}

/// Everything needed to dial one configured server.
#[derive(Debug, Clone)]
pub struct DialInfo {
    pub server: String,
    pub address: String,
    /// Credential we present: `hex(SHA-256(our_key ":" their_key))`.
    pub credential: String,
    pub node_version: String,
    pub handshake_timeout: Duration,
}

/// Handle to a live (or in-progress) connection.
#[derive(Clone)]
pub struct Connection {
    peer: String,
    state: Arc<Mutex<LinkState>>,
    outgoing_tx: mpsc::Sender<Message>,
    shutdown_tx: mpsc::Sender<()>,
    last_send: Arc<Mutex<Instant>>,
    last_recv: Arc<Mutex<Instant>>,
    closed_emitted: Arc<AtomicBool>,
}

impl Connection {
    /// Open an outbound connection and run its handshake in the background.
    ///
    /// Lifecycle notifications and inbound messages arrive on `events`.
    pub fn dial(info: DialInfo, events: mpsc::Sender<NodeEvent>) -> Connection {
        let (conn, outgoing_rx, shutdown_rx) = Connection::parts(info.server.clone(), LinkState::Connecting);

        let task_conn = conn.clone();
        tokio::spawn(async move {
            task_conn.run_outbound(info, events, outgoing_rx, shutdown_rx).await;
        });
        conn
    }

    /// Wrap an accepted socket whose handshake the listener already
    /// completed. Starts in `Authenticated`.
    pub fn from_accepted(
        peer: String,
        stream: TcpStream,
        decoder: FrameDecoder,
        events: mpsc::Sender<NodeEvent>,
    ) -> Connection {
        let (conn, outgoing_rx, shutdown_rx) = Connection::parts(peer, LinkState::Authenticated);

        let task_conn = conn.clone();
        tokio::spawn(async move {
            let (read_half, write_half) = stream.into_split();
            task_conn
                .run_established(read_half, write_half, decoder, events, outgoing_rx, shutdown_rx)
                .await;
        });
        conn
    }

    fn parts(
        peer: String,
        state: LinkState,
    ) -> (Connection, mpsc::Receiver<Message>, mpsc::Receiver<()>) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let conn = Connection {
            peer,
            state: Arc::new(Mutex::new(state)),
            outgoing_tx,
            shutdown_tx,
            last_send: Arc::new(Mutex::new(Instant::now())),
            last_recv: Arc::new(Mutex::new(Instant::now())),
            closed_emitted: Arc::new(AtomicBool::new(false)),
        };
        (conn, outgoing_rx, shutdown_rx)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == LinkState::Authenticated
    }

    /// Non-blocking send. Fails immediately with `NotConnected` unless the
    /// connection is `Authenticated`; nothing queues silently.
    pub fn send(&self, message: Message) -> MeshResult<()> {
        if !self.is_authenticated() {
            return Err(MeshError::NotConnected);
        }
        self.outgoing_tx
            .try_send(message)
            .map_err(|_| MeshError::NotConnected)
    }

    /// Begin teardown. Safe to call repeatedly.
    pub fn close(&self) {
        *self.state.lock().unwrap() = LinkState::Closed;
        let _ = self.shutdown_tx.try_send(());
    }

    pub fn idle_send(&self) -> Duration {
        self.last_send.lock().unwrap().elapsed()
    }

    pub fn idle_recv(&self) -> Duration {
        self.last_recv.lock().unwrap().elapsed()
    }

    async fn run_outbound(
        &self,
        info: DialInfo,
        events: mpsc::Sender<NodeEvent>,
        outgoing_rx: mpsc::Receiver<Message>,
        shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mut stream = match TcpStream::connect(&info.address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(server = %info.server, error = %e, "connect failed");
                self.emit_disconnected(&events).await;
                return;
            }
        };

        *self.state.lock().unwrap() = LinkState::Handshaking;
        let hello = Message::Handshake {
            protocol_version: PROTOCOL_VERSION,
            node_version: info.node_version.clone(),
            credential: info.credential.clone(),
        };
        let frame = match frame_encode(&hello) {
            Ok(f) => f,
            Err(e) => {
                warn!(server = %info.server, error = %e, "could not encode handshake");
                self.emit_disconnected(&events).await;
                return;
            }
        };
        if let Err(e) = stream.write_all(&frame).await {
            debug!(server = %info.server, error = %e, "handshake write failed");
            self.emit_disconnected(&events).await;
            return;
        }

        // Wait for the ack; a peer that never answers is cut off.
        let mut decoder = FrameDecoder::new();
        let ack = tokio::time::timeout(
            info.handshake_timeout,
            read_one_message(&mut stream, &mut decoder),
        )
        .await;
        let version = match ack {
            Ok(Ok(Message::HandshakeAck {
                protocol_version,
                node_version,
                node_name,
            })) => {
                if protocol_version != PROTOCOL_VERSION {
                    warn!(
                        server = %info.server,
                        wanted = PROTOCOL_VERSION,
                        got = protocol_version,
                        "protocol version mismatch"
                    );
                    self.emit_disconnected(&events).await;
                    return;
                }
                debug!(server = %info.server, node = %node_name, "handshake acknowledged");
                node_version
            }
            Ok(Ok(Message::Error { message })) => {
                // AuthenticationFailed from the far side; dropped without
                // retry here; reconnect policy belongs to the Server.
                warn!(server = %info.server, reason = %message, "handshake rejected");
                self.emit_disconnected(&events).await;
                return;
            }
            Ok(Ok(other)) => {
                warn!(server = %info.server, message = ?other, "unexpected message during handshake");
                self.emit_disconnected(&events).await;
                return;
            }
            Ok(Err(e)) => {
                debug!(server = %info.server, error = %e, "handshake read failed");
                self.emit_disconnected(&events).await;
                return;
            }
            Err(_) => {
                warn!(server = %info.server, "no handshake ack received");
                self.emit_disconnected(&events).await;
                return;
            }
        };

        *self.state.lock().unwrap() = LinkState::Authenticated;
        info!(server = %info.server, version = %version, "connected");
        let _ = events
            .send(NodeEvent::PeerConnected {
                server: info.server.clone(),
                version,
            })
            .await;

        let (read_half, write_half) = stream.into_split();
        self.run_established(read_half, write_half, decoder, events, outgoing_rx, shutdown_rx)
            .await;
    }

    async fn run_established(
        &self,
        mut read_half: OwnedReadHalf,
        mut write_half: OwnedWriteHalf,
        mut decoder: FrameDecoder,
        events: mpsc::Sender<NodeEvent>,
        mut outgoing_rx: mpsc::Receiver<Message>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        // Writer task: the only place bytes go out, so send order holds.
        let peer = self.peer.clone();
        let last_send = self.last_send.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let frame = match frame_encode(&message) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(server = %peer, error = %e, "dropping unencodable message");
                        continue;
                    }
                };
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
                *last_send.lock().unwrap() = Instant::now();
            }
        });

        let mut buf = [0u8; 4096];
        'link: loop {
            // Drain complete frames first: the handshake read may have
            // pulled in more than its own frame.
            loop {
                let frame = match decoder.next_frame() {
                    Ok(Some(f)) => f,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(server = %self.peer, error = %e, "bad frame, closing");
                        break 'link;
                    }
                };
                match payload_decode::<Message>(&frame) {
                    Ok(message) => {
                        if events
                            .send(NodeEvent::PeerMessage {
                                server: self.peer.clone(),
                                message,
                            })
                            .await
                            .is_err()
                        {
                            break 'link;
                        }
                    }
                    Err(e) => {
                        warn!(server = %self.peer, error = %e, "undecodable message, closing");
                        break 'link;
                    }
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                read = read_half.read(&mut buf) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            *self.last_recv.lock().unwrap() = Instant::now();
                            decoder.push(&buf[..n]);
                        }
                    }
                }
            }
        }

        writer.abort();
        self.emit_disconnected(&events).await;
    }

    async fn emit_disconnected(&self, events: &mpsc::Sender<NodeEvent>) {
        *self.state.lock().unwrap() = LinkState::Closed;
        if !self.closed_emitted.swap(true, Ordering::SeqCst) {
            let _ = events
                .send(NodeEvent::PeerDisconnected {
                    server: self.peer.clone(),
                })
                .await;
        }
    }
}

/// Read from `stream` until one complete message is decoded. Frames that
/// arrive behind it stay buffered in `decoder` for the established loop.
pub(crate) async fn read_one_message(
    stream: &mut TcpStream,
    decoder: &mut FrameDecoder,
) -> MeshResult<Message> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(frame) = decoder.next_frame()? {
            return payload_decode::<Message>(&frame);
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(MeshError::Protocol("connection closed mid-handshake".into()));
        }
        decoder.push(&buf[..n]);
    }
}
