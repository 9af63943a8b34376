//! Mesh control message types.
//!
//! Every message is a CBOR map carrying a string `type` discriminator, so a
//! peer dispatches each inbound payload to exactly one handler. The typed
//! envelope here is the only thing that crosses the wire; free-form data
//! (API arguments, reservation snapshots) rides inside [`Document`] fields.

use crate::document::Document;
use serde::{Deserialize, Serialize};

/// Protocol version exchanged during the handshake. Mismatch is fatal.
pub const PROTOCOL_VERSION: u32 = 1;

/// Gate structural variant, shared between the wire and the gate model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    /// Built from world blocks matched against a design.
    Block,
    /// A free-standing cuboid region.
    Area,
    /// Anchored to the server itself rather than a structure.
    Server,
}

/// One gate in a refresh inventory: local name (`world.name`) plus variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSummary {
    pub name: String,
    pub kind: GateKind,
}

/// One online player in a refresh inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSummary {
    pub name: String,
    pub world: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Full inventory of a node: its worlds, visible gates, and online players.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshPayload {
    pub version: String,
    pub worlds: Vec<String>,
    pub gates: Vec<GateSummary>,
    pub players: Vec<PlayerSummary>,
}

/// A mesh control message.
///
/// The serde representation puts the variant name into a `type` field,
/// camel-cased, which is exactly the wire discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Message {
    /// First message on every connection, sent by the dialing side.
    Handshake {
        protocol_version: u32,
        node_version: String,
        /// `hex(SHA-256(dialer_key ":" listener_key))`; see `secret`.
        credential: String,
    },
    /// Listener's answer once the credential matched a configured server.
    HandshakeAck {
        protocol_version: u32,
        node_version: String,
        node_name: String,
    },
    Ping {
        time: i64,
    },
    Pong {
        time: i64,
    },
    /// Remote API invocation; `id` is echoed by the matching response.
    ApiRequest {
        id: u64,
        target: String,
        method: String,
        args: Document,
    },
    /// Exactly one of `result` / `error` is set.
    ApiResponse {
        id: u64,
        #[serde(default)]
        result: Option<Document>,
        #[serde(default)]
        error: Option<String>,
    },
    /// Ask the peer to resend its full inventory.
    Refresh,
    /// Answer to `refresh`, also sent unprompted right after connecting.
    RefreshData(RefreshPayload),
    /// A gate appeared on the sending node.
    GateAdded {
        name: String,
        kind: GateKind,
    },
    /// A gate was removed or destroyed on the sending node.
    GateRemoved {
        name: String,
    },
    /// `from` (full name, our side) linked onto `to` (local name, peer side).
    GateAttach {
        to: String,
        from: String,
    },
    GateDetach {
        to: String,
        from: String,
    },
    Chat {
        player: String,
        world: String,
        message: String,
        /// When set, deliver only near these gates (peer-local names).
        #[serde(default)]
        to_gates: Option<Vec<String>>,
    },
    PrivateMessage {
        from: String,
        to: String,
        message: String,
    },
    WorldLoad {
        world: String,
    },
    WorldUnload {
        world: String,
    },
    PlayerJoin {
        name: String,
        world: String,
    },
    PlayerQuit {
        name: String,
    },
    /// Teleport reservation snapshot from the departing side.
    Reservation {
        reservation: Document,
    },
    ReservationApproved {
        id: u64,
    },
    ReservationDenied {
        id: u64,
        reason: String,
    },
    ReservationArrived {
        id: u64,
    },
    /// Free-form complaint; never fatal on its own.
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{frame_encode, payload_decode, FrameDecoder};

    #[test]
    fn type_discriminator_is_camel_case() {
        let msg = Message::HandshakeAck {
            protocol_version: PROTOCOL_VERSION,
            node_version: "0.1.0".into(),
            node_name: "alpha".into(),
        };
        let frame = frame_encode(&msg).unwrap();
        // The payload is an ordinary document; check the tag field directly.
        let doc: Document = payload_decode(&frame[4..]).unwrap();
        assert_eq!(doc.get_str("type"), Some("handshakeAck"));
        assert_eq!(doc.get_str("nodeName"), Some("alpha"));
    }

    #[test]
    fn api_request_round_trip() {
        let msg = Message::ApiRequest {
            id: 42,
            target: "world".into(),
            method: "getSeed".into(),
            args: Document::new().with("world", "overworld"),
        };
        let frame = frame_encode(&msg).unwrap();
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&frame).unwrap();
        assert_eq!(frames.len(), 1);
        let back: Message = payload_decode(&frames[0]).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn api_response_defaults() {
        let msg = Message::ApiResponse {
            id: 7,
            result: None,
            error: Some("world 'nether' is unknown".into()),
        };
        let frame = frame_encode(&msg).unwrap();
        let back: Message = payload_decode(&frame[4..]).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_type_is_malformed() {
        let doc = Document::new().with("type", "teleportEverything");
        let frame = frame_encode(&doc).unwrap();
        let err = payload_decode::<Message>(&frame[4..]).unwrap_err();
        assert!(matches!(err, crate::MeshError::Malformed(_)));
    }

    #[test]
    fn refresh_data_round_trip() {
        let msg = Message::RefreshData(RefreshPayload {
            version: "0.1.0".into(),
            worlds: vec!["overworld".into(), "nether".into()],
            gates: vec![GateSummary {
                name: "overworld.east".into(),
                kind: GateKind::Area,
            }],
            players: vec![PlayerSummary {
                name: "alice".into(),
                world: "overworld".into(),
                display_name: None,
            }],
        });
        let frame = frame_encode(&msg).unwrap();
        let doc: Document = payload_decode(&frame[4..]).unwrap();
        assert_eq!(doc.get_str("type"), Some("refreshData"));
        let back: Message = payload_decode(&frame[4..]).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn reservation_dialogue_round_trip() {
        let snapshot = Document::new()
            .with("id", 3i64)
            .with("playerName", "alice")
            .with("health", 20);
        for msg in [
            Message::Reservation {
                reservation: snapshot,
            },
            Message::ReservationApproved { id: 3 },
            Message::ReservationDenied {
                id: 3,
                reason: "remote gate requires $10.00".into(),
            },
            Message::ReservationArrived { id: 3 },
        ] {
            let frame = frame_encode(&msg).unwrap();
            let back: Message = payload_decode(&frame[4..]).unwrap();
            assert_eq!(back, msg);
        }
    }
}
