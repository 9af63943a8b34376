//! gatemesh-core: shared protocol library for the gate mesh.
//!
//! Provides the typed wire document, length-prefixed CBOR framing, the
//! control message envelope, and shared-secret handshake credentials.

pub mod codec;
pub mod document;
pub mod error;
pub mod messages;
pub mod secret;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode, frame_encode, payload_decode, FrameDecoder};
pub use document::{Document, Value};
pub use error::{MeshError, MeshResult};
pub use messages::{GateKind, GateSummary, Message, PlayerSummary, RefreshPayload, PROTOCOL_VERSION};
