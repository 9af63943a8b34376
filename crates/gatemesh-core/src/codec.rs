//! Length-prefixed CBOR framing for the mesh control stream.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`
//!
//! Strings and byte payloads are length-prefixed by CBOR itself, so the
//! encoding is binary-safe end to end, with no delimiter escaping anywhere.

use crate::document::Document;
use crate::error::{MeshError, MeshResult};
use std::io::Cursor;

/// Upper bound on a single frame payload. A peer announcing more than this
/// is treated as a protocol violation, not a large message.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> MeshResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn payload_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> MeshResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Encode a [`Document`] to its CBOR payload bytes (no length prefix).
pub fn encode(doc: &Document) -> MeshResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(doc, &mut payload)?;
    Ok(payload)
}

/// Decode a CBOR payload into a [`Document`].
///
/// Fails with [`MeshError::Malformed`] on truncated or tag-inconsistent
/// input.
pub fn decode(data: &[u8]) -> MeshResult<Document> {
    payload_decode(data)
}

/// Streaming frame decoder: accumulates bytes and yields complete payloads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
        }
    }

    /// Append raw bytes without extracting anything.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extract the next complete frame payload, if one is buffered.
    pub fn next_frame(&mut self) -> MeshResult<Option<Vec<u8>>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let len =
            u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                as usize;
        if len > MAX_FRAME_LEN {
            return Err(MeshError::Protocol(format!(
                "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
            )));
        }
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }
        let payload = self.buffer[4..4 + len].to_vec();
        self.buffer.drain(..4 + len);
        Ok(Some(payload))
    }

    /// Feed raw bytes and return the complete frame payloads they finish.
    ///
    /// Partial frames stay buffered until the rest arrives.
    pub fn feed(&mut self, data: &[u8]) -> MeshResult<Vec<Vec<u8>>> {
        self.push(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Drop any partially buffered frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, Value};

    fn sample_doc() -> Document {
        let effects = vec![
            Document::new()
                .with("effect", "swiftness")
                .with("duration", 1200)
                .with("amplifier", 1),
            Document::new()
                .with("effect", "regeneration")
                .with("duration", 80)
                .with("amplifier", 0),
        ];
        Document::new()
            .with("name", "alice")
            .with("health", 20)
            .with("seed", 8_674_665_223_082_153_551_i64)
            .with("xp", 0.35f32)
            .with("x", 102.5f64)
            .with("flying", false)
            .with(
                "position",
                Document::new().with("world", "overworld").with("y", 64.0f64),
            )
            .with("effects", effects)
    }

    #[test]
    fn document_round_trip() {
        let doc = sample_doc();
        let bytes = encode(&doc).unwrap();
        assert_eq!(decode(&bytes).unwrap(), doc);
    }

    #[test]
    fn round_trip_preserves_numeric_kind() {
        let doc = Document::new()
            .with("int", 5)
            .with("long", 5i64)
            .with("float", 5.0f32)
            .with("double", 5.0f64);
        let back = decode(&encode(&doc).unwrap()).unwrap();
        assert_eq!(back.get("int"), Some(&Value::Int(5)));
        assert_eq!(back.get("long"), Some(&Value::Long(5)));
        assert_eq!(back.get("float"), Some(&Value::Float(5.0)));
        assert_eq!(back.get("double"), Some(&Value::Double(5.0)));
    }

    #[test]
    fn binary_safe_strings() {
        let doc = Document::new().with("msg", "hello\0world \u{1F600} \"quoted\"");
        let back = decode(&encode(&doc).unwrap()).unwrap();
        assert_eq!(back.get_str("msg"), Some("hello\0world \u{1F600} \"quoted\""));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let bytes = encode(&sample_doc()).unwrap();
        let err = decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, MeshError::Malformed(_)));
    }

    #[test]
    fn frame_round_trip_multiple() {
        let docs = vec![
            Document::new().with("n", 1),
            Document::new().with("n", 2),
            sample_doc(),
        ];
        let mut combined = Vec::new();
        for d in &docs {
            combined.extend(frame_encode(d).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&combined).unwrap();
        assert_eq!(frames.len(), 3);
        for (frame, doc) in frames.iter().zip(&docs) {
            assert_eq!(&decode(frame).unwrap(), doc);
        }
    }

    #[test]
    fn incremental_feed_reassembles_partial_reads() {
        let doc = sample_doc();
        let frame = frame_encode(&doc).unwrap();
        let mut decoder = FrameDecoder::new();

        for i in 0..frame.len() - 1 {
            assert!(decoder.feed(&frame[i..i + 1]).unwrap().is_empty());
        }
        let frames = decoder.feed(&frame[frame.len() - 1..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(decode(&frames[0]).unwrap(), doc);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn oversized_frame_is_protocol_error() {
        let mut decoder = FrameDecoder::new();
        let huge = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        assert!(matches!(
            decoder.feed(&huge),
            Err(MeshError::Protocol(_))
        ));
    }
}
