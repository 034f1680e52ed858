// Frame encoding.
//
// Outbound envelopes are serialized to JSON text. When compression applies
// and the text exceeds the threshold, the JSON is zlib-compressed and sent as
// a binary frame instead. Inbound binary frames are read the same way.

use std::io::{Read, Write};

use beacon_common::protocol::ws::Envelope;
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("zlib stream error: {0}")]
    Zlib(#[from] std::io::Error),
    #[error("decompressed frame exceeds the {max} byte limit")]
    TooLarge { max: usize },
    #[error("decompressed frame is not UTF-8")]
    NotUtf8,
}

/// An encoded frame ready for the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedFrame {
    Text(String),
    /// zlib-compressed JSON.
    Binary(Vec<u8>),
}

impl EncodedFrame {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Binary(_))
    }
}

/// Serialize `envelope`, compressing when `compression_threshold` is set and
/// the JSON is strictly larger than it.
pub fn encode(
    envelope: &Envelope,
    compression_threshold: Option<usize>,
) -> Result<EncodedFrame, CodecError> {
    let text = serde_json::to_string(envelope)?;
    match compression_threshold {
        Some(threshold) if text.len() > threshold => Ok(EncodedFrame::Binary(compress(text.as_bytes())?)),
        _ => Ok(EncodedFrame::Text(text)),
    }
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::fast());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Inflate a binary frame back to its JSON text, refusing anything that
/// inflates past `max_len` bytes.
pub fn decompress(bytes: &[u8], max_len: usize) -> Result<String, CodecError> {
    let mut decoder = ZlibDecoder::new(bytes).take((max_len as u64).saturating_add(1));
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    if out.len() > max_len {
        return Err(CodecError::TooLarge { max: max_len });
    }
    String::from_utf8(out).map_err(|_| CodecError::NotUtf8)
}

#[cfg(test)]
mod tests {
    use beacon_common::protocol::ws::{EventPayload, MessageType};
    use beacon_common::types::GatewayEvent;
    use serde_json::json;

    use super::*;

    fn event_envelope(body: &str) -> Envelope {
        Envelope::new(
            MessageType::Event,
            &EventPayload {
                subscription_id: "s1".into(),
                event: GatewayEvent::new("price.updated", json!({ "body": body }), "svc-a"),
            },
        )
        .expect("envelope should build")
    }

    #[test]
    fn small_frames_stay_text() {
        let frame = encode(&event_envelope("tiny"), Some(1024)).expect("encode");
        assert!(matches!(frame, EncodedFrame::Text(_)));
    }

    #[test]
    fn large_frames_compress_and_inflate_to_same_json() {
        let envelope = event_envelope(&"x".repeat(4096));
        let frame = encode(&envelope, Some(1024)).expect("encode");

        let EncodedFrame::Binary(bytes) = &frame else {
            panic!("expected a compressed frame, got {frame:?}");
        };
        assert!(bytes.len() < 4096);

        let text = decompress(bytes, usize::MAX).expect("decompress");
        let decoded: Envelope = serde_json::from_str(&text).expect("valid json");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn disabled_threshold_never_compresses() {
        let frame = encode(&event_envelope(&"x".repeat(4096)), None).expect("encode");
        assert!(!frame.is_compressed());
    }

    #[test]
    fn decompress_stops_at_limit() {
        let bytes = compress("y".repeat(10_000).as_bytes()).expect("compress");
        assert!(matches!(decompress(&bytes, 100), Err(CodecError::TooLarge { max: 100 })));
        assert_eq!(decompress(&bytes, 10_000).expect("at the limit").len(), 10_000);
    }

    #[test]
    fn oversized_multibyte_text_reports_size_not_encoding() {
        // Two-byte characters: the cap at 101 bytes splits one in half.
        let bytes = compress("é".repeat(1_000).as_bytes()).expect("compress");
        assert!(matches!(decompress(&bytes, 100), Err(CodecError::TooLarge { max: 100 })));
    }
}
