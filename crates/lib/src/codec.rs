//! Seam to the payload codecs (proprietary compression, protobuf <-> JSON).
//!
//! The gateway only decides which mode applies; the codecs themselves are supplied by the caller.

use crate::compression::CompressionMode;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("{mode:?} codec failed: {reason}")]
    Codec { mode: CompressionMode, reason: String },
}

/// Converts between client frames and the textual envelopes the hub understands.
pub trait PayloadCodec: Send + Sync {
    /// Client frame -> JSON envelope.
    fn decode(&self, mode: CompressionMode, frame: Vec<u8>) -> Result<String, CodecError>;
    /// JSON envelope -> client frame.
    fn encode(&self, mode: CompressionMode, message: String) -> Result<Vec<u8>, CodecError>;
}

/// Leaves payloads untouched in every mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl PayloadCodec for Passthrough {
    fn decode(&self, _mode: CompressionMode, frame: Vec<u8>) -> Result<String, CodecError> {
        Ok(String::from_utf8(frame)?)
    }

    fn encode(&self, _mode: CompressionMode, message: String) -> Result<Vec<u8>, CodecError> {
        Ok(message.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_rejects_invalid_utf8() {
        let err = Passthrough
            .decode(CompressionMode::Proprietary, vec![0xff, 0xfe])
            .unwrap_err();
        assert!(matches!(err, CodecError::Utf8(_)));
    }

    #[test]
    fn passthrough_keeps_text() {
        let msg = r#"{"action":"get","path":"Vehicle.Speed"}"#;
        assert_eq!(Passthrough.decode(CompressionMode::None, msg.as_bytes().to_vec()).unwrap(), msg);
        assert_eq!(Passthrough.encode(CompressionMode::PbLevel1, msg.to_string()).unwrap(), msg.as_bytes());
    }
}
