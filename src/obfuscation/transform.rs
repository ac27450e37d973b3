//! Frame transform applied at the transport boundary

use super::key::{derive_transform_key, KEY_LEN};
use crate::protocol::{ProtocolError, SessionDescriptor};
use base64::Engine;
use bytes::Bytes;
use std::fmt;

/// Self-inverse, length-preserving byte transform keyed by the shared secret.
///
/// This hides frame contents from casual inspection; it is not encryption.
#[derive(Clone)]
pub struct FrameTransform {
    key: [u8; KEY_LEN],
}

impl FrameTransform {
    /// Create a transform from the operator's shared secret
    pub fn new(secret: &str) -> Result<Self, ProtocolError> {
        Ok(Self {
            key: derive_transform_key(secret.as_bytes())?,
        })
    }

    /// Apply the transform to `buf` in place
    pub fn apply(&self, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b ^= self.key[i % KEY_LEN];
        }
    }

    /// Obfuscate a frame before it leaves the process
    pub fn encode(&self, frame: &[u8]) -> Bytes {
        let mut out = frame.to_vec();
        self.apply(&mut out);
        Bytes::from(out)
    }

    /// Recover a frame received from a transport
    pub fn decode(&self, data: &[u8]) -> Bytes {
        self.encode(data)
    }

    /// Render a session descriptor as printable text for out-of-band exchange
    pub fn encode_descriptor(&self, desc: &SessionDescriptor) -> Result<String, ProtocolError> {
        let mut json = serde_json::to_vec(desc)
            .map_err(|e| ProtocolError::Descriptor(e.to_string()))?;
        self.apply(&mut json);
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    /// Parse text produced by [`FrameTransform::encode_descriptor`]
    pub fn decode_descriptor(&self, text: &str) -> Result<SessionDescriptor, ProtocolError> {
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(text.trim())
            .map_err(|e| ProtocolError::Descriptor(format!("bad base64: {}", e)))?;
        self.apply(&mut raw);
        serde_json::from_slice(&raw).map_err(|e| ProtocolError::Descriptor(e.to_string()))
    }
}

impl fmt::Debug for FrameTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FrameTransform(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DescriptorKind;

    #[test]
    fn test_round_trip() {
        let t = FrameTransform::new("hunter2").unwrap();
        for len in [0usize, 1, 31, 32, 33, 1500, 4096] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            let encoded = t.encode(&data);
            assert_eq!(encoded.len(), data.len());
            assert_eq!(t.decode(&encoded).as_ref(), &data[..]);
        }
    }

    #[test]
    fn test_empty_input() {
        let t = FrameTransform::new("k").unwrap();
        assert!(t.encode(&[]).is_empty());
        assert!(t.decode(&[]).is_empty());
    }

    #[test]
    fn test_obfuscates() {
        let t = FrameTransform::new("hunter2").unwrap();
        let data = vec![0u8; 64];
        assert_ne!(t.encode(&data).as_ref(), &data[..]);
    }

    #[test]
    fn test_different_keys_disagree() {
        let a = FrameTransform::new("a").unwrap();
        let b = FrameTransform::new("b").unwrap();
        let data = b"some frame bytes";
        assert_ne!(b.decode(&a.encode(data)).as_ref(), &data[..]);
    }

    #[test]
    fn test_descriptor_round_trip() {
        let t = FrameTransform::new("hunter2").unwrap();
        let desc = SessionDescriptor::offer("v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\n");
        let text = t.encode_descriptor(&desc).unwrap();
        assert!(!text.contains("v=0"));

        let decoded = t.decode_descriptor(&format!("  {}\n", text)).unwrap();
        assert_eq!(decoded, desc);
        assert_eq!(decoded.kind, DescriptorKind::Offer);
    }

    #[test]
    fn test_descriptor_garbage() {
        let t = FrameTransform::new("hunter2").unwrap();
        assert!(t.decode_descriptor("!!not base64!!").is_err());
        assert!(t.decode_descriptor("aGVsbG8=").is_err());
    }
}
