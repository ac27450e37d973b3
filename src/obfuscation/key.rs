//! Key derivation for the frame transform
//!
//! HKDF-SHA256 stretches the operator's shared secret into a fixed-size key.

use crate::protocol::ProtocolError;
use ring::hkdf::{self, Salt, HKDF_SHA256};

/// Length of the transform key in bytes
pub const KEY_LEN: usize = 32;

const KEY_SALT: &[u8] = b"veilnet-frame-transform-v1";
const KEY_INFO: &[u8] = b"veilnet frame key";

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Derive the transform key from a shared secret
pub fn derive_transform_key(secret: &[u8]) -> Result<[u8; KEY_LEN], ProtocolError> {
    let prk = Salt::new(HKDF_SHA256, KEY_SALT).extract(secret);
    let mut key = [0u8; KEY_LEN];
    expand(&prk, &mut key)?;
    Ok(key)
}

fn expand(prk: &hkdf::Prk, output: &mut [u8]) -> Result<(), ProtocolError> {
    let okm = prk
        .expand(&[KEY_INFO], HkdfLen(output.len()))
        .map_err(|_| ProtocolError::KeyDerivation("HKDF expand failed".to_string()))?;
    okm.fill(output)
        .map_err(|_| ProtocolError::KeyDerivation("HKDF fill failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        assert_eq!(
            derive_transform_key(b"secret").unwrap(),
            derive_transform_key(b"secret").unwrap()
        );
    }

    #[test]
    fn test_distinct_secrets() {
        let a = derive_transform_key(b"secret-a").unwrap();
        let b = derive_transform_key(b"secret-b").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, [0u8; KEY_LEN]);
    }

    #[test]
    fn test_oversized_output_is_error() {
        // HKDF-SHA256 yields at most 255 blocks of 32 bytes
        let prk = Salt::new(HKDF_SHA256, KEY_SALT).extract(b"secret");
        let mut output = vec![0u8; 255 * 32 + 1];
        assert!(matches!(
            expand(&prk, &mut output),
            Err(ProtocolError::KeyDerivation(_))
        ));
    }
}
