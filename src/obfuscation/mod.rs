//! Traffic obfuscation layer
//!
//! Every frame is passed through a keyed, self-inverse transform before it
//! is handed to a transport and again after it is received. Session
//! descriptors get the same treatment before being base64-encoded for the
//! out-of-band exchange.

mod key;
mod transform;

pub use key::{derive_transform_key, KEY_LEN};
pub use transform::FrameTransform;
