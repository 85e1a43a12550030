//! Pluggable request transform: bytes in, bytes out.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;

/// The function a handler applies to each request payload.
pub type Transform = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Default transform: base64-encode the payload.
pub fn base64_transform() -> Transform {
    Arc::new(|payload| STANDARD.encode(payload).into_bytes())
}
