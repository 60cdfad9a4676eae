//! Challenge/response authentication: `HMAC-SHA256(PSK, nonce || session_id)`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute the auth proof for a challenge nonce.
pub fn compute_hmac(psk: &str, nonce: &[u8], session_id: &str) -> [u8; 32] {
    let mut mac =
        HmacSha256::new_from_slice(psk.as_bytes()).expect("HMAC accepts any key length");
    mac.update(nonce);
    mac.update(session_id.as_bytes());
    mac.finalize().into_bytes().into()
}

/// Verify a received proof in constant time.
pub fn verify_hmac(psk: &str, nonce: &[u8], session_id: &str, received: &[u8]) -> bool {
    let mut mac =
        HmacSha256::new_from_slice(psk.as_bytes()).expect("HMAC accepts any key length");
    mac.update(nonce);
    mac.update(session_id.as_bytes());
    mac.verify_slice(received).is_ok()
}
