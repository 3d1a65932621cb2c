//! Key Derivation
//!
//! Keys are the SHA-256 digest of the passphrase, truncated to the cipher's
//! key length. Both peers only share the passphrase, so the derivation has to
//! be deterministic and salt-free.

use super::CryptoError;
use ring::digest::{digest, SHA256, SHA256_OUTPUT_LEN};

/// Derive a `key_len`-byte key from a passphrase
pub fn derive_key(passphrase: &str, key_len: usize) -> Result<Vec<u8>, CryptoError> {
    if key_len == 0 || key_len > SHA256_OUTPUT_LEN {
        return Err(CryptoError::InvalidKeyLength(key_len));
    }

    let hash = digest(&SHA256, passphrase.as_bytes());
    Ok(hash.as_ref()[..key_len].to_vec())
}
