//! Cryptographic primitives for the bridge
//!
//! This module provides:
//! - Per-packet block encryption with PKCS#7-style padding
//! - SHA-256 passphrase key derivation
//! - Secure random number generation (rendezvous hands)

mod cipher;
mod kdf;

pub use self::cipher::{CipherKind, PacketCipher};
pub use self::kdf::derive_key;

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Unknown cipher: {0}")]
    UnknownCipher(String),

    #[error("Invalid key length: {0}")]
    InvalidKeyLength(usize),

    #[error("Truncated packet ({0} bytes)")]
    TruncatedPacket(usize),

    #[error("Random generation failed")]
    Random,
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Random)
}
