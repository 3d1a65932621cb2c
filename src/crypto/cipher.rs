//! Per-packet block encryption
//!
//! Every packet is padded and encrypted on its own (ECB over the padded
//! buffer, no IV carried between packets), so a lost or reordered datagram
//! never affects the decryption of the next one.
//!
//! Padding is PKCS#7-style: `n` bytes of value `n`, `1 <= n <= block_size`.
//! A packet that is already block aligned gets a whole block of padding.

use super::{derive_key, CryptoError};
use aes::Aes256;
use blowfish::Blowfish;
use bytes::{Bytes, BytesMut};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, BlockSizeUser, KeyInit};
use des::{Des, TdesEde3};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Supported block ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    /// AES-256
    Aes,
    /// Blowfish with a 128-bit key
    Blowfish,
    /// Single DES
    Des,
    /// Triple DES (EDE, three keys)
    TripleDes,
}

impl CipherKind {
    /// Key length taken from the passphrase digest
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes => 32,
            CipherKind::Blowfish => 16,
            CipherKind::Des => 8,
            CipherKind::TripleDes => 24,
        }
    }

    /// Cipher block size in bytes
    pub fn block_size(&self) -> usize {
        match self {
            CipherKind::Aes => 16,
            CipherKind::Blowfish | CipherKind::Des | CipherKind::TripleDes => 8,
        }
    }

    /// Canonical configuration name
    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Aes => "aes",
            CipherKind::Blowfish => "blowfish",
            CipherKind::Des => "des",
            CipherKind::TripleDes => "3des",
        }
    }
}

impl FromStr for CipherKind {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes" | "aes256" | "aes-256" => Ok(CipherKind::Aes),
            "blowfish" | "bf" => Ok(CipherKind::Blowfish),
            "des" => Ok(CipherKind::Des),
            "3des" | "tripledes" | "des3" | "des-ede3" => Ok(CipherKind::TripleDes),
            _ => Err(CryptoError::UnknownCipher(s.to_string())),
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

enum Engine {
    Aes(Box<Aes256>),
    Blowfish(Box<Blowfish>),
    Des(Box<Des>),
    TripleDes(Box<TdesEde3>),
}

impl Engine {
    fn new(kind: CipherKind, key: &[u8]) -> Result<Self, CryptoError> {
        let invalid = |_| CryptoError::InvalidKeyLength(key.len());
        Ok(match kind {
            CipherKind::Aes => Engine::Aes(Box::new(Aes256::new_from_slice(key).map_err(invalid)?)),
            CipherKind::Blowfish => {
                Engine::Blowfish(Box::new(Blowfish::new_from_slice(key).map_err(invalid)?))
            }
            CipherKind::Des => Engine::Des(Box::new(Des::new_from_slice(key).map_err(invalid)?)),
            CipherKind::TripleDes => {
                Engine::TripleDes(Box::new(TdesEde3::new_from_slice(key).map_err(invalid)?))
            }
        })
    }

    fn encrypt(&self, buf: &mut [u8]) {
        match self {
            Engine::Aes(c) => encrypt_blocks(c.as_ref(), buf),
            Engine::Blowfish(c) => encrypt_blocks(c.as_ref(), buf),
            Engine::Des(c) => encrypt_blocks(c.as_ref(), buf),
            Engine::TripleDes(c) => encrypt_blocks(c.as_ref(), buf),
        }
    }

    fn decrypt(&self, buf: &mut [u8]) {
        match self {
            Engine::Aes(c) => decrypt_blocks(c.as_ref(), buf),
            Engine::Blowfish(c) => decrypt_blocks(c.as_ref(), buf),
            Engine::Des(c) => decrypt_blocks(c.as_ref(), buf),
            Engine::TripleDes(c) => decrypt_blocks(c.as_ref(), buf),
        }
    }
}

fn encrypt_blocks<C: BlockEncrypt + BlockSizeUser>(cipher: &C, buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(C::block_size()) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
}

fn decrypt_blocks<C: BlockDecrypt + BlockSizeUser>(cipher: &C, buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(C::block_size()) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
}

/// Packet cipher, or a pass-through when no passphrase is configured
pub struct PacketCipher {
    inner: Option<(CipherKind, Engine)>,
}

impl PacketCipher {
    /// Create a cipher keyed from `passphrase`
    pub fn new(kind: CipherKind, passphrase: &str) -> Result<Self, CryptoError> {
        let key = derive_key(passphrase, kind.key_len())?;
        let engine = Engine::new(kind, &key)?;
        Ok(Self {
            inner: Some((kind, engine)),
        })
    }

    /// Create a pass-through cipher
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Build from optional configuration values
    ///
    /// No passphrase means plaintext; a passphrase without a cipher name
    /// selects AES.
    pub fn from_settings(name: Option<&str>, passphrase: Option<&str>) -> Result<Self, CryptoError> {
        match passphrase {
            Some(passphrase) if !passphrase.is_empty() => {
                let kind = match name {
                    Some(name) => name.parse()?,
                    None => CipherKind::Aes,
                };
                Self::new(kind, passphrase)
            }
            _ => {
                warn!("No passphrase configured, packets will be transmitted in plaintext");
                Ok(Self::disabled())
            }
        }
    }

    /// Check if encryption is active
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Selected cipher, if any
    pub fn kind(&self) -> Option<CipherKind> {
        self.inner.as_ref().map(|(kind, _)| *kind)
    }

    /// Pad and encrypt one packet
    pub fn encrypt(&self, packet: Bytes) -> Bytes {
        let Some((kind, engine)) = &self.inner else {
            return packet;
        };

        let block_size = kind.block_size();
        let pad = block_size - packet.len() % block_size;

        let mut buf = BytesMut::with_capacity(packet.len() + pad);
        buf.extend_from_slice(&packet);
        buf.resize(packet.len() + pad, pad as u8);

        engine.encrypt(&mut buf);
        buf.freeze()
    }

    /// Decrypt one packet and strip its padding
    pub fn decrypt(&self, ciphertext: Bytes) -> Result<Bytes, CryptoError> {
        let Some((kind, engine)) = &self.inner else {
            return Ok(ciphertext);
        };

        let block_size = kind.block_size();
        let len = ciphertext.len();
        if len == 0 || len % block_size != 0 {
            return Err(CryptoError::TruncatedPacket(len));
        }

        let mut buf = BytesMut::from(&ciphertext[..]);
        engine.decrypt(&mut buf);

        let pad = buf[len - 1] as usize;
        if pad == 0 || pad > block_size {
            return Err(CryptoError::TruncatedPacket(len));
        }

        buf.truncate(len - pad);
        Ok(buf.freeze())
    }
}
