//! Public key and signature containers.
//!
//! These hold already-validated bytes; curve arithmetic lives in `kestrel-crypto`.
//! Secret material never appears in this crate.

use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::constants::{COMPRESSED_PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use crate::error::{KestrelError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// PUBLIC KEY
// ═══════════════════════════════════════════════════════════════════════════════

/// Compressed secp256k1 public key (33 bytes, SEC1).
///
/// Ordering is lexicographic over the serialized bytes, which is the BIP67
/// order used for multisig redeem scripts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey {
    bytes: [u8; COMPRESSED_PUBLIC_KEY_SIZE],
}

impl PublicKey {
    /// Creates a public key from SEC1 compressed bytes.
    ///
    /// # Errors
    /// Returns error if the length is not 33 or the prefix is not 0x02/0x03.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != COMPRESSED_PUBLIC_KEY_SIZE {
            return Err(KestrelError::InvalidKeySize {
                expected: COMPRESSED_PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0] != 0x02 && bytes[0] != 0x03 {
            return Err(KestrelError::InvalidKey(format!(
                "bad compressed key prefix 0x{:02x}",
                bytes[0]
            )));
        }

        let mut arr = [0u8; COMPRESSED_PUBLIC_KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Returns the raw bytes of the public key.
    pub fn as_bytes(&self) -> &[u8; COMPRESSED_PUBLIC_KEY_SIZE] {
        &self.bytes
    }

    /// Returns the hex-encoded public key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Creates a public key from hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Node identity key of a channel peer.
pub type NodeId = PublicKey;

// ═══════════════════════════════════════════════════════════════════════════════
// SIGNATURE
// ═══════════════════════════════════════════════════════════════════════════════

/// Compact ECDSA signature (r || s, low-S).
#[derive(Clone, Copy, Eq)]
pub struct Signature {
    bytes: [u8; SIGNATURE_SIZE],
}

impl Signature {
    /// Creates a signature from 64 compact bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SIGNATURE_SIZE {
            return Err(KestrelError::InvalidKeySize {
                expected: SIGNATURE_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; SIGNATURE_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Creates a signature from a fixed-size array.
    pub fn from_array(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self { bytes }
    }

    /// Returns the compact bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.bytes
    }

    /// Returns the hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Parses a hex-encoded compact signature.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())?;
        Self::from_bytes(&bytes)
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.ct_eq(&other.bytes).into()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", hex::encode(&self.bytes[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
