//! Domain types for Kestrel.
//!
//! This module provides the data model shared across the engine:
//!
//! - [`Network`] and [`ScriptType`]: closed enums dispatched by `match`
//! - [`PublicKey`] / [`Signature`]: hex-serialized secp256k1 material
//! - [`DerivationPath`]: BIP32 paths
//! - [`Utxo`] / [`OutPoint`] / [`Txid`]: on-chain references
//! - [`ChannelRecord`] / [`Htlc`]: persisted channel state
//! - [`WalletMetadata`]: the public half of a wallet

mod network;
mod keys;
mod path;
mod utxo;
mod channel;
mod wallet;

pub use network::*;
pub use keys::*;
pub use path::*;
pub use utxo::*;
pub use channel::*;
pub use wallet::*;

/// Serde helper for fixed-size byte arrays stored as hex strings.
pub(crate) mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|v: Vec<u8>| serde::de::Error::invalid_length(v.len(), &"fixed-size hex"))
    }
}

/// Serde helper for variable-length byte strings stored as hex.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
