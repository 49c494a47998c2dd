//! Wallet metadata: everything about a wallet that may be persisted.
//!
//! Seeds have no plaintext representation here. The only seed material a
//! repository ever sees is an [`EncryptedSeed`] sealed under a passphrase.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KestrelError, Result};
use crate::types::{hex_bytes, DerivationPath, Network, OutPoint, ScriptType, Txid, Utxo};

/// Wallet identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalletId(Uuid);

impl WalletId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WalletId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for WalletId {
    type Err = KestrelError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| KestrelError::ValidationError(format!("bad wallet id: {}", e)))
    }
}

/// A derived address the wallet watches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    /// Encoded address
    pub address: String,
    /// Full derivation path of the key
    pub path: DerivationPath,
    /// Address index within its chain
    pub index: u32,
    /// True for the internal (change) chain
    pub change: bool,
}

/// A signed transaction whose inputs stay reserved until it confirms or the
/// chain reports it unknown.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSpend {
    /// Transaction id
    pub txid: Txid,
    /// Inputs it consumes
    pub inputs: Vec<OutPoint>,
    /// Signed transaction, kept so a failed broadcast can be retried
    #[serde(default, with = "hex_bytes")]
    pub raw: Vec<u8>,
    /// Whether a broadcast has been accepted by the chain
    #[serde(default)]
    pub accepted: bool,
    /// Last broadcast attempt
    pub broadcast_at: DateTime<Utc>,
}

/// A seed sealed with AES-256-GCM under a passphrase-derived key.
///
/// The key is PBKDF2-HMAC-SHA256 over the passphrase and `salt`; the wallet
/// id is bound in as associated data, so a keystore cannot be moved to
/// another wallet record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSeed {
    /// PBKDF2 iteration count
    pub kdf_rounds: u32,
    /// PBKDF2 salt
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    /// AES-GCM nonce
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
    /// Encrypted seed with the GCM tag appended
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Persisted wallet state. Never holds a plaintext seed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletMetadata {
    /// Wallet id
    pub id: WalletId,
    /// Display name
    pub name: String,
    /// Network the wallet derives addresses for
    pub network: Network,
    /// Script type of receive and change addresses
    pub script_type: ScriptType,
    /// Account derivation path (`m/purpose'/coin'/account'`)
    pub account_path: DerivationPath,
    /// Base58 extended public key of the account
    pub account_xpub: String,
    /// Master key fingerprint (hex)
    pub master_fingerprint: String,
    /// Derived addresses in derivation order
    #[serde(default)]
    pub addresses: Vec<AddressRecord>,
    /// Next external index
    pub next_receive_index: u32,
    /// Next internal index
    pub next_change_index: u32,
    /// Last observed UTXO set
    #[serde(default)]
    pub utxos: Vec<Utxo>,
    /// Broadcast, unconfirmed spends
    #[serde(default)]
    pub pending: Vec<PendingSpend>,
    /// Passphrase-sealed seed, when the wallet is protected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystore: Option<EncryptedSeed>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl WalletMetadata {
    /// Finds the address record for an encoded address.
    pub fn address(&self, address: &str) -> Option<&AddressRecord> {
        self.addresses.iter().find(|a| a.address == address)
    }

    /// Outpoints currently held by pending spends.
    pub fn reserved_outpoints(&self) -> impl Iterator<Item = &OutPoint> + '_ {
        self.pending.iter().flat_map(|p| p.inputs.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_id_roundtrip() {
        let id = WalletId::new();
        assert_eq!(id.to_string().parse::<WalletId>().unwrap(), id);
        assert!("not-a-uuid".parse::<WalletId>().is_err());
    }

    #[test]
    fn test_metadata_json_has_no_secret_fields() {
        let meta = WalletMetadata {
            id: WalletId::new(),
            name: "savings".into(),
            network: Network::Testnet,
            script_type: ScriptType::P2wpkh,
            account_path: DerivationPath::account(84, 1, 0).unwrap(),
            account_xpub: "tpub...".into(),
            master_fingerprint: "00000000".into(),
            addresses: vec![],
            next_receive_index: 0,
            next_change_index: 0,
            utxos: vec![],
            pending: vec![],
            keystore: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("seed"));
        assert!(!json.contains("xprv"));
        let back: WalletMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_keystore_serializes_as_hex() {
        let sealed = EncryptedSeed {
            kdf_rounds: 1_000,
            salt: vec![0xab; 16],
            nonce: vec![0x01; 12],
            ciphertext: vec![0xff; 48],
        };
        let json = serde_json::to_value(&sealed).unwrap();
        assert_eq!(json["salt"], "ab".repeat(16));
        assert_eq!(json["nonce"], "01".repeat(12));
        let back: EncryptedSeed = serde_json::from_value(json).unwrap();
        assert_eq!(back, sealed);
    }
}
