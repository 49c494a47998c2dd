//! On-chain references: transaction ids, outpoints and UTXOs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::HASH_SIZE;
use crate::error::{KestrelError, Result};
use crate::types::{DerivationPath, ScriptType};

// ═══════════════════════════════════════════════════════════════════════════════
// TXID
// ═══════════════════════════════════════════════════════════════════════════════

/// Transaction id: double-SHA256 of the non-witness serialization.
///
/// Stored in internal byte order and displayed reversed, as block explorers do.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Txid([u8; HASH_SIZE]);

impl Txid {
    /// Wraps a digest in internal byte order.
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Internal byte order.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        f.write_str(&hex::encode(reversed))
    }
}

impl fmt::Debug for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Txid({})", self)
    }
}

impl FromStr for Txid {
    type Err = KestrelError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())?;
        let mut arr: [u8; HASH_SIZE] = bytes.try_into().map_err(|v: Vec<u8>| {
            KestrelError::InvalidKeySize {
                expected: HASH_SIZE,
                actual: v.len(),
            }
        })?;
        arr.reverse();
        Ok(Self(arr))
    }
}

impl Serialize for Txid {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Txid {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OUTPOINT
// ═══════════════════════════════════════════════════════════════════════════════

/// Reference to one output of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    /// Transaction that created the output
    pub txid: Txid,
    /// Output index
    pub vout: u32,
}

impl OutPoint {
    /// Creates an outpoint.
    pub fn new(txid: Txid, vout: u32) -> Self {
        Self { txid, vout }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// UTXO
// ═══════════════════════════════════════════════════════════════════════════════

/// What it takes to spend an output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpendCondition {
    /// One signature from the key hashed in the script.
    SingleKey {
        /// Derivation path of the key, when the owning wallet knows it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<DerivationPath>,
    },
    /// CHECKMULTISIG redeem script wrapped in P2SH or P2WSH.
    Multisig {
        /// Serialized redeem script
        #[serde(with = "hex")]
        redeem_script: Vec<u8>,
    },
}

impl Default for SpendCondition {
    fn default() -> Self {
        SpendCondition::SingleKey { path: None }
    }
}

/// An unspent output as observed on chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Location of the output
    pub outpoint: OutPoint,
    /// Value in minor units
    pub amount: u64,
    /// Locking script
    #[serde(with = "hex")]
    pub script_pubkey: Vec<u8>,
    /// Script template of the locking script
    pub script_type: ScriptType,
    /// Encoded address the output pays
    pub address: String,
    /// Confirmations at observation time (0 = mempool)
    pub confirmations: u32,
    /// How the owning wallet spends it
    #[serde(default)]
    pub spend: SpendCondition,
}

impl Utxo {
    /// True if the output is worth less than it costs to spend.
    pub fn is_dust(&self) -> bool {
        self.amount < self.script_type.dust_threshold()
    }

    /// Estimated input size when spending this output.
    pub fn input_vbytes(&self) -> u64 {
        match &self.spend {
            SpendCondition::Multisig { redeem_script } => {
                let (m, n) = multisig_shape(redeem_script).unwrap_or((1, 1));
                self.script_type.multisig_input_vbytes(m, n)
            }
            SpendCondition::SingleKey { .. } => self.script_type.input_vbytes(),
        }
    }
}

/// Reads M and N from the first and penultimate opcodes of a CHECKMULTISIG script.
fn multisig_shape(script: &[u8]) -> Option<(usize, usize)> {
    let len = script.len();
    if len < 3 {
        return None;
    }
    let small_int = |op: u8| (0x51..=0x60).contains(&op).then(|| (op - 0x50) as usize);
    Some((small_int(script[0])?, small_int(script[len - 2])?))
}

/// Sums amounts with overflow detection.
pub fn checked_sum<I: IntoIterator<Item = u64>>(amounts: I) -> Result<u64> {
    amounts
        .into_iter()
        .try_fold(0u64, |acc, a| acc.checked_add(a))
        .ok_or(KestrelError::AmountOverflow)
}

// ═══════════════════════════════════════════════════════════════════════════════
// BALANCE
// ═══════════════════════════════════════════════════════════════════════════════

/// Wallet balance split by availability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Confirmed and not reserved
    pub confirmed: u64,
    /// Seen in the mempool only
    pub unconfirmed: u64,
    /// Held by in-flight transactions
    pub reserved: u64,
}

impl Balance {
    /// Total of all buckets.
    pub fn total(&self) -> u64 {
        self.confirmed
            .saturating_add(self.unconfirmed)
            .saturating_add(self.reserved)
    }
}
