//! Persisted payment-channel state.
//!
//! A [`ChannelRecord`] is the last *mutually signed* state of a channel. Staged
//! updates never appear here; `kestrel-channel` only writes a record after the
//! counterparty's countersignature has been verified.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::HASH_SIZE;
use crate::error::{KestrelError, Result};
use crate::types::{hex_array, DerivationPath, NodeId, OutPoint, PublicKey, Signature, Txid};

// ═══════════════════════════════════════════════════════════════════════════════
// IDENTIFIERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Channel identifier (32 bytes).
///
/// Ordered so two-channel operations can lock in a global order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(#[serde(with = "hex_array")] [u8; HASH_SIZE]);

impl ChannelId {
    /// Wraps raw bytes.
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({}...)", hex::encode(&self.0[..6]))
    }
}

impl FromStr for ChannelId {
    type Err = KestrelError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())?;
        let arr = bytes.try_into().map_err(|v: Vec<u8>| KestrelError::InvalidKeySize {
            expected: HASH_SIZE,
            actual: v.len(),
        })?;
        Ok(Self(arr))
    }
}

/// SHA-256 payment hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PaymentHash(#[serde(with = "hex_array")] pub [u8; HASH_SIZE]);

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentHash({}...)", hex::encode(&self.0[..6]))
    }
}

/// Payment preimage. Held by the payee until settlement.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Preimage([u8; HASH_SIZE]);

impl Preimage {
    /// Wraps preimage bytes.
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Preimage([REDACTED])")
    }
}

/// Reference to an HTLC: parent channel by id plus its index in that channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HtlcId {
    /// Owning channel
    pub channel_id: ChannelId,
    /// Per-channel monotonically assigned index
    pub index: u64,
}

impl fmt::Display for HtlcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.index)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATES
// ═══════════════════════════════════════════════════════════════════════════════

/// Channel lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Funding negotiated or broadcast, not yet deep enough.
    Negotiating,
    /// Usable for HTLCs.
    Open,
    /// Cooperative settlement broadcast.
    Closing,
    /// Last commitment broadcast unilaterally; dispute window running.
    ForceClosing,
    /// Settled on chain.
    Closed,
    /// Funding never completed.
    Failed,
}

impl ChannelState {
    /// Whether the lifecycle permits moving to `next`.
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Negotiating, Open)
                | (Negotiating, Failed)
                | (Open, Closing)
                | (Open, ForceClosing)
                | (Closing, Closed)
                | (Closing, ForceClosing)
                | (ForceClosing, Closed)
        )
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Failed)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Negotiating => "negotiating",
            ChannelState::Open => "open",
            ChannelState::Closing => "closing",
            ChannelState::ForceClosing => "force_closing",
            ChannelState::Closed => "closed",
            ChannelState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Which side pays an HTLC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HtlcDirection {
    /// We offered it; funded from the local balance.
    Offered,
    /// Counterparty offered it; funded from the remote balance.
    Received,
}

/// A pending hash time-locked contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Htlc {
    /// Index within the channel
    pub index: u64,
    /// sha256 of the preimage that settles it
    pub payment_hash: PaymentHash,
    /// Amount in minor units
    pub amount: u64,
    /// Block height after which it is failed back
    pub expiry: u32,
    /// Offered or received
    pub direction: HtlcDirection,
    /// Incoming HTLC this one was forwarded for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_from: Option<HtlcId>,
}

/// How a finished HTLC ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HtlcOutcome {
    /// Preimage revealed; amount went to the receiver.
    Fulfilled,
    /// Failed or timed out; amount returned to the sender.
    Failed,
}

/// Record of a finished HTLC, kept for idempotent fulfilment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedHtlc {
    /// The HTLC as it was while pending
    pub htlc: Htlc,
    /// How it ended
    pub outcome: HtlcOutcome,
    /// Commitment version that removed it
    pub resolved_at_version: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMMITMENT
// ═══════════════════════════════════════════════════════════════════════════════

/// A mutually signed balance snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    /// Strictly increasing version
    pub version: u64,
    /// Our balance
    pub local_balance: u64,
    /// Counterparty balance
    pub remote_balance: u64,
    /// HTLCs in flight, keyed by index
    pub htlcs: BTreeMap<u64, Htlc>,
    /// Counterparty signature over this commitment's transaction
    pub remote_signature: Option<Signature>,
}

impl Commitment {
    /// Sum of pending HTLC amounts, `None` on overflow.
    pub fn pending_total(&self) -> Option<u64> {
        self.htlcs
            .values()
            .try_fold(0u64, |acc, h| acc.checked_add(h.amount))
    }

    /// `local + remote + pending`, `None` on overflow.
    pub fn total(&self) -> Option<u64> {
        self.local_balance
            .checked_add(self.remote_balance)?
            .checked_add(self.pending_total()?)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHANNEL RECORD
// ═══════════════════════════════════════════════════════════════════════════════

/// Persisted channel state. Contains public material only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// Channel id
    pub id: ChannelId,
    /// Counterparty node key
    pub counterparty: NodeId,
    /// Funding amount
    pub capacity: u64,
    /// True if we funded the channel
    pub is_funder: bool,
    /// Lifecycle state
    pub state: ChannelState,
    /// Last mutually signed state
    pub commitment: Commitment,
    /// Funding output once the funding transaction is built
    pub funding_outpoint: Option<OutPoint>,
    /// 2-of-2 redeem script of the funding output
    #[serde(with = "hex")]
    pub funding_script: Vec<u8>,
    /// Path of our funding key under the node key
    pub local_key_path: DerivationPath,
    /// Our funding public key
    pub local_funding_key: PublicKey,
    /// Counterparty funding public key
    pub remote_funding_key: PublicKey,
    /// Txid of the cooperative close or broadcast commitment
    pub closing_txid: Option<Txid>,
    /// Block height at which the dispute window of a force close ends
    pub dispute_deadline: Option<u32>,
    /// Finished HTLCs
    #[serde(default)]
    pub resolved: Vec<ResolvedHtlc>,
    /// Next HTLC index to assign
    pub next_htlc_index: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last committed transition
    pub updated_at: DateTime<Utc>,
}

impl ChannelRecord {
    /// Checks `local + remote + pending == capacity`.
    pub fn check_balance_invariant(&self) -> Result<()> {
        match self.commitment.total() {
            Some(total) if total == self.capacity => Ok(()),
            Some(total) => Err(KestrelError::IntegrityViolation(format!(
                "channel {}: balances sum to {} but capacity is {}",
                self.id, total, self.capacity
            ))),
            None => Err(KestrelError::IntegrityViolation(format!(
                "channel {}: balance sum overflows",
                self.id
            ))),
        }
    }

    /// Pending HTLC by index.
    pub fn pending_htlc(&self, index: u64) -> Option<&Htlc> {
        self.commitment.htlcs.get(&index)
    }

    /// Resolved HTLC by index.
    pub fn resolved_htlc(&self, index: u64) -> Option<&ResolvedHtlc> {
        self.resolved.iter().find(|r| r.htlc.index == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use ChannelState::*;
        assert!(Negotiating.can_transition_to(Open));
        assert!(Negotiating.can_transition_to(Failed));
        assert!(Open.can_transition_to(ForceClosing));
        assert!(ForceClosing.can_transition_to(Closed));
        assert!(!Negotiating.can_transition_to(Closing));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Open.can_transition_to(Negotiating));
        assert!(Failed.is_terminal());
    }

    #[test]
    fn test_commitment_total() {
        let commitment = Commitment {
            version: 3,
            local_balance: 800,
            remote_balance: 100,
            htlcs: BTreeMap::from([(
                0,
                Htlc {
                    index: 0,
                    payment_hash: PaymentHash([1; 32]),
                    amount: 100,
                    expiry: 500,
                    direction: HtlcDirection::Offered,
                    forwarded_from: None,
                },
            )]),
            remote_signature: None,
        };
        assert_eq!(commitment.pending_total(), Some(100));
        assert_eq!(commitment.total(), Some(1000));
    }

    #[test]
    fn test_channel_id_parse() {
        let id = ChannelId::from_bytes([0xab; 32]);
        assert_eq!(id.to_string().parse::<ChannelId>().unwrap(), id);
        assert!("abcd".parse::<ChannelId>().is_err());
    }

    #[test]
    fn test_preimage_debug_redacted() {
        let p = Preimage::from_bytes([9; 32]);
        assert_eq!(format!("{:?}", p), "Preimage([REDACTED])");
    }
}
