//! Signing proposals.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kestrel_core::constants::HASH_SIZE;
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{PublicKey, Signature, Txid};
use kestrel_tx::{MultisigWitnessSource, ReservationId, SignedTransaction, UnsignedTransaction};

use crate::wallet::MultisigWallet;

/// Proposal identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalId(Uuid);

impl ProposalId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ProposalId {
    type Err = KestrelError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| KestrelError::ValidationError(format!("bad proposal id: {}", e)))
    }
}

/// Proposal lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    /// Waiting for signatures.
    Collecting,
    /// At least M distinct valid signers.
    Ready,
    /// Signed transaction produced; inputs still reserved.
    Finalized,
    /// Signed transaction confirmed; inputs spent.
    Confirmed,
    /// Signed transaction given up on; inputs released.
    Abandoned,
    /// Deadline passed or cancelled.
    Expired,
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProposalState::Collecting => "collecting",
            ProposalState::Ready => "ready",
            ProposalState::Finalized => "finalized",
            ProposalState::Confirmed => "confirmed",
            ProposalState::Abandoned => "abandoned",
            ProposalState::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Snapshot of a proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalStatus {
    /// Proposal id
    pub id: ProposalId,
    /// Current state
    pub state: ProposalState,
    /// Distinct signers collected
    pub collected: usize,
    /// Threshold M
    pub required: usize,
    /// Keys that have signed, in redeem-script order
    pub signers: Vec<PublicKey>,
    /// Collection deadline
    pub deadline: DateTime<Utc>,
    /// Txid once finalized
    pub txid: Option<Txid>,
}

pub(crate) struct Proposal {
    pub id: ProposalId,
    pub wallet: Arc<MultisigWallet>,
    pub unsigned: UnsignedTransaction,
    pub sighashes: Vec<[u8; HASH_SIZE]>,
    /// Key index in the redeem script → one signature per input.
    pub partials: BTreeMap<usize, Vec<Signature>>,
    pub state: ProposalState,
    pub deadline: DateTime<Utc>,
    pub reservation: Option<ReservationId>,
    pub txid: Option<Txid>,
    pub signed: Option<SignedTransaction>,
}

impl Proposal {
    pub fn is_live(&self) -> bool {
        matches!(self.state, ProposalState::Collecting | ProposalState::Ready)
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    pub fn status(&self) -> ProposalStatus {
        ProposalStatus {
            id: self.id,
            state: self.state,
            collected: self.partials.len(),
            required: self.wallet.threshold(),
            signers: self.partials.keys().map(|&i| self.wallet.keys()[i]).collect(),
            deadline: self.deadline,
            txid: self.txid,
        }
    }
}

/// Witness source over the M lowest-indexed signers.
pub(crate) struct CollectedSignatures<'a> {
    pub partials: &'a BTreeMap<usize, Vec<Signature>>,
    pub threshold: usize,
}

impl MultisigWitnessSource for CollectedSignatures<'_> {
    fn multisig_signatures(
        &self,
        index: usize,
        _redeem_script: &[u8],
        _sighash: &[u8; HASH_SIZE],
    ) -> Result<Vec<Signature>> {
        self.partials
            .values()
            .take(self.threshold)
            .map(|sigs| {
                sigs.get(index).copied().ok_or_else(|| {
                    KestrelError::InternalError(format!("partial signature missing input {}", index))
                })
            })
            .collect()
    }
}
