//! Collection of partial signatures for multisig spends.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use kestrel_core::constants::HASH_SIZE;
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{PublicKey, Signature};
use kestrel_crypto::{verify, ExtendedPrivateKey};
use kestrel_tx::{
    all_input_hashes, MultisigWitnessSource, SignedTransaction, Signer, UnsignedTransaction,
    UtxoReservations,
};

use crate::proposal::{CollectedSignatures, Proposal, ProposalId, ProposalState, ProposalStatus};
use crate::wallet::MultisigWallet;

/// Coordinator configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Seconds a proposal may collect signatures
    pub proposal_deadline_secs: u64,
    /// Reserve the proposal's inputs until it finalizes or expires
    pub reserve_utxos: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            proposal_deadline_secs: 24 * 60 * 60,
            reserve_utxos: true,
        }
    }
}

impl CoordinatorConfig {
    /// Sets the collection deadline.
    pub fn with_deadline_secs(mut self, secs: u64) -> Self {
        self.proposal_deadline_secs = secs;
        self
    }

    /// Enables or disables UTXO reservation.
    pub fn with_reservations(mut self, reserve: bool) -> Self {
        self.reserve_utxos = reserve;
        self
    }
}

/// Signs every input of `unsigned` with `key`, producing one co-signer's partial.
pub fn sign_partial(unsigned: &UnsignedTransaction, key: &ExtendedPrivateKey) -> Result<Vec<Signature>> {
    all_input_hashes(unsigned)?
        .iter()
        .map(|hash| key.sign(hash))
        .collect()
}

/// Tracks multisig proposals from creation to a finalized transaction.
///
/// Each proposal sits behind its own lock; there is no coordinator-wide lock.
pub struct MultisigCoordinator {
    config: CoordinatorConfig,
    proposals: DashMap<ProposalId, Arc<Mutex<Proposal>>>,
    reservations: Arc<UtxoReservations>,
}

impl MultisigCoordinator {
    /// Creates a coordinator sharing `reservations` with the rest of the engine.
    pub fn new(config: CoordinatorConfig, reservations: Arc<UtxoReservations>) -> Self {
        Self {
            config,
            proposals: DashMap::new(),
            reservations,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Opens a proposal to spend `unsigned` from `wallet`.
    ///
    /// # Errors
    /// - `ValidationError` if an input does not spend the wallet's redeem script
    /// - `UtxoReserved` if reservation is enabled and an input is taken
    #[instrument(skip_all, fields(inputs = unsigned.inputs().len()))]
    pub fn propose(&self, unsigned: UnsignedTransaction, wallet: Arc<MultisigWallet>) -> Result<ProposalId> {
        if let Some(index) = unsigned.inputs().iter().position(|input| !wallet.owns(input)) {
            return Err(KestrelError::ValidationError(format!(
                "input {} does not spend wallet {}",
                index,
                wallet.address()
            )));
        }

        let sighashes = all_input_hashes(&unsigned)?;
        let reservation = if self.config.reserve_utxos {
            Some(self.reservations.reserve(&unsigned.outpoints())?)
        } else {
            None
        };

        let id = ProposalId::new();
        let deadline = Utc::now() + Duration::seconds(self.config.proposal_deadline_secs as i64);
        let proposal = Proposal {
            id,
            wallet,
            unsigned,
            sighashes,
            partials: BTreeMap::new(),
            state: ProposalState::Collecting,
            deadline,
            reservation,
            txid: None,
            signed: None,
        };
        self.proposals.insert(id, Arc::new(Mutex::new(proposal)));
        info!(proposal = %id, %deadline, "Proposal opened");
        Ok(id)
    }

    /// Adds one co-signer's signatures, one per input.
    ///
    /// A rejected submission leaves the proposal untouched.
    #[instrument(skip_all, fields(proposal = %id, signer = %signer))]
    pub fn submit_partial(
        &self,
        id: ProposalId,
        signer: &PublicKey,
        signatures: Vec<Signature>,
    ) -> Result<ProposalStatus> {
        let entry = self.entry(id)?;
        let mut proposal = entry.lock();
        self.check_deadline(&mut proposal)?;

        if !proposal.is_live() {
            return Err(KestrelError::InvalidStateTransition {
                from: proposal.state.to_string(),
                to: ProposalState::Ready.to_string(),
            });
        }

        let key_index = proposal
            .wallet
            .key_index(signer)
            .ok_or_else(|| KestrelError::UnknownSigner(signer.to_hex()))?;
        if proposal.partials.contains_key(&key_index) {
            return Err(KestrelError::DuplicateSignature(signer.to_hex()));
        }
        if signatures.len() != proposal.sighashes.len() {
            return Err(KestrelError::InvalidPartialSignature(format!(
                "expected {} signatures, got {}",
                proposal.sighashes.len(),
                signatures.len()
            )));
        }
        if let Some(input) = signatures
            .iter()
            .zip(&proposal.sighashes)
            .position(|(sig, hash)| !verify(signer, hash, sig))
        {
            return Err(KestrelError::InvalidPartialSignature(format!(
                "signature for input {} does not verify",
                input
            )));
        }

        proposal.partials.insert(key_index, signatures);
        if proposal.state == ProposalState::Collecting
            && proposal.partials.len() >= proposal.wallet.threshold()
        {
            proposal.state = ProposalState::Ready;
            info!(collected = proposal.partials.len(), "Proposal ready");
        } else {
            debug!(collected = proposal.partials.len(), "Partial signature accepted");
        }
        Ok(proposal.status())
    }

    /// Assembles and verifies the signed transaction.
    ///
    /// Uses exactly M signatures, taken from the lowest key indices and placed
    /// in redeem-script order.
    #[instrument(skip_all, fields(proposal = %id))]
    pub fn finalize(&self, id: ProposalId) -> Result<SignedTransaction> {
        let entry = self.entry(id)?;
        let mut proposal = entry.lock();
        self.check_deadline(&mut proposal)?;

        if proposal.state != ProposalState::Ready {
            return Err(KestrelError::InvalidStateTransition {
                from: proposal.state.to_string(),
                to: ProposalState::Finalized.to_string(),
            });
        }

        let source = CollectedSignatures {
            partials: &proposal.partials,
            threshold: proposal.wallet.threshold(),
        };
        let signed = Signer::sign(
            proposal.unsigned.clone(),
            &[],
            Some(&source as &dyn MultisigWitnessSource),
        )?;

        proposal.state = ProposalState::Finalized;
        proposal.txid = Some(signed.txid());
        proposal.signed = Some(signed.clone());
        info!(txid = %signed.txid(), "Proposal finalized");
        Ok(signed)
    }

    /// Signed transaction of a finalized proposal, for (re)broadcast.
    pub fn signed_transaction(&self, id: ProposalId) -> Result<SignedTransaction> {
        let entry = self.entry(id)?;
        let proposal = entry.lock();
        match (&proposal.signed, proposal.state) {
            (Some(signed), ProposalState::Finalized | ProposalState::Confirmed) => Ok(signed.clone()),
            _ => Err(KestrelError::InvalidStateTransition {
                from: proposal.state.to_string(),
                to: ProposalState::Finalized.to_string(),
            }),
        }
    }

    /// Records that the finalized transaction confirmed; its inputs are spent.
    #[instrument(skip(self))]
    pub fn confirm(&self, id: ProposalId) -> Result<ProposalStatus> {
        let entry = self.entry(id)?;
        let mut proposal = entry.lock();
        Self::require_finalized(&proposal, ProposalState::Confirmed)?;

        match proposal.reservation.take() {
            Some(reservation) if self.reservations.commit(reservation).is_ok() => {}
            _ => self.reservations.mark_spent(&proposal.unsigned.outpoints()),
        }
        proposal.state = ProposalState::Confirmed;
        info!(txid = ?proposal.txid, "Proposal confirmed");
        Ok(proposal.status())
    }

    /// Gives up on a finalized transaction that never reached the chain and
    /// releases its inputs.
    #[instrument(skip(self))]
    pub fn abandon(&self, id: ProposalId) -> Result<ProposalStatus> {
        let entry = self.entry(id)?;
        let mut proposal = entry.lock();
        Self::require_finalized(&proposal, ProposalState::Abandoned)?;

        if let Some(reservation) = proposal.reservation.take() {
            if !self.reservations.release(reservation) {
                warn!("Reservation already gone");
            }
        }
        proposal.state = ProposalState::Abandoned;
        proposal.signed = None;
        info!(txid = ?proposal.txid, "Proposal abandoned");
        Ok(proposal.status())
    }

    /// Cancels a live proposal and releases its inputs.
    pub fn cancel(&self, id: ProposalId) -> Result<ProposalStatus> {
        let entry = self.entry(id)?;
        let mut proposal = entry.lock();
        if !proposal.is_live() {
            return Err(KestrelError::InvalidStateTransition {
                from: proposal.state.to_string(),
                to: ProposalState::Expired.to_string(),
            });
        }
        self.expire(&mut proposal);
        info!(proposal = %id, "Proposal cancelled");
        Ok(proposal.status())
    }

    /// Expires every live proposal past its deadline. Returns how many expired.
    pub fn expire_stale(&self) -> usize {
        let now = Utc::now();
        let entries: Vec<_> = self.proposals.iter().map(|e| Arc::clone(e.value())).collect();

        let mut expired = 0;
        for entry in entries {
            let mut proposal = entry.lock();
            if proposal.is_live() && proposal.is_past_deadline(now) {
                self.expire(&mut proposal);
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "Stale proposals expired");
        }
        expired
    }

    /// Current status of a proposal.
    pub fn status(&self, id: ProposalId) -> Result<ProposalStatus> {
        Ok(self.entry(id)?.lock().status())
    }

    /// Statuses of all known proposals.
    pub fn list(&self) -> Vec<ProposalStatus> {
        self.proposals.iter().map(|e| e.value().lock().status()).collect()
    }

    /// Input digests a co-signer must sign.
    pub fn sighashes(&self, id: ProposalId) -> Result<Vec<[u8; HASH_SIZE]>> {
        Ok(self.entry(id)?.lock().sighashes.clone())
    }

    /// Unsigned transaction under signature.
    pub fn transaction(&self, id: ProposalId) -> Result<UnsignedTransaction> {
        Ok(self.entry(id)?.lock().unsigned.clone())
    }

    fn entry(&self, id: ProposalId) -> Result<Arc<Mutex<Proposal>>> {
        self.proposals
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| KestrelError::not_found("proposal", id))
    }

    fn require_finalized(proposal: &Proposal, to: ProposalState) -> Result<()> {
        if proposal.state != ProposalState::Finalized {
            return Err(KestrelError::InvalidStateTransition {
                from: proposal.state.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    fn check_deadline(&self, proposal: &mut Proposal) -> Result<()> {
        if proposal.state == ProposalState::Expired {
            return Err(KestrelError::ProposalExpired(proposal.id.to_string()));
        }
        if proposal.is_live() && proposal.is_past_deadline(Utc::now()) {
            self.expire(proposal);
            return Err(KestrelError::ProposalExpired(proposal.id.to_string()));
        }
        Ok(())
    }

    fn expire(&self, proposal: &mut Proposal) {
        proposal.state = ProposalState::Expired;
        if let Some(reservation) = proposal.reservation.take() {
            if !self.reservations.release(reservation) {
                warn!(proposal = %proposal.id, "Reservation already gone");
            }
        }
    }
}

impl std::fmt::Debug for MultisigCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultisigCoordinator")
            .field("config", &self.config)
            .field("proposals", &self.proposals.len())
            .finish()
    }
}
