//! Channel lifecycle and HTLC updates.
//!
//! Every channel is an independent aggregate behind its own
//! `tokio::sync::Mutex`. An update is staged on a copy of the record, sent to
//! the counterparty for its signature, verified, persisted and only then
//! swapped in, so a failed or timed-out update leaves the committed state
//! untouched. Chain calls never run while a channel lock is held.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use kestrel_chain::{ConfirmationWatcher, WaitOutcome};
use kestrel_core::constants::HASH_SIZE;
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::traits::{ChainClient, WalletRepository};
use kestrel_core::types::{
    ChannelId, ChannelRecord, ChannelState, ChildNumber, Commitment, DerivationPath, Htlc,
    HtlcDirection, HtlcId, HtlcOutcome, Network, NodeId, PaymentHash, Preimage, ResolvedHtlc,
    Txid,
};
use kestrel_crypto::{sha256, verify, ExtendedPrivateKey};

use crate::commitment::{
    commitment_transaction, complete_transaction, funding_address, funding_script,
    settlement_transaction, signing_digest, ChannelParams,
};
use crate::config::ChannelConfig;
use crate::funder::{ChannelFunder, FundingTransaction};
use crate::graph::{ChannelEdge, ChannelGraph, Route};
use crate::peer::{ClosingProposal, CommitmentUpdate, Counterparty, OpenRequest};

// ═══════════════════════════════════════════════════════════════════════════════
// RESULT TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// How to close a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseMode {
    /// Both parties sign a settlement of the current balances.
    Cooperative,
    /// Broadcast the last mutually signed commitment.
    Force,
}

/// Where an HTLC stands after a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HtlcStatus {
    /// Still in the commitment.
    Pending,
    /// Settled by this call.
    Fulfilled,
    /// Failed back to the sender.
    Failed,
    /// Was already settled; nothing changed.
    AlreadySettled,
}

/// Outcome of [`ChannelManager::sweep_expired`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired HTLCs failed back
    pub failed: Vec<HtlcId>,
    /// Channels force-closed because the counterparty would not countersign
    pub force_closed: Vec<ChannelId>,
}

/// Outcome of [`ChannelManager::poll_chain`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Channels whose funding reached the required depth
    pub opened: Vec<ChannelId>,
    /// Channels whose closing transaction settled
    pub closed: Vec<ChannelId>,
    /// Negotiating channels failed because the chain does not know their funding
    pub failed: Vec<ChannelId>,
}

/// Outcome of [`ChannelManager::load`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Channels restored as stored
    pub loaded: usize,
    /// Channels refused with `IntegrityViolation` and moved to `ForceClosing`
    pub refused: Vec<ChannelId>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) struct ChannelEntry {
    pub(crate) record: ChannelRecord,
    peer: Option<Arc<dyn Counterparty>>,
    funding: Option<FundingTransaction>,
}

impl ChannelEntry {
    fn peer(&self) -> Result<Arc<dyn Counterparty>> {
        self.peer
            .clone()
            .ok_or_else(|| KestrelError::not_found("peer", self.record.counterparty))
    }
}

/// Owns every channel of one node.
pub struct ChannelManager {
    config: ChannelConfig,
    network: Network,
    node_key: ExtendedPrivateKey,
    chain: Arc<dyn ChainClient>,
    repository: Arc<dyn WalletRepository>,
    funder: Arc<dyn ChannelFunder>,
    channels: DashMap<ChannelId, Arc<Mutex<ChannelEntry>>>,
    peers: DashMap<NodeId, Arc<dyn Counterparty>>,
    graph: RwLock<ChannelGraph>,
    /// Outgoing HTLC → the incoming HTLC it was forwarded for
    pub(crate) forwards: DashMap<HtlcId, HtlcId>,
    next_key_index: AtomicU32,
}

impl ChannelManager {
    /// Creates a manager.
    ///
    /// `node_key` is the node identity key; channel funding keys are its
    /// normal children. `chain` should already be wrapped in a retry policy.
    pub fn new(
        config: ChannelConfig,
        network: Network,
        node_key: ExtendedPrivateKey,
        chain: Arc<dyn ChainClient>,
        repository: Arc<dyn WalletRepository>,
        funder: Arc<dyn ChannelFunder>,
    ) -> Self {
        Self {
            config,
            network,
            node_key,
            chain,
            repository,
            funder,
            channels: DashMap::new(),
            peers: DashMap::new(),
            graph: RwLock::new(ChannelGraph::new()),
            forwards: DashMap::new(),
            next_key_index: AtomicU32::new(0),
        }
    }

    /// Our node id.
    pub fn node_id(&self) -> NodeId {
        *self.node_key.public_key()
    }

    /// Active configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Chain client the manager uses.
    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }

    /// Makes `peer` reachable, attaching it to any loaded channels it owns.
    pub async fn register_peer(&self, peer: Arc<dyn Counterparty>) {
        let node_id = peer.node_id();
        self.peers.insert(node_id, peer.clone());
        for entry in self.entries() {
            let mut guard = entry.lock().await;
            if guard.record.counterparty == node_id {
                guard.peer = Some(peer.clone());
            }
        }
        debug!(peer = %node_id, "Peer registered");
    }

    /// Adds a channel between other nodes to the routing graph.
    pub fn add_remote_channel(&self, edge: ChannelEdge) {
        self.graph.write().add_edge(edge);
    }

    /// Cheapest route from us to `target`.
    pub fn find_route(&self, target: NodeId, amount: u64, final_expiry: u32) -> Result<Route> {
        self.graph
            .read()
            .find_route(self.node_id(), target, amount, final_expiry)
    }

    /// Committed state of a channel.
    pub async fn channel(&self, channel_id: &ChannelId) -> Result<ChannelRecord> {
        Ok(self.entry(channel_id)?.lock().await.record.clone())
    }

    /// Committed state of every channel, ordered by id.
    pub async fn list_channels(&self) -> Vec<ChannelRecord> {
        let mut records = Vec::with_capacity(self.channels.len());
        for entry in self.entries() {
            records.push(entry.lock().await.record.clone());
        }
        records
    }

    /// A pending HTLC.
    pub async fn pending_htlc(&self, htlc_id: HtlcId) -> Result<Htlc> {
        let entry = self.entry(&htlc_id.channel_id)?;
        let guard = entry.lock().await;
        guard
            .record
            .pending_htlc(htlc_id.index)
            .cloned()
            .ok_or_else(|| KestrelError::not_found("htlc", htlc_id))
    }

    /// Current status of an HTLC.
    pub async fn htlc_status(&self, htlc_id: HtlcId) -> Result<HtlcStatus> {
        let entry = self.entry(&htlc_id.channel_id)?;
        let guard = entry.lock().await;
        if guard.record.pending_htlc(htlc_id.index).is_some() {
            return Ok(HtlcStatus::Pending);
        }
        match guard.record.resolved_htlc(htlc_id.index) {
            Some(r) if r.outcome == HtlcOutcome::Fulfilled => Ok(HtlcStatus::Fulfilled),
            Some(_) => Ok(HtlcStatus::Failed),
            None => Err(KestrelError::not_found("htlc", htlc_id)),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // OPENING
    // ═══════════════════════════════════════════════════════════════════════════

    /// Opens a channel to `peer` funded with `capacity`, crediting
    /// `push_amount` to the peer.
    ///
    /// The channel stays `Negotiating` until its funding confirms. If the
    /// funding broadcast fails the error is returned, but the channel keeps
    /// its funding inputs; [`rebroadcast_funding`](Self::rebroadcast_funding)
    /// retries and [`poll_chain`](Self::poll_chain) fails the channel once the
    /// chain reports the funding unknown.
    ///
    /// # Errors
    /// - `ValidationError` for a capacity below the minimum or a push amount
    ///   not below the capacity
    /// - `CountersignTimeout` / `CounterpartyRejected` if the peer does not
    ///   accept or sign version 0; the funding inputs are released
    /// - the funder's error if the funding transaction cannot be built
    #[instrument(skip_all, fields(peer = %peer.node_id(), capacity = capacity, push = push_amount))]
    pub async fn open(
        &self,
        peer: Arc<dyn Counterparty>,
        capacity: u64,
        push_amount: u64,
    ) -> Result<ChannelId> {
        if capacity < self.config.min_capacity {
            return Err(KestrelError::ValidationError(format!(
                "capacity {} below minimum {}",
                capacity, self.config.min_capacity
            )));
        }
        if push_amount >= capacity {
            return Err(KestrelError::ValidationError(
                "push amount must be below capacity".into(),
            ));
        }

        let mut id = [0u8; HASH_SIZE];
        OsRng.fill_bytes(&mut id);
        let channel_id = ChannelId::from_bytes(id);

        let key_index = self.next_key_index.fetch_add(1, Ordering::SeqCst);
        let key_path = DerivationPath::from_children(vec![ChildNumber::Normal(key_index)])?;
        let local_key = self.node_key.derive_path(&key_path)?;
        let request = OpenRequest {
            channel_id,
            funder: self.node_id(),
            capacity,
            push_amount,
            funding_key: *local_key.public_key(),
        };
        let remote_key = self
            .await_peer(channel_id, peer.accept_channel(&request))
            .await?;

        let script = funding_script(local_key.public_key(), &remote_key)?;
        let address = funding_address(&script, self.network)?;
        let funding = self.funder.fund(&address, capacity).await?;

        let now = Utc::now();
        let record = ChannelRecord {
            id: channel_id,
            counterparty: peer.node_id(),
            capacity,
            is_funder: true,
            state: ChannelState::Negotiating,
            commitment: Commitment {
                version: 0,
                local_balance: capacity - push_amount,
                remote_balance: push_amount,
                htlcs: Default::default(),
                remote_signature: None,
            },
            funding_outpoint: Some(funding.outpoint()),
            funding_script: script,
            local_key_path: key_path,
            local_funding_key: *local_key.public_key(),
            remote_funding_key: remote_key,
            closing_txid: None,
            dispute_deadline: None,
            resolved: Vec::new(),
            next_htlc_index: 0,
            created_at: now,
            updated_at: now,
        };
        let mut entry = ChannelEntry {
            record: record.clone(),
            peer: Some(peer.clone()),
            funding: Some(funding.clone()),
        };

        // Version 0 is signed before the funding transaction leaves us.
        if let Err(e) = self.commit_update(&mut entry, record).await {
            warn!(channel = %channel_id, error = %e, "Initial commitment not signed");
            self.funder.release(&funding).await;
            return Err(e);
        }
        self.peers.insert(peer.node_id(), peer);

        let broadcast = self
            .chain
            .broadcast_transaction(&funding.transaction.serialize())
            .await;
        self.channels.insert(channel_id, Arc::new(Mutex::new(entry)));
        if let Err(e) = broadcast {
            warn!(
                channel = %channel_id,
                error = %e,
                "Funding broadcast failed, channel kept negotiating"
            );
            return Err(e);
        }

        info!(channel = %channel_id, funding = %funding.outpoint(), "Channel funding broadcast");
        Ok(channel_id)
    }

    /// Sends the funding transaction of a negotiating channel again.
    ///
    /// # Errors
    /// - `InvalidStateTransition` outside `Negotiating`
    /// - `NotFound` if the funding transaction is not held locally
    /// - the chain's error; the channel stays negotiating
    #[instrument(skip(self))]
    pub async fn rebroadcast_funding(&self, channel_id: ChannelId) -> Result<Txid> {
        let entry = self.entry(&channel_id)?;
        let raw = {
            let guard = entry.lock().await;
            if guard.record.state != ChannelState::Negotiating {
                return Err(KestrelError::InvalidStateTransition {
                    from: guard.record.state.to_string(),
                    to: ChannelState::Open.to_string(),
                });
            }
            guard
                .funding
                .as_ref()
                .map(|f| f.transaction.serialize())
                .ok_or_else(|| KestrelError::not_found("funding transaction", channel_id))?
        };
        let txid = self.chain.broadcast_transaction(&raw).await?;
        info!(%txid, "Channel funding rebroadcast");
        Ok(txid)
    }

    /// Opens the channel if its funding has the configured depth.
    pub async fn confirm_funding(&self, channel_id: &ChannelId) -> Result<ChannelState> {
        let entry = self.entry(channel_id)?;
        let (state, outpoint) = {
            let guard = entry.lock().await;
            (guard.record.state, guard.record.funding_outpoint)
        };
        let Some(outpoint) = outpoint.filter(|_| state == ChannelState::Negotiating) else {
            return Ok(state);
        };

        if self.depth(&outpoint.txid).await? < self.config.min_funding_depth {
            return Ok(ChannelState::Negotiating);
        }
        self.mark_open(&entry).await
    }

    /// Waits for the funding to confirm, then opens the channel.
    ///
    /// Cancellation or a chain error fails the channel and releases the
    /// funding inputs.
    #[instrument(skip_all, fields(channel = %channel_id))]
    pub async fn wait_for_funding(
        &self,
        channel_id: &ChannelId,
        cancel: &CancellationToken,
    ) -> Result<ChannelState> {
        let entry = self.entry(channel_id)?;
        let (state, outpoint) = {
            let guard = entry.lock().await;
            (guard.record.state, guard.record.funding_outpoint)
        };
        let Some(outpoint) = outpoint.filter(|_| state == ChannelState::Negotiating) else {
            return Ok(state);
        };

        let watcher = ConfirmationWatcher::new(self.chain.clone(), self.config.funding_poll());
        match watcher
            .wait_for(outpoint.txid, self.config.min_funding_depth, cancel)
            .await
        {
            Ok(WaitOutcome::Confirmed(_)) => self.mark_open(&entry).await,
            Ok(WaitOutcome::Cancelled) => {
                self.fail_funding(&entry, "funding wait cancelled").await?;
                Ok(ChannelState::Failed)
            }
            Err(e) => {
                self.fail_funding(&entry, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn mark_open(&self, entry: &Mutex<ChannelEntry>) -> Result<ChannelState> {
        let mut guard = entry.lock().await;
        if guard.record.state != ChannelState::Negotiating {
            return Ok(guard.record.state);
        }
        let mut staged = guard.record.clone();
        staged.state = ChannelState::Open;
        self.save(&mut guard, staged).await?;
        if let Some(funding) = guard.funding.take() {
            self.funder.commit(&funding).await;
        }

        let record = &guard.record;
        self.graph.write().add_channel(
            record.id,
            self.node_id(),
            record.counterparty,
            record.capacity,
            self.config.relay,
        );
        info!(channel = %record.id, "Channel open");
        Ok(ChannelState::Open)
    }

    async fn fail_funding(&self, entry: &Mutex<ChannelEntry>, reason: &str) -> Result<()> {
        let mut guard = entry.lock().await;
        if guard.record.state != ChannelState::Negotiating {
            return Ok(());
        }
        let mut staged = guard.record.clone();
        staged.state = ChannelState::Failed;
        self.save(&mut guard, staged).await?;
        if let Some(funding) = guard.funding.take() {
            self.funder.release(&funding).await;
        }
        warn!(channel = %guard.record.id, reason, "Channel funding failed");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // HTLC UPDATES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Offers an HTLC funded from our balance.
    ///
    /// # Errors
    /// - `ChannelNotOpen` outside `Open`
    /// - `InsufficientChannelBalance` if the local balance is below `amount`
    /// - `HtlcExpiryTooSoon` if `expiry` is not beyond the current height
    /// - `CountersignTimeout` / `CounterpartyRejected`; the channel is unchanged
    #[instrument(skip_all, fields(channel = %channel_id, amount = amount, expiry = expiry))]
    pub async fn add_htlc(
        &self,
        channel_id: ChannelId,
        payment_hash: PaymentHash,
        amount: u64,
        expiry: u32,
    ) -> Result<HtlcId> {
        let height = self.chain.get_block_height().await?;
        let entry = self.entry(&channel_id)?;
        let mut guard = entry.lock().await;
        self.add_locked(&mut guard, HtlcDirection::Offered, payment_hash, amount, expiry, height, None)
            .await
    }

    /// Accepts an HTLC offered by the counterparty, funded from its balance.
    #[instrument(skip_all, fields(channel = %channel_id, amount = amount, expiry = expiry))]
    pub async fn receive_htlc(
        &self,
        channel_id: ChannelId,
        payment_hash: PaymentHash,
        amount: u64,
        expiry: u32,
    ) -> Result<HtlcId> {
        let height = self.chain.get_block_height().await?;
        let entry = self.entry(&channel_id)?;
        let mut guard = entry.lock().await;
        self.add_locked(&mut guard, HtlcDirection::Received, payment_hash, amount, expiry, height, None)
            .await
    }

    pub(crate) async fn add_locked(
        &self,
        entry: &mut ChannelEntry,
        direction: HtlcDirection,
        payment_hash: PaymentHash,
        amount: u64,
        expiry: u32,
        height: u32,
        forwarded_from: Option<HtlcId>,
    ) -> Result<HtlcId> {
        let record = &entry.record;
        if record.state != ChannelState::Open {
            return Err(KestrelError::ChannelNotOpen(format!(
                "channel {} is {}",
                record.id, record.state
            )));
        }
        if amount == 0 {
            return Err(KestrelError::ValidationError("HTLC amount must be positive".into()));
        }
        if expiry <= height {
            return Err(KestrelError::HtlcExpiryTooSoon { expiry, height });
        }
        if record.commitment.htlcs.len() >= self.config.max_pending_htlcs {
            return Err(KestrelError::ValidationError(format!(
                "channel {} already has {} pending HTLCs",
                record.id,
                record.commitment.htlcs.len()
            )));
        }

        let mut staged = stage(record);
        let side = match direction {
            HtlcDirection::Offered => &mut staged.commitment.local_balance,
            HtlcDirection::Received => &mut staged.commitment.remote_balance,
        };
        if *side < amount {
            return Err(KestrelError::InsufficientChannelBalance {
                needed: amount,
                available: *side,
            });
        }
        *side -= amount;

        let index = staged.next_htlc_index;
        staged.commitment.htlcs.insert(
            index,
            Htlc {
                index,
                payment_hash,
                amount,
                expiry,
                direction,
                forwarded_from,
            },
        );
        staged.next_htlc_index += 1;
        let channel_id = staged.id;

        self.commit_update(entry, staged).await?;
        let htlc_id = HtlcId { channel_id, index };
        debug!(htlc = %htlc_id, ?direction, version = entry.record.commitment.version, "HTLC added");
        Ok(htlc_id)
    }

    /// Settles an HTLC with its preimage, moving the amount to the receiver.
    ///
    /// If the HTLC was forwarded, the incoming HTLC it came from is settled
    /// with the same preimage.
    ///
    /// # Errors
    /// - `PreimageMismatch` if `sha256(preimage)` is not the payment hash
    /// - `HtlcAlreadyResolved` if it was failed
    /// - `NotFound` for an unknown HTLC
    pub async fn fulfill_htlc(&self, htlc_id: HtlcId, preimage: &Preimage) -> Result<HtlcStatus> {
        let status = self.settle_one(htlc_id, preimage).await?;
        if status == HtlcStatus::Fulfilled {
            if let Some((_, incoming)) = self.forwards.remove(&htlc_id) {
                match self.settle_one(incoming, preimage).await {
                    Ok(_) => info!(outgoing = %htlc_id, incoming = %incoming, "Forwarded HTLC settled"),
                    Err(e) => error!(incoming = %incoming, error = %e, "Incoming HTLC not settled"),
                }
            }
        }
        Ok(status)
    }

    #[instrument(skip_all, fields(htlc = %htlc_id))]
    async fn settle_one(&self, htlc_id: HtlcId, preimage: &Preimage) -> Result<HtlcStatus> {
        let entry = self.entry(&htlc_id.channel_id)?;
        let mut guard = entry.lock().await;
        let hash = sha256(preimage.as_bytes());

        let record = &guard.record;
        if let Some(htlc) = record.pending_htlc(htlc_id.index) {
            if htlc.payment_hash.0 != hash {
                return Err(KestrelError::PreimageMismatch);
            }
        } else {
            let resolved = record
                .resolved_htlc(htlc_id.index)
                .ok_or_else(|| KestrelError::not_found("htlc", htlc_id))?;
            if resolved.htlc.payment_hash.0 != hash {
                return Err(KestrelError::PreimageMismatch);
            }
            return match resolved.outcome {
                HtlcOutcome::Fulfilled => {
                    debug!("HTLC already settled");
                    Ok(HtlcStatus::AlreadySettled)
                }
                HtlcOutcome::Failed => Err(KestrelError::HtlcAlreadyResolved(htlc_id.to_string())),
            };
        }

        self.resolve_locked(&mut guard, htlc_id.index, HtlcOutcome::Fulfilled)
            .await?;
        info!("HTLC fulfilled");
        Ok(HtlcStatus::Fulfilled)
    }

    /// Fails an HTLC, returning the amount to the sender.
    ///
    /// Failing an already failed HTLC is a no-op. A forwarded HTLC also fails
    /// the incoming HTLC it came from.
    ///
    /// # Errors
    /// `HtlcAlreadyResolved` if it was fulfilled.
    pub async fn fail_htlc(&self, htlc_id: HtlcId, reason: &str) -> Result<HtlcStatus> {
        let status = self.fail_one(htlc_id, reason).await?;
        if let Some((_, incoming)) = self.forwards.remove(&htlc_id) {
            if let Err(e) = self.fail_one(incoming, "downstream failure").await {
                error!(incoming = %incoming, error = %e, "Incoming HTLC not failed back");
            }
        }
        Ok(status)
    }

    #[instrument(skip_all, fields(htlc = %htlc_id, reason = reason))]
    async fn fail_one(&self, htlc_id: HtlcId, reason: &str) -> Result<HtlcStatus> {
        let entry = self.entry(&htlc_id.channel_id)?;
        let mut guard = entry.lock().await;

        if guard.record.pending_htlc(htlc_id.index).is_none() {
            return match guard.record.resolved_htlc(htlc_id.index) {
                Some(r) if r.outcome == HtlcOutcome::Failed => Ok(HtlcStatus::Failed),
                Some(_) => Err(KestrelError::HtlcAlreadyResolved(htlc_id.to_string())),
                None => Err(KestrelError::not_found("htlc", htlc_id)),
            };
        }

        self.resolve_locked(&mut guard, htlc_id.index, HtlcOutcome::Failed)
            .await?;
        info!("HTLC failed");
        Ok(HtlcStatus::Failed)
    }

    async fn resolve_locked(
        &self,
        entry: &mut ChannelEntry,
        index: u64,
        outcome: HtlcOutcome,
    ) -> Result<()> {
        if entry.record.state != ChannelState::Open {
            return Err(KestrelError::ChannelNotOpen(format!(
                "channel {} is {}",
                entry.record.id, entry.record.state
            )));
        }
        let mut staged = stage(&entry.record);
        let htlc = staged
            .commitment
            .htlcs
            .remove(&index)
            .ok_or_else(|| KestrelError::not_found("htlc", index))?;

        let side = match (htlc.direction, outcome) {
            (HtlcDirection::Offered, HtlcOutcome::Fulfilled)
            | (HtlcDirection::Received, HtlcOutcome::Failed) => &mut staged.commitment.remote_balance,
            (HtlcDirection::Received, HtlcOutcome::Fulfilled)
            | (HtlcDirection::Offered, HtlcOutcome::Failed) => &mut staged.commitment.local_balance,
        };
        *side = side.checked_add(htlc.amount).ok_or(KestrelError::AmountOverflow)?;

        staged.resolved.push(ResolvedHtlc {
            htlc,
            outcome,
            resolved_at_version: staged.commitment.version,
        });
        self.commit_update(entry, staged).await
    }

    /// Fails every HTLC with `expiry <= height`.
    ///
    /// A channel whose counterparty will not countersign the failure is
    /// force-closed.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self, height: u32) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for entry in self.entries() {
            let (channel_id, expired) = {
                let guard = entry.lock().await;
                if guard.record.state != ChannelState::Open {
                    continue;
                }
                let expired: Vec<u64> = guard
                    .record
                    .commitment
                    .htlcs
                    .values()
                    .filter(|h| h.expiry <= height)
                    .map(|h| h.index)
                    .collect();
                (guard.record.id, expired)
            };

            for index in expired {
                let htlc_id = HtlcId { channel_id, index };
                match self.fail_htlc(htlc_id, "expired").await {
                    Ok(_) => report.failed.push(htlc_id),
                    Err(
                        e @ (KestrelError::CountersignTimeout(_)
                        | KestrelError::CounterpartyRejected(_)
                        | KestrelError::VerificationFailed(_)),
                    ) => {
                        warn!(htlc = %htlc_id, error = %e, "Counterparty will not fail expired HTLC");
                        if let Err(close_err) = self.force_close(channel_id).await {
                            error!(channel = %channel_id, error = %close_err, "Force close failed");
                        }
                        report.force_closed.push(channel_id);
                        break;
                    }
                    Err(e) => warn!(htlc = %htlc_id, error = %e, "Expired HTLC not failed"),
                }
            }
        }

        if !report.failed.is_empty() || !report.force_closed.is_empty() {
            info!(
                failed = report.failed.len(),
                force_closed = report.force_closed.len(),
                "Expired HTLCs swept"
            );
        }
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // CLOSING
    // ═══════════════════════════════════════════════════════════════════════════

    /// Closes a channel and returns the broadcast txid.
    pub async fn close(&self, channel_id: ChannelId, mode: CloseMode) -> Result<Txid> {
        match mode {
            CloseMode::Cooperative => self.close_cooperative(channel_id).await,
            CloseMode::Force => self.force_close(channel_id).await,
        }
    }

    /// Settles the current balances with the counterparty's signature.
    ///
    /// # Errors
    /// - `ChannelNotOpen` outside `Open`
    /// - `ChannelHasPendingHtlcs` while HTLCs are in flight
    #[instrument(skip(self))]
    pub async fn close_cooperative(&self, channel_id: ChannelId) -> Result<Txid> {
        let entry = self.entry(&channel_id)?;
        let signed = {
            let mut guard = entry.lock().await;
            if guard.record.state != ChannelState::Open {
                return Err(KestrelError::ChannelNotOpen(format!(
                    "channel {} is {}",
                    channel_id, guard.record.state
                )));
            }
            let pending = guard.record.commitment.htlcs.len();
            if pending > 0 {
                return Err(KestrelError::ChannelHasPendingHtlcs(pending));
            }

            let params = ChannelParams::from_record(&guard.record, self.network)?;
            let local_balance = guard.record.commitment.local_balance;
            let remote_balance = guard.record.commitment.remote_balance;
            let fee = self.config.closing_fee;
            let tx = settlement_transaction(&params, local_balance, remote_balance, fee)?;
            let proposal = ClosingProposal {
                params: params.clone(),
                local_balance,
                remote_balance,
                fee,
                digest: signing_digest(&tx)?,
            };

            let peer = guard.peer()?;
            let remote_signature = self
                .await_peer(channel_id, peer.sign_closing(&proposal))
                .await?;
            let local_key = self.channel_key(&guard.record)?;
            let signed = complete_transaction(tx, &params, &local_key, remote_signature)?;

            let mut staged = guard.record.clone();
            staged.state = ChannelState::Closing;
            staged.closing_txid = Some(signed.txid());
            self.save(&mut guard, staged).await?;
            signed
        };

        self.graph.write().remove_channel(&channel_id);
        let txid = self.chain.broadcast_transaction(&signed.serialize()).await?;
        info!(%txid, fee = signed.fee(), "Cooperative close broadcast");
        Ok(txid)
    }

    /// Broadcasts the last mutually signed commitment and starts the dispute window.
    #[instrument(skip(self))]
    pub async fn force_close(&self, channel_id: ChannelId) -> Result<Txid> {
        let height = self.chain.get_block_height().await?;
        let entry = self.entry(&channel_id)?;
        let signed = {
            let mut guard = entry.lock().await;
            let state = guard.record.state;
            if !state.can_transition_to(ChannelState::ForceClosing) {
                return Err(KestrelError::InvalidStateTransition {
                    from: state.to_string(),
                    to: ChannelState::ForceClosing.to_string(),
                });
            }
            let remote_signature = guard.record.commitment.remote_signature.ok_or_else(|| {
                KestrelError::IntegrityViolation(format!(
                    "channel {} has no countersigned commitment",
                    channel_id
                ))
            })?;

            let params = ChannelParams::from_record(&guard.record, self.network)?;
            let tx = commitment_transaction(
                &params,
                &guard.record.commitment,
                self.config.commitment_fee,
            )?;
            let local_key = self.channel_key(&guard.record)?;
            let signed = complete_transaction(tx, &params, &local_key, remote_signature)?;

            let mut staged = guard.record.clone();
            staged.state = ChannelState::ForceClosing;
            staged.closing_txid = Some(signed.txid());
            staged.dispute_deadline = Some(height.saturating_add(self.config.to_self_delay));
            self.save(&mut guard, staged).await?;
            signed
        };

        self.graph.write().remove_channel(&channel_id);
        let txid = self.chain.broadcast_transaction(&signed.serialize()).await?;
        warn!(%txid, height = height, "Commitment broadcast, channel force-closing");
        Ok(txid)
    }

    /// Advances channels waiting on the chain: funding depth reached opens a
    /// channel, funding the chain does not know fails it, and a confirmed
    /// closing transaction (after the dispute window for a force close)
    /// closes it.
    pub async fn poll_chain(&self) -> Result<PollReport> {
        let height = self.chain.get_block_height().await?;
        let mut report = PollReport::default();

        for entry in self.entries() {
            let (channel_id, state, funding, closing, deadline) = {
                let guard = entry.lock().await;
                let r = &guard.record;
                (r.id, r.state, r.funding_outpoint, r.closing_txid, r.dispute_deadline)
            };

            match (state, funding, closing) {
                (ChannelState::Negotiating, Some(outpoint), _) => {
                    match self.chain.get_confirmation_depth(&outpoint.txid).await {
                        Ok(depth) => {
                            if depth >= self.config.min_funding_depth
                                && self.mark_open(&entry).await? == ChannelState::Open
                            {
                                report.opened.push(channel_id);
                            }
                        }
                        Err(KestrelError::NotFound { .. }) => {
                            self.fail_funding(&entry, "funding unknown to the chain").await?;
                            report.failed.push(channel_id);
                        }
                        Err(e) => return Err(e),
                    }
                }
                (ChannelState::Closing | ChannelState::ForceClosing, _, Some(txid)) => {
                    let window_over = state == ChannelState::Closing
                        || deadline.map_or(true, |d| height >= d);
                    if window_over && self.depth(&txid).await? >= 1 && self.mark_closed(&entry, state).await? {
                        report.closed.push(channel_id);
                    }
                }
                _ => {}
            }
        }
        Ok(report)
    }

    async fn mark_closed(&self, entry: &Mutex<ChannelEntry>, from: ChannelState) -> Result<bool> {
        let mut guard = entry.lock().await;
        if guard.record.state != from {
            return Ok(false);
        }
        let mut staged = guard.record.clone();
        staged.state = ChannelState::Closed;
        self.save(&mut guard, staged).await?;
        info!(channel = %guard.record.id, "Channel closed");
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // RECOVERY
    // ═══════════════════════════════════════════════════════════════════════════

    /// Restores channels from the repository, including the links from
    /// pending forwarded HTLCs to the incoming HTLCs they settle.
    ///
    /// Channels whose balances do not add up to their capacity are refused
    /// and moved to `ForceClosing`; they accept no further updates.
    pub async fn load(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        for mut record in self.repository.list_channels().await? {
            if self.channels.contains_key(&record.id) {
                continue;
            }
            if let Some(ChildNumber::Normal(index)) = record.local_key_path.last() {
                self.next_key_index.fetch_max(index.saturating_add(1), Ordering::SeqCst);
            }

            match record.check_balance_invariant() {
                Ok(()) => {
                    for htlc in record.commitment.htlcs.values() {
                        if let Some(incoming) = htlc.forwarded_from {
                            let outgoing = HtlcId {
                                channel_id: record.id,
                                index: htlc.index,
                            };
                            self.forwards.insert(outgoing, incoming);
                        }
                    }
                    if record.state == ChannelState::Open {
                        self.graph.write().add_channel(
                            record.id,
                            self.node_id(),
                            record.counterparty,
                            record.capacity,
                            self.config.relay,
                        );
                    }
                    report.loaded += 1;
                }
                Err(e) => {
                    error!(channel = %record.id, error = %e, "Refusing stored channel");
                    if !record.state.is_terminal() {
                        record.state = ChannelState::ForceClosing;
                        record.updated_at = Utc::now();
                        self.repository.save_channel_state(&record).await?;
                    }
                    report.refused.push(record.id);
                }
            }

            let peer = self.peers.get(&record.counterparty).map(|p| p.value().clone());
            self.channels.insert(
                record.id,
                Arc::new(Mutex::new(ChannelEntry {
                    record,
                    peer,
                    funding: None,
                })),
            );
        }

        info!(loaded = report.loaded, refused = report.refused.len(), "Channels loaded");
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // INTERNALS
    // ═══════════════════════════════════════════════════════════════════════════

    pub(crate) fn entry(&self, channel_id: &ChannelId) -> Result<Arc<Mutex<ChannelEntry>>> {
        self.channels
            .get(channel_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| KestrelError::not_found("channel", channel_id))
    }

    fn entries(&self) -> Vec<Arc<Mutex<ChannelEntry>>> {
        let mut entries: Vec<(ChannelId, Arc<Mutex<ChannelEntry>>)> = self
            .channels
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, entry)| entry).collect()
    }

    fn channel_key(&self, record: &ChannelRecord) -> Result<ExtendedPrivateKey> {
        self.node_key.derive_path(&record.local_key_path)
    }

    async fn depth(&self, txid: &Txid) -> Result<u32> {
        match self.chain.get_confirmation_depth(txid).await {
            Ok(depth) => Ok(depth),
            Err(KestrelError::NotFound { .. }) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Bounds a counterparty request by the countersign timeout.
    async fn await_peer<T>(
        &self,
        channel_id: ChannelId,
        request: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.countersign_timeout(), request).await {
            Ok(result) => result,
            Err(_) => {
                warn!(channel = %channel_id, "Counterparty did not answer in time");
                Err(KestrelError::CountersignTimeout(channel_id.to_string()))
            }
        }
    }

    /// Gets `staged` countersigned, then persists and commits it.
    async fn commit_update(&self, entry: &mut ChannelEntry, mut staged: ChannelRecord) -> Result<()> {
        staged.check_balance_invariant()?;
        let params = ChannelParams::from_record(&staged, self.network)?;
        let tx = commitment_transaction(&params, &staged.commitment, self.config.commitment_fee)?;
        let digest = signing_digest(&tx)?;

        let update = CommitmentUpdate {
            params,
            commitment: staged.commitment.clone(),
            fee: self.config.commitment_fee,
            digest,
        };
        let peer = entry.peer()?;
        let signature = self
            .await_peer(staged.id, peer.countersign(&update))
            .await?;
        if !verify(&staged.remote_funding_key, &digest, &signature) {
            return Err(KestrelError::VerificationFailed(format!(
                "countersignature of channel {} version {}",
                staged.id, staged.commitment.version
            )));
        }

        staged.commitment.remote_signature = Some(signature);
        self.save(entry, staged).await
    }

    async fn save(&self, entry: &mut ChannelEntry, mut staged: ChannelRecord) -> Result<()> {
        staged.updated_at = Utc::now();
        self.repository.save_channel_state(&staged).await?;
        entry.record = staged;
        Ok(())
    }
}

/// Copy of `record` with the next commitment version and no signature.
fn stage(record: &ChannelRecord) -> ChannelRecord {
    let mut staged = record.clone();
    staged.commitment.version += 1;
    staged.commitment.remote_signature = None;
    staged
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("node_id", &self.node_id())
            .field("network", &self.network)
            .field("channels", &self.channels.len())
            .field("peers", &self.peers.len())
            .field("graph_edges", &self.graph.read().edge_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use kestrel_chain::MemoryChain;
    use kestrel_core::constants::{DEFAULT_MIN_FINAL_CLTV, PURPOSE_NODE};
    use kestrel_crypto::Seed;
    use kestrel_store::MemoryRepository;
    use kestrel_tx::UtxoReservations;

    use crate::funder::KeyFunder;
    use crate::peer::LoopbackPeer;

    struct Harness {
        chain: Arc<MemoryChain>,
        repository: Arc<MemoryRepository>,
        funder: Arc<KeyFunder>,
        manager: ChannelManager,
    }

    fn key(byte: u8) -> ExtendedPrivateKey {
        ExtendedPrivateKey::from_seed(&Seed::from_bytes(&[byte; 32]).unwrap()).unwrap()
    }

    fn peer(byte: u8) -> Arc<LoopbackPeer> {
        Arc::new(LoopbackPeer::from_seed(&Seed::from_bytes(&[byte; 32]).unwrap()).unwrap())
    }

    fn harness(config: ChannelConfig) -> Harness {
        let chain = Arc::new(MemoryChain::new(Network::Regtest));
        let repository = Arc::new(MemoryRepository::new());
        let funder = Arc::new(
            KeyFunder::new(key(2), Network::Regtest, Arc::new(UtxoReservations::new())).unwrap(),
        );
        for _ in 0..2 {
            let (_, utxo) = chain.fund(funder.address(), 1_500_000).unwrap();
            funder.add_utxo(utxo);
        }
        let node_key = key(1)
            .derive_child(ChildNumber::Hardened(PURPOSE_NODE))
            .unwrap();
        let manager = ChannelManager::new(
            config,
            Network::Regtest,
            node_key,
            chain.clone(),
            repository.clone(),
            funder.clone(),
        );
        Harness {
            chain,
            repository,
            funder,
            manager,
        }
    }

    async fn open_channel(h: &Harness, peer: &Arc<LoopbackPeer>, push: u64) -> ChannelId {
        let channel_id = h.manager.open(peer.clone(), 1_000_000, push).await.unwrap();
        h.chain.mine(3);
        assert_eq!(
            h.manager.confirm_funding(&channel_id).await.unwrap(),
            ChannelState::Open
        );
        channel_id
    }

    fn payment(byte: u8) -> (Preimage, PaymentHash) {
        let preimage = Preimage::from_bytes([byte; 32]);
        let hash = PaymentHash(sha256(preimage.as_bytes()));
        (preimage, hash)
    }

    #[tokio::test]
    async fn test_open_waits_for_funding_depth() {
        let h = harness(ChannelConfig::default());
        let peer = peer(10);
        let channel_id = h.manager.open(peer.clone(), 1_000_000, 0).await.unwrap();

        let record = h.manager.channel(&channel_id).await.unwrap();
        assert_eq!(record.state, ChannelState::Negotiating);
        assert_eq!(record.commitment.version, 0);
        assert!(record.commitment.remote_signature.is_some());
        assert_eq!(peer.signed_version(&channel_id), Some(0));
        assert_eq!(h.repository.channel_count(), 1);

        h.chain.mine(2);
        assert_eq!(
            h.manager.confirm_funding(&channel_id).await.unwrap(),
            ChannelState::Negotiating
        );
        h.chain.mine(1);
        assert_eq!(
            h.manager.confirm_funding(&channel_id).await.unwrap(),
            ChannelState::Open
        );
        assert!(h.manager.find_route(peer.node_id(), 10_000, 100).is_ok());
    }

    #[tokio::test]
    async fn test_open_rejects_small_capacity() {
        let h = harness(ChannelConfig::default());
        let err = h.manager.open(peer(10), 1_000, 0).await.unwrap_err();
        assert!(matches!(err, KestrelError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_refused_open_releases_funding() {
        let h = harness(ChannelConfig::default());
        let peer = peer(10);
        peer.set_refusing(true);
        let err = h.manager.open(peer.clone(), 1_000_000, 0).await.unwrap_err();
        assert!(matches!(err, KestrelError::CounterpartyRejected(_)));
        assert_eq!(h.funder.available(), 3_000_000);
        assert!(h.manager.list_channels().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_funding_broadcast_keeps_inputs() {
        let h = harness(ChannelConfig::default());
        let peer = peer(10);
        h.chain.fail_next_broadcasts(1);
        let err = h.manager.open(peer.clone(), 1_000_000, 0).await.unwrap_err();
        assert!(matches!(err, KestrelError::BroadcastFailed(_)));

        let channels = h.manager.list_channels().await;
        assert_eq!(channels.len(), 1);
        let channel_id = channels[0].id;
        assert_eq!(channels[0].state, ChannelState::Negotiating);
        assert!(h.funder.available() < 3_000_000);

        let txid = h.manager.rebroadcast_funding(channel_id).await.unwrap();
        assert_eq!(Some(txid), channels[0].funding_outpoint.map(|o| o.txid));
        h.chain.mine(3);
        let report = h.manager.poll_chain().await.unwrap();
        assert_eq!(report.opened, vec![channel_id]);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_funding_fails_channel() {
        let h = harness(ChannelConfig::default());
        h.chain.fail_next_broadcasts(1);
        h.manager.open(peer(10), 1_000_000, 0).await.unwrap_err();
        let channel_id = h.manager.list_channels().await[0].id;

        let report = h.manager.poll_chain().await.unwrap();
        assert_eq!(report.failed, vec![channel_id]);
        assert_eq!(h.manager.channel(&channel_id).await.unwrap().state, ChannelState::Failed);
        assert_eq!(h.funder.available(), 3_000_000);

        let err = h.manager.rebroadcast_funding(channel_id).await.unwrap_err();
        assert!(matches!(err, KestrelError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_funding_wait_fails_channel() {
        let h = harness(ChannelConfig::default().with_funding_poll(Duration::from_millis(10)));
        let channel_id = h.manager.open(peer(10), 1_000_000, 0).await.unwrap();
        assert!(h.funder.available() < 3_000_000);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let state = h.manager.wait_for_funding(&channel_id, &cancel).await.unwrap();
        assert_eq!(state, ChannelState::Failed);
        assert_eq!(h.funder.available(), 3_000_000);
    }

    #[tokio::test]
    async fn test_wait_for_funding_opens() {
        let h = harness(ChannelConfig::default().with_funding_poll(Duration::from_millis(10)));
        let channel_id = h.manager.open(peer(10), 1_000_000, 0).await.unwrap();
        h.chain.mine(3);
        let state = h
            .manager
            .wait_for_funding(&channel_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state, ChannelState::Open);
    }

    #[tokio::test]
    async fn test_htlc_fulfill_moves_balance() {
        let h = harness(ChannelConfig::default());
        let peer = peer(10);
        let channel_id = open_channel(&h, &peer, 0).await;
        let (preimage, hash) = payment(7);
        let height = h.chain.height();

        let htlc = h
            .manager
            .add_htlc(channel_id, hash, 100_000, height + 40)
            .await
            .unwrap();
        let record = h.manager.channel(&channel_id).await.unwrap();
        assert_eq!(record.commitment.local_balance, 900_000);
        assert_eq!(record.commitment.pending_total(), Some(100_000));
        record.check_balance_invariant().unwrap();

        let status = h.manager.fulfill_htlc(htlc, &preimage).await.unwrap();
        assert_eq!(status, HtlcStatus::Fulfilled);
        let record = h.manager.channel(&channel_id).await.unwrap();
        assert_eq!(record.commitment.local_balance, 900_000);
        assert_eq!(record.commitment.remote_balance, 100_000);
        assert!(record.commitment.htlcs.is_empty());
        assert_eq!(record.commitment.version, 2);
        assert_eq!(peer.signed_balance(&channel_id), Some(100_000));

        let again = h.manager.fulfill_htlc(htlc, &preimage).await.unwrap();
        assert_eq!(again, HtlcStatus::AlreadySettled);
        assert_eq!(h.manager.channel(&channel_id).await.unwrap().commitment.version, 2);
    }

    #[tokio::test]
    async fn test_preimage_mismatch() {
        let h = harness(ChannelConfig::default());
        let channel_id = open_channel(&h, &peer(10), 0).await;
        let (_, hash) = payment(7);
        let (wrong, _) = payment(8);
        let htlc = h
            .manager
            .add_htlc(channel_id, hash, 50_000, h.chain.height() + 40)
            .await
            .unwrap();

        let err = h.manager.fulfill_htlc(htlc, &wrong).await.unwrap_err();
        assert!(matches!(err, KestrelError::PreimageMismatch));
        assert_eq!(h.manager.htlc_status(htlc).await.unwrap(), HtlcStatus::Pending);
    }

    #[tokio::test]
    async fn test_add_htlc_validation() {
        let h = harness(ChannelConfig::default());
        let channel_id = open_channel(&h, &peer(10), 0).await;
        let (_, hash) = payment(7);
        let height = h.chain.height();

        let err = h.manager.add_htlc(channel_id, hash, 10_000, height).await.unwrap_err();
        assert!(matches!(err, KestrelError::HtlcExpiryTooSoon { .. }));

        let err = h
            .manager
            .add_htlc(channel_id, hash, 1_000_001, height + 40)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KestrelError::InsufficientChannelBalance { needed: 1_000_001, available: 1_000_000 }
        ));

        let err = h
            .manager
            .receive_htlc(channel_id, hash, 10_000, height + 40)
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::InsufficientChannelBalance { available: 0, .. }));
    }

    #[tokio::test]
    async fn test_countersign_timeout_leaves_state() {
        let h = harness(ChannelConfig::default().with_countersign_timeout(Duration::from_millis(50)));
        let peer = peer(10);
        let channel_id = open_channel(&h, &peer, 0).await;
        let before = h.manager.channel(&channel_id).await.unwrap();
        let (_, hash) = payment(7);

        peer.set_response_delay(Duration::from_millis(300));
        let err = h
            .manager
            .add_htlc(channel_id, hash, 100_000, h.chain.height() + 40)
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::CountersignTimeout(_)));

        let after = h.manager.channel(&channel_id).await.unwrap();
        assert_eq!(after.commitment, before.commitment);
        assert_eq!(peer.signed_version(&channel_id), Some(0));

        peer.set_response_delay(Duration::ZERO);
        h.manager
            .add_htlc(channel_id, hash, 100_000, h.chain.height() + 40)
            .await
            .unwrap();
        assert_eq!(peer.signed_version(&channel_id), Some(1));
    }

    #[tokio::test]
    async fn test_sweep_fails_expired_htlc() {
        let h = harness(ChannelConfig::default());
        let channel_id = open_channel(&h, &peer(10), 0).await;
        let (_, hash) = payment(7);
        let htlc = h
            .manager
            .add_htlc(channel_id, hash, 100_000, h.chain.height() + 5)
            .await
            .unwrap();

        let report = h.manager.sweep_expired(h.chain.height()).await.unwrap();
        assert!(report.failed.is_empty());

        let height = h.chain.mine(10);
        let report = h.manager.sweep_expired(height).await.unwrap();
        assert_eq!(report.failed, vec![htlc]);
        assert!(report.force_closed.is_empty());

        let record = h.manager.channel(&channel_id).await.unwrap();
        assert_eq!(record.commitment.local_balance, 1_000_000);
        assert!(record.commitment.htlcs.is_empty());
        record.check_balance_invariant().unwrap();
        assert_eq!(h.manager.htlc_status(htlc).await.unwrap(), HtlcStatus::Failed);
        assert_eq!(h.manager.fail_htlc(htlc, "again").await.unwrap(), HtlcStatus::Failed);
    }

    #[tokio::test]
    async fn test_sweep_force_closes_unresponsive_peer() {
        let h = harness(ChannelConfig::default());
        let peer = peer(10);
        let channel_id = open_channel(&h, &peer, 0).await;
        let (_, hash) = payment(7);
        h.manager
            .add_htlc(channel_id, hash, 100_000, h.chain.height() + 5)
            .await
            .unwrap();

        peer.set_refusing(true);
        let height = h.chain.mine(10);
        let report = h.manager.sweep_expired(height).await.unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(report.force_closed, vec![channel_id]);
        let record = h.manager.channel(&channel_id).await.unwrap();
        assert_eq!(record.state, ChannelState::ForceClosing);
    }

    #[tokio::test]
    async fn test_force_close_waits_for_dispute_window() {
        let h = harness(ChannelConfig::default().with_to_self_delay(10));
        let channel_id = open_channel(&h, &peer(10), 0).await;
        let (_, hash) = payment(7);
        h.manager
            .add_htlc(channel_id, hash, 100_000, h.chain.height() + 40)
            .await
            .unwrap();

        let height = h.chain.height();
        let txid = h.manager.close(channel_id, CloseMode::Force).await.unwrap();
        let record = h.manager.channel(&channel_id).await.unwrap();
        assert_eq!(record.state, ChannelState::ForceClosing);
        assert_eq!(record.closing_txid, Some(txid));
        assert_eq!(record.dispute_deadline, Some(height + 10));
        assert!(h.chain.transaction(&txid).is_some());

        h.chain.mine(1);
        assert!(h.manager.poll_chain().await.unwrap().closed.is_empty());
        h.chain.mine(10);
        assert_eq!(h.manager.poll_chain().await.unwrap().closed, vec![channel_id]);
        assert_eq!(
            h.manager.channel(&channel_id).await.unwrap().state,
            ChannelState::Closed
        );
    }

    #[tokio::test]
    async fn test_cooperative_close() {
        let h = harness(ChannelConfig::default());
        let channel_id = open_channel(&h, &peer(10), 0).await;
        let (preimage, hash) = payment(7);
        let htlc = h
            .manager
            .add_htlc(channel_id, hash, 100_000, h.chain.height() + 40)
            .await
            .unwrap();

        let err = h.manager.close(channel_id, CloseMode::Cooperative).await.unwrap_err();
        assert!(matches!(err, KestrelError::ChannelHasPendingHtlcs(1)));

        h.manager.fulfill_htlc(htlc, &preimage).await.unwrap();
        let txid = h.manager.close(channel_id, CloseMode::Cooperative).await.unwrap();
        let settlement = h.chain.transaction(&txid).unwrap();
        let mut amounts: Vec<u64> = settlement.outputs.iter().map(|o| o.amount).collect();
        amounts.sort_unstable();
        assert_eq!(amounts, vec![100_000, 899_000]);

        h.chain.mine(1);
        assert_eq!(h.manager.poll_chain().await.unwrap().closed, vec![channel_id]);
        let err = h
            .manager
            .add_htlc(channel_id, hash, 1_000, h.chain.height() + 40)
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::ChannelNotOpen(_)));
    }

    #[tokio::test]
    async fn test_load_refuses_corrupted_channel() {
        let h = harness(ChannelConfig::default());
        let peer = peer(10);
        let good = open_channel(&h, &peer, 0).await;
        let bad = open_channel(&h, &peer, 0).await;

        let mut record = h.manager.channel(&bad).await.unwrap();
        record.commitment.local_balance += 1;
        h.repository.save_channel_state(&record).await.unwrap();

        let restarted = ChannelManager::new(
            ChannelConfig::default(),
            Network::Regtest,
            key(1).derive_child(ChildNumber::Hardened(PURPOSE_NODE)).unwrap(),
            h.chain.clone(),
            h.repository.clone(),
            h.funder.clone(),
        );
        restarted.register_peer(peer.clone()).await;
        let report = restarted.load().await.unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.refused, vec![bad]);
        assert_eq!(
            restarted.channel(&bad).await.unwrap().state,
            ChannelState::ForceClosing
        );

        let (_, hash) = payment(7);
        restarted
            .add_htlc(good, hash, 10_000, h.chain.height() + 40)
            .await
            .unwrap();
        let err = restarted
            .add_htlc(bad, hash, 10_000, h.chain.height() + 40)
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::ChannelNotOpen(_)));
    }

    #[tokio::test]
    async fn test_forwarded_htlc_settles_incoming() {
        let h = harness(ChannelConfig::default());
        let upstream = peer(10);
        let downstream = peer(11);
        let incoming_channel = open_channel(&h, &upstream, 500_000).await;
        let outgoing_channel = open_channel(&h, &downstream, 0).await;
        let (preimage, hash) = payment(7);
        let height = h.chain.height();

        let incoming = h
            .manager
            .receive_htlc(incoming_channel, hash, 101_010, height + 100)
            .await
            .unwrap();

        let err = h
            .manager
            .forward_htlc(incoming, outgoing_channel, 100_100, height + 50)
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::ValidationError(_)));
        let err = h
            .manager
            .forward_htlc(incoming, outgoing_channel, 100_000, height + 80)
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::HtlcExpiryTooSoon { .. }));

        let outgoing = h
            .manager
            .forward_htlc(incoming, outgoing_channel, 100_000, height + 50)
            .await
            .unwrap();
        assert_eq!(h.manager.pending_forwards(), 1);

        h.manager.fulfill_htlc(outgoing, &preimage).await.unwrap();
        assert_eq!(h.manager.pending_forwards(), 0);
        assert_eq!(h.manager.htlc_status(incoming).await.unwrap(), HtlcStatus::Fulfilled);

        let upstream_record = h.manager.channel(&incoming_channel).await.unwrap();
        assert_eq!(upstream_record.commitment.local_balance, 601_010);
        let downstream_record = h.manager.channel(&outgoing_channel).await.unwrap();
        assert_eq!(downstream_record.commitment.remote_balance, 100_000);
    }

    #[tokio::test]
    async fn test_failed_forward_fails_incoming() {
        let h = harness(ChannelConfig::default());
        let incoming_channel = open_channel(&h, &peer(10), 500_000).await;
        let outgoing_channel = open_channel(&h, &peer(11), 0).await;
        let (_, hash) = payment(7);
        let height = h.chain.height();

        let incoming = h
            .manager
            .receive_htlc(incoming_channel, hash, 101_010, height + 100)
            .await
            .unwrap();
        let outgoing = h
            .manager
            .forward_htlc(incoming, outgoing_channel, 100_000, height + 50)
            .await
            .unwrap();

        h.manager.fail_htlc(outgoing, "unknown payment").await.unwrap();
        assert_eq!(h.manager.htlc_status(incoming).await.unwrap(), HtlcStatus::Failed);
        let upstream_record = h.manager.channel(&incoming_channel).await.unwrap();
        assert_eq!(upstream_record.commitment.remote_balance, 500_000);
    }

    #[tokio::test]
    async fn test_forward_link_survives_restart() {
        let h = harness(ChannelConfig::default());
        let upstream = peer(10);
        let downstream = peer(11);
        let incoming_channel = open_channel(&h, &upstream, 500_000).await;
        let outgoing_channel = open_channel(&h, &downstream, 0).await;
        let (preimage, hash) = payment(7);
        let height = h.chain.height();

        let incoming = h
            .manager
            .receive_htlc(incoming_channel, hash, 101_010, height + 100)
            .await
            .unwrap();
        let outgoing = h
            .manager
            .forward_htlc(incoming, outgoing_channel, 100_000, height + 50)
            .await
            .unwrap();
        let stored = h.repository.load_channel_state(&outgoing_channel).await.unwrap().unwrap();
        assert_eq!(stored.pending_htlc(outgoing.index).unwrap().forwarded_from, Some(incoming));

        let restarted = ChannelManager::new(
            ChannelConfig::default(),
            Network::Regtest,
            key(1).derive_child(ChildNumber::Hardened(PURPOSE_NODE)).unwrap(),
            h.chain.clone(),
            h.repository.clone(),
            h.funder.clone(),
        );
        restarted.register_peer(upstream.clone()).await;
        restarted.register_peer(downstream.clone()).await;
        restarted.load().await.unwrap();
        assert_eq!(restarted.pending_forwards(), 1);

        restarted.fulfill_htlc(outgoing, &preimage).await.unwrap();
        assert_eq!(restarted.pending_forwards(), 0);
        assert_eq!(restarted.htlc_status(incoming).await.unwrap(), HtlcStatus::Fulfilled);
        let upstream_record = restarted.channel(&incoming_channel).await.unwrap();
        assert_eq!(upstream_record.commitment.local_balance, 601_010);
    }

    #[tokio::test]
    async fn test_concurrent_htlcs_cannot_overspend() {
        let h = harness(ChannelConfig::default());
        let channel_id = open_channel(&h, &peer(10), 0).await;
        let (_, first) = payment(7);
        let (_, second) = payment(8);
        let expiry = h.chain.height() + 40;

        let (a, b) = tokio::join!(
            h.manager.add_htlc(channel_id, first, 600_000, expiry),
            h.manager.add_htlc(channel_id, second, 600_000, expiry),
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        let err = a.err().or(b.err()).unwrap();
        assert!(matches!(
            err,
            KestrelError::InsufficientChannelBalance { needed: 600_000, available: 400_000 }
        ));

        let record = h.manager.channel(&channel_id).await.unwrap();
        record.check_balance_invariant().unwrap();
        assert_eq!(record.commitment.htlcs.len(), 1);
        assert_eq!(record.commitment.local_balance, 400_000);
        let stored = h.repository.load_channel_state(&channel_id).await.unwrap().unwrap();
        assert_eq!(stored.commitment, record.commitment);
    }

    #[tokio::test]
    async fn test_pay_over_route() {
        let h = harness(ChannelConfig::default());
        let peer = peer(10);
        let channel_id = open_channel(&h, &peer, 0).await;
        let (_, hash) = payment(7);

        let (route, htlc) = h.manager.pay(peer.node_id(), 25_000, hash, 0).await.unwrap();
        assert_eq!(route.hops.len(), 1);
        assert_eq!(route.total_fee, 0);
        assert_eq!(htlc.channel_id, channel_id);

        let pending = h.manager.pending_htlc(htlc).await.unwrap();
        assert_eq!(pending.amount, 25_000);
        assert_eq!(pending.expiry, h.chain.height() + DEFAULT_MIN_FINAL_CLTV);
    }
}
