//! The remote side of a channel.
//!
//! [`Counterparty`] is what the manager needs from a peer: accept an open,
//! countersign commitments and sign the cooperative settlement. Transport is
//! not modelled; [`LoopbackPeer`] is an in-process peer that checks every
//! request against its own view of the channel before signing.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, instrument};

use kestrel_core::constants::{HASH_SIZE, PURPOSE_NODE};
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{ChannelId, ChildNumber, Commitment, NodeId, PublicKey, Signature};
use kestrel_crypto::{ExtendedPrivateKey, Seed};

use crate::commitment::{
    commitment_transaction, mirror_commitment, settlement_transaction, signing_digest,
    ChannelParams,
};

// ═══════════════════════════════════════════════════════════════════════════════
// MESSAGES
// ═══════════════════════════════════════════════════════════════════════════════

/// Request to open a channel funded by the sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenRequest {
    /// Proposed channel id
    pub channel_id: ChannelId,
    /// Funder node
    pub funder: NodeId,
    /// Funding amount
    pub capacity: u64,
    /// Amount credited to the acceptor at version 0
    pub push_amount: u64,
    /// Funder's funding key
    pub funding_key: PublicKey,
}

/// A staged commitment, in the proposer's view, awaiting the peer's signature.
#[derive(Clone, Debug)]
pub struct CommitmentUpdate {
    /// Proposer's channel parameters
    pub params: ChannelParams,
    /// Proposed state
    pub commitment: Commitment,
    /// Commitment fee paid by the funder
    pub fee: u64,
    /// Digest of the commitment transaction
    pub digest: [u8; HASH_SIZE],
}

/// A cooperative settlement, in the proposer's view, awaiting the peer's signature.
#[derive(Clone, Debug)]
pub struct ClosingProposal {
    /// Proposer's channel parameters
    pub params: ChannelParams,
    /// Proposer's final balance
    pub local_balance: u64,
    /// Peer's final balance
    pub remote_balance: u64,
    /// Settlement fee paid by the funder
    pub fee: u64,
    /// Digest of the settlement transaction
    pub digest: [u8; HASH_SIZE],
}

/// A channel peer.
#[async_trait]
pub trait Counterparty: Send + Sync {
    /// The peer's node key.
    fn node_id(&self) -> NodeId;

    /// Accepts a channel and returns the peer's funding key.
    async fn accept_channel(&self, request: &OpenRequest) -> Result<PublicKey>;

    /// Signs the commitment transaction of a staged update.
    async fn countersign(&self, update: &CommitmentUpdate) -> Result<Signature>;

    /// Signs a cooperative settlement transaction.
    async fn sign_closing(&self, proposal: &ClosingProposal) -> Result<Signature>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOOPBACK PEER
// ═══════════════════════════════════════════════════════════════════════════════

struct PeerChannel {
    funding_key: ExtendedPrivateKey,
    capacity: u64,
    /// Last state we signed, in our view
    signed: Option<(Commitment, [u8; HASH_SIZE])>,
}

/// In-process counterparty with its own keys.
///
/// It recomputes every transaction it is asked to sign from its mirrored view
/// and refuses stale versions, so a manager talking to it exercises the same
/// checks a remote node would apply. Response delay and refusal can be
/// injected to test timeouts.
pub struct LoopbackPeer {
    node_key: ExtendedPrivateKey,
    funding_root: ExtendedPrivateKey,
    channels: DashMap<ChannelId, PeerChannel>,
    next_key_index: AtomicU32,
    delay_ms: AtomicU64,
    refusing: AtomicBool,
}

impl LoopbackPeer {
    /// Derives the peer's node and funding keys from `seed`.
    pub fn from_seed(seed: &Seed) -> Result<Self> {
        let master = ExtendedPrivateKey::from_seed(seed)?;
        let node = master.derive_child(ChildNumber::Hardened(PURPOSE_NODE))?;
        Ok(Self {
            node_key: node.derive_child(ChildNumber::Hardened(0))?,
            funding_root: node.derive_child(ChildNumber::Hardened(1))?,
            channels: DashMap::new(),
            next_key_index: AtomicU32::new(0),
            delay_ms: AtomicU64::new(0),
            refusing: AtomicBool::new(false),
        })
    }

    /// Delays every response by `delay`.
    pub fn set_response_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes every request fail with `CounterpartyRejected`.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of channels accepted.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Version of the last commitment signed for `channel_id`.
    pub fn signed_version(&self, channel_id: &ChannelId) -> Option<u64> {
        self.channels
            .get(channel_id)
            .and_then(|c| c.signed.as_ref().map(|(commitment, _)| commitment.version))
    }

    /// Our balance in the last signed commitment.
    pub fn signed_balance(&self, channel_id: &ChannelId) -> Option<u64> {
        self.channels
            .get(channel_id)
            .and_then(|c| c.signed.as_ref().map(|(commitment, _)| commitment.local_balance))
    }

    async fn respond(&self) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.refusing.load(Ordering::SeqCst) {
            return Err(KestrelError::CounterpartyRejected(format!(
                "peer {} refuses requests",
                self.node_id()
            )));
        }
        Ok(())
    }

    fn rejected(reason: impl std::fmt::Display) -> KestrelError {
        KestrelError::CounterpartyRejected(reason.to_string())
    }

    /// Our view of the channel, after checking it is the one we accepted.
    fn view(channel: &PeerChannel, params: &ChannelParams) -> Result<ChannelParams> {
        let ours = params.mirrored();
        if ours.local_key != *channel.funding_key.public_key() {
            return Err(Self::rejected("funding key mismatch"));
        }
        if ours.capacity != channel.capacity {
            return Err(Self::rejected("capacity mismatch"));
        }
        Ok(ours)
    }
}

#[async_trait]
impl Counterparty for LoopbackPeer {
    fn node_id(&self) -> NodeId {
        *self.node_key.public_key()
    }

    #[instrument(skip_all, fields(channel = %request.channel_id, capacity = request.capacity))]
    async fn accept_channel(&self, request: &OpenRequest) -> Result<PublicKey> {
        self.respond().await?;
        if request.push_amount > request.capacity {
            return Err(Self::rejected("push amount exceeds capacity"));
        }
        if self.channels.contains_key(&request.channel_id) {
            return Err(Self::rejected("channel id already in use"));
        }

        let index = self.next_key_index.fetch_add(1, Ordering::SeqCst);
        let funding_key = self.funding_root.derive_child(ChildNumber::Normal(index))?;
        let public = *funding_key.public_key();
        self.channels.insert(
            request.channel_id,
            PeerChannel {
                funding_key,
                capacity: request.capacity,
                signed: None,
            },
        );
        debug!("Channel accepted");
        Ok(public)
    }

    #[instrument(skip_all, fields(channel = %update.params.channel_id, version = update.commitment.version))]
    async fn countersign(&self, update: &CommitmentUpdate) -> Result<Signature> {
        self.respond().await?;
        let mut channel = self
            .channels
            .get_mut(&update.params.channel_id)
            .ok_or_else(|| KestrelError::not_found("channel", update.params.channel_id))?;

        let params = Self::view(&channel, &update.params)?;
        if let Some((last, digest)) = &channel.signed {
            let stale = update.commitment.version < last.version
                || (update.commitment.version == last.version && update.digest != *digest);
            if stale {
                return Err(Self::rejected(format!(
                    "version {} conflicts with signed version {}",
                    update.commitment.version, last.version
                )));
            }
        }

        let commitment = mirror_commitment(&update.commitment);
        let tx = commitment_transaction(&params, &commitment, update.fee).map_err(Self::rejected)?;
        if signing_digest(&tx)? != update.digest {
            return Err(Self::rejected("commitment digest mismatch"));
        }

        let signature = channel.funding_key.sign(&update.digest)?;
        channel.signed = Some((commitment, update.digest));
        debug!("Commitment countersigned");
        Ok(signature)
    }

    #[instrument(skip_all, fields(channel = %proposal.params.channel_id))]
    async fn sign_closing(&self, proposal: &ClosingProposal) -> Result<Signature> {
        self.respond().await?;
        let channel = self
            .channels
            .get(&proposal.params.channel_id)
            .ok_or_else(|| KestrelError::not_found("channel", proposal.params.channel_id))?;

        let params = Self::view(&channel, &proposal.params)?;
        let Some((signed, _)) = &channel.signed else {
            return Err(Self::rejected("no signed commitment to settle"));
        };
        if !signed.htlcs.is_empty() {
            return Err(Self::rejected("HTLCs still pending"));
        }
        if signed.local_balance != proposal.remote_balance
            || signed.remote_balance != proposal.local_balance
        {
            return Err(Self::rejected("settlement does not match signed balances"));
        }

        let tx = settlement_transaction(
            &params,
            proposal.remote_balance,
            proposal.local_balance,
            proposal.fee,
        )
        .map_err(Self::rejected)?;
        if signing_digest(&tx)? != proposal.digest {
            return Err(Self::rejected("settlement digest mismatch"));
        }
        debug!("Settlement signed");
        channel.funding_key.sign(&proposal.digest)
    }
}

impl std::fmt::Debug for LoopbackPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackPeer")
            .field("node_id", &self.node_id())
            .field("channels", &self.channels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use kestrel_core::types::{Network, OutPoint, Txid};

    use crate::commitment::funding_script;

    fn local_key() -> ExtendedPrivateKey {
        ExtendedPrivateKey::from_seed(&Seed::from_bytes(&[5; 32]).unwrap()).unwrap()
    }

    async fn accepted(peer: &LoopbackPeer, local: &ExtendedPrivateKey) -> ChannelParams {
        let request = OpenRequest {
            channel_id: ChannelId::from_bytes([3; 32]),
            funder: *local.public_key(),
            capacity: 500_000,
            push_amount: 0,
            funding_key: *local.public_key(),
        };
        let remote = peer.accept_channel(&request).await.unwrap();
        ChannelParams {
            channel_id: request.channel_id,
            network: Network::Regtest,
            capacity: 500_000,
            is_funder: true,
            funding_outpoint: OutPoint::new(Txid::from_bytes([9; 32]), 0),
            funding_script: funding_script(local.public_key(), &remote).unwrap(),
            local_key: *local.public_key(),
            remote_key: remote,
        }
    }

    fn update(params: &ChannelParams, version: u64, local: u64, remote: u64) -> CommitmentUpdate {
        let commitment = Commitment {
            version,
            local_balance: local,
            remote_balance: remote,
            htlcs: BTreeMap::new(),
            remote_signature: None,
        };
        let tx = commitment_transaction(params, &commitment, 500).unwrap();
        CommitmentUpdate {
            params: params.clone(),
            digest: signing_digest(&tx).unwrap(),
            commitment,
            fee: 500,
        }
    }

    #[tokio::test]
    async fn test_countersign_verifies() {
        let peer = LoopbackPeer::from_seed(&Seed::from_bytes(&[6; 32]).unwrap()).unwrap();
        let local = local_key();
        let params = accepted(&peer, &local).await;

        let u = update(&params, 0, 500_000, 0);
        let sig = peer.countersign(&u).await.unwrap();
        assert!(kestrel_crypto::verify(&params.remote_key, &u.digest, &sig));
        assert_eq!(peer.signed_version(&params.channel_id), Some(0));
        assert_eq!(peer.signed_balance(&params.channel_id), Some(0));
    }

    #[tokio::test]
    async fn test_rejects_forged_digest() {
        let peer = LoopbackPeer::from_seed(&Seed::from_bytes(&[6; 32]).unwrap()).unwrap();
        let params = accepted(&peer, &local_key()).await;

        let mut u = update(&params, 1, 400_000, 100_000);
        u.digest = [0; 32];
        let err = peer.countersign(&u).await.unwrap_err();
        assert!(matches!(err, KestrelError::CounterpartyRejected(_)));
    }

    #[tokio::test]
    async fn test_rejects_stale_version() {
        let peer = LoopbackPeer::from_seed(&Seed::from_bytes(&[6; 32]).unwrap()).unwrap();
        let params = accepted(&peer, &local_key()).await;

        peer.countersign(&update(&params, 2, 400_000, 100_000)).await.unwrap();
        // Re-signing the identical state is allowed.
        peer.countersign(&update(&params, 2, 400_000, 100_000)).await.unwrap();
        assert!(peer.countersign(&update(&params, 2, 300_000, 200_000)).await.is_err());
        assert!(peer.countersign(&update(&params, 1, 500_000, 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_refusing_peer() {
        let peer = LoopbackPeer::from_seed(&Seed::from_bytes(&[6; 32]).unwrap()).unwrap();
        let params = accepted(&peer, &local_key()).await;
        peer.set_refusing(true);
        let err = peer.countersign(&update(&params, 0, 500_000, 0)).await.unwrap_err();
        assert!(matches!(err, KestrelError::CounterpartyRejected(_)));
    }

    #[tokio::test]
    async fn test_closing_must_match_signed_state() {
        let peer = LoopbackPeer::from_seed(&Seed::from_bytes(&[6; 32]).unwrap()).unwrap();
        let params = accepted(&peer, &local_key()).await;
        peer.countersign(&update(&params, 0, 450_000, 50_000)).await.unwrap();

        let proposal = |local: u64, remote: u64| {
            let tx = settlement_transaction(&params, local, remote, 1_000).unwrap();
            ClosingProposal {
                params: params.clone(),
                local_balance: local,
                remote_balance: remote,
                fee: 1_000,
                digest: signing_digest(&tx).unwrap(),
            }
        };
        assert!(peer.sign_closing(&proposal(450_000, 50_000)).await.is_ok());
        assert!(peer.sign_closing(&proposal(500_000, 0)).await.is_err());
    }
}
