//! The wallet engine.
//!
//! [`WalletEngine`] owns the key vault, the wallets, the multisig
//! coordinator, the channel manager and the invoice service, and exposes
//! them as one async API. Each wallet is an independent aggregate behind its
//! own `tokio::sync::Mutex`; chain calls are made with no wallet lock held.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use kestrel_address::{Address, AddressCodec};
use kestrel_chain::RetryingChainClient;
use kestrel_channel::{ChannelManager, CloseMode, Counterparty, HtlcSweeper, LoadReport, Route};
use kestrel_core::constants::{PURPOSE_BIP48, PURPOSE_NODE};
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::traits::{ChainClient, WalletRepository};
use kestrel_core::types::{
    AddressRecord, Balance, ChannelId, ChildNumber, DerivationPath, EncryptedSeed, HtlcId,
    Network, NodeId,
    PendingSpend, PublicKey, Txid, WalletId, WalletMetadata,
};
use kestrel_crypto::{ExtendedPrivateKey, KeyVault, Seed};
use kestrel_invoice::{Invoice, InvoiceService};
use kestrel_multisig::{sign_partial, MultisigCoordinator, ProposalId, ProposalState, ProposalStatus};
use kestrel_store::{FileRepository, MemoryRepository};
use kestrel_tx::{
    FeePolicy, ReservationId, SignedTransaction, Signer, TransactionBuilder, TxOutput,
    UtxoReservations,
};

use crate::account::{self, WalletHandle};
use crate::config::EngineConfig;
use crate::funder::WalletFunder;

/// BIP48 script-type branch for P2WSH co-signer keys.
const COSIGNER_SCRIPT_BRANCH: u32 = 2;

/// Outcome of [`WalletEngine::restore`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Wallets loaded (without seeds until re-imported)
    pub wallets: usize,
    /// Wallets stored for another network
    pub skipped: usize,
    /// Pending spends whose inputs were reserved again
    pub pending: usize,
    /// Channel recovery
    pub channels: LoadReport,
}

/// Outcome of [`WalletEngine::export_wallet`].
///
/// `Debug` shows the seed redacted.
#[derive(Clone, Debug)]
pub struct WalletExport {
    /// Wallet id
    pub id: WalletId,
    /// Account-level extended public key
    pub account_xpub: String,
    /// The sealed seed as stored
    pub keystore: EncryptedSeed,
    /// The decrypted seed
    pub seed: Seed,
}

/// Wallets, on-chain spends, multisig, channels and invoices of one node.
pub struct WalletEngine {
    config: EngineConfig,
    vault: Arc<KeyVault>,
    chain: Arc<dyn ChainClient>,
    repository: Arc<dyn WalletRepository>,
    reservations: Arc<UtxoReservations>,
    wallets: Arc<DashMap<WalletId, WalletHandle>>,
    pending: DashMap<Txid, ReservationId>,
    funder: Arc<WalletFunder>,
    open_lock: Mutex<()>,
    multisig: MultisigCoordinator,
    channels: Arc<ChannelManager>,
    invoices: InvoiceService,
}

impl WalletEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // CONSTRUCTION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Builds an engine over `chain` and `repository`.
    ///
    /// `chain` is wrapped in the configured retry policy. The node identity
    /// used for channels and invoices is derived from `node_seed`. Nothing is
    /// loaded; call [`restore`](Self::restore) to pick up stored state.
    pub fn new(
        config: EngineConfig,
        chain: Arc<dyn ChainClient>,
        repository: Arc<dyn WalletRepository>,
        node_seed: &Seed,
    ) -> Result<Self> {
        config.validate()?;
        let chain: Arc<dyn ChainClient> =
            Arc::new(RetryingChainClient::new(chain, config.retry.clone()));
        let vault = Arc::new(KeyVault::new());
        let reservations = Arc::new(UtxoReservations::new());
        let wallets = Arc::new(DashMap::new());

        let funder = Arc::new(WalletFunder::new(
            vault.clone(),
            reservations.clone(),
            repository.clone(),
            wallets.clone(),
            config.builder.clone(),
            config.fee,
            config.min_confirmations,
        ));
        let node_key = node_key(node_seed, config.network)?;
        let channels = Arc::new(ChannelManager::new(
            config.channel.clone(),
            config.network,
            node_key.clone(),
            chain.clone(),
            repository.clone(),
            funder.clone(),
        ));
        let invoices = InvoiceService::new(
            config.invoice.clone(),
            config.network,
            node_key,
            channels.clone(),
        );
        let multisig = MultisigCoordinator::new(config.multisig.clone(), reservations.clone());

        info!(network = %config.network, node = %channels.node_id(), "Wallet engine ready");
        Ok(Self {
            config,
            vault,
            chain,
            repository,
            reservations,
            wallets,
            pending: DashMap::new(),
            funder,
            open_lock: Mutex::new(()),
            multisig,
            channels,
            invoices,
        })
    }

    /// Opens the configured repository, builds the engine and restores it.
    ///
    /// The file repository lives in `data_dir`; without one the engine keeps
    /// everything in memory.
    pub async fn start(
        config: EngineConfig,
        chain: Arc<dyn ChainClient>,
        node_seed: &Seed,
    ) -> Result<Self> {
        let repository: Arc<dyn WalletRepository> = match config.repository_path() {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    tokio::fs::create_dir_all(dir).await?;
                }
                Arc::new(FileRepository::open(path).await?)
            }
            None => Arc::new(MemoryRepository::new()),
        };
        let engine = Self::new(config, chain, repository, node_seed)?;
        let report = engine.restore().await?;
        info!(
            wallets = report.wallets,
            pending = report.pending,
            channels = report.channels.loaded,
            refused = report.channels.refused.len(),
            "Engine state restored"
        );
        Ok(engine)
    }

    /// Loads stored wallets and channels.
    ///
    /// Wallets come back without their seeds: they can be inspected and
    /// refreshed, and regain signing through [`WalletEngine::unlock_wallet`]
    /// when protected, or once the seed is imported again.
    /// Inputs of unconfirmed spends are reserved again.
    pub async fn restore(&self) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();
        for meta in self.repository.list_wallets().await? {
            if meta.network != self.config.network {
                debug!(wallet = %meta.id, network = %meta.network, "Skipping wallet of another network");
                report.skipped += 1;
                continue;
            }
            if self.wallets.contains_key(&meta.id) {
                continue;
            }
            for spend in &meta.pending {
                match self.reservations.reserve(&spend.inputs) {
                    Ok(id) => {
                        self.pending.insert(spend.txid, id);
                        report.pending += 1;
                    }
                    Err(e) => warn!(txid = %spend.txid, error = %e, "Pending spend not reserved"),
                }
            }
            self.wallets.insert(meta.id, Arc::new(Mutex::new(meta)));
            report.wallets += 1;
        }
        report.channels = self.channels.load().await?;
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // WALLETS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Creates a wallet from a fresh seed.
    #[instrument(skip(self))]
    pub async fn create_wallet(&self, name: &str) -> Result<WalletMetadata> {
        let seed = KeyVault::generate_seed(self.config.seed_bits)?;
        self.register(name, seed).await
    }

    /// Imports a wallet from raw seed bytes.
    ///
    /// A restored wallet with the same master fingerprint gets its seed back
    /// and keeps its id and name.
    ///
    /// # Errors
    /// - `InvalidEntropyLength` for a seed outside 16..=64 bytes
    /// - `ValidationError` if the seed is already loaded
    #[instrument(skip(self, seed))]
    pub async fn import_wallet(&self, name: &str, seed: &[u8]) -> Result<WalletMetadata> {
        let seed = Seed::from_bytes(seed)?;
        let fingerprint = hex::encode(ExtendedPrivateKey::from_seed(&seed)?.fingerprint());

        let handles: Vec<WalletHandle> = self.wallets.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            let meta = handle.lock().await;
            if meta.master_fingerprint != fingerprint || meta.script_type != self.config.script_type {
                continue;
            }
            if self.vault.contains(&meta.id) {
                return Err(KestrelError::ValidationError(format!(
                    "seed already loaded as wallet {}",
                    meta.id
                )));
            }
            self.vault.insert(meta.id, seed)?;
            info!(wallet = %meta.id, "Seed reattached");
            return Ok(meta.clone());
        }
        self.register(name, seed).await
    }

    async fn register(&self, name: &str, seed: Seed) -> Result<WalletMetadata> {
        let name = name.trim();
        if name.is_empty() {
            return Err(KestrelError::ValidationError("wallet name is empty".into()));
        }
        let network = self.config.network;
        let script_type = self.config.script_type;
        let id = WalletId::new();
        self.vault.insert(id, seed)?;

        let created = async {
            let account_path =
                DerivationPath::account(script_type.account_purpose(), network.coin_type(), 0)?;
            let xpub = self.vault.derive_public(&id, &account_path)?;
            let meta = WalletMetadata {
                id,
                name: name.to_string(),
                network,
                script_type,
                account_xpub: xpub.to_base58(network),
                account_path,
                master_fingerprint: hex::encode(self.vault.master_fingerprint(&id)?),
                addresses: Vec::new(),
                next_receive_index: 0,
                next_change_index: 0,
                utxos: Vec::new(),
                pending: Vec::new(),
                keystore: None,
                created_at: Utc::now(),
            };
            self.repository.save_wallet_metadata(&meta).await?;
            Ok::<_, KestrelError>(meta)
        }
        .await;

        let meta = match created {
            Ok(meta) => meta,
            Err(e) => {
                self.vault.erase(&id);
                return Err(e);
            }
        };
        self.wallets.insert(id, Arc::new(Mutex::new(meta.clone())));
        info!(wallet = %id, script_type = %script_type, path = %meta.account_path, "Wallet created");
        Ok(meta)
    }

    /// All wallets, oldest first.
    pub async fn list_wallets(&self) -> Vec<WalletMetadata> {
        let handles: Vec<WalletHandle> = self.wallets.iter().map(|e| e.value().clone()).collect();
        let mut wallets = Vec::with_capacity(handles.len());
        for handle in handles {
            wallets.push(handle.lock().await.clone());
        }
        wallets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        wallets
    }

    /// One wallet's metadata.
    pub async fn wallet(&self, wallet: &WalletId) -> Result<WalletMetadata> {
        Ok(self.handle(wallet)?.lock().await.clone())
    }

    /// True if the wallet's seed is loaded and it can sign.
    pub fn can_sign(&self, wallet: &WalletId) -> bool {
        self.vault.contains(wallet)
    }

    /// Deletes a wallet and erases its seed.
    ///
    /// Returns false if the wallet is unknown.
    #[instrument(skip(self))]
    pub async fn delete_wallet(&self, wallet: &WalletId) -> Result<bool> {
        let Some(handle) = self.wallets.get(wallet).map(|h| h.value().clone()) else {
            return Ok(false);
        };
        let meta = handle.lock().await;
        self.repository.delete_wallet(wallet).await?;

        for spend in &meta.pending {
            if let Some((_, id)) = self.pending.remove(&spend.txid) {
                self.reservations.release(id);
            }
        }
        let erased = self.vault.erase(wallet);
        self.wallets.remove(wallet);
        info!(wallet = %wallet, erased, "Wallet deleted");
        Ok(true)
    }

    /// The wallet's account-level extended public key.
    pub async fn export_account_xpub(&self, wallet: &WalletId) -> Result<String> {
        Ok(self.handle(wallet)?.lock().await.account_xpub.clone())
    }

    /// Seals the wallet's seed under `passphrase` and persists the keystore,
    /// replacing any previous one.
    ///
    /// # Errors
    /// `NotFound` if the wallet or its seed is not loaded; `ValidationError`
    /// for an empty passphrase.
    #[instrument(skip(self, passphrase))]
    pub async fn protect_wallet(&self, wallet: &WalletId, passphrase: &str) -> Result<()> {
        let handle = self.handle(wallet)?;
        let sealed = self.vault.seal(wallet, passphrase, self.config.kdf_rounds)?;
        let mut meta = handle.lock().await;
        let mut staged = meta.clone();
        staged.keystore = Some(sealed);
        self.repository.save_wallet_metadata(&staged).await?;
        *meta = staged;
        info!(rounds = self.config.kdf_rounds, "Keystore sealed");
        Ok(())
    }

    /// Opens the stored keystore and reattaches the seed.
    ///
    /// # Errors
    /// - `NotFound` if the wallet has no keystore
    /// - `VerificationFailed` for a wrong passphrase
    /// - `ValidationError` if the seed is already loaded
    #[instrument(skip(self, passphrase))]
    pub async fn unlock_wallet(&self, wallet: &WalletId, passphrase: &str) -> Result<()> {
        let handle = self.handle(wallet)?;
        let meta = handle.lock().await;
        let sealed = meta
            .keystore
            .as_ref()
            .ok_or_else(|| KestrelError::not_found("keystore", wallet.to_string()))?;
        if let Err(e) = self.vault.unseal(*wallet, sealed, passphrase) {
            warn!(error = %e, "Keystore not opened");
            return Err(e);
        }
        info!("Wallet unlocked");
        Ok(())
    }

    /// Decrypts the wallet's keystore for backup.
    ///
    /// The passphrase is checked against the stored keystore, so a wallet
    /// has to be protected before it can be exported.
    ///
    /// # Errors
    /// `NotFound` if the wallet has no keystore; `VerificationFailed` for a
    /// wrong passphrase.
    #[instrument(skip(self, passphrase))]
    pub async fn export_wallet(&self, wallet: &WalletId, passphrase: &str) -> Result<WalletExport> {
        let meta = self.handle(wallet)?.lock().await.clone();
        let keystore = meta
            .keystore
            .ok_or_else(|| KestrelError::not_found("keystore", wallet.to_string()))?;
        let seed = kestrel_crypto::keystore::open(&keystore, wallet, passphrase)?;
        info!("Wallet exported");
        Ok(WalletExport {
            id: meta.id,
            account_xpub: meta.account_xpub,
            keystore,
            seed,
        })
    }

    /// Derives and records the next receive address.
    ///
    /// # Errors
    /// `NotFound` if the wallet or its seed is not loaded.
    #[instrument(skip(self))]
    pub async fn next_address(&self, wallet: &WalletId) -> Result<Address> {
        let handle = self.handle(wallet)?;
        let mut meta = handle.lock().await;
        let mut staged = meta.clone();
        let record = account::derive_address(&self.vault, &mut staged, false)?;
        self.repository.save_wallet_metadata(&staged).await?;
        *meta = staged;
        debug!(index = record.index, address = %record.address, "Receive address derived");
        record.address.parse()
    }

    /// Every address derived so far, receive and change.
    pub async fn addresses(&self, wallet: &WalletId) -> Result<Vec<AddressRecord>> {
        Ok(self.handle(wallet)?.lock().await.addresses.clone())
    }

    /// Re-reads the wallet's outputs from the chain and returns the balance.
    #[instrument(skip(self))]
    pub async fn refresh_utxos(&self, wallet: &WalletId) -> Result<Balance> {
        let handle = self.handle(wallet)?;
        let addresses: Vec<String> = handle
            .lock()
            .await
            .addresses
            .iter()
            .map(|a| a.address.clone())
            .collect();

        let mut observed = Vec::new();
        for address in &addresses {
            observed.extend(self.chain.get_utxo_set(address).await?);
        }

        let mut meta = handle.lock().await;
        let mut staged = meta.clone();
        account::apply_utxos(&mut staged, observed);
        self.repository.save_wallet_metadata(&staged).await?;
        *meta = staged;
        let balance = account::balance(&meta, &self.reservations);
        debug!(utxos = meta.utxos.len(), total = balance.total(), "UTXOs refreshed");
        Ok(balance)
    }

    /// Balance of the outputs seen at the last refresh.
    pub async fn get_balance(&self, wallet: &WalletId) -> Result<Balance> {
        let handle = self.handle(wallet)?;
        let meta = handle.lock().await;
        Ok(account::balance(&meta, &self.reservations))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SPENDING
    // ═══════════════════════════════════════════════════════════════════════════

    /// Builds, signs and broadcasts a payment to `outputs`.
    ///
    /// Change goes to a fresh change address. The signed transaction is
    /// recorded as a pending spend before it is broadcast, and its inputs
    /// stay reserved until [`confirm_pending`](Self::confirm_pending) sees it
    /// confirm or the chain report it unknown.
    ///
    /// # Errors
    /// - `InvalidAddressFormat` for an output on another network
    /// - builder errors (`InsufficientFunds`, `DustOutput`, ...)
    /// - the chain's error if the broadcast fails; the spend stays pending
    ///   and can be sent again with [`rebroadcast`](Self::rebroadcast)
    #[instrument(skip(self, outputs, fee), fields(outputs = outputs.len()))]
    pub async fn send(
        &self,
        wallet: &WalletId,
        outputs: Vec<TxOutput>,
        fee: Option<FeePolicy>,
    ) -> Result<SignedTransaction> {
        for output in &outputs {
            self.check_network(&output.address)?;
        }
        let handle = self.handle(wallet)?;

        let signed = {
            let mut meta = handle.lock().await;
            let candidates =
                account::spendable(&meta, &self.reservations, self.config.min_confirmations);
            let mut staged = meta.clone();
            let change = account::change_address(&self.vault, &mut staged)?;
            let unsigned = TransactionBuilder::new(self.config.builder.clone())
                .with_change(change)
                .build(&candidates, outputs, fee.unwrap_or(self.config.fee))?;

            let reservation = self.reservations.reserve(&unsigned.outpoints())?;
            let signed = match account::signing_keys(&self.vault, &staged, &unsigned)
                .and_then(|keys| Signer::sign(unsigned, &keys, None))
            {
                Ok(signed) => signed,
                Err(e) => {
                    self.reservations.release(reservation);
                    return Err(e);
                }
            };
            staged.pending.push(PendingSpend {
                txid: signed.txid(),
                inputs: signed.unsigned().outpoints(),
                raw: signed.serialize(),
                accepted: false,
                broadcast_at: Utc::now(),
            });
            if let Err(e) = self.repository.save_wallet_metadata(&staged).await {
                self.reservations.release(reservation);
                return Err(e);
            }
            *meta = staged;
            self.pending.insert(signed.txid(), reservation);
            signed
        };

        let txid = self.broadcast_pending(&handle, signed.txid(), signed.serialize()).await?;
        info!(
            txid = %txid,
            fee = signed.fee(),
            change = signed.unsigned().change_amount(),
            "Payment broadcast"
        );
        Ok(signed)
    }

    /// Sends a pending spend to the chain again.
    ///
    /// # Errors
    /// - `NotFound` if the wallet has no pending spend `txid`
    /// - the chain's error; the spend stays pending
    #[instrument(skip(self))]
    pub async fn rebroadcast(&self, wallet: &WalletId, txid: &Txid) -> Result<Txid> {
        let handle = self.handle(wallet)?;
        let raw = handle
            .lock()
            .await
            .pending
            .iter()
            .find(|p| p.txid == *txid)
            .map(|p| p.raw.clone())
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| KestrelError::not_found("pending spend", txid))?;
        self.broadcast_pending(&handle, *txid, raw).await
    }

    async fn broadcast_pending(&self, handle: &WalletHandle, txid: Txid, raw: Vec<u8>) -> Result<Txid> {
        let outcome = self.chain.broadcast_transaction(&raw).await;

        let mut meta = handle.lock().await;
        let mut staged = meta.clone();
        if let Some(spend) = staged.pending.iter_mut().find(|p| p.txid == txid) {
            spend.broadcast_at = Utc::now();
            spend.accepted |= outcome.is_ok();
        }
        match self.repository.save_wallet_metadata(&staged).await {
            Ok(()) => *meta = staged,
            Err(e) => warn!(txid = %txid, error = %e, "Broadcast attempt not persisted"),
        }
        if let Err(e) = &outcome {
            warn!(txid = %txid, error = %e, "Broadcast failed, inputs stay reserved");
        }
        outcome
    }

    /// Settles pending spends against the chain.
    ///
    /// Confirmed spends mark their inputs spent; spends the chain no longer
    /// knows release them. Returns the confirmed txids.
    #[instrument(skip(self))]
    pub async fn confirm_pending(&self, wallet: &WalletId) -> Result<Vec<Txid>> {
        let handle = self.handle(wallet)?;
        let pending = handle.lock().await.pending.clone();

        let mut confirmed = Vec::new();
        let mut dropped = Vec::new();
        for spend in &pending {
            match self.chain.get_confirmation_depth(&spend.txid).await {
                Ok(depth) if depth >= self.config.min_confirmations.max(1) => {
                    confirmed.push(spend.clone())
                }
                Ok(_) => {}
                Err(KestrelError::NotFound { .. }) => dropped.push(spend.clone()),
                Err(e) => return Err(e),
            }
        }
        if confirmed.is_empty() && dropped.is_empty() {
            return Ok(Vec::new());
        }

        let mut meta = handle.lock().await;
        let mut staged = meta.clone();
        staged.pending.retain(|p| {
            !confirmed.iter().any(|c| c.txid == p.txid) && !dropped.iter().any(|d| d.txid == p.txid)
        });
        for spend in &confirmed {
            account::remove_spent(&mut staged, &spend.inputs);
        }
        self.repository.save_wallet_metadata(&staged).await?;
        *meta = staged;

        for spend in &confirmed {
            match self.pending.remove(&spend.txid) {
                Some((_, id)) if self.reservations.commit(id).is_ok() => {}
                _ => self.reservations.mark_spent(&spend.inputs),
            }
        }
        for spend in &dropped {
            if let Some((_, id)) = self.pending.remove(&spend.txid) {
                self.reservations.release(id);
            }
            warn!(txid = %spend.txid, "Pending spend dropped by the chain");
        }
        info!(confirmed = confirmed.len(), dropped = dropped.len(), "Pending spends settled");
        Ok(confirmed.into_iter().map(|s| s.txid).collect())
    }

    fn check_network(&self, address: &str) -> Result<()> {
        let decoded = AddressCodec::decode(address)?;
        let network = self.config.network;
        // Regtest shares the testnet Base58 versions.
        let legacy_regtest = network == Network::Regtest
            && decoded.network == Network::Testnet
            && !decoded.script_type.is_segwit();
        if decoded.network == network || legacy_regtest {
            Ok(())
        } else {
            Err(KestrelError::InvalidAddressFormat(format!(
                "{} is a {} address, engine runs on {}",
                address, decoded.network, network
            )))
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // MULTISIG
    // ═══════════════════════════════════════════════════════════════════════════

    /// The wallet's co-signer key (`m/48'/coin'/0'/2'`).
    pub fn cosigner_key(&self, wallet: &WalletId) -> Result<PublicKey> {
        let key = self.vault.derive_public(wallet, &self.cosigner_path()?)?;
        Ok(*key.public_key())
    }

    /// Signs every input of a proposal with the wallet's co-signer key and
    /// submits the signatures.
    #[instrument(skip(self, proposal), fields(proposal = %proposal))]
    pub fn sign_proposal(&self, wallet: &WalletId, proposal: ProposalId) -> Result<ProposalStatus> {
        let key = self.vault.derive_private(wallet, &self.cosigner_path()?)?;
        let unsigned = self.multisig.transaction(proposal)?;
        let signatures = sign_partial(&unsigned, &key)?;
        self.multisig
            .submit_partial(proposal, key.public_key(), signatures)
    }

    /// Broadcasts a proposal's signed transaction, finalizing it first if it
    /// is ready. The inputs stay reserved until
    /// [`settle_proposal`](Self::settle_proposal) or
    /// [`abandon_proposal`](Self::abandon_proposal).
    ///
    /// # Errors
    /// - `InvalidStateTransition` unless the proposal is ready or finalized
    /// - the chain's error; the proposal stays finalized and can be retried
    #[instrument(skip(self))]
    pub async fn broadcast_proposal(&self, proposal: ProposalId) -> Result<Txid> {
        let signed = match self.multisig.status(proposal)?.state {
            ProposalState::Ready => self.multisig.finalize(proposal)?,
            _ => self.multisig.signed_transaction(proposal)?,
        };
        match self.chain.broadcast_transaction(&signed.serialize()).await {
            Ok(txid) => {
                info!(txid = %txid, "Multisig spend broadcast");
                Ok(txid)
            }
            Err(e) => {
                warn!(error = %e, "Multisig broadcast failed, inputs stay reserved");
                Err(e)
            }
        }
    }

    /// Settles a finalized proposal against the chain.
    ///
    /// A confirmed transaction marks the inputs spent; one the chain does
    /// not know is abandoned and its inputs released. Otherwise the proposal
    /// stays finalized.
    #[instrument(skip(self))]
    pub async fn settle_proposal(&self, proposal: ProposalId) -> Result<ProposalStatus> {
        let status = self.multisig.status(proposal)?;
        let Some(txid) = status.txid.filter(|_| status.state == ProposalState::Finalized) else {
            return Ok(status);
        };
        match self.chain.get_confirmation_depth(&txid).await {
            Ok(depth) if depth >= self.config.min_confirmations.max(1) => self.multisig.confirm(proposal),
            Ok(_) => Ok(status),
            Err(KestrelError::NotFound { .. }) => self.multisig.abandon(proposal),
            Err(e) => Err(e),
        }
    }

    /// Abandons a finalized proposal and releases its inputs.
    pub fn abandon_proposal(&self, proposal: ProposalId) -> Result<ProposalStatus> {
        self.multisig.abandon(proposal)
    }

    fn cosigner_path(&self) -> Result<DerivationPath> {
        DerivationPath::account(PURPOSE_BIP48, self.config.network.coin_type(), 0)?
            .child(ChildNumber::hardened(COSIGNER_SCRIPT_BRANCH)?)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // CHANNELS & INVOICES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Opens a channel funded from `wallet`.
    ///
    /// The channel stays `Negotiating` until its funding confirms; see
    /// [`ChannelManager::wait_for_funding`].
    #[instrument(skip(self, peer), fields(peer = %peer.node_id()))]
    pub async fn open_channel(
        &self,
        wallet: &WalletId,
        peer: Arc<dyn Counterparty>,
        capacity: u64,
        push_amount: u64,
    ) -> Result<ChannelId> {
        self.handle(wallet)?;
        let _open = self.open_lock.lock().await;
        self.funder.select(Some(*wallet));
        let opened = self.channels.open(peer, capacity, push_amount).await;
        self.funder.select(None);
        opened
    }

    /// Closes a channel cooperatively or by force.
    pub async fn close_channel(&self, channel_id: ChannelId, mode: CloseMode) -> Result<Txid> {
        self.channels.close(channel_id, mode).await
    }

    /// Issues an invoice payable to this node.
    pub async fn create_invoice(
        &self,
        amount: u64,
        expiry_secs: Option<u32>,
        description: &str,
    ) -> Result<Invoice> {
        self.invoices
            .create_invoice(amount, expiry_secs, description)
            .await
    }

    /// Pays an encoded invoice over our channels.
    pub async fn pay_invoice(&self, encoded: &str) -> Result<(Invoice, Route, HtlcId)> {
        self.invoices.pay(encoded).await
    }

    /// Sweeper over this engine's channels at the configured interval.
    pub fn sweeper(&self) -> HtlcSweeper {
        HtlcSweeper::new(self.channels.clone(), self.config.sweep_interval())
    }

    /// Runs the sweeper in the background until `cancel` fires.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.sweeper().spawn(cancel)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ACCESSORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// This node's identity key.
    pub fn node_id(&self) -> NodeId {
        self.channels.node_id()
    }

    /// The channel manager.
    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    /// The invoice service.
    pub fn invoices(&self) -> &InvoiceService {
        &self.invoices
    }

    /// The multisig coordinator.
    pub fn multisig(&self) -> &MultisigCoordinator {
        &self.multisig
    }

    /// Reservation table shared by spends, proposals and channel funding.
    pub fn reservations(&self) -> &Arc<UtxoReservations> {
        &self.reservations
    }

    /// Chain client, wrapped in the retry policy.
    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }

    fn handle(&self, wallet: &WalletId) -> Result<WalletHandle> {
        self.wallets
            .get(wallet)
            .map(|h| h.value().clone())
            .ok_or_else(|| KestrelError::not_found("wallet", wallet))
    }
}

/// Node identity key at `m/1017'/coin'`.
fn node_key(seed: &Seed, network: Network) -> Result<ExtendedPrivateKey> {
    let path = DerivationPath::from_children(vec![
        ChildNumber::hardened(PURPOSE_NODE)?,
        ChildNumber::hardened(network.coin_type())?,
    ])?;
    ExtendedPrivateKey::from_seed(seed)?.derive_path(&path)
}

impl std::fmt::Debug for WalletEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletEngine")
            .field("network", &self.config.network)
            .field("wallets", &self.wallets.len())
            .field("pending", &self.pending.len())
            .field("vault", &self.vault)
            .field("funder", &self.funder)
            .finish()
    }
}
