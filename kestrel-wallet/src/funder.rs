//! Channel funding from engine wallets.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use kestrel_address::Address;
use kestrel_channel::{ChannelFunder, FundingTransaction};
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::traits::WalletRepository;
use kestrel_core::types::WalletId;
use kestrel_crypto::KeyVault;
use kestrel_tx::{
    BuilderConfig, FeePolicy, ReservationId, Signer, TransactionBuilder, TxOutput,
    UtxoReservations,
};

use crate::account::{self, WalletHandle};

/// [`ChannelFunder`] spending the confirmed outputs of one engine wallet.
///
/// The engine selects the wallet for the duration of one open and holds its
/// open lock meanwhile, so concurrent opens never see each other's selection.
pub struct WalletFunder {
    vault: Arc<KeyVault>,
    reservations: Arc<UtxoReservations>,
    repository: Arc<dyn WalletRepository>,
    wallets: Arc<DashMap<WalletId, WalletHandle>>,
    selected: Mutex<Option<WalletId>>,
    funded: DashMap<ReservationId, WalletId>,
    builder: BuilderConfig,
    fee: FeePolicy,
    min_confirmations: u32,
}

impl WalletFunder {
    pub(crate) fn new(
        vault: Arc<KeyVault>,
        reservations: Arc<UtxoReservations>,
        repository: Arc<dyn WalletRepository>,
        wallets: Arc<DashMap<WalletId, WalletHandle>>,
        builder: BuilderConfig,
        fee: FeePolicy,
        min_confirmations: u32,
    ) -> Self {
        Self {
            vault,
            reservations,
            repository,
            wallets,
            selected: Mutex::new(None),
            funded: DashMap::new(),
            builder: builder.with_rbf(false),
            fee,
            min_confirmations,
        }
    }

    pub(crate) fn select(&self, wallet: Option<WalletId>) {
        *self.selected.lock() = wallet;
    }

    /// Funding transactions not yet committed or released.
    pub fn in_flight(&self) -> usize {
        self.funded.len()
    }

    fn handle(&self, wallet: &WalletId) -> Result<WalletHandle> {
        self.wallets
            .get(wallet)
            .map(|h| h.value().clone())
            .ok_or_else(|| KestrelError::not_found("wallet", wallet))
    }
}

#[async_trait]
impl ChannelFunder for WalletFunder {
    #[instrument(skip_all, fields(amount = amount))]
    async fn fund(&self, address: &Address, amount: u64) -> Result<FundingTransaction> {
        let wallet = (*self.selected.lock())
            .ok_or_else(|| KestrelError::ValidationError("no funding wallet selected".into()))?;
        let handle = self.handle(&wallet)?;
        let mut meta = handle.lock().await;

        let candidates = account::spendable(&meta, &self.reservations, self.min_confirmations);
        let mut staged = meta.clone();
        let change = account::change_address(&self.vault, &mut staged)?;
        let unsigned = TransactionBuilder::new(self.builder.clone())
            .with_change(change)
            .build(&candidates, vec![TxOutput::to_address(address, amount)], self.fee)?;

        let reservation = self.reservations.reserve(&unsigned.outpoints())?;
        let signed = account::signing_keys(&self.vault, &staged, &unsigned)
            .and_then(|keys| Signer::sign(unsigned, &keys, None));
        let signed = match signed {
            Ok(signed) => signed,
            Err(e) => {
                self.reservations.release(reservation);
                return Err(e);
            }
        };
        if let Err(e) = self.repository.save_wallet_metadata(&staged).await {
            self.reservations.release(reservation);
            return Err(e);
        }
        *meta = staged;

        self.funded.insert(reservation, wallet);
        debug!(wallet = %wallet, txid = %signed.txid(), fee = signed.fee(), "Funding transaction signed");
        FundingTransaction::new(signed, address, Some(reservation))
    }

    async fn release(&self, funding: &FundingTransaction) {
        let Some(id) = funding.reservation else {
            return;
        };
        self.funded.remove(&id);
        if !self.reservations.release(id) {
            warn!(reservation = %id, "Funding reservation already gone");
        }
    }

    async fn commit(&self, funding: &FundingTransaction) {
        let Some(id) = funding.reservation else {
            return;
        };
        if let Err(e) = self.reservations.commit(id) {
            warn!(reservation = %id, error = %e, "Funding reservation not committed");
        }
        let Some((_, wallet)) = self.funded.remove(&id) else {
            return;
        };
        let Ok(handle) = self.handle(&wallet) else {
            return;
        };

        let spent = funding.transaction.unsigned().outpoints();
        let mut meta = handle.lock().await;
        let mut staged = meta.clone();
        account::remove_spent(&mut staged, &spent);
        match self.repository.save_wallet_metadata(&staged).await {
            Ok(()) => *meta = staged,
            Err(e) => warn!(wallet = %wallet, error = %e, "Funding spend not persisted"),
        }
    }
}

impl std::fmt::Debug for WalletFunder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletFunder")
            .field("selected", &*self.selected.lock())
            .field("in_flight", &self.funded.len())
            .field("fee", &self.fee)
            .finish()
    }
}
