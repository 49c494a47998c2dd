//! Funding transactions.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use kestrel_address::{Address, AddressCodec, AddressSource};
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{Network, OutPoint, ScriptType, Utxo};
use kestrel_crypto::ExtendedPrivateKey;
use kestrel_tx::{
    BuilderConfig, FeePolicy, ReservationId, SignedTransaction, Signer, TransactionBuilder,
    TxOutput, UtxoReservations,
};

/// A signed transaction paying a channel's funding output.
#[derive(Clone, Debug)]
pub struct FundingTransaction {
    /// The transaction, ready to broadcast
    pub transaction: SignedTransaction,
    /// Index of the funding output
    pub output_index: u32,
    /// Reservation holding the spent inputs
    pub reservation: Option<ReservationId>,
}

impl FundingTransaction {
    /// Locates the output paying `address` in `transaction`.
    pub fn new(
        transaction: SignedTransaction,
        address: &Address,
        reservation: Option<ReservationId>,
    ) -> Result<Self> {
        let script = address.script_pubkey();
        let output_index = transaction
            .outputs()
            .iter()
            .position(|o| o.script_pubkey == script)
            .ok_or_else(|| {
                KestrelError::ValidationError(format!("funding transaction does not pay {}", address))
            })?;
        Ok(Self {
            transaction,
            output_index: output_index as u32,
            reservation,
        })
    }

    /// The funding outpoint.
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.transaction.txid(), self.output_index)
    }

    /// Amount locked in the funding output.
    pub fn amount(&self) -> u64 {
        self.transaction.outputs()[self.output_index as usize].amount
    }
}

/// Source of on-chain funds for channels the manager opens.
#[async_trait]
pub trait ChannelFunder: Send + Sync {
    /// Builds and signs a transaction paying exactly `amount` to `address`,
    /// reserving its inputs.
    async fn fund(&self, address: &Address, amount: u64) -> Result<FundingTransaction>;

    /// Returns the inputs of an abandoned funding transaction.
    async fn release(&self, funding: &FundingTransaction);

    /// Marks the inputs of a confirmed funding transaction as spent.
    async fn commit(&self, funding: &FundingTransaction);
}

/// Funder spending outputs locked to a single P2WPKH key.
///
/// Change returns to the same key.
pub struct KeyFunder {
    key: ExtendedPrivateKey,
    address: Address,
    utxos: Mutex<Vec<Utxo>>,
    reservations: Arc<UtxoReservations>,
    fee: FeePolicy,
}

impl KeyFunder {
    /// Creates a funder for `key` sharing `reservations` with the engine.
    pub fn new(
        key: ExtendedPrivateKey,
        network: Network,
        reservations: Arc<UtxoReservations>,
    ) -> Result<Self> {
        let address = AddressCodec::encode(
            AddressSource::PublicKey(key.public_key()),
            network,
            ScriptType::P2wpkh,
        )?;
        Ok(Self {
            key,
            address,
            utxos: Mutex::new(Vec::new()),
            reservations,
            fee: FeePolicy::PerVbyte(2),
        })
    }

    /// Sets the fee policy of funding transactions.
    pub fn with_fee(mut self, fee: FeePolicy) -> Self {
        self.fee = fee;
        self
    }

    /// Address the funder's outputs pay.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Adds a spendable output.
    pub fn add_utxo(&self, utxo: Utxo) {
        self.utxos.lock().push(utxo);
    }

    /// Sum of outputs not reserved or spent.
    pub fn available(&self) -> u64 {
        self.utxos
            .lock()
            .iter()
            .filter(|u| self.reservations.is_available(&u.outpoint))
            .map(|u| u.amount)
            .sum()
    }
}

#[async_trait]
impl ChannelFunder for KeyFunder {
    #[instrument(skip_all, fields(amount = amount))]
    async fn fund(&self, address: &Address, amount: u64) -> Result<FundingTransaction> {
        let candidates: Vec<Utxo> = self
            .utxos
            .lock()
            .iter()
            .filter(|u| self.reservations.is_available(&u.outpoint))
            .cloned()
            .collect();

        let unsigned = TransactionBuilder::new(BuilderConfig::default().with_rbf(false))
            .with_change(self.address.clone())
            .build(&candidates, vec![TxOutput::to_address(address, amount)], self.fee)?;
        let reservation = self.reservations.reserve(&unsigned.outpoints())?;

        let signed = match Signer::sign(unsigned, std::slice::from_ref(&self.key), None) {
            Ok(signed) => signed,
            Err(e) => {
                self.reservations.release(reservation);
                return Err(e);
            }
        };
        debug!(txid = %signed.txid(), fee = signed.fee(), "Funding transaction signed");
        FundingTransaction::new(signed, address, Some(reservation))
    }

    async fn release(&self, funding: &FundingTransaction) {
        if let Some(id) = funding.reservation {
            if !self.reservations.release(id) {
                warn!(reservation = %id, "Funding reservation already gone");
            }
        }
    }

    async fn commit(&self, funding: &FundingTransaction) {
        if let Some(id) = funding.reservation {
            if let Err(e) = self.reservations.commit(id) {
                warn!(reservation = %id, error = %e, "Funding reservation not committed");
            }
        }
        let spent = funding.transaction.unsigned().outpoints();
        self.utxos.lock().retain(|u| !spent.contains(&u.outpoint));
    }
}

impl std::fmt::Debug for KeyFunder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFunder")
            .field("address", &self.address.as_str())
            .field("utxos", &self.utxos.lock().len())
            .finish()
    }
}
