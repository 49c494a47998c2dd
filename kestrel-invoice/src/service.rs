//! Invoice issuing, HTLC correlation and settlement.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use kestrel_channel::{ChannelEdge, ChannelManager, RelayPolicy, Route};
use kestrel_core::constants::{
    DEFAULT_INVOICE_EXPIRY_SECS, DEFAULT_MIN_FINAL_CLTV, HASH_SIZE, MAX_ROUTE_HINTS,
};
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{ChannelState, HtlcDirection, HtlcId, Network, PaymentHash, Preimage};
use kestrel_crypto::{sha256, ExtendedPrivateKey};

use crate::invoice::{unix_now, Invoice, InvoiceTerms, RouteHint};

/// Invoice service configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvoiceConfig {
    /// Validity of invoices created without an explicit expiry, in seconds
    pub default_expiry_secs: u32,
    /// Minimum final CLTV delta requested from payers
    pub min_final_cltv: u32,
    /// Advertise open channels as route hints
    pub include_route_hints: bool,
}

impl Default for InvoiceConfig {
    fn default() -> Self {
        Self {
            default_expiry_secs: DEFAULT_INVOICE_EXPIRY_SECS,
            min_final_cltv: DEFAULT_MIN_FINAL_CLTV,
            include_route_hints: true,
        }
    }
}

impl InvoiceConfig {
    /// Sets the default expiry.
    pub fn with_default_expiry(mut self, secs: u32) -> Self {
        self.default_expiry_secs = secs;
        self
    }

    /// Sets the requested final CLTV delta.
    pub fn with_min_final_cltv(mut self, blocks: u32) -> Self {
        self.min_final_cltv = blocks;
        self
    }

    /// Enables or disables route hints.
    pub fn with_route_hints(mut self, include: bool) -> Self {
        self.include_route_hints = include;
        self
    }
}

/// Lifecycle of an issued invoice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum InvoiceStatus {
    /// Awaiting payment
    Open,
    /// Paid by `htlc`
    Settled {
        /// HTLC that carried the payment
        htlc: HtlcId,
        /// When the preimage was released
        settled_at: DateTime<Utc>,
    },
    /// Cancelled by us
    Cancelled,
    /// Past its expiry without payment
    Expired,
}

struct InvoiceEntry {
    invoice: Invoice,
    preimage: Preimage,
    status: InvoiceStatus,
}

impl InvoiceEntry {
    /// Status with lazy expiry applied.
    fn current_status(&mut self) -> InvoiceStatus {
        if self.status == InvoiceStatus::Open && self.invoice.is_expired() {
            self.status = InvoiceStatus::Expired;
        }
        self.status
    }
}

/// Issues invoices and settles the HTLCs that pay them.
///
/// Preimages never leave the service except into
/// [`ChannelManager::fulfill_htlc`]; they are not persisted and are zeroized
/// when the entry is dropped.
pub struct InvoiceService {
    config: InvoiceConfig,
    network: Network,
    node_key: ExtendedPrivateKey,
    channels: Arc<ChannelManager>,
    invoices: DashMap<PaymentHash, Arc<Mutex<InvoiceEntry>>>,
}

impl InvoiceService {
    /// Creates a service signing with `node_key`, the same key the channel
    /// manager uses as node id.
    pub fn new(
        config: InvoiceConfig,
        network: Network,
        node_key: ExtendedPrivateKey,
        channels: Arc<ChannelManager>,
    ) -> Self {
        Self {
            config,
            network,
            node_key,
            channels,
            invoices: DashMap::new(),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &InvoiceConfig {
        &self.config
    }

    /// Issues an invoice for `amount` with a fresh preimage.
    ///
    /// `expiry` defaults to the configured validity.
    #[instrument(skip_all, fields(amount = amount))]
    pub async fn create_invoice(
        &self,
        amount: u64,
        expiry: Option<u32>,
        description: &str,
    ) -> Result<Invoice> {
        let mut bytes = [0u8; HASH_SIZE];
        OsRng.fill_bytes(&mut bytes);
        let preimage = Preimage::from_bytes(bytes);
        let payment_hash = PaymentHash(sha256(preimage.as_bytes()));

        let route_hints = if self.config.include_route_hints {
            self.route_hints().await
        } else {
            Vec::new()
        };
        let terms = InvoiceTerms {
            amount,
            payment_hash,
            created_at: unix_now(),
            expiry: expiry.unwrap_or(self.config.default_expiry_secs),
            min_final_cltv: self.config.min_final_cltv,
            description: description.to_string(),
            route_hints,
        };
        let invoice = Invoice::sign(self.network, terms, &self.node_key)?;

        self.invoices.insert(
            payment_hash,
            Arc::new(Mutex::new(InvoiceEntry {
                invoice: invoice.clone(),
                preimage,
                status: InvoiceStatus::Open,
            })),
        );
        info!(payment_hash = %payment_hash, expiry = invoice.expiry, "Invoice created");
        Ok(invoice)
    }

    /// Decodes an invoice for this service's network.
    ///
    /// # Errors
    /// `MalformedInvoice` / `InvoiceExpired` from [`Invoice::decode`], and
    /// `MalformedInvoice` for another network's invoice.
    pub fn decode(&self, encoded: &str) -> Result<Invoice> {
        let invoice = Invoice::decode(encoded)?;
        if invoice.network != self.network {
            return Err(KestrelError::MalformedInvoice(format!(
                "invoice for {} on a {} node",
                invoice.network, self.network
            )));
        }
        Ok(invoice)
    }

    /// Settles `invoice` with the HTLC `htlc_id`.
    ///
    /// # Errors
    /// - `NotFound` if we did not issue the invoice
    /// - `InvoiceAlreadySettled` if it was paid
    /// - `ValidationError` if it was cancelled or the HTLC was not received
    /// - `InvoiceExpired` past its expiry
    /// - `PaymentHashMismatch` if the HTLC pays another hash
    /// - `InvoiceUnderpaid` if the HTLC carries less than the amount
    #[instrument(skip_all, fields(payment_hash = %invoice.payment_hash, htlc = %htlc_id))]
    pub async fn settle(&self, invoice: &Invoice, htlc_id: HtlcId) -> Result<InvoiceStatus> {
        let entry = self.entry(&invoice.payment_hash)?;
        let mut guard = entry.lock().await;

        match guard.current_status() {
            InvoiceStatus::Open => {}
            InvoiceStatus::Settled { .. } => return Err(KestrelError::InvoiceAlreadySettled),
            InvoiceStatus::Cancelled => {
                return Err(KestrelError::ValidationError("invoice was cancelled".into()))
            }
            InvoiceStatus::Expired => {
                return Err(KestrelError::InvoiceExpired {
                    expired_at: guard.invoice.expires_at(),
                })
            }
        }

        let htlc = self.channels.pending_htlc(htlc_id).await?;
        if htlc.direction != HtlcDirection::Received {
            return Err(KestrelError::ValidationError(format!(
                "HTLC {} was offered by us",
                htlc_id
            )));
        }
        if htlc.payment_hash != guard.invoice.payment_hash {
            return Err(KestrelError::PaymentHashMismatch);
        }
        if htlc.amount < guard.invoice.amount {
            return Err(KestrelError::InvoiceUnderpaid {
                expected: guard.invoice.amount,
                received: htlc.amount,
            });
        }

        self.channels.fulfill_htlc(htlc_id, &guard.preimage).await?;
        guard.status = InvoiceStatus::Settled {
            htlc: htlc_id,
            settled_at: Utc::now(),
        };
        info!(amount = htlc.amount, "Invoice settled");
        Ok(guard.status)
    }

    /// Settles the invoice an incoming HTLC pays, if we issued one for its hash.
    ///
    /// Returns `None` for HTLCs that match no invoice, such as ones to
    /// forward. An HTLC that matches but cannot settle the invoice is failed
    /// back and the reason returned.
    pub async fn on_incoming_htlc(&self, htlc_id: HtlcId) -> Result<Option<InvoiceStatus>> {
        let htlc = self.channels.pending_htlc(htlc_id).await?;
        let invoice = match self.invoices.get(&htlc.payment_hash) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(htlc = %htlc_id, "No invoice for incoming HTLC");
                return Ok(None);
            }
        };
        let invoice = invoice.lock().await.invoice.clone();

        match self.settle(&invoice, htlc_id).await {
            Ok(status) => Ok(Some(status)),
            Err(e) if is_payment_refusal(&e) => {
                warn!(htlc = %htlc_id, error = %e, "Incoming HTLC refused");
                if let Err(fail_err) = self.channels.fail_htlc(htlc_id, &e.to_string()).await {
                    warn!(htlc = %htlc_id, error = %fail_err, "Refused HTLC not failed back");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Cancels an open invoice.
    ///
    /// # Errors
    /// `InvoiceAlreadySettled` if it was paid.
    pub async fn cancel_invoice(&self, payment_hash: &PaymentHash) -> Result<InvoiceStatus> {
        let entry = self.entry(payment_hash)?;
        let mut guard = entry.lock().await;
        match guard.current_status() {
            InvoiceStatus::Settled { .. } => Err(KestrelError::InvoiceAlreadySettled),
            InvoiceStatus::Cancelled => Ok(InvoiceStatus::Cancelled),
            InvoiceStatus::Open | InvoiceStatus::Expired => {
                guard.status = InvoiceStatus::Cancelled;
                info!(payment_hash = %payment_hash, "Invoice cancelled");
                Ok(InvoiceStatus::Cancelled)
            }
        }
    }

    /// Current status of an invoice we issued.
    pub async fn status(&self, payment_hash: &PaymentHash) -> Result<InvoiceStatus> {
        let entry = self.entry(payment_hash)?;
        let status = entry.lock().await.current_status();
        Ok(status)
    }

    /// An invoice we issued.
    pub async fn invoice(&self, payment_hash: &PaymentHash) -> Result<Invoice> {
        let entry = self.entry(payment_hash)?;
        let invoice = entry.lock().await.invoice.clone();
        Ok(invoice)
    }

    /// Number of invoices issued.
    pub fn invoice_count(&self) -> usize {
        self.invoices.len()
    }

    /// Pays an encoded invoice over the channel graph.
    ///
    /// Route hints are added to the graph before routing.
    #[instrument(skip_all)]
    pub async fn pay(&self, encoded: &str) -> Result<(Invoice, Route, HtlcId)> {
        let invoice = self.decode(encoded)?;
        let ours = self.channels.node_id();
        if invoice.destination == ours {
            return Err(KestrelError::ValidationError("cannot pay our own invoice".into()));
        }

        for hint in invoice.route_hints.iter().filter(|h| h.node != ours) {
            self.channels.add_remote_channel(ChannelEdge {
                channel_id: hint.channel_id,
                from: hint.node,
                to: invoice.destination,
                capacity: u64::MAX,
                policy: RelayPolicy {
                    base_fee: u64::from(hint.base_fee),
                    fee_ppm: u64::from(hint.fee_ppm),
                    cltv_delta: u32::from(hint.cltv_delta),
                },
                enabled: true,
            });
        }

        let (route, htlc_id) = self
            .channels
            .pay(
                invoice.destination,
                invoice.amount,
                invoice.payment_hash,
                invoice.min_final_cltv,
            )
            .await?;
        info!(
            payment_hash = %invoice.payment_hash,
            hops = route.hops.len(),
            fee = route.total_fee,
            "Invoice payment sent"
        );
        Ok((invoice, route, htlc_id))
    }

    fn entry(&self, payment_hash: &PaymentHash) -> Result<Arc<Mutex<InvoiceEntry>>> {
        self.invoices
            .get(payment_hash)
            .map(|e| e.value().clone())
            .ok_or_else(|| KestrelError::not_found("invoice", payment_hash))
    }

    /// Open channels, advertised with our relay policy.
    async fn route_hints(&self) -> Vec<RouteHint> {
        let relay = self.channels.config().relay;
        self.channels
            .list_channels()
            .await
            .into_iter()
            .filter(|c| c.state == ChannelState::Open)
            .take(MAX_ROUTE_HINTS)
            .map(|c| RouteHint {
                node: c.counterparty,
                channel_id: c.id,
                base_fee: u32::try_from(relay.base_fee).unwrap_or(u32::MAX),
                fee_ppm: u32::try_from(relay.fee_ppm).unwrap_or(u32::MAX),
                cltv_delta: u16::try_from(relay.cltv_delta).unwrap_or(u16::MAX),
            })
            .collect()
    }
}

/// Errors meaning the HTLC can never pay the invoice.
fn is_payment_refusal(e: &KestrelError) -> bool {
    matches!(
        e,
        KestrelError::PaymentHashMismatch
            | KestrelError::InvoiceUnderpaid { .. }
            | KestrelError::InvoiceExpired { .. }
            | KestrelError::InvoiceAlreadySettled
            | KestrelError::ValidationError(_)
    )
}

impl std::fmt::Debug for InvoiceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvoiceService")
            .field("network", &self.network)
            .field("invoices", &self.invoices.len())
            .finish()
    }
}
