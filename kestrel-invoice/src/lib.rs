//! # Kestrel Invoices
//!
//! Payment requests and their settlement against incoming HTLCs.
//!
//! An [`Invoice`] is a Bech32 string signed by the payee's node key. The
//! [`InvoiceService`] keeps the preimage for each invoice it issues and
//! releases it to the channel manager only when a received HTLC pays the
//! right hash with enough value before expiry.
//!
//! ## Example
//!
//! ```rust,ignore
//! use kestrel_invoice::{InvoiceConfig, InvoiceService};
//!
//! let service = InvoiceService::new(InvoiceConfig::default(), network, node_key, channels);
//! let invoice = service.create_invoice(250_000, None, "coffee").await?;
//! println!("{}", invoice);
//!
//! // later, when the payer's HTLC arrives
//! service.on_incoming_htlc(htlc_id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod invoice;
pub mod service;

pub use invoice::{Invoice, InvoiceTerms, RouteHint};
pub use service::{InvoiceConfig, InvoiceService, InvoiceStatus};
