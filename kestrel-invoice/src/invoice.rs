//! Invoice type and its Bech32 wire format.
//!
//! ```text
//! hrp  = <network prefix><amount in sats>           e.g. lnbcrt250000
//! data = version            u8
//!        payment_hash       [32]
//!        created_at         u64 BE (unix seconds)
//!        expiry             u32 BE (seconds)
//!        min_final_cltv     u32 BE
//!        destination        [33]
//!        description        u16 BE length ‖ UTF-8
//!        route hints        u8 count ‖ count × (node[33] ‖ channel_id[32] ‖
//!                           base_fee u32 ‖ fee_ppm u32 ‖ cltv_delta u16)
//!        signature          [64] over sha256(hrp ‖ data without signature)
//! ```
//!
//! The signature is made by the destination key, so a decoded invoice is
//! self-authenticating.

use std::fmt;
use std::str::FromStr;

use bech32::primitives::decode::CheckedHrpstring;
use bech32::{Bech32, Hrp};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use kestrel_core::constants::{
    COMPRESSED_PUBLIC_KEY_SIZE, HASH_SIZE, INVOICE_VERSION, MAX_INVOICE_DESCRIPTION,
    MAX_ROUTE_HINTS, SIGNATURE_SIZE,
};
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{ChannelId, Network, NodeId, PaymentHash, PublicKey, Signature};
use kestrel_crypto::{sha256, verify, ExtendedPrivateKey};

/// A private channel the payer may use for the last hop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHint {
    /// Node at the far end of the hinted channel
    pub node: NodeId,
    /// Hinted channel
    pub channel_id: ChannelId,
    /// Base fee charged by `node`
    pub base_fee: u32,
    /// Proportional fee charged by `node`
    pub fee_ppm: u32,
    /// CLTV delta `node` adds
    pub cltv_delta: u16,
}

/// What an invoice asks for, before it is signed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvoiceTerms {
    /// Amount in sats
    pub amount: u64,
    /// sha256 of the preimage that settles the invoice
    pub payment_hash: PaymentHash,
    /// Unix seconds
    pub created_at: u64,
    /// Seconds after `created_at` the invoice stays payable
    pub expiry: u32,
    /// Minimum blocks between the final HTLC's expiry and the current height
    pub min_final_cltv: u32,
    /// Free text
    pub description: String,
    /// Last-hop hints
    pub route_hints: Vec<RouteHint>,
}

/// A signed payment request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    /// Network the invoice pays on
    pub network: Network,
    /// Amount in sats
    pub amount: u64,
    /// sha256 of the preimage
    pub payment_hash: PaymentHash,
    /// Unix seconds
    pub created_at: u64,
    /// Validity in seconds
    pub expiry: u32,
    /// Minimum final CLTV delta
    pub min_final_cltv: u32,
    /// Node to pay; also the signing key
    pub destination: NodeId,
    /// Free text
    pub description: String,
    /// Last-hop hints
    pub route_hints: Vec<RouteHint>,
    /// Destination's signature over the encoded fields
    pub signature: Signature,
}

impl Invoice {
    /// Signs `terms` with `node_key`, which becomes the destination.
    ///
    /// # Errors
    /// `ValidationError` for a zero amount, an oversized description or too
    /// many route hints.
    pub fn sign(network: Network, terms: InvoiceTerms, node_key: &ExtendedPrivateKey) -> Result<Self> {
        if terms.amount == 0 {
            return Err(KestrelError::ValidationError("invoice amount must be positive".into()));
        }
        if terms.description.len() > MAX_INVOICE_DESCRIPTION {
            return Err(KestrelError::ValidationError(format!(
                "description is {} bytes, limit {}",
                terms.description.len(),
                MAX_INVOICE_DESCRIPTION
            )));
        }
        if terms.route_hints.len() > MAX_ROUTE_HINTS {
            return Err(KestrelError::ValidationError(format!(
                "{} route hints, limit {}",
                terms.route_hints.len(),
                MAX_ROUTE_HINTS
            )));
        }

        let mut invoice = Self {
            network,
            amount: terms.amount,
            payment_hash: terms.payment_hash,
            created_at: terms.created_at,
            expiry: terms.expiry,
            min_final_cltv: terms.min_final_cltv,
            destination: *node_key.public_key(),
            description: terms.description,
            route_hints: terms.route_hints,
            signature: Signature::from_array([0; SIGNATURE_SIZE]),
        };
        invoice.signature = node_key.sign(&invoice.signing_hash())?;
        Ok(invoice)
    }

    /// Human-readable part: network prefix followed by the amount.
    pub fn hrp(&self) -> String {
        format!("{}{}", self.network.invoice_prefix(), self.amount)
    }

    /// Unix time after which the invoice is no longer payable.
    pub fn expires_at(&self) -> u64 {
        self.created_at.saturating_add(u64::from(self.expiry))
    }

    /// True if `now` (unix seconds) is past the expiry.
    pub fn is_expired_at(&self, now: u64) -> bool {
        now > self.expires_at()
    }

    /// True if the invoice has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_now())
    }

    /// Encodes the invoice as a Bech32 string.
    pub fn encode(&self) -> Result<String> {
        let hrp = Hrp::parse(&self.hrp())
            .map_err(|e| KestrelError::InternalError(format!("invoice hrp: {}", e)))?;
        let mut data = self.fields();
        data.extend_from_slice(self.signature.as_bytes());
        bech32::encode::<Bech32>(hrp, &data)
            .map_err(|e| KestrelError::InternalError(format!("invoice encode: {}", e)))
    }

    /// Decodes and authenticates an invoice, refusing expired ones.
    ///
    /// # Errors
    /// - `MalformedInvoice` for a bad checksum, prefix, amount, length,
    ///   UTF-8 description or signature
    /// - `InvoiceExpired` if the current time is past `created_at + expiry`
    pub fn decode(s: &str) -> Result<Self> {
        Self::decode_at(s, unix_now())
    }

    /// [`decode`](Self::decode) with an explicit current time.
    pub fn decode_at(s: &str, now: u64) -> Result<Self> {
        let invoice = Self::parse(s)?;
        if invoice.is_expired_at(now) {
            return Err(KestrelError::InvoiceExpired {
                expired_at: invoice.expires_at(),
            });
        }
        Ok(invoice)
    }

    /// Decodes and authenticates an invoice without checking its expiry.
    pub fn parse(s: &str) -> Result<Self> {
        let checked = CheckedHrpstring::new::<Bech32>(s.trim())
            .map_err(|e| malformed(format!("bech32: {}", e)))?;
        let hrp = checked.hrp().to_lowercase();
        let (network, amount) = parse_hrp(&hrp)?;
        let data: Vec<u8> = checked.byte_iter().collect();

        let mut r = Reader::new(&data);
        let version = r.u8()?;
        if version != INVOICE_VERSION {
            return Err(malformed(format!("unsupported version {}", version)));
        }
        let payment_hash = PaymentHash(r.array()?);
        let created_at = r.u64()?;
        let expiry = r.u32()?;
        let min_final_cltv = r.u32()?;
        let destination = r.public_key()?;

        let description_len = usize::from(r.u16()?);
        if description_len > MAX_INVOICE_DESCRIPTION {
            return Err(malformed(format!("description length {}", description_len)));
        }
        let description = String::from_utf8(r.take(description_len)?.to_vec())
            .map_err(|_| malformed("description is not UTF-8"))?;

        let hint_count = usize::from(r.u8()?);
        if hint_count > MAX_ROUTE_HINTS {
            return Err(malformed(format!("{} route hints", hint_count)));
        }
        let mut route_hints = Vec::with_capacity(hint_count);
        for _ in 0..hint_count {
            route_hints.push(RouteHint {
                node: r.public_key()?,
                channel_id: ChannelId::from_bytes(r.array()?),
                base_fee: r.u32()?,
                fee_ppm: r.u32()?,
                cltv_delta: r.u16()?,
            });
        }

        let signature = Signature::from_bytes(r.take(SIGNATURE_SIZE)?)
            .map_err(|e| malformed(format!("signature: {}", e)))?;
        if r.remaining() != 0 {
            return Err(malformed(format!("{} trailing bytes", r.remaining())));
        }

        let invoice = Self {
            network,
            amount,
            payment_hash,
            created_at,
            expiry,
            min_final_cltv,
            destination,
            description,
            route_hints,
            signature,
        };
        if !verify(&invoice.destination, &invoice.signing_hash(), &invoice.signature) {
            return Err(malformed("signature does not match destination"));
        }
        Ok(invoice)
    }

    /// Everything but the signature, in wire order.
    fn fields(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(
            1 + HASH_SIZE + 8 + 4 + 4 + COMPRESSED_PUBLIC_KEY_SIZE + 2 + self.description.len() + 1,
        );
        data.push(INVOICE_VERSION);
        data.extend_from_slice(&self.payment_hash.0);
        data.extend_from_slice(&self.created_at.to_be_bytes());
        data.extend_from_slice(&self.expiry.to_be_bytes());
        data.extend_from_slice(&self.min_final_cltv.to_be_bytes());
        data.extend_from_slice(self.destination.as_bytes());
        data.extend_from_slice(&(self.description.len() as u16).to_be_bytes());
        data.extend_from_slice(self.description.as_bytes());
        data.push(self.route_hints.len() as u8);
        for hint in &self.route_hints {
            data.extend_from_slice(hint.node.as_bytes());
            data.extend_from_slice(hint.channel_id.as_bytes());
            data.extend_from_slice(&hint.base_fee.to_be_bytes());
            data.extend_from_slice(&hint.fee_ppm.to_be_bytes());
            data.extend_from_slice(&hint.cltv_delta.to_be_bytes());
        }
        data
    }

    fn signing_hash(&self) -> [u8; HASH_SIZE] {
        let mut message = self.hrp().into_bytes();
        message.extend_from_slice(&self.fields());
        sha256(&message)
    }
}

impl fmt::Display for Invoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.encode().map_err(|_| fmt::Error)?;
        f.write_str(&encoded)
    }
}

/// Parses without the expiry check; see [`Invoice::parse`].
impl FromStr for Invoice {
    type Err = KestrelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

pub(crate) fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

fn malformed(reason: impl Into<String>) -> KestrelError {
    KestrelError::MalformedInvoice(reason.into())
}

/// Splits `<prefix><digits>` into a network and amount.
fn parse_hrp(hrp: &str) -> Result<(Network, u64)> {
    for network in Network::ALL {
        let Some(digits) = hrp.strip_prefix(network.invoice_prefix()) else {
            continue;
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let amount = digits
            .parse::<u64>()
            .map_err(|_| malformed(format!("amount {} out of range", digits)))?;
        if amount == 0 {
            return Err(malformed("zero amount"));
        }
        return Ok((network, amount));
    }
    Err(malformed(format!("unknown prefix in {}", hrp)))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(malformed(format!(
                "truncated at byte {}: need {} more, have {}",
                self.pos,
                len,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn public_key(&mut self) -> Result<PublicKey> {
        PublicKey::from_bytes(self.take(COMPRESSED_PUBLIC_KEY_SIZE)?)
            .map_err(|e| malformed(format!("public key: {}", e)))
    }
}
