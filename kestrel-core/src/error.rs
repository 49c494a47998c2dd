//! Error types for Kestrel.
//!
//! A single error hierarchy built with `thiserror`, grouped the way callers
//! have to react to it:
//!
//! - **Input** errors are rejected synchronously and never retried.
//! - **Resource** errors mean nothing was committed.
//! - **Coordination** errors reject one contribution and leave the
//!   surrounding proposal or channel untouched.
//! - **Network** errors are the only ones eligible for automatic retry.
//! - **Integrity** errors abort the operation and are never swallowed.

use thiserror::Error;

/// Result type alias using `KestrelError`.
pub type Result<T> = std::result::Result<T, KestrelError>;

/// Coarse classification of a [`KestrelError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed caller input.
    Input,
    /// Not enough funds or outputs too small.
    Resource,
    /// A signature, preimage or payment contribution was rejected.
    Coordination,
    /// An object is in the wrong lifecycle state or does not exist.
    State,
    /// Transient chain/RPC failure.
    Network,
    /// Invariant or verification failure.
    Integrity,
    /// Persistence failure.
    Storage,
    /// Configuration or internal bug.
    Internal,
}

/// Main error type for all Kestrel operations.
#[derive(Debug, Error)]
pub enum KestrelError {
    // ═══════════════════════════════════════════════════════════════════════════
    // INPUT ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Derivation path text could not be parsed.
    #[error("Invalid derivation path: {0}")]
    InvalidDerivationPath(String),

    /// Address string has an unknown prefix, charset, length or version.
    #[error("Invalid address format: {0}")]
    InvalidAddressFormat(String),

    /// Base58Check or Bech32 checksum did not match.
    #[error("Address checksum mismatch")]
    ChecksumMismatch,

    /// Invoice string could not be decoded or its signature is invalid.
    #[error("Malformed invoice: {0}")]
    MalformedInvoice(String),

    /// Invoice is past its expiry.
    #[error("Invoice expired at unix time {expired_at}")]
    InvoiceExpired {
        /// Unix timestamp at which the invoice stopped being payable
        expired_at: u64,
    },

    /// Requested entropy is not a multiple of 32 bits in 128..=512.
    #[error("Invalid entropy length: {0} bits")]
    InvalidEntropyLength(usize),

    /// Invalid key size or format.
    #[error("Invalid key: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        actual: usize,
    },

    /// Key bytes are the right size but not a valid curve point or scalar.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Script does not have the expected template.
    #[error("Invalid script: {0}")]
    InvalidScript(String),

    /// Input validation failed.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Invalid hex encoding.
    #[error("Invalid hex encoding: {0}")]
    HexError(#[from] hex::FromHexError),

    // ═══════════════════════════════════════════════════════════════════════════
    // KEY MATERIAL ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// The platform RNG could not supply secure bytes.
    #[error("Insufficient entropy: {0}")]
    InsufficientEntropy(String),

    /// Child index is reserved or the combination is invalid under BIP32.
    #[error("Key derivation overflow: {0}")]
    KeyDerivationOverflow(String),

    /// Signing primitive failed.
    #[error("Signing failed: {0}")]
    SigningError(String),

    // ═══════════════════════════════════════════════════════════════════════════
    // RESOURCE ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Spendable UTXOs cannot cover outputs plus fee.
    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds {
        /// Outputs plus fee
        needed: u64,
        /// Total of the eligible UTXOs
        available: u64,
    },

    /// Local channel balance cannot cover the HTLC.
    #[error("Insufficient channel balance: need {needed}, have {available}")]
    InsufficientChannelBalance {
        /// HTLC amount
        needed: u64,
        /// Spendable local balance
        available: u64,
    },

    /// Output is below the dust threshold of its script type.
    #[error("Output {index} of {amount} is below dust threshold {threshold}")]
    DustOutput {
        /// Index of the offending output
        index: usize,
        /// Output amount
        amount: u64,
        /// Dust threshold for the output's script type
        threshold: u64,
    },

    /// A UTXO is already reserved by an in-flight transaction.
    #[error("UTXO already reserved: {0}")]
    UtxoReserved(String),

    /// Amount arithmetic overflowed u64.
    #[error("Amount overflow")]
    AmountOverflow,

    // ═══════════════════════════════════════════════════════════════════════════
    // COORDINATION ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// A multisig input does not have enough signatures yet.
    #[error("Incomplete signatures: {collected} of {required}")]
    IncompleteSignatures {
        /// Distinct valid signatures collected
        collected: usize,
        /// Threshold M
        required: usize,
    },

    /// The signer already contributed to this proposal.
    #[error("Duplicate signature from {0}")]
    DuplicateSignature(String),

    /// A partial signature failed per-input verification.
    #[error("Invalid partial signature: {0}")]
    InvalidPartialSignature(String),

    /// The signer is not one of the wallet's co-signers.
    #[error("Unknown signer: {0}")]
    UnknownSigner(String),

    /// No key in the key ring can sign an input.
    #[error("Missing signing key for input {0}")]
    MissingSigningKey(usize),

    /// sha256(preimage) does not equal the stored payment hash.
    #[error("Preimage does not match payment hash")]
    PreimageMismatch,

    /// HTLC payment hash differs from the invoice's.
    #[error("Payment hash mismatch")]
    PaymentHashMismatch,

    /// HTLC amount is lower than the invoice amount.
    #[error("Invoice underpaid: expected {expected}, received {received}")]
    InvoiceUnderpaid {
        /// Invoice amount
        expected: u64,
        /// HTLC amount
        received: u64,
    },

    /// Invoice was already settled by another HTLC.
    #[error("Invoice already settled")]
    InvoiceAlreadySettled,

    /// HTLC was already failed and can no longer be fulfilled.
    #[error("HTLC already resolved: {0}")]
    HtlcAlreadyResolved(String),

    /// Counterparty did not countersign in time.
    #[error("Countersignature timed out: {0}")]
    CountersignTimeout(String),

    /// Counterparty refused a proposal.
    #[error("Counterparty rejected: {0}")]
    CounterpartyRejected(String),

    // ═══════════════════════════════════════════════════════════════════════════
    // STATE ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Operation requires an open channel.
    #[error("Channel not open (state: {0})")]
    ChannelNotOpen(String),

    /// State machine refused a transition.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Multisig proposal passed its collection deadline.
    #[error("Proposal expired: {0}")]
    ProposalExpired(String),

    /// Cooperative close attempted with HTLCs in flight.
    #[error("Channel has {0} pending HTLCs")]
    ChannelHasPendingHtlcs(usize),

    /// HTLC expiry is not beyond the current block height.
    #[error("HTLC expiry {expiry} too soon for height {height}")]
    HtlcExpiryTooSoon {
        /// Requested expiry height
        expiry: u32,
        /// Current chain height
        height: u32,
    },

    /// No path in the local channel graph can carry the amount.
    #[error("No route found: {0}")]
    NoRouteFound(String),

    /// Lookup of a wallet, channel, HTLC, proposal or invoice failed.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of object
        kind: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    // ═══════════════════════════════════════════════════════════════════════════
    // NETWORK ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// RPC call failed.
    #[error("RPC call failed: {0}")]
    RpcError(String),

    /// Connection timeout.
    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    /// Broadcast did not reach the network.
    #[error("Broadcast failed: {0}")]
    BroadcastFailed(String),

    /// Node rejected the transaction (not retryable).
    #[error("Transaction rejected: {0}")]
    TransactionRejected(String),

    // ═══════════════════════════════════════════════════════════════════════════
    // INTEGRITY ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// A persisted or in-memory invariant does not hold.
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// Cryptographic verification failed.
    #[error("Cryptographic verification failed: {0}")]
    VerificationFailed(String),

    // ═══════════════════════════════════════════════════════════════════════════
    // STORAGE ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// File I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Repository is unreadable or corrupted.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Storage format version mismatch.
    #[error("Storage version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Supported version
        expected: u8,
        /// Version found on disk
        actual: u8,
    },

    // ═══════════════════════════════════════════════════════════════════════════
    // INTERNAL ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal invariant violation (should never happen).
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl KestrelError {
    /// Shorthand for [`KestrelError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        KestrelError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Returns the category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        use KestrelError::*;
        match self {
            InvalidDerivationPath(_)
            | InvalidAddressFormat(_)
            | ChecksumMismatch
            | MalformedInvoice(_)
            | InvoiceExpired { .. }
            | InvalidEntropyLength(_)
            | InvalidKeySize { .. }
            | InvalidKey(_)
            | InvalidScript(_)
            | ValidationError(_)
            | HexError(_)
            | KeyDerivationOverflow(_) => ErrorCategory::Input,

            InsufficientFunds { .. }
            | InsufficientChannelBalance { .. }
            | DustOutput { .. }
            | UtxoReserved(_)
            | AmountOverflow => ErrorCategory::Resource,

            IncompleteSignatures { .. }
            | DuplicateSignature(_)
            | InvalidPartialSignature(_)
            | UnknownSigner(_)
            | MissingSigningKey(_)
            | PreimageMismatch
            | PaymentHashMismatch
            | InvoiceUnderpaid { .. }
            | InvoiceAlreadySettled
            | HtlcAlreadyResolved(_)
            | CountersignTimeout(_)
            | CounterpartyRejected(_) => ErrorCategory::Coordination,

            ChannelNotOpen(_)
            | InvalidStateTransition { .. }
            | ProposalExpired(_)
            | ChannelHasPendingHtlcs(_)
            | HtlcExpiryTooSoon { .. }
            | NoRouteFound(_)
            | NotFound { .. } => ErrorCategory::State,

            RpcError(_) | ConnectionTimeout(_) | BroadcastFailed(_) => ErrorCategory::Network,
            TransactionRejected(_) => ErrorCategory::Network,

            IntegrityViolation(_) | VerificationFailed(_) => ErrorCategory::Integrity,

            IoError(_) | JsonError(_) | StorageError(_) | VersionMismatch { .. } => {
                ErrorCategory::Storage
            }

            InsufficientEntropy(_) | SigningError(_) | ConfigError(_) | InternalError(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Returns true if this error is recoverable (can retry).
    ///
    /// Only transient network failures qualify; a rejected transaction does not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            KestrelError::RpcError(_)
                | KestrelError::ConnectionTimeout(_)
                | KestrelError::BroadcastFailed(_)
        )
    }

    /// Returns true if this is an input error.
    pub fn is_input_error(&self) -> bool {
        self.category() == ErrorCategory::Input
    }

    /// Returns true if this is a resource error.
    pub fn is_resource_error(&self) -> bool {
        self.category() == ErrorCategory::Resource
    }

    /// Returns true if this is a coordination error.
    pub fn is_coordination_error(&self) -> bool {
        self.category() == ErrorCategory::Coordination
    }

    /// Returns true if this is an integrity error.
    pub fn is_integrity_error(&self) -> bool {
        self.category() == ErrorCategory::Integrity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KestrelError::InsufficientFunds {
            needed: 41_000,
            available: 40_000,
        };
        assert!(err.to_string().contains("41000"));
        assert!(err.to_string().contains("40000"));

        let err = KestrelError::not_found("channel", "abcd");
        assert_eq!(err.to_string(), "channel not found: abcd");
    }

    #[test]
    fn test_error_classification() {
        assert!(KestrelError::RpcError("test".into()).is_recoverable());
        assert!(KestrelError::ConnectionTimeout("test".into()).is_recoverable());
        assert!(KestrelError::BroadcastFailed("test".into()).is_recoverable());
        assert!(!KestrelError::TransactionRejected("test".into()).is_recoverable());
        assert!(!KestrelError::ChecksumMismatch.is_recoverable());

        assert!(KestrelError::InvalidDerivationPath("x".into()).is_input_error());
        assert!(KestrelError::MalformedInvoice("x".into()).is_input_error());
        assert!(KestrelError::AmountOverflow.is_resource_error());
        assert!(KestrelError::PreimageMismatch.is_coordination_error());
        assert!(KestrelError::DuplicateSignature("a".into()).is_coordination_error());
        assert!(KestrelError::IntegrityViolation("x".into()).is_integrity_error());
        assert!(!KestrelError::IntegrityViolation("x".into()).is_recoverable());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_result: std::result::Result<serde_json::Value, _> = serde_json::from_str("invalid");
        let kestrel_result: Result<serde_json::Value> = json_result.map_err(KestrelError::from);
        assert!(matches!(kestrel_result, Err(KestrelError::JsonError(_))));
    }
}
