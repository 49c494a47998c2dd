//! Protocol constants for Kestrel.
//!
//! Sizes follow secp256k1 / Bitcoin serialization rules. Dust thresholds are
//! the relay-policy values for the default 3 sat/vB dust relay fee.

// ═══════════════════════════════════════════════════════════════════════════════
// KEY AND SIGNATURE SIZES
// ═══════════════════════════════════════════════════════════════════════════════

/// Size of a compressed secp256k1 public key.
pub const COMPRESSED_PUBLIC_KEY_SIZE: usize = 33;

/// Size of a secp256k1 secret scalar.
pub const SECRET_KEY_SIZE: usize = 32;

/// Size of a compact (r || s) ECDSA signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of SHA-256 digests, txids, channel ids and payment hashes.
pub const HASH_SIZE: usize = 32;

/// Size of a HASH160 (RIPEMD160 of SHA256) digest.
pub const HASH160_SIZE: usize = 20;

/// Size of a BIP32 chain code.
pub const CHAIN_CODE_SIZE: usize = 32;

// ═══════════════════════════════════════════════════════════════════════════════
// SEEDS AND DERIVATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Minimum seed length in bytes (128 bits).
pub const MIN_SEED_SIZE: usize = 16;

/// Maximum seed length in bytes (512 bits).
pub const MAX_SEED_SIZE: usize = 64;

/// Offset that marks a BIP32 child index as hardened.
pub const HARDENED_OFFSET: u32 = 0x8000_0000;

/// Maximum BIP32 depth (serialized as one byte).
pub const MAX_DERIVATION_DEPTH: usize = 255;

/// BIP44 purpose for legacy P2PKH accounts.
pub const PURPOSE_BIP44: u32 = 44;

/// BIP49 purpose for nested segwit accounts.
pub const PURPOSE_BIP49: u32 = 49;

/// BIP84 purpose for native segwit accounts.
pub const PURPOSE_BIP84: u32 = 84;

/// BIP48 purpose for multisig accounts.
pub const PURPOSE_BIP48: u32 = 48;

/// Purpose used for channel funding and node identity keys.
pub const PURPOSE_NODE: u32 = 1017;

// ═══════════════════════════════════════════════════════════════════════════════
// DUST AND FEES
// ═══════════════════════════════════════════════════════════════════════════════

/// Dust threshold for P2PKH outputs.
pub const DUST_P2PKH: u64 = 546;

/// Dust threshold for P2SH outputs.
pub const DUST_P2SH: u64 = 540;

/// Dust threshold for P2WPKH outputs.
pub const DUST_P2WPKH: u64 = 294;

/// Dust threshold for P2WSH outputs.
pub const DUST_P2WSH: u64 = 330;

/// Fixed per-transaction overhead in vbytes (version, counts, locktime, segwit marker).
pub const TX_OVERHEAD_VBYTES: u64 = 11;

// ═══════════════════════════════════════════════════════════════════════════════
// MULTISIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Maximum co-signers in a standard CHECKMULTISIG redeem script.
pub const MAX_MULTISIG_KEYS: usize = 15;

// ═══════════════════════════════════════════════════════════════════════════════
// CHANNELS AND INVOICES
// ═══════════════════════════════════════════════════════════════════════════════

/// Default confirmation depth before a funded channel becomes usable.
pub const DEFAULT_MIN_FUNDING_DEPTH: u32 = 3;

/// Default dispute window (blocks) after a unilateral close.
pub const DEFAULT_TO_SELF_DELAY: u32 = 144;

/// Default fee (sats) paid by the funder of a cooperative close.
pub const DEFAULT_CLOSING_FEE: u64 = 1_000;

/// Default invoice validity in seconds.
pub const DEFAULT_INVOICE_EXPIRY_SECS: u32 = 3_600;

/// Default CLTV delta required for the final hop.
pub const DEFAULT_MIN_FINAL_CLTV: u32 = 18;

/// Maximum number of hops a local route may have.
pub const MAX_ROUTE_HOPS: usize = 20;

/// Maximum invoice description length in bytes.
pub const MAX_INVOICE_DESCRIPTION: usize = 160;

/// Maximum route hints carried by one invoice.
pub const MAX_ROUTE_HINTS: usize = 4;

/// Invoice wire-format version byte.
pub const INVOICE_VERSION: u8 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dust_ordering() {
        // Witness outputs are cheaper to spend, so their dust floor is lower.
        assert!(DUST_P2WPKH < DUST_P2WSH);
        assert!(DUST_P2WSH < DUST_P2SH);
        assert!(DUST_P2SH < DUST_P2PKH);
    }

    #[test]
    fn test_seed_bounds() {
        assert_eq!(MIN_SEED_SIZE * 8, 128);
        assert_eq!(MAX_SEED_SIZE * 8, 512);
    }
}
