//! Hash functions used by addresses, transactions, BIP32 and invoices.

use hmac::{Hmac, Mac};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};

use kestrel_core::constants::{HASH160_SIZE, HASH_SIZE};
use kestrel_core::error::{KestrelError, Result};

type HmacSha512 = Hmac<Sha512>;

// ═══════════════════════════════════════════════════════════════════════════════
// SHA-256 FAMILY
// ═══════════════════════════════════════════════════════════════════════════════

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; HASH_SIZE] {
    Sha256::digest(data).into()
}

/// SHA-256 over the concatenation of `parts`.
pub fn sha256_concat(parts: &[&[u8]]) -> [u8; HASH_SIZE] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Double SHA-256, used for txids, sighashes and Base58Check.
pub fn sha256d(data: &[u8]) -> [u8; HASH_SIZE] {
    sha256(&sha256(data))
}

/// RIPEMD160(SHA256(data)), used for key and script hashes.
pub fn hash160(data: &[u8]) -> [u8; HASH160_SIZE] {
    Ripemd160::digest(sha256(data)).into()
}

// ═══════════════════════════════════════════════════════════════════════════════
// HMAC
// ═══════════════════════════════════════════════════════════════════════════════

/// HMAC-SHA512, the BIP32 key-derivation PRF.
pub fn hmac_sha512(key: &[u8], data: &[u8]) -> Result<[u8; 64]> {
    let mut mac = HmacSha512::new_from_slice(key)
        .map_err(|_| KestrelError::InternalError("HMAC initialization failed".into()))?;
    mac.update(data);
    let tag = mac.finalize().into_bytes();

    let mut out = [0u8; 64];
    out.copy_from_slice(&tag);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_empty() {
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_sha256d_hello() {
        assert_eq!(
            hex::encode(sha256d(b"hello")),
            "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }

    #[test]
    fn test_hash160_generator_point() {
        // HASH160 of the compressed generator point (private key 1).
        let g = hex::decode("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")
            .unwrap();
        assert_eq!(
            hex::encode(hash160(&g)),
            "751e76e8199196d454941c45d1b3a323f1433bd6"
        );
    }

    #[test]
    fn test_sha256_concat_matches_single() {
        assert_eq!(sha256_concat(&[b"ab", b"cd"]), sha256(b"abcd"));
    }

    #[test]
    fn test_hmac_sha512_rfc4231_case2() {
        let tag = hmac_sha512(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(&tag[..16]),
            "164b7a7bfcf819e2e395fbe73b56e0a3"
        );
    }
}
