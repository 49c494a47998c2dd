//! secp256k1 ECDSA over 32-byte digests.
//!
//! Nonces follow RFC6979, so the same key and digest always give the same
//! signature. Signatures are normalized to low-S; verification rejects high-S.

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};

use kestrel_core::constants::{HASH_SIZE, SECRET_KEY_SIZE};
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{PublicKey, Signature};

use crate::bip32::ExtendedPrivateKey;

/// Signs `hash` with `key`.
pub fn sign(key: &ExtendedPrivateKey, hash: &[u8; HASH_SIZE]) -> Result<Signature> {
    sign_secret(key.secret_bytes(), hash)
}

pub(crate) fn sign_secret(
    secret: &[u8; SECRET_KEY_SIZE],
    hash: &[u8; HASH_SIZE],
) -> Result<Signature> {
    let signing_key = SigningKey::from_slice(secret)
        .map_err(|e| KestrelError::SigningError(format!("bad signing key: {}", e)))?;
    let sig: EcdsaSignature = signing_key
        .sign_prehash(hash)
        .map_err(|e| KestrelError::SigningError(e.to_string()))?;
    let sig = sig.normalize_s().unwrap_or(sig);

    Signature::from_bytes(&sig.to_bytes())
}

/// Verifies a compact signature over `hash`.
///
/// Returns false for malformed keys or signatures as well as for
/// mismatches; only low-S signatures are accepted.
pub fn verify(public_key: &PublicKey, hash: &[u8; HASH_SIZE], signature: &Signature) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(public_key.as_bytes()) else {
        return false;
    };
    let Ok(sig) = EcdsaSignature::from_slice(signature.as_bytes()) else {
        return false;
    };
    if sig.normalize_s().is_some() {
        return false;
    }
    verifying_key.verify_prehash(hash, &sig).is_ok()
}

/// DER encoding used inside transaction witnesses.
pub fn to_der(signature: &Signature) -> Result<Vec<u8>> {
    let sig = EcdsaSignature::from_slice(signature.as_bytes())
        .map_err(|e| KestrelError::SigningError(format!("bad compact signature: {}", e)))?;
    Ok(sig.to_der().as_bytes().to_vec())
}

/// Parses a DER signature back into compact form.
pub fn from_der(der: &[u8]) -> Result<Signature> {
    let sig = EcdsaSignature::from_der(der)
        .map_err(|e| KestrelError::InvalidScript(format!("bad DER signature: {}", e)))?;
    Signature::from_bytes(&sig.to_bytes())
}
