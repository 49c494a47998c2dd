//! BIP32 hierarchical deterministic keys over secp256k1.
//!
//! ## Derivation
//!
//! ```text
//! master:   I = HMAC-SHA512("Bitcoin seed", seed)
//! hardened: I = HMAC-SHA512(c_par, 0x00 || k_par || ser32(i))
//! normal:   I = HMAC-SHA512(c_par, serP(K_par) || ser32(i))
//! child:    k_i = IL + k_par (mod n),  c_i = IR
//! ```
//!
//! IL ≥ n or a zero child key is reported as `KeyDerivationOverflow`; the
//! caller is expected to move on to the next index.

use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::PrimeField;
use k256::{FieldBytes, ProjectivePoint, Scalar, SecretKey};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use kestrel_core::constants::{CHAIN_CODE_SIZE, MAX_DERIVATION_DEPTH, SECRET_KEY_SIZE};
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{ChildNumber, DerivationPath, Network, PublicKey, Signature};

use crate::hash::{hash160, hmac_sha512};
use crate::seed::Seed;

const MASTER_HMAC_KEY: &[u8] = b"Bitcoin seed";

/// Length of a serialized extended key before the Base58Check wrapper.
const EXTENDED_KEY_LEN: usize = 78;

// ═══════════════════════════════════════════════════════════════════════════════
// SCALAR HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Parses 32 big-endian bytes as a scalar, rejecting values ≥ n.
fn parse_scalar(bytes: &[u8]) -> Option<Scalar> {
    Option::from(Scalar::from_repr(*FieldBytes::from_slice(bytes)))
}

fn public_from_secret(secret: &[u8; SECRET_KEY_SIZE]) -> Result<PublicKey> {
    let sk = SecretKey::from_slice(secret)
        .map_err(|_| KestrelError::InvalidKey("secret scalar out of range".into()))?;
    PublicKey::from_bytes(sk.public_key().to_encoded_point(true).as_bytes())
}

fn fingerprint_of(key: &PublicKey) -> [u8; 4] {
    let h = hash160(key.as_bytes());
    [h[0], h[1], h[2], h[3]]
}

fn split_hmac(i: &[u8; 64]) -> ([u8; 32], [u8; CHAIN_CODE_SIZE]) {
    let mut il = [0u8; 32];
    let mut ir = [0u8; CHAIN_CODE_SIZE];
    il.copy_from_slice(&i[..32]);
    ir.copy_from_slice(&i[32..]);
    (il, ir)
}

fn check_depth(depth: u8) -> Result<()> {
    if depth as usize >= MAX_DERIVATION_DEPTH {
        return Err(KestrelError::KeyDerivationOverflow(format!(
            "depth {} cannot be extended",
            depth
        )));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// EXTENDED PRIVATE KEY
// ═══════════════════════════════════════════════════════════════════════════════

/// BIP32 extended private key.
///
/// The secret scalar and chain code are wiped on drop. There is no
/// `Serialize` impl and `Debug` only shows the path and fingerprint.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ExtendedPrivateKey {
    secret: [u8; SECRET_KEY_SIZE],
    chain_code: [u8; CHAIN_CODE_SIZE],
    #[zeroize(skip)]
    public_key: PublicKey,
    #[zeroize(skip)]
    depth: u8,
    #[zeroize(skip)]
    child_number: ChildNumber,
    #[zeroize(skip)]
    parent_fingerprint: [u8; 4],
    #[zeroize(skip)]
    path: DerivationPath,
}

impl ExtendedPrivateKey {
    /// Derives the master key from a seed.
    pub fn from_seed(seed: &Seed) -> Result<Self> {
        let mut i = hmac_sha512(MASTER_HMAC_KEY, seed.as_bytes())?;
        let (mut il, chain_code) = split_hmac(&i);
        i.zeroize();

        let valid = parse_scalar(&il).map(|s| !bool::from(s.is_zero()));
        if valid != Some(true) {
            il.zeroize();
            return Err(KestrelError::KeyDerivationOverflow(
                "seed produces an invalid master key".into(),
            ));
        }

        let public_key = public_from_secret(&il)?;
        Ok(Self {
            secret: il,
            chain_code,
            public_key,
            depth: 0,
            child_number: ChildNumber::Normal(0),
            parent_fingerprint: [0u8; 4],
            path: DerivationPath::master(),
        })
    }

    /// Derives one child.
    pub fn derive_child(&self, child: ChildNumber) -> Result<Self> {
        check_depth(self.depth)?;
        let path = self.path.child(child)?;

        let mut data = Vec::with_capacity(37);
        if child.is_hardened() {
            data.push(0x00);
            data.extend_from_slice(&self.secret);
        } else {
            data.extend_from_slice(self.public_key.as_bytes());
        }
        data.extend_from_slice(&child.to_u32().to_be_bytes());

        let mut i = hmac_sha512(&self.chain_code, &data)?;
        data.zeroize();
        let (mut il, chain_code) = split_hmac(&i);
        i.zeroize();

        let tweak = parse_scalar(&il);
        il.zeroize();
        let tweak = tweak.ok_or_else(|| {
            KestrelError::KeyDerivationOverflow(format!("IL >= n at child {}", child))
        })?;
        let parent = parse_scalar(&self.secret)
            .ok_or_else(|| KestrelError::InternalError("parent scalar out of range".into()))?;

        let child_scalar = tweak + parent;
        if bool::from(child_scalar.is_zero()) {
            return Err(KestrelError::KeyDerivationOverflow(format!(
                "zero key at child {}",
                child
            )));
        }

        let mut secret = [0u8; SECRET_KEY_SIZE];
        secret.copy_from_slice(&child_scalar.to_repr());
        let public_key = public_from_secret(&secret)?;

        Ok(Self {
            secret,
            chain_code,
            public_key,
            depth: self.depth + 1,
            child_number: child,
            parent_fingerprint: self.fingerprint(),
            path,
        })
    }

    /// Derives every component of `relative` in turn, starting from `self`.
    pub fn derive_path(&self, relative: &DerivationPath) -> Result<Self> {
        let mut key = self.clone();
        for child in relative.children() {
            key = key.derive_child(*child)?;
        }
        Ok(key)
    }

    /// Compressed public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// First four bytes of HASH160 of the public key.
    pub fn fingerprint(&self) -> [u8; 4] {
        fingerprint_of(&self.public_key)
    }

    /// One-way export of the matching extended public key.
    pub fn to_extended_public(&self) -> ExtendedPublicKey {
        ExtendedPublicKey {
            public_key: self.public_key,
            chain_code: self.chain_code,
            depth: self.depth,
            child_number: self.child_number,
            parent_fingerprint: self.parent_fingerprint,
            path: self.path.clone(),
        }
    }

    /// Signs a 32-byte digest with this key.
    pub fn sign(&self, hash: &[u8; 32]) -> Result<Signature> {
        crate::sign::sign_secret(&self.secret, hash)
    }

    /// Depth in the tree (0 for master).
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Child number this key was derived at.
    pub fn child_number(&self) -> ChildNumber {
        self.child_number
    }

    /// Fingerprint of the parent key.
    pub fn parent_fingerprint(&self) -> [u8; 4] {
        self.parent_fingerprint
    }

    /// Full path from the master key.
    pub fn path(&self) -> &DerivationPath {
        &self.path
    }

    pub(crate) fn secret_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.secret
    }
}

impl PartialEq for ExtendedPrivateKey {
    fn eq(&self, other: &Self) -> bool {
        let secret_eq: bool = self.secret.ct_eq(&other.secret).into();
        let chain_eq: bool = self.chain_code.ct_eq(&other.chain_code).into();
        secret_eq && chain_eq && self.path == other.path
    }
}

impl Eq for ExtendedPrivateKey {}

impl std::fmt::Debug for ExtendedPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ExtendedPrivateKey {{ path: {}, fingerprint: {}, secret: [REDACTED] }}",
            self.path,
            hex::encode(self.fingerprint())
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EXTENDED PUBLIC KEY
// ═══════════════════════════════════════════════════════════════════════════════

/// BIP32 extended public key. Safe to share and persist.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedPublicKey {
    public_key: PublicKey,
    #[serde(with = "hex")]
    chain_code: [u8; CHAIN_CODE_SIZE],
    depth: u8,
    child_number: ChildNumber,
    #[serde(with = "hex")]
    parent_fingerprint: [u8; 4],
    path: DerivationPath,
}

impl ExtendedPublicKey {
    /// Derives a non-hardened child.
    ///
    /// # Errors
    /// `KeyDerivationOverflow` for a hardened child, excessive depth, or the
    /// BIP32 invalid-child case.
    pub fn derive_child(&self, child: ChildNumber) -> Result<Self> {
        if child.is_hardened() {
            return Err(KestrelError::KeyDerivationOverflow(format!(
                "cannot derive hardened child {} from a public key",
                child
            )));
        }
        check_depth(self.depth)?;
        let path = self.path.child(child)?;

        let mut data = Vec::with_capacity(37);
        data.extend_from_slice(self.public_key.as_bytes());
        data.extend_from_slice(&child.to_u32().to_be_bytes());

        let i = hmac_sha512(&self.chain_code, &data)?;
        let (il, chain_code) = split_hmac(&i);
        let tweak = parse_scalar(&il).ok_or_else(|| {
            KestrelError::KeyDerivationOverflow(format!("IL >= n at child {}", child))
        })?;

        let parent = k256::PublicKey::from_sec1_bytes(self.public_key.as_bytes())
            .map_err(|_| KestrelError::InvalidKey("public key is not on the curve".into()))?;
        let point = ProjectivePoint::GENERATOR * tweak + parent.to_projective();
        let child_key = k256::PublicKey::from_affine(point.to_affine()).map_err(|_| {
            KestrelError::KeyDerivationOverflow(format!("point at infinity at child {}", child))
        })?;
        let public_key = PublicKey::from_bytes(child_key.to_encoded_point(true).as_bytes())?;

        Ok(Self {
            public_key,
            chain_code,
            depth: self.depth + 1,
            child_number: child,
            parent_fingerprint: self.fingerprint(),
            path,
        })
    }

    /// Derives every component of `relative` in turn.
    pub fn derive_path(&self, relative: &DerivationPath) -> Result<Self> {
        let mut key = self.clone();
        for child in relative.children() {
            key = key.derive_child(*child)?;
        }
        Ok(key)
    }

    /// Compressed public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Chain code.
    pub fn chain_code(&self) -> &[u8; CHAIN_CODE_SIZE] {
        &self.chain_code
    }

    /// First four bytes of HASH160 of the public key.
    pub fn fingerprint(&self) -> [u8; 4] {
        fingerprint_of(&self.public_key)
    }

    /// Depth in the tree.
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Child number this key was derived at.
    pub fn child_number(&self) -> ChildNumber {
        self.child_number
    }

    /// Fingerprint of the parent key.
    pub fn parent_fingerprint(&self) -> [u8; 4] {
        self.parent_fingerprint
    }

    /// Full path from the master key.
    pub fn path(&self) -> &DerivationPath {
        &self.path
    }

    /// Base58Check `xpub`/`tpub` serialization.
    pub fn to_base58(&self, network: Network) -> String {
        let mut data = Vec::with_capacity(EXTENDED_KEY_LEN);
        data.extend_from_slice(&network.xpub_version());
        data.push(self.depth);
        data.extend_from_slice(&self.parent_fingerprint);
        data.extend_from_slice(&self.child_number.to_u32().to_be_bytes());
        data.extend_from_slice(&self.chain_code);
        data.extend_from_slice(self.public_key.as_bytes());
        bs58::encode(data).with_check().into_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // BIP32 test vector 1.
    const TV1_SEED: &str = "000102030405060708090a0b0c0d0e0f";

    fn tv1_master() -> ExtendedPrivateKey {
        ExtendedPrivateKey::from_seed(&Seed::from_hex(TV1_SEED).unwrap()).unwrap()
    }

    #[test]
    fn test_vector_1_master() {
        let master = tv1_master();
        assert_eq!(
            hex::encode(master.secret_bytes()),
            "e8f32e723decf4051aefac8e2c93c9c5b214313817cdb01a1494b917c8436b35"
        );
        assert_eq!(
            master.public_key().to_hex(),
            "0339a36013301597daef41fbe593a02cc513d0b55527ec2df1050e2e8ff49c85c2"
        );
        assert_eq!(hex::encode(master.fingerprint()), "3442193e");
        assert_eq!(
            master.to_extended_public().to_base58(Network::Mainnet),
            "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8"
        );
    }

    #[test]
    fn test_vector_1_hardened_child() {
        let child = tv1_master().derive_child(ChildNumber::Hardened(0)).unwrap();
        assert_eq!(
            hex::encode(child.secret_bytes()),
            "edb2e14f9ee77d26dd93b4ecede8d16ed408ce149b6cd80b0715a2d911a0afea"
        );
        assert_eq!(hex::encode(child.parent_fingerprint()), "3442193e");
        assert_eq!(child.path().to_string(), "m/0'");
        assert_eq!(
            child.to_extended_public().to_base58(Network::Mainnet),
            "xpub68Gmy5EdvgibQVfPdqkBBCHxA5htiqg55crXYuXoQRKfDBFA1WEjWgP6LHhwBZeNK1VTsfTFUHCdrfp1bgwQ9xv5ski8PX9rL2dZXvgGDnw"
        );
    }

    #[test]
    fn test_public_derivation_matches_private() {
        let account = tv1_master()
            .derive_path(&"m/84'/1'/0'".parse().unwrap())
            .unwrap();
        let relative: DerivationPath = "m/0/7".parse().unwrap();

        let from_private = account.derive_path(&relative).unwrap().to_extended_public();
        let from_public = account.to_extended_public().derive_path(&relative).unwrap();
        assert_eq!(from_private, from_public);
        assert_eq!(from_public.path().to_string(), "m/84'/1'/0'/0/7");
    }

    #[test]
    fn test_hardened_from_public_rejected() {
        let xpub = tv1_master().to_extended_public();
        assert!(matches!(
            xpub.derive_child(ChildNumber::Hardened(0)),
            Err(KestrelError::KeyDerivationOverflow(_))
        ));
    }

    #[test]
    fn test_sign_with_derived_key_verifies() {
        let child = tv1_master().derive_child(ChildNumber::Hardened(0)).unwrap();
        let digest = crate::hash::sha256(b"kestrel");
        let sig = child.sign(&digest).unwrap();
        assert!(crate::sign::verify(child.public_key(), &digest, &sig));
        assert_eq!(sig, crate::sign::sign(&child, &digest).unwrap());
    }

    #[test]
    fn test_debug_hides_secret() {
        let master = tv1_master();
        let shown = format!("{:?}", master);
        assert!(shown.contains("REDACTED"));
        assert!(!shown.contains("e8f32e72"));
    }

    #[test]
    fn test_xpub_serde_roundtrip() {
        let xpub = tv1_master()
            .derive_child(ChildNumber::Hardened(0))
            .unwrap()
            .to_extended_public();
        let json = serde_json::to_string(&xpub).unwrap();
        let back: ExtendedPublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, xpub);
    }

    proptest! {
        #[test]
        fn prop_derivation_is_deterministic(
            seed in proptest::collection::vec(any::<u8>(), 16..64),
            raw in proptest::collection::vec(any::<u32>(), 0..4),
        ) {
            let seed = Seed::from_bytes(&seed).unwrap();
            let path = DerivationPath::from_children(
                raw.into_iter().map(ChildNumber::from_u32).collect(),
            ).unwrap();

            let a = ExtendedPrivateKey::from_seed(&seed).unwrap().derive_path(&path).unwrap();
            let b = ExtendedPrivateKey::from_seed(&seed).unwrap().derive_path(&path).unwrap();
            prop_assert_eq!(a.public_key(), b.public_key());
            prop_assert!(a == b);
        }
    }
}
