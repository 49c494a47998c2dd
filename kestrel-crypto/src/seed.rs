//! Wallet seeds.

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use kestrel_core::constants::{MAX_SEED_SIZE, MIN_SEED_SIZE};
use kestrel_core::error::{KestrelError, Result};

/// Raw seed entropy (16 to 64 bytes).
///
/// Zeroized when dropped. Deliberately not `Serialize`; the only way out of
/// the process is [`Seed::as_bytes`], which callers use for backups.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Seed {
    bytes: Vec<u8>,
}

impl Seed {
    /// Draws `entropy_bits` of entropy from the operating system RNG.
    ///
    /// # Errors
    /// - `InvalidEntropyLength` unless the size is a multiple of 32 in 128..=512
    /// - `InsufficientEntropy` if the OS RNG fails
    pub fn generate(entropy_bits: usize) -> Result<Self> {
        if entropy_bits % 32 != 0
            || entropy_bits < MIN_SEED_SIZE * 8
            || entropy_bits > MAX_SEED_SIZE * 8
        {
            return Err(KestrelError::InvalidEntropyLength(entropy_bits));
        }

        let mut bytes = vec![0u8; entropy_bits / 8];
        if let Err(e) = OsRng.try_fill_bytes(&mut bytes) {
            bytes.zeroize();
            return Err(KestrelError::InsufficientEntropy(e.to_string()));
        }
        Ok(Self { bytes })
    }

    /// Wraps existing seed bytes (import / restore).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_SEED_SIZE || bytes.len() > MAX_SEED_SIZE {
            return Err(KestrelError::InvalidEntropyLength(bytes.len() * 8));
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// Parses a hex-encoded seed.
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut raw = hex::decode(s.trim())?;
        let seed = Self::from_bytes(&raw);
        raw.zeroize();
        seed
    }

    /// Seed bytes. Handle with care.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Entropy size in bits.
    pub fn bits(&self) -> usize {
        self.bytes.len() * 8
    }
}

impl std::fmt::Debug for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Seed([REDACTED; {} bits])", self.bits())
    }
}
