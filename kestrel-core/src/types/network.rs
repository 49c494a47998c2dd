//! Networks and script types.
//!
//! Both are closed sets fixed by consensus rules, so they are plain enums and
//! every per-variant constant is a `match`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DUST_P2PKH, DUST_P2SH, DUST_P2WPKH, DUST_P2WSH, PURPOSE_BIP44, PURPOSE_BIP48, PURPOSE_BIP84,
};
use crate::error::{KestrelError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// NETWORK
// ═══════════════════════════════════════════════════════════════════════════════

/// Target network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Production network.
    Mainnet,
    /// Public test network.
    #[default]
    Testnet,
    /// Local regression-test network.
    Regtest,
}

impl Network {
    /// All supported networks.
    pub const ALL: [Network; 3] = [Network::Mainnet, Network::Testnet, Network::Regtest];

    /// Base58Check version byte for P2PKH addresses.
    pub fn p2pkh_version(self) -> u8 {
        match self {
            Network::Mainnet => 0x00,
            Network::Testnet | Network::Regtest => 0x6f,
        }
    }

    /// Base58Check version byte for P2SH addresses.
    pub fn p2sh_version(self) -> u8 {
        match self {
            Network::Mainnet => 0x05,
            Network::Testnet | Network::Regtest => 0xc4,
        }
    }

    /// Bech32 human-readable part for segwit addresses.
    pub fn bech32_hrp(self) -> &'static str {
        match self {
            Network::Mainnet => "bc",
            Network::Testnet => "tb",
            Network::Regtest => "bcrt",
        }
    }

    /// Invoice prefix (the HRP before the amount).
    pub fn invoice_prefix(self) -> &'static str {
        match self {
            Network::Mainnet => "lnbc",
            Network::Testnet => "lntb",
            Network::Regtest => "lnbcrt",
        }
    }

    /// BIP44 coin type.
    pub fn coin_type(self) -> u32 {
        match self {
            Network::Mainnet => 0,
            Network::Testnet | Network::Regtest => 1,
        }
    }

    /// BIP32 extended public key version bytes (xpub / tpub).
    pub fn xpub_version(self) -> [u8; 4] {
        match self {
            Network::Mainnet => [0x04, 0x88, 0xb2, 0x1e],
            Network::Testnet | Network::Regtest => [0x04, 0x35, 0x87, 0xcf],
        }
    }

    /// Lowercase network name.
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = KestrelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "bitcoin" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(KestrelError::ConfigError(format!("unknown network '{}'", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCRIPT TYPE
// ═══════════════════════════════════════════════════════════════════════════════

/// Output script template.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    /// Pay to public-key hash (legacy).
    P2pkh,
    /// Pay to script hash (legacy).
    P2sh,
    /// Pay to witness public-key hash (segwit v0).
    P2wpkh,
    /// Pay to witness script hash (segwit v0).
    P2wsh,
    /// Bare multisig redeem script, addressed through its P2SH form.
    MultisigRedeem,
}

impl ScriptType {
    /// The script type that actually appears on chain.
    pub fn on_chain(self) -> ScriptType {
        match self {
            ScriptType::MultisigRedeem => ScriptType::P2sh,
            other => other,
        }
    }

    /// True for witness-program outputs.
    pub fn is_segwit(self) -> bool {
        matches!(self, ScriptType::P2wpkh | ScriptType::P2wsh)
    }

    /// True when the address commits to a script rather than a key.
    pub fn is_script_hash(self) -> bool {
        matches!(
            self,
            ScriptType::P2sh | ScriptType::P2wsh | ScriptType::MultisigRedeem
        )
    }

    /// Minimum economical output value for this script type.
    pub fn dust_threshold(self) -> u64 {
        match self.on_chain() {
            ScriptType::P2pkh => DUST_P2PKH,
            ScriptType::P2sh => DUST_P2SH,
            ScriptType::P2wpkh => DUST_P2WPKH,
            ScriptType::P2wsh | ScriptType::MultisigRedeem => DUST_P2WSH,
        }
    }

    /// Serialized output size in vbytes.
    pub fn output_vbytes(self) -> u64 {
        match self.on_chain() {
            ScriptType::P2pkh => 34,
            ScriptType::P2sh => 32,
            ScriptType::P2wpkh => 31,
            ScriptType::P2wsh | ScriptType::MultisigRedeem => 43,
        }
    }

    /// Estimated single-key input size in vbytes.
    ///
    /// Multisig inputs are sized by `multisig_input_vbytes`.
    pub fn input_vbytes(self) -> u64 {
        match self.on_chain() {
            ScriptType::P2pkh => 148,
            ScriptType::P2wpkh => 68,
            ScriptType::P2sh | ScriptType::P2wsh | ScriptType::MultisigRedeem => 297,
        }
    }

    /// Estimated size of an M-of-N multisig input in vbytes.
    pub fn multisig_input_vbytes(self, m: usize, n: usize) -> u64 {
        let script = 3 + 34 * n as u64;
        let sigs = 1 + 73 * m as u64;
        match self.on_chain() {
            // witness bytes count a quarter
            ScriptType::P2wsh => 41 + (sigs + script + 3) / 4,
            _ => 41 + sigs + script + 3,
        }
    }

    /// BIP purpose used for single-key accounts of this type.
    pub fn account_purpose(self) -> u32 {
        match self.on_chain() {
            ScriptType::P2pkh => PURPOSE_BIP44,
            ScriptType::P2wpkh => PURPOSE_BIP84,
            ScriptType::P2sh | ScriptType::P2wsh | ScriptType::MultisigRedeem => PURPOSE_BIP48,
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScriptType::P2pkh => "p2pkh",
            ScriptType::P2sh => "p2sh",
            ScriptType::P2wpkh => "p2wpkh",
            ScriptType::P2wsh => "p2wsh",
            ScriptType::MultisigRedeem => "multisig",
        };
        f.write_str(s)
    }
}

impl FromStr for ScriptType {
    type Err = KestrelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "p2pkh" | "legacy" => Ok(ScriptType::P2pkh),
            "p2sh" => Ok(ScriptType::P2sh),
            "p2wpkh" | "segwit" => Ok(ScriptType::P2wpkh),
            "p2wsh" => Ok(ScriptType::P2wsh),
            "multisig" | "multisig_redeem" => Ok(ScriptType::MultisigRedeem),
            other => Err(KestrelError::ValidationError(format!(
                "unknown script type '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Network::Mainnet, 0x00, 0x05, "bc")]
    #[test_case(Network::Testnet, 0x6f, 0xc4, "tb")]
    #[test_case(Network::Regtest, 0x6f, 0xc4, "bcrt")]
    fn test_network_prefixes(network: Network, p2pkh: u8, p2sh: u8, hrp: &str) {
        assert_eq!(network.p2pkh_version(), p2pkh);
        assert_eq!(network.p2sh_version(), p2sh);
        assert_eq!(network.bech32_hrp(), hrp);
    }

    #[test]
    fn test_network_parse_roundtrip() {
        for network in Network::ALL {
            assert_eq!(network.to_string().parse::<Network>().unwrap(), network);
        }
        assert!("dogecoin".parse::<Network>().is_err());
    }

    #[test]
    fn test_multisig_redeem_is_p2sh_on_chain() {
        assert_eq!(ScriptType::MultisigRedeem.on_chain(), ScriptType::P2sh);
        assert_eq!(
            ScriptType::MultisigRedeem.dust_threshold(),
            ScriptType::P2sh.dust_threshold()
        );
    }

    #[test]
    fn test_witness_multisig_is_cheaper() {
        assert!(
            ScriptType::P2wsh.multisig_input_vbytes(2, 3)
                < ScriptType::P2sh.multisig_input_vbytes(2, 3)
        );
    }
}
