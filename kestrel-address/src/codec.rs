//! Address encoding and decoding.

use std::fmt;
use std::str::FromStr;

use bech32::primitives::decode::{CheckedHrpstring, CheckedHrpstringError};
use bech32::{Bech32, Bech32m, Fe32, Hrp};
use serde::{Deserialize, Serialize};

use kestrel_core::constants::{HASH160_SIZE, HASH_SIZE};
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{Network, PublicKey, ScriptType};
use kestrel_crypto::{hash160, sha256};

use crate::script;

/// Base58Check payload: version byte plus a 20-byte hash.
const BASE58_PAYLOAD_LEN: usize = 1 + HASH160_SIZE;

/// What an address commits to.
#[derive(Debug, Clone, Copy)]
pub enum AddressSource<'a> {
    /// A compressed public key (P2PKH, P2WPKH).
    PublicKey(&'a PublicKey),
    /// A redeem or witness script (P2SH, P2WSH, MultisigRedeem).
    Script(&'a [u8]),
}

// ═══════════════════════════════════════════════════════════════════════════════
// ADDRESS
// ═══════════════════════════════════════════════════════════════════════════════

/// An encoded address. Immutable once built.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Address {
    network: Network,
    script_type: ScriptType,
    encoded: String,
    payload: Vec<u8>,
}

impl Address {
    /// Builds an address from its hash payload.
    ///
    /// `payload` is the 20-byte HASH160 for P2PKH/P2SH/P2WPKH/MultisigRedeem
    /// and the 32-byte SHA-256 for P2WSH.
    pub fn from_payload(network: Network, script_type: ScriptType, payload: &[u8]) -> Result<Self> {
        let expected = match script_type.on_chain() {
            ScriptType::P2wsh => HASH_SIZE,
            _ => HASH160_SIZE,
        };
        if payload.len() != expected {
            return Err(KestrelError::InvalidAddressFormat(format!(
                "{} payload must be {} bytes, got {}",
                script_type,
                expected,
                payload.len()
            )));
        }

        let encoded = match script_type {
            ScriptType::P2pkh => base58_encode(network.p2pkh_version(), payload),
            ScriptType::P2sh | ScriptType::MultisigRedeem => {
                base58_encode(network.p2sh_version(), payload)
            }
            ScriptType::P2wpkh | ScriptType::P2wsh => segwit_encode(network, payload)?,
        };

        Ok(Self {
            network,
            script_type,
            encoded,
            payload: payload.to_vec(),
        })
    }

    /// Recovers the address paying to a standard locking script.
    pub fn from_script_pubkey(script_pubkey: &[u8], network: Network) -> Result<Self> {
        let (script_type, payload) = script::classify_script_pubkey(script_pubkey).ok_or_else(|| {
            KestrelError::InvalidScript("not a standard locking script".into())
        })?;
        Self::from_payload(network, script_type, &payload)
    }

    /// Network the address belongs to.
    pub fn network(&self) -> Network {
        self.network
    }

    /// Script type the address was built for.
    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }

    /// Encoded string form.
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// Hash payload (key hash or script hash).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Locking script paying to this address.
    pub fn script_pubkey(&self) -> Vec<u8> {
        locking_script(self.script_type, &self.payload)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({}, {})", self.encoded, self.script_type)
    }
}

impl FromStr for Address {
    type Err = KestrelError;

    fn from_str(s: &str) -> Result<Self> {
        let decoded = AddressCodec::decode(s)?;
        Ok(Self {
            network: decoded.network,
            script_type: decoded.script_type,
            encoded: s.to_string(),
            payload: decoded.payload,
        })
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.encoded)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Result of [`AddressCodec::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAddress {
    /// Network inferred from the version byte or HRP.
    pub network: Network,
    /// On-chain script type.
    pub script_type: ScriptType,
    /// Key hash or script hash.
    pub payload: Vec<u8>,
}

impl DecodedAddress {
    /// Locking script paying to the decoded address.
    pub fn script_pubkey(&self) -> Vec<u8> {
        locking_script(self.script_type, &self.payload)
    }
}

fn locking_script(script_type: ScriptType, payload: &[u8]) -> Vec<u8> {
    let mut h20 = [0u8; HASH160_SIZE];
    let mut h32 = [0u8; HASH_SIZE];
    match script_type {
        ScriptType::P2pkh => {
            h20.copy_from_slice(payload);
            script::p2pkh(&h20)
        }
        ScriptType::P2sh | ScriptType::MultisigRedeem => {
            h20.copy_from_slice(payload);
            script::p2sh(&h20)
        }
        ScriptType::P2wpkh => {
            h20.copy_from_slice(payload);
            script::p2wpkh(&h20)
        }
        ScriptType::P2wsh => {
            h32.copy_from_slice(payload);
            script::p2wsh(&h32)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CODEC
// ═══════════════════════════════════════════════════════════════════════════════

/// Stateless address encoder/decoder.
pub struct AddressCodec;

impl AddressCodec {
    /// Encodes `source` as an address of `script_type` on `network`.
    ///
    /// # Errors
    /// - `ValidationError` if the source kind does not fit the script type
    /// - `InvalidScript` if a `MultisigRedeem` source is not a multisig script
    pub fn encode(source: AddressSource<'_>, network: Network, script_type: ScriptType) -> Result<Address> {
        let payload: Vec<u8> = match (script_type, source) {
            (ScriptType::P2pkh | ScriptType::P2wpkh, AddressSource::PublicKey(pk)) => {
                hash160(pk.as_bytes()).to_vec()
            }
            (ScriptType::P2sh, AddressSource::Script(s)) => hash160(s).to_vec(),
            (ScriptType::MultisigRedeem, AddressSource::Script(s)) => {
                script::parse_multisig(s)?;
                hash160(s).to_vec()
            }
            (ScriptType::P2wsh, AddressSource::Script(s)) => sha256(s).to_vec(),
            (st, src) => {
                return Err(KestrelError::ValidationError(format!(
                    "{} address cannot be built from {}",
                    st,
                    match src {
                        AddressSource::PublicKey(_) => "a public key",
                        AddressSource::Script(_) => "a script",
                    }
                )))
            }
        };
        Address::from_payload(network, script_type, &payload)
    }

    /// Decodes an address string.
    ///
    /// # Errors
    /// - `InvalidAddressFormat` for unknown prefixes, bad characters, lengths
    ///   or versions (witness v1+ included)
    /// - `ChecksumMismatch` when the Base58Check or Bech32 checksum fails
    pub fn decode(s: &str) -> Result<DecodedAddress> {
        let s = s.trim();
        if s.is_empty() {
            return Err(KestrelError::InvalidAddressFormat("empty address".into()));
        }
        match segwit_network(s) {
            Some(network) => segwit_decode(s, network),
            None => base58_decode(s),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BASE58CHECK
// ═══════════════════════════════════════════════════════════════════════════════

fn base58_encode(version: u8, hash: &[u8]) -> String {
    let mut data = Vec::with_capacity(BASE58_PAYLOAD_LEN);
    data.push(version);
    data.extend_from_slice(hash);
    bs58::encode(data).with_check().into_string()
}

fn base58_decode(s: &str) -> Result<DecodedAddress> {
    let data = bs58::decode(s).with_check(None).into_vec().map_err(|e| match e {
        bs58::decode::Error::InvalidChecksum { .. } => KestrelError::ChecksumMismatch,
        other => KestrelError::InvalidAddressFormat(format!("base58: {}", other)),
    })?;
    if data.len() != BASE58_PAYLOAD_LEN {
        return Err(KestrelError::InvalidAddressFormat(format!(
            "base58 payload is {} bytes, expected {}",
            data.len(),
            BASE58_PAYLOAD_LEN
        )));
    }

    // Regtest shares testnet's version bytes, so these decode as testnet.
    let (network, script_type) = match data[0] {
        0x00 => (Network::Mainnet, ScriptType::P2pkh),
        0x05 => (Network::Mainnet, ScriptType::P2sh),
        0x6f => (Network::Testnet, ScriptType::P2pkh),
        0xc4 => (Network::Testnet, ScriptType::P2sh),
        v => {
            return Err(KestrelError::InvalidAddressFormat(format!(
                "unknown version byte 0x{:02x}",
                v
            )))
        }
    };

    Ok(DecodedAddress {
        network,
        script_type,
        payload: data[1..].to_vec(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// BECH32 (WITNESS V0)
// ═══════════════════════════════════════════════════════════════════════════════

fn segwit_encode(network: Network, program: &[u8]) -> Result<String> {
    let hrp = Hrp::parse(network.bech32_hrp())
        .map_err(|e| KestrelError::InternalError(format!("bad hrp: {}", e)))?;
    bech32::segwit::encode_v0(hrp, program)
        .map_err(|e| KestrelError::InvalidAddressFormat(format!("bech32 encode: {}", e)))
}

/// Network for strings shaped like `<hrp>1...` with a known segwit HRP.
fn segwit_network(s: &str) -> Option<Network> {
    let lower = s.to_ascii_lowercase();
    let (hrp, _) = lower.rsplit_once('1')?;
    Network::ALL.into_iter().find(|n| n.bech32_hrp() == hrp)
}

fn segwit_decode(s: &str, network: Network) -> Result<DecodedAddress> {
    match CheckedHrpstring::new::<Bech32>(s) {
        Ok(_) => {}
        Err(CheckedHrpstringError::Checksum(_)) => {
            if CheckedHrpstring::new::<Bech32m>(s).is_ok() {
                return Err(KestrelError::InvalidAddressFormat(
                    "witness v1+ (bech32m) addresses are not supported".into(),
                ));
            }
            return Err(KestrelError::ChecksumMismatch);
        }
        Err(e) => {
            return Err(KestrelError::InvalidAddressFormat(format!("bech32: {}", e)));
        }
    }

    let (_, version, program) = bech32::segwit::decode(s)
        .map_err(|e| KestrelError::InvalidAddressFormat(format!("segwit: {}", e)))?;
    if version != Fe32::Q {
        return Err(KestrelError::InvalidAddressFormat(format!(
            "unsupported witness version {}",
            version.to_u8()
        )));
    }

    let script_type = match program.len() {
        HASH160_SIZE => ScriptType::P2wpkh,
        HASH_SIZE => ScriptType::P2wsh,
        n => {
            return Err(KestrelError::InvalidAddressFormat(format!(
                "witness v0 program of {} bytes",
                n
            )))
        }
    };

    Ok(DecodedAddress {
        network,
        script_type,
        payload: program,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    /// Compressed generator point (private key 1).
    fn g() -> PublicKey {
        PublicKey::from_hex("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")
            .unwrap()
    }

    #[test]
    fn test_p2pkh_mainnet_vector() {
        let addr = AddressCodec::encode(AddressSource::PublicKey(&g()), Network::Mainnet, ScriptType::P2pkh)
            .unwrap();
        assert_eq!(addr.as_str(), "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH");
    }

    #[test_case(Network::Mainnet, "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4" ; "mainnet")]
    #[test_case(Network::Testnet, "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx" ; "testnet")]
    fn test_p2wpkh_vectors(network: Network, expected: &str) {
        let addr = AddressCodec::encode(AddressSource::PublicKey(&g()), network, ScriptType::P2wpkh).unwrap();
        assert_eq!(addr.as_str(), expected);
        let decoded = AddressCodec::decode(expected).unwrap();
        assert_eq!(decoded.network, network);
        assert_eq!(decoded.script_type, ScriptType::P2wpkh);
        assert_eq!(decoded.payload, addr.payload());
    }

    #[test]
    fn test_p2wsh_vector_decodes() {
        let decoded =
            AddressCodec::decode("tb1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3q0sl5k7")
                .unwrap();
        assert_eq!(decoded.script_type, ScriptType::P2wsh);
        assert_eq!(
            hex::encode(&decoded.payload),
            "1863143c14c5166804bd19203356da136c985678cd4d27a1b8c6329604903262"
        );
    }

    #[test]
    fn test_uppercase_bech32_accepted() {
        let decoded = AddressCodec::decode("BC1QW508D6QEJXTDG4Y5R3ZARVARY0C5XW7KV8F3T4").unwrap();
        assert_eq!(decoded.network, Network::Mainnet);
    }

    #[test_case("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t5" ; "bech32")]
    #[test_case("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMJ" ; "base58")]
    fn test_checksum_mismatch(input: &str) {
        assert!(matches!(AddressCodec::decode(input), Err(KestrelError::ChecksumMismatch)));
    }

    #[test_case("" ; "empty")]
    #[test_case("0OIl" ; "base58 alphabet")]
    #[test_case("zz1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4" ; "unknown hrp")]
    #[test_case("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3tb" ; "bech32 charset")]
    fn test_invalid_format(input: &str) {
        assert!(matches!(
            AddressCodec::decode(input),
            Err(KestrelError::InvalidAddressFormat(_))
        ));
    }

    #[test]
    fn test_bech32m_rejected() {
        let hrp = Hrp::parse("bc").unwrap();
        let taproot = bech32::segwit::encode_v1(hrp, &[0x11; 32]).unwrap();
        assert!(matches!(
            AddressCodec::decode(&taproot),
            Err(KestrelError::InvalidAddressFormat(_))
        ));
    }

    #[test]
    fn test_multisig_redeem_is_p2sh_string() {
        let script = script::multisig_redeem(1, &[g()]).unwrap();
        let as_redeem =
            AddressCodec::encode(AddressSource::Script(&script), Network::Testnet, ScriptType::MultisigRedeem)
                .unwrap();
        let as_p2sh =
            AddressCodec::encode(AddressSource::Script(&script), Network::Testnet, ScriptType::P2sh).unwrap();
        assert_eq!(as_redeem.as_str(), as_p2sh.as_str());
        assert_eq!(as_redeem.script_pubkey(), as_p2sh.script_pubkey());

        let decoded = AddressCodec::decode(as_redeem.as_str()).unwrap();
        assert_eq!(decoded.script_type, ScriptType::P2sh);
        let again = Address::from_payload(decoded.network, decoded.script_type, &decoded.payload).unwrap();
        assert_eq!(again.as_str(), as_redeem.as_str());
    }

    #[test]
    fn test_multisig_redeem_requires_multisig_script() {
        let result = AddressCodec::encode(
            AddressSource::Script(&[0x51]),
            Network::Testnet,
            ScriptType::MultisigRedeem,
        );
        assert!(matches!(result, Err(KestrelError::InvalidScript(_))));
    }

    #[test]
    fn test_source_mismatch() {
        let result = AddressCodec::encode(AddressSource::Script(&[0x51]), Network::Testnet, ScriptType::P2wpkh);
        assert!(matches!(result, Err(KestrelError::ValidationError(_))));
    }

    #[test]
    fn test_regtest_prefixes() {
        let addr = AddressCodec::encode(AddressSource::PublicKey(&g()), Network::Regtest, ScriptType::P2wpkh).unwrap();
        assert!(addr.as_str().starts_with("bcrt1q"));
        assert_eq!(AddressCodec::decode(addr.as_str()).unwrap().network, Network::Regtest);
    }

    #[test]
    fn test_from_script_pubkey() {
        let addr = AddressCodec::encode(AddressSource::PublicKey(&g()), Network::Testnet, ScriptType::P2pkh).unwrap();
        let back = Address::from_script_pubkey(&addr.script_pubkey(), Network::Testnet).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_serde_as_string() {
        let addr = AddressCodec::encode(AddressSource::PublicKey(&g()), Network::Mainnet, ScriptType::P2wpkh).unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    fn script_type_strategy() -> impl Strategy<Value = ScriptType> {
        prop_oneof![
            Just(ScriptType::P2pkh),
            Just(ScriptType::P2sh),
            Just(ScriptType::P2wpkh),
            Just(ScriptType::P2wsh),
        ]
    }

    fn network_strategy() -> impl Strategy<Value = Network> {
        prop_oneof![Just(Network::Mainnet), Just(Network::Testnet), Just(Network::Regtest)]
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            script_type in script_type_strategy(),
            network in network_strategy(),
            payload in proptest::collection::vec(any::<u8>(), 32),
        ) {
            let len = if script_type == ScriptType::P2wsh { 32 } else { 20 };
            let addr = Address::from_payload(network, script_type, &payload[..len]).unwrap();
            let decoded = AddressCodec::decode(addr.as_str()).unwrap();

            prop_assert_eq!(decoded.script_type, script_type);
            prop_assert_eq!(&decoded.payload[..], &payload[..len]);
            let expected_network = match (network, script_type.is_segwit()) {
                (Network::Regtest, false) => Network::Testnet,
                (n, _) => n,
            };
            prop_assert_eq!(decoded.network, expected_network);
        }
    }
}
