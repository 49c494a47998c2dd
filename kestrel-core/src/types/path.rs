//! BIP32 derivation paths.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{HARDENED_OFFSET, MAX_DERIVATION_DEPTH};
use crate::error::{KestrelError, Result};

/// One component of a derivation path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildNumber {
    /// Non-hardened index (`< 2^31`).
    Normal(u32),
    /// Hardened index (stored without the offset).
    Hardened(u32),
}

impl ChildNumber {
    /// Builds a normal child number, rejecting indices in the hardened range.
    pub fn normal(index: u32) -> Result<Self> {
        if index >= HARDENED_OFFSET {
            return Err(KestrelError::KeyDerivationOverflow(format!(
                "index {} is reserved for hardened children",
                index
            )));
        }
        Ok(ChildNumber::Normal(index))
    }

    /// Builds a hardened child number from an unhardened index.
    pub fn hardened(index: u32) -> Result<Self> {
        if index >= HARDENED_OFFSET {
            return Err(KestrelError::KeyDerivationOverflow(format!(
                "hardened index {} out of range",
                index
            )));
        }
        Ok(ChildNumber::Hardened(index))
    }

    /// Decodes the 32-bit BIP32 serialization.
    pub fn from_u32(raw: u32) -> Self {
        if raw >= HARDENED_OFFSET {
            ChildNumber::Hardened(raw - HARDENED_OFFSET)
        } else {
            ChildNumber::Normal(raw)
        }
    }

    /// Returns the 32-bit BIP32 serialization (offset applied when hardened).
    pub fn to_u32(self) -> u32 {
        match self {
            ChildNumber::Normal(i) => i,
            ChildNumber::Hardened(i) => i | HARDENED_OFFSET,
        }
    }

    /// True for hardened children.
    pub fn is_hardened(self) -> bool {
        matches!(self, ChildNumber::Hardened(_))
    }

    /// Index without the hardened offset.
    pub fn index(self) -> u32 {
        match self {
            ChildNumber::Normal(i) | ChildNumber::Hardened(i) => i,
        }
    }
}

impl fmt::Display for ChildNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildNumber::Normal(i) => write!(f, "{}", i),
            ChildNumber::Hardened(i) => write!(f, "{}'", i),
        }
    }
}

impl FromStr for ChildNumber {
    type Err = KestrelError;

    fn from_str(s: &str) -> Result<Self> {
        let (digits, hardened) = match s.strip_suffix(['\'', 'h', 'H']) {
            Some(rest) => (rest, true),
            None => (s, false),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(KestrelError::InvalidDerivationPath(format!(
                "bad component '{}'",
                s
            )));
        }
        let index: u32 = digits.parse().map_err(|_| {
            KestrelError::KeyDerivationOverflow(format!("component '{}' exceeds 32 bits", s))
        })?;
        if hardened {
            ChildNumber::hardened(index)
        } else {
            ChildNumber::normal(index)
        }
    }
}

/// A BIP32 derivation path such as `m/84'/0'/0'/0/5`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DerivationPath {
    children: Vec<ChildNumber>,
}

impl DerivationPath {
    /// The master path `m`.
    pub fn master() -> Self {
        Self::default()
    }

    /// Builds a path from components.
    pub fn from_children(children: Vec<ChildNumber>) -> Result<Self> {
        if children.len() > MAX_DERIVATION_DEPTH {
            return Err(KestrelError::KeyDerivationOverflow(format!(
                "depth {} exceeds {}",
                children.len(),
                MAX_DERIVATION_DEPTH
            )));
        }
        Ok(Self { children })
    }

    /// Account path `m/purpose'/coin'/account'`.
    pub fn account(purpose: u32, coin_type: u32, account: u32) -> Result<Self> {
        Self::from_children(vec![
            ChildNumber::hardened(purpose)?,
            ChildNumber::hardened(coin_type)?,
            ChildNumber::hardened(account)?,
        ])
    }

    /// Returns a new path with `child` appended.
    pub fn child(&self, child: ChildNumber) -> Result<Self> {
        let mut children = self.children.clone();
        children.push(child);
        Self::from_children(children)
    }

    /// Returns a new path with all of `other`'s components appended.
    pub fn extend(&self, other: &DerivationPath) -> Result<Self> {
        let mut children = self.children.clone();
        children.extend_from_slice(&other.children);
        Self::from_children(children)
    }

    /// Path components.
    pub fn children(&self) -> &[ChildNumber] {
        &self.children
    }

    /// Number of components.
    pub fn depth(&self) -> usize {
        self.children.len()
    }

    /// True for the master path.
    pub fn is_master(&self) -> bool {
        self.children.is_empty()
    }

    /// Last component, if any.
    pub fn last(&self) -> Option<ChildNumber> {
        self.children.last().copied()
    }

    /// True if `self` starts with all components of `prefix`.
    pub fn starts_with(&self, prefix: &DerivationPath) -> bool {
        self.children.starts_with(&prefix.children)
    }

    /// Components after `prefix`, or `None` if `prefix` does not match.
    pub fn strip_prefix(&self, prefix: &DerivationPath) -> Option<DerivationPath> {
        self.children
            .strip_prefix(prefix.children.as_slice())
            .map(|rest| DerivationPath {
                children: rest.to_vec(),
            })
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for child in &self.children {
            write!(f, "/{}", child)?;
        }
        Ok(())
    }
}

impl FromStr for DerivationPath {
    type Err = KestrelError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split('/');
        match parts.next() {
            Some("m") | Some("M") => {}
            _ => {
                return Err(KestrelError::InvalidDerivationPath(format!(
                    "'{}' must start with 'm'",
                    s
                )))
            }
        }
        let children = parts
            .map(ChildNumber::from_str)
            .collect::<Result<Vec<_>>>()?;
        Self::from_children(children)
    }
}

impl Serialize for DerivationPath {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DerivationPath {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
