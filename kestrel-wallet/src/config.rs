//! Engine configuration.
//!
//! One struct aggregates the per-component configs. Values come from
//! `Default`, from serde (a config file) or from the environment via
//! [`EngineConfig::from_env`], which also reads a `.env` file when present.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kestrel_chain::RetryPolicy;
use kestrel_channel::ChannelConfig;
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{Network, ScriptType};
use kestrel_crypto::DEFAULT_KDF_ROUNDS;
use kestrel_invoice::InvoiceConfig;
use kestrel_multisig::CoordinatorConfig;
use kestrel_tx::{BuilderConfig, FeePolicy};

/// File name of the repository inside the data directory.
pub const REPOSITORY_FILE: &str = "kestrel.db";

/// Engine configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Network every wallet and channel lives on
    pub network: Network,
    /// Script type of new single-key wallets
    pub script_type: ScriptType,
    /// Entropy of generated seeds
    pub seed_bits: usize,
    /// PBKDF2 rounds of new keystores
    pub kdf_rounds: u32,
    /// Directory of the file repository; in-memory when unset
    pub data_dir: Option<PathBuf>,
    /// Confirmations before a UTXO is spendable
    pub min_confirmations: u32,
    /// Fee of wallet spends and channel funding
    pub fee: FeePolicy,
    /// Interval of the background HTLC sweeper
    pub sweep_interval_ms: u64,
    /// Coin selection and transaction options
    pub builder: BuilderConfig,
    /// Multisig proposal options
    pub multisig: CoordinatorConfig,
    /// Channel options
    pub channel: ChannelConfig,
    /// Chain call retry schedule
    pub retry: RetryPolicy,
    /// Invoice options
    pub invoice: InvoiceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            script_type: ScriptType::P2wpkh,
            seed_bits: 256,
            kdf_rounds: DEFAULT_KDF_ROUNDS,
            data_dir: None,
            min_confirmations: 1,
            fee: FeePolicy::PerVbyte(2),
            sweep_interval_ms: 10_000,
            builder: BuilderConfig::default(),
            multisig: CoordinatorConfig::default(),
            channel: ChannelConfig::default(),
            retry: RetryPolicy::default(),
            invoice: InvoiceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults for `network`.
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    /// Loads `.env` if present, then applies `KESTREL_*` variables over the
    /// defaults.
    ///
    /// # Errors
    /// `ConfigError` naming the variable when a value does not parse.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Applies variables read through `lookup` over the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(network) = parse_var::<Network>(&lookup, "KESTREL_NETWORK")? {
            config.network = network;
        }
        if let Some(dir) = lookup("KESTREL_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            config.data_dir = Some(PathBuf::from(dir.trim()));
        }
        if let Some(bits) = parse_var(&lookup, "KESTREL_SEED_BITS")? {
            config.seed_bits = bits;
        }
        if let Some(rounds) = parse_var(&lookup, "KESTREL_KDF_ROUNDS")? {
            config.kdf_rounds = rounds;
        }
        if let Some(confs) = parse_var(&lookup, "KESTREL_MIN_CONFIRMATIONS")? {
            config.min_confirmations = confs;
        }
        if let Some(rate) = parse_var(&lookup, "KESTREL_FEE_RATE")? {
            config.fee = FeePolicy::PerVbyte(rate);
        }
        if let Some(ms) = parse_var(&lookup, "KESTREL_SWEEP_INTERVAL_MS")? {
            config.sweep_interval_ms = ms;
        }
        if let Some(depth) = parse_var(&lookup, "KESTREL_MIN_FUNDING_DEPTH")? {
            config.channel = config.channel.with_min_funding_depth(depth);
        }
        if let Some(ms) = parse_var(&lookup, "KESTREL_COUNTERSIGN_TIMEOUT_MS")? {
            config.channel = config
                .channel
                .with_countersign_timeout(Duration::from_millis(ms));
        }
        if let Some(secs) = parse_var(&lookup, "KESTREL_PROPOSAL_DEADLINE_SECS")? {
            config.multisig = config.multisig.with_deadline_secs(secs);
        }
        if let Some(attempts) = parse_var(&lookup, "KESTREL_RPC_MAX_ATTEMPTS")? {
            config.retry = config.retry.with_max_attempts(attempts);
        }
        if let Some(secs) = parse_var(&lookup, "KESTREL_INVOICE_EXPIRY_SECS")? {
            config.invoice = config.invoice.with_default_expiry(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks values no component can work with.
    pub fn validate(&self) -> Result<()> {
        if !(128..=512).contains(&self.seed_bits) || self.seed_bits % 32 != 0 {
            return Err(KestrelError::ConfigError(format!(
                "seed_bits must be a multiple of 32 in 128..=512, got {}",
                self.seed_bits
            )));
        }
        if !matches!(self.script_type, ScriptType::P2pkh | ScriptType::P2wpkh) {
            return Err(KestrelError::ConfigError(format!(
                "{} is not a single-key wallet type",
                self.script_type
            )));
        }
        if self.kdf_rounds == 0 {
            return Err(KestrelError::ConfigError("kdf_rounds must be at least 1".into()));
        }
        if self.channel.min_funding_depth == 0 {
            return Err(KestrelError::ConfigError(
                "min_funding_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Path of the file repository, if any.
    pub fn repository_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(REPOSITORY_FILE))
    }

    /// Sweeper interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| KestrelError::ConfigError(format!("{}: {}", name, e))),
    }
}
