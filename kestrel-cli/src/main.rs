//! Kestrel CLI
//!
//! Command-line interface for the Kestrel wallet engine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use dialoguer::{Confirm, Password};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kestrel_address::AddressCodec;
use kestrel_chain::MemoryChain;
use kestrel_core::types::ChannelState;
use kestrel_wallet::{
    CloseMode, EngineConfig, FeePolicy, Invoice, InvoiceStatus, LoopbackPeer, Network, Seed,
    TxOutput, WalletEngine, WalletId,
};

/// Kestrel - HD wallet, multisig and payment-channel engine
#[derive(Parser)]
#[command(name = "kestrel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new wallet seed (hex)
    Seed {
        /// Entropy size in bits
        #[arg(short, long, default_value = "256")]
        bits: usize,
    },

    /// Show the account xpub and first receive addresses of a seed
    Derive {
        /// Seed (hex)
        #[arg(long, env = "KESTREL_SEED")]
        seed: String,
        /// Number of receive addresses
        #[arg(short, long, default_value = "3")]
        count: u32,
        /// Network (mainnet, testnet, regtest)
        #[arg(short, long)]
        network: Option<String>,
    },

    /// Decode an address and show its script
    DecodeAddress {
        /// Base58Check or Bech32 address
        address: String,
    },

    /// Decode and authenticate an invoice
    DecodeInvoice {
        /// Encoded invoice
        invoice: String,
        /// Show the invoice even if it has expired
        #[arg(long)]
        allow_expired: bool,
    },

    /// List wallets stored in the data directory
    Wallets {
        /// Data directory
        #[arg(long, env = "KESTREL_DATA_DIR")]
        data_dir: PathBuf,
        /// Print stored metadata as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a stored wallet
    Delete {
        /// Wallet id
        id: String,
        /// Data directory
        #[arg(long, env = "KESTREL_DATA_DIR")]
        data_dir: PathBuf,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Seal a stored wallet's seed under a passphrase
    Protect {
        /// Wallet id
        id: String,
        /// Seed (hex) of the wallet
        #[arg(long, env = "KESTREL_SEED")]
        seed: String,
        /// Data directory
        #[arg(long, env = "KESTREL_DATA_DIR")]
        data_dir: PathBuf,
    },

    /// Decrypt a protected wallet's seed for backup
    Export {
        /// Wallet id
        id: String,
        /// Data directory
        #[arg(long, env = "KESTREL_DATA_DIR")]
        data_dir: PathBuf,
    },

    /// Run a full payment cycle on an in-process regtest chain
    Demo {
        /// Channel capacity in sats
        #[arg(long, default_value = "1000000")]
        capacity: u64,
        /// Invoice amount in sats
        #[arg(long, default_value = "50000")]
        amount: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "kestrel=debug,info"
    } else {
        "kestrel=info,warn"
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Seed { bits } => cmd_seed(bits),
        Commands::Derive {
            seed,
            count,
            network,
        } => cmd_derive(&seed, count, network.as_deref()).await,
        Commands::DecodeAddress { address } => cmd_decode_address(&address),
        Commands::DecodeInvoice {
            invoice,
            allow_expired,
        } => cmd_decode_invoice(&invoice, allow_expired),
        Commands::Wallets { data_dir, json } => cmd_wallets(data_dir, json).await,
        Commands::Delete { id, data_dir, yes } => cmd_delete(&id, data_dir, yes).await,
        Commands::Protect { id, seed, data_dir } => cmd_protect(&id, &seed, data_dir).await,
        Commands::Export { id, data_dir } => cmd_export(&id, data_dir).await,
        Commands::Demo { capacity, amount } => cmd_demo(capacity, amount).await,
    }
}

/// Engine over a fresh in-process chain, using `.env`/environment settings.
async fn local_engine(config: EngineConfig) -> Result<(WalletEngine, Arc<MemoryChain>)> {
    let chain = Arc::new(MemoryChain::new(config.network));
    let node_seed = Seed::generate(256)?;
    let engine = WalletEngine::start(config, chain.clone(), &node_seed)
        .await
        .context("Failed to start wallet engine")?;
    info!(
        network = %engine.config().network,
        node = %engine.node_id(),
        wallets = engine.list_wallets().await.len(),
        "Local engine started"
    );
    Ok((engine, chain))
}

fn load_config() -> Result<EngineConfig> {
    EngineConfig::from_env().context("Invalid KESTREL_* configuration")
}

/// Generate a seed
fn cmd_seed(bits: usize) -> Result<()> {
    let seed = Seed::generate(bits).context("Failed to generate seed")?;
    println!("{}", "🔑 New seed".cyan().bold());
    println!("   {}", hex::encode(seed.as_bytes()));
    println!("\n{}", "⚠️  Anyone holding this seed can spend the wallet's funds.".red().bold());
    Ok(())
}

/// Derive account xpub and receive addresses
async fn cmd_derive(seed: &str, count: u32, network: Option<&str>) -> Result<()> {
    let mut config = load_config()?;
    if let Some(network) = network {
        config.network = network.parse().context("Unknown network")?;
    }
    config.data_dir = None;

    let seed = Seed::from_hex(seed).context("Invalid seed hex")?;
    let (engine, _) = local_engine(config).await?;
    let wallet = engine.import_wallet("derive", seed.as_bytes()).await?;

    println!("{} {}", "🧭 Account".cyan().bold(), wallet.account_path);
    println!("   {} {}", "Network:".dimmed(), wallet.network);
    println!("   {} {}", "Fingerprint:".dimmed(), wallet.master_fingerprint);
    println!("   {} {}", "xpub:".yellow(), engine.export_account_xpub(&wallet.id).await?);

    for _ in 0..count {
        engine.next_address(&wallet.id).await?;
    }
    println!("\n{}", "Receive addresses:".yellow().bold());
    for record in engine.addresses(&wallet.id).await? {
        println!("   {:<24} {}", record.path.to_string().dimmed(), record.address);
    }
    Ok(())
}

/// Decode an address
fn cmd_decode_address(address: &str) -> Result<()> {
    let decoded = AddressCodec::decode(address).context("Invalid address")?;

    println!("{}", "✅ Valid address".green().bold());
    println!("   {} {}", "Network:".dimmed(), decoded.network);
    println!("   {} {}", "Type:".dimmed(), decoded.script_type);
    println!("   {} {}", "Payload:".dimmed(), hex::encode(&decoded.payload));
    println!("   {} {}", "scriptPubKey:".dimmed(), hex::encode(decoded.script_pubkey()));
    Ok(())
}

/// Decode an invoice
fn cmd_decode_invoice(encoded: &str, allow_expired: bool) -> Result<()> {
    let invoice = if allow_expired {
        Invoice::parse(encoded)
    } else {
        Invoice::decode(encoded)
    }
    .context("Invalid invoice")?;

    println!("{}", "🧾 Invoice".cyan().bold());
    let json = serde_json::json!({
        "network": invoice.network.as_str(),
        "amount": invoice.amount,
        "payment_hash": invoice.payment_hash.to_string(),
        "destination": invoice.destination.to_hex(),
        "created_at": invoice.created_at,
        "expires_at": invoice.expires_at(),
        "expired": invoice.is_expired(),
        "min_final_cltv": invoice.min_final_cltv,
        "description": invoice.description,
        "route_hints": invoice.route_hints.len(),
    });
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

/// List stored wallets
async fn cmd_wallets(data_dir: PathBuf, json: bool) -> Result<()> {
    let mut config = load_config()?;
    config.data_dir = Some(data_dir);
    let (engine, _) = local_engine(config).await?;
    let wallets = engine.list_wallets().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&wallets)?);
        return Ok(());
    }
    if wallets.is_empty() {
        println!("{}", "No wallets stored.".yellow());
        return Ok(());
    }

    println!("{} {} wallet(s)", "👛".cyan(), wallets.len());
    for wallet in &wallets {
        let observed: u64 = wallet.utxos.iter().map(|u| u.amount).sum();
        println!("   {} {}", wallet.id.to_string().green(), wallet.name.bold());
        println!(
            "      {} {}  {} {}  {} {} sats",
            "type:".dimmed(),
            wallet.script_type,
            "addresses:".dimmed(),
            wallet.addresses.len(),
            "last seen:".dimmed(),
            observed
        );
        if !wallet.pending.is_empty() {
            println!("      {} {} pending spend(s)", "⏳".yellow(), wallet.pending.len());
        }
    }
    Ok(())
}

/// Delete a stored wallet
async fn cmd_delete(id: &str, data_dir: PathBuf, yes: bool) -> Result<()> {
    let wallet: WalletId = id.parse().context("Invalid wallet id")?;
    let mut config = load_config()?;
    config.data_dir = Some(data_dir);
    let (engine, _) = local_engine(config).await?;
    let meta = engine.wallet(&wallet).await.context("Wallet not found")?;

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!("Delete wallet '{}' ({})?", meta.name, wallet))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("{}", "Aborted.".yellow());
            return Ok(());
        }
    }

    if engine.delete_wallet(&wallet).await? {
        info!(wallet = %wallet, "Wallet deleted from data directory");
        println!("{} {}", "🗑️  Deleted".green(), wallet);
    } else {
        println!("{} {}", "Nothing stored for".yellow(), wallet);
    }
    Ok(())
}

/// Seal a stored wallet's seed
async fn cmd_protect(id: &str, seed: &str, data_dir: PathBuf) -> Result<()> {
    let wallet: WalletId = id.parse().context("Invalid wallet id")?;
    let mut config = load_config()?;
    config.data_dir = Some(data_dir);
    let (engine, _) = local_engine(config).await?;
    engine.wallet(&wallet).await.context("Wallet not found")?;

    let seed = Seed::from_hex(seed).context("Invalid seed hex")?;
    let attached = engine.import_wallet("protect", seed.as_bytes()).await?;
    if attached.id != wallet {
        engine.delete_wallet(&attached.id).await?;
        bail!("seed does not belong to wallet {}", wallet);
    }

    let passphrase = Password::new()
        .with_prompt("New passphrase")
        .with_confirmation("Repeat passphrase", "Passphrases do not match")
        .interact()?;
    engine.protect_wallet(&wallet, &passphrase).await?;
    println!("{} {}", "🔒 Keystore sealed for".green(), wallet);
    Ok(())
}

/// Decrypt a protected wallet's seed
async fn cmd_export(id: &str, data_dir: PathBuf) -> Result<()> {
    let wallet: WalletId = id.parse().context("Invalid wallet id")?;
    let mut config = load_config()?;
    config.data_dir = Some(data_dir);
    let (engine, _) = local_engine(config).await?;

    let passphrase = Password::new().with_prompt("Passphrase").interact()?;
    let export = match engine.export_wallet(&wallet, &passphrase).await {
        Ok(export) => export,
        Err(e) => {
            warn!(wallet = %wallet, error = %e, "Export refused");
            return Err(e).context("Export failed");
        }
    };

    println!("{} {}", "📦 Wallet".cyan().bold(), export.id);
    println!("   {} {}", "xpub:".yellow(), export.account_xpub);
    println!("   {} {}", "seed:".red(), hex::encode(export.seed.as_bytes()));
    println!("   {}", serde_json::to_string(&export.keystore)?.dimmed());
    Ok(())
}

/// Mine `blocks` with a progress bar
fn mine(chain: &MemoryChain, blocks: u32) -> Result<()> {
    let pb = ProgressBar::new(u64::from(blocks));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("   ⛏️  [{bar:30.cyan/blue}] {pos}/{len} blocks")?
            .progress_chars("#>-"),
    );
    for _ in 0..blocks {
        chain.mine(1);
        pb.inc(1);
    }
    pb.finish();
    Ok(())
}

/// Full regtest walkthrough
async fn cmd_demo(capacity: u64, amount: u64) -> Result<()> {
    if amount >= capacity {
        bail!("invoice amount must be below the channel capacity");
    }
    println!("{}", "🚀 Kestrel regtest demo".cyan().bold());

    let mut config = EngineConfig::for_network(Network::Regtest);
    config.channel.min_funding_depth = 3;
    let depth = config.channel.min_funding_depth;
    let (engine, chain) = local_engine(config).await?;

    // Wallets and funding
    println!("\n{}", "1. Creating wallets...".dimmed());
    let spending = engine.create_wallet("spending").await?;
    let savings = engine.create_wallet("savings").await?;
    let address = engine.next_address(&spending.id).await?;
    println!("   ✓ spending {} receives at {}", spending.id, address);

    let funding = capacity * 2;
    chain.fund(&address, funding)?;
    mine(&chain, 1)?;
    let balance = engine.refresh_utxos(&spending.id).await?;
    println!("   ✓ confirmed balance: {} sats", balance.confirmed);

    // On-chain payment
    println!("\n{}", "2. Paying the savings wallet on-chain...".dimmed());
    let destination = engine.next_address(&savings.id).await?;
    let tx = engine
        .send(
            &spending.id,
            vec![TxOutput::to_address(&destination, amount)],
            Some(FeePolicy::PerVbyte(2)),
        )
        .await?;
    println!("   ✓ broadcast {} (fee {} sats)", tx.txid(), tx.fee());
    mine(&chain, 1)?;
    let confirmed = engine.confirm_pending(&spending.id).await?;
    println!("   ✓ {} spend(s) confirmed", confirmed.len());
    let balance = engine.refresh_utxos(&savings.id).await?;
    println!("   ✓ savings balance: {} sats", balance.confirmed);
    let balance = engine.refresh_utxos(&spending.id).await?;
    println!("   ✓ spending change: {} sats", balance.confirmed);

    // Channel
    println!("\n{}", "3. Opening a channel...".dimmed());
    let peer = Arc::new(LoopbackPeer::from_seed(&Seed::generate(256)?)?);
    let channel = engine
        .open_channel(&spending.id, peer, capacity, amount)
        .await
        .context("Channel open failed")?;
    mine(&chain, depth)?;
    let state = engine.channels().confirm_funding(&channel).await?;
    if state != ChannelState::Open {
        bail!("channel still {} after {} blocks", state, depth);
    }
    info!(channel = %channel, capacity, "Demo channel open");
    println!("   ✓ channel {} open", channel);

    // Invoice paid by the peer
    println!("\n{}", "4. Receiving an invoice payment...".dimmed());
    let invoice = engine.create_invoice(amount, None, "kestrel demo").await?;
    println!("   ✓ invoice {}", invoice.encode()?.yellow());
    let expiry = chain.height() + invoice.min_final_cltv + 10;
    let htlc = engine
        .channels()
        .receive_htlc(channel, invoice.payment_hash, amount, expiry)
        .await?;
    match engine.invoices().on_incoming_htlc(htlc).await? {
        Some(InvoiceStatus::Settled { .. }) => println!("   ✓ invoice settled"),
        other => bail!("invoice not settled: {:?}", other),
    }
    let record = engine.channels().channel(&channel).await?;
    println!(
        "   ✓ balances: local {} / remote {}",
        record.commitment.local_balance, record.commitment.remote_balance
    );

    // Close
    println!("\n{}", "5. Closing cooperatively...".dimmed());
    let closing = engine.close_channel(channel, CloseMode::Cooperative).await?;
    mine(&chain, 1)?;
    let report = engine.channels().poll_chain().await?;
    info!(channel = %channel, txid = %closing, "Demo channel closed");
    println!("   ✓ closing tx {} ({} channel(s) closed)", closing, report.closed.len());

    let balance = engine.refresh_utxos(&spending.id).await?;
    println!("\n{}", "📈 Done".green().bold());
    println!("   spending wallet: {} sats confirmed", balance.confirmed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_keystore_commands() {
        let cli = Cli::try_parse_from([
            "kestrel", "protect", "abc", "--seed", "00", "--data-dir", "/tmp/k",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Protect { ref id, .. } if id == "abc"));

        let cli = Cli::try_parse_from(["kestrel", "-v", "export", "abc", "--data-dir", "/tmp/k"])
            .unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Export { ref data_dir, .. } if data_dir == &PathBuf::from("/tmp/k")));
    }
}
