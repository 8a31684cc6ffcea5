//! CLI harness for exercising the sync engine offline
//!
//! Remote state comes from JSON chain captures (see `ChainFixture`), so
//! reorgs, pending transactions and metadata outages can be replayed
//! against a real on-disk store:
//! - Replay a sequence of captures, one sync cycle each
//! - Inspect balances and history of the resulting store
//! - Run the background loop for a while, then stop it
//! - Benchmark merge throughput on a synthetic chain

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use ledger_storage_sqlite::{AccountId, AccountStore, Database, LockSet, Repository, WalletKind};
use ledger_sync::{
    BackgroundSync, BackgroundSyncConfig, BestBlock, ChainFixture, FixtureRemote, RemoteBlock,
    RemoteInput, RemoteOutput, RemoteTransaction, RemoteTxState, SyncConfig, SyncEngine,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sync-harness")]
#[command(about = "Wallet history sync testing harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync once per capture, in order
    Replay {
        /// Database file (created if missing)
        #[arg(short, long)]
        db: PathBuf,

        /// Owned address to register (repeatable)
        #[arg(short, long = "address")]
        addresses: Vec<String>,

        /// Network id
        #[arg(short, long, default_value = "1")]
        network: i64,

        /// Create the account with a reward address
        #[arg(long)]
        accounting: bool,

        /// Sync configuration (JSON), defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Chain captures
        #[arg(required = true)]
        fixtures: Vec<PathBuf>,
    },

    /// Print per-address and total balances
    Balance {
        /// Database file
        #[arg(short, long)]
        db: PathBuf,
    },

    /// Print the newest history entries
    History {
        /// Database file
        #[arg(short, long)]
        db: PathBuf,

        /// Number of entries
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Run the background loop against a capture, then cancel it
    Background {
        /// Chain capture
        fixture: PathBuf,

        /// Owned address to register (repeatable)
        #[arg(short, long = "address")]
        addresses: Vec<String>,

        /// Network id
        #[arg(short, long, default_value = "1")]
        network: i64,

        /// Seconds between cycles
        #[arg(short, long, default_value = "2")]
        interval: u64,

        /// Stop after N seconds
        #[arg(short, long, default_value = "10")]
        run_for: u64,
    },

    /// Benchmark sync of a synthetic chain
    Benchmark {
        /// Transactions in the chain
        #[arg(short, long, default_value = "5000")]
        transactions: u64,

        /// History page size
        #[arg(short, long, default_value = "50")]
        page_size: usize,

        /// Number of runs
        #[arg(short, long, default_value = "3")]
        runs: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            db,
            addresses,
            network,
            accounting,
            config,
            fixtures,
        } => {
            let config = match config {
                Some(path) => load_config(&path)?,
                None => SyncConfig::default(),
            };
            run_replay(&db, &addresses, network, accounting, config, &fixtures).await?;
        }
        Commands::Balance { db } => print_balance(&db)?,
        Commands::History { db, limit } => print_history(&db, limit)?,
        Commands::Background {
            fixture,
            addresses,
            network,
            interval,
            run_for,
        } => {
            run_background(&fixture, &addresses, network, interval, run_for).await?;
        }
        Commands::Benchmark {
            transactions,
            page_size,
            runs,
        } => {
            run_benchmark(transactions, page_size, runs).await?;
        }
    }

    Ok(())
}

fn load_fixture(path: &Path) -> anyhow::Result<ChainFixture> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(ChainFixture::from_json(&json)?)
}

fn load_config(path: &Path) -> anyhow::Result<SyncConfig> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))
}

/// First account of the store, created on first use
fn harness_account(
    engine: &SyncEngine,
    network: i64,
    kind: WalletKind,
) -> anyhow::Result<AccountId> {
    let existing = {
        let db = engine.database();
        let db = db.lock();
        let tx = db.read(LockSet::of(AccountStore::TABLES))?;
        let accounts = AccountStore::new(&tx)?.list()?;
        accounts.into_iter().next()
    };
    match existing {
        Some(account) if account.network_id != network => bail!(
            "store belongs to network {}, not {}",
            account.network_id,
            network
        ),
        Some(account) => Ok(account.id),
        None => Ok(engine.create_account("harness", network, kind)?.id),
    }
}

fn first_account(db: &Database) -> anyhow::Result<AccountId> {
    let tx = db.read(LockSet::of(AccountStore::TABLES))?;
    let account = AccountStore::new(&tx)?
        .list()?
        .into_iter()
        .next()
        .context("store has no account, run `replay` first")?;
    Ok(account.id)
}

async fn run_replay(
    path: &Path,
    addresses: &[String],
    network: i64,
    accounting: bool,
    config: SyncConfig,
    fixtures: &[PathBuf],
) -> anyhow::Result<()> {
    let db = Arc::new(Mutex::new(Database::open(path)?));
    let remote = Arc::new(FixtureRemote::default());
    let engine = SyncEngine::new(db, remote.clone(), config);
    let kind = if accounting {
        WalletKind::UtxoAndAccounting
    } else {
        WalletKind::Utxo
    };
    let account = harness_account(&engine, network, kind)?;
    let added = engine.register_addresses(account, addresses)?;
    info!("Account {} on network {}, {} addresses registered", account, network, added);

    let pb = ProgressBar::new(fixtures.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );

    for fixture in fixtures {
        remote.set_chain(load_fixture(fixture)?);
        pb.set_message(fixture.display().to_string());
        let report = engine.sync_account(account).await?;
        pb.println(format!(
            "{}: tip {} | fetched {} | +{} new | {} updated | {} not in remote{}",
            fixture.display(),
            report.best_block.as_ref().map_or(0, |b| b.height),
            report.fetched,
            report.inserted,
            report.updated,
            report.not_in_remote,
            if report.rollback.is_some() { " | rolled back" } else { "" },
        ));
        pb.inc(1);
    }
    pb.finish_with_message("Replay complete");
    Ok(())
}

fn print_balance(path: &Path) -> anyhow::Result<()> {
    let db = Database::open(path)?;
    let account = first_account(&db)?;
    let repo = Repository::new(&db);

    for (address, tokens) in repo.balance_by_address(account)? {
        println!("{address}");
        for (asset, amount) in tokens.iter() {
            let asset = if asset.is_empty() { "<primary>" } else { asset };
            println!("    {asset}: {amount}");
        }
    }
    let total = repo.wallet_balance(account)?;
    println!("total: {}", total.primary());
    for (asset, amount) in total.iter().filter(|(id, _)| !id.is_empty()) {
        println!("    {asset}: {amount}");
    }
    Ok(())
}

fn print_history(path: &Path, limit: usize) -> anyhow::Result<()> {
    let db = Database::open(path)?;
    let account = first_account(&db)?;

    for entry in Repository::new(&db).history(account, 0, limit)? {
        let tx = &entry.transaction;
        let height = tx
            .height()
            .map_or_else(|| "-".to_string(), |h| h.to_string());
        let spent: u128 = entry.inputs.iter().map(|i| i.tokens.primary()).sum();
        let received: u128 = entry.outputs.iter().map(|o| o.tokens.primary()).sum();
        println!(
            "{:>10} {:?} {} in {} out {} certs {}",
            height,
            tx.status,
            tx.hash,
            spent,
            received,
            entry.certificates.len()
        );
    }
    Ok(())
}

async fn run_background(
    fixture: &Path,
    addresses: &[String],
    network: i64,
    interval: u64,
    run_for: u64,
) -> anyhow::Result<()> {
    let db = Arc::new(Mutex::new(Database::open_in_memory()?));
    let remote = Arc::new(FixtureRemote::new(load_fixture(fixture)?));
    let engine = Arc::new(SyncEngine::new(db, remote, SyncConfig::default()));
    let account = harness_account(&engine, network, WalletKind::Utxo)?;
    engine.register_addresses(account, addresses)?;

    let background = Arc::new(BackgroundSync::new(
        Arc::clone(&engine),
        BackgroundSyncConfig {
            interval: Duration::from_secs(interval),
            ..Default::default()
        },
    ));
    let cancel = background.cancel_token();
    let handle = background.spawn();

    tokio::time::sleep(Duration::from_secs(run_for)).await;
    info!("Stopping background sync");
    cancel.cancel();
    handle.await?;

    let db = engine.database();
    let db = db.lock();
    let history = Repository::new(&db).history(account, 0, 100_000)?;
    info!("Background sync stopped with {} transactions stored", history.len());
    Ok(())
}

fn synthetic_chain(transactions: u64) -> (ChainFixture, Vec<String>) {
    let owned: Vec<String> = (1u8..=4).map(|n| format!("61{}", hex::encode([n; 28]))).collect();
    let foreign = format!("61{}", hex::encode([0xf0u8; 28]));
    let block = |height: u64| RemoteBlock {
        hash: format!("{height:064x}"),
        height,
        slot: height * 20,
        epoch: None,
        time: 1_600_000_000 + height as i64 * 20,
    };

    let txs = (0..transactions)
        .map(|i| {
            let receiver = &owned[(i % owned.len() as u64) as usize];
            // Every other transaction spends the previous one's first output
            let inputs = if i % 2 == 1 {
                vec![RemoteInput {
                    address: owned[((i - 1) % owned.len() as u64) as usize].clone(),
                    tx_hash: format!("{:064x}", i - 1),
                    index: 0,
                    amount: "2000000".to_string(),
                    assets: vec![],
                }]
            } else {
                vec![RemoteInput {
                    address: foreign.clone(),
                    tx_hash: format!("f{:063x}", i),
                    index: 0,
                    amount: "2500000".to_string(),
                    assets: vec![],
                }]
            };
            RemoteTransaction {
                hash: format!("{i:064x}"),
                state: RemoteTxState::Successful,
                block: Some(block(1_000 + i)),
                ordinal: Some(0),
                error_message: None,
                fee: Some("170000".to_string()),
                is_valid: true,
                inputs,
                outputs: vec![
                    RemoteOutput {
                        address: receiver.clone(),
                        amount: "2000000".to_string(),
                        assets: vec![],
                    },
                    RemoteOutput {
                        address: foreign.clone(),
                        amount: "330000".to_string(),
                        assets: vec![],
                    },
                ],
                withdrawals: vec![],
                certificates: vec![],
            }
        })
        .collect();
    let tip = block(1_000 + transactions);
    let chain = ChainFixture {
        best_block: BestBlock {
            hash: tip.hash,
            height: tip.height,
            slot: tip.slot,
            epoch: None,
            time: tip.time,
        },
        transactions: txs,
        ..Default::default()
    };
    (chain, owned)
}

async fn run_benchmark(transactions: u64, page_size: usize, runs: u32) -> anyhow::Result<()> {
    if transactions < 2 {
        bail!("benchmark needs at least 2 transactions");
    }
    info!("Starting benchmark: {} transactions, {} runs", transactions, runs);
    let (full, owned) = synthetic_chain(transactions);

    let mut total_duration = Duration::ZERO;
    let mut total_transactions = 0usize;

    for run in 1..=runs {
        info!("Run {}/{}", run, runs);
        // Seed with the oldest transaction so the first cycle pages forward
        let mut seed = full.clone();
        seed.transactions.truncate(1);

        let db = Arc::new(Mutex::new(Database::open_in_memory()?));
        let remote = Arc::new(FixtureRemote::new(seed));
        let config = SyncConfig {
            history_page_size: page_size,
            max_pages: usize::MAX,
            ..Default::default()
        };
        let engine = SyncEngine::new(db, remote.clone(), config);
        let account = engine.create_account("bench", 1, WalletKind::Utxo)?.id;
        engine.register_addresses(account, &owned)?;
        engine.sync_account(account).await?;

        remote.set_chain(full.clone());
        let started = Instant::now();
        let report = engine.sync_account(account).await?;
        let elapsed = started.elapsed();

        if report.inserted as u64 + 1 != transactions {
            warn!("  Expected {} new transactions, got {}", transactions - 1, report.inserted);
        }
        info!(
            "  Duration: {:.2}s | {:.1} tx/s | {} history pages",
            elapsed.as_secs_f64(),
            report.inserted as f64 / elapsed.as_secs_f64(),
            remote.history_calls() - 1
        );
        total_duration += elapsed;
        total_transactions += report.inserted;
    }

    let runs = runs.max(1);
    info!("Benchmark Results:");
    info!("  Runs: {}", runs);
    info!("  Transactions merged: {}", total_transactions);
    info!("  Average duration: {:.2}s", (total_duration / runs).as_secs_f64());
    info!(
        "  Average speed: {:.1} tx/s",
        total_transactions as f64 / total_duration.as_secs_f64()
    );
    Ok(())
}
