use clap::Parser;
use lottopay::config::EngineConfig;
use lottopay::domain::ports::LedgerStoreRef;
use lottopay::infrastructure::in_memory::InMemoryLedgerStore;
use lottopay::interfaces::csv::ledger_writer::LedgerWriter;
use lottopay::interfaces::csv::script_reader::ScriptReader;
use lottopay::interfaces::replay::Replay;
use lottopay::telemetry;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Replay script CSV file
    input: PathBuf,

    /// Path to persistent ledger (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Payment timeout in seconds; overrides PAYMENT_TIMEOUT_SECS.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Retries for transient service failures; overrides PAYMENT_MAX_RETRIES.
    #[arg(long)]
    max_retries: Option<u32>,
}

#[cfg(feature = "storage-rocksdb")]
fn open_ledger(db_path: Option<PathBuf>) -> Result<LedgerStoreRef> {
    use lottopay::infrastructure::rocksdb::RocksDbLedgerStore;

    match db_path {
        Some(path) => Ok(Arc::new(RocksDbLedgerStore::open(path).into_diagnostic()?)),
        None => Ok(Arc::new(InMemoryLedgerStore::new())),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_ledger(db_path: Option<PathBuf>) -> Result<LedgerStoreRef> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(Arc::new(InMemoryLedgerStore::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let mut config = EngineConfig::from_env();
    if let Some(secs) = cli.timeout_secs {
        config = config.with_payment_timeout(Duration::from_secs(secs));
    }
    if let Some(max_retries) = cli.max_retries {
        config.retry.max_retries = max_retries;
    }

    let ledger = open_ledger(cli.db_path)?;
    let mut replay = Replay::new(ledger, config);

    // Finish what a previous run left behind before taking new events
    let recovered = replay.engine().recover_orphans().await.into_diagnostic()?;

    let file = File::open(cli.input).into_diagnostic()?;
    let reader = ScriptReader::new(file);
    for row_result in reader.rows() {
        match row_result {
            Ok(row) => {
                if let Err(e) = replay.apply(row).await {
                    eprintln!("Error processing event: {}", e);
                }
            }
            Err(e) => {
                eprintln!("Error reading event: {}", e);
            }
        }
    }

    let entries = replay.report().await.into_diagnostic()?;

    let stdout = io::stdout();
    let mut writer = LedgerWriter::new(stdout.lock());
    writer
        .write_entries(recovered.iter().chain(entries.iter()))
        .into_diagnostic()?;

    Ok(())
}
