//! ledger_inspect - show, verify or clear a session's persisted ledger

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

use proctor_monitor::{MonitorConfig, SealStatus, SessionId, SqliteKeyValueStore, ViolationLedger};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the ledger database (defaults to the configured db_path).
    #[arg(long)]
    db_path: Option<String>,
    /// Test identifier whose ledger to inspect.
    #[arg(long)]
    test_id: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the stored counters and seal status as JSON.
    Show,
    /// Exit non-zero if the stored counters fail the seal check.
    Verify,
    /// Remove every stored key for the test.
    Clear,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let db_path = match args.db_path {
        Some(path) => path,
        None => MonitorConfig::load()?.db_path,
    };

    // The participant token plays no part in the stored layout.
    let session = SessionId::new(&args.test_id, "")?;
    let store = SqliteKeyValueStore::open(&db_path)?;
    let keys = store.keys_with_prefix(&format!("proctoring_{}_", args.test_id))?;
    let (mut ledger, outcome) = ViolationLedger::load(&session, Box::new(store));

    match args.command {
        Command::Show => {
            let seal = match outcome.seal {
                SealStatus::Valid => "valid",
                SealStatus::Missing => "missing",
                SealStatus::Mismatch => "mismatch",
            };
            println!(
                "{}",
                serde_json::json!({
                    "test_id": args.test_id,
                    "counts": outcome.snapshot,
                    "seal": seal,
                    "keys": keys,
                })
            );
        }
        Command::Verify => match outcome.seal {
            SealStatus::Valid => println!("ledger for {} verified", args.test_id),
            SealStatus::Missing if outcome.snapshot.is_zero() => {
                println!("no ledger stored for {}", args.test_id)
            }
            SealStatus::Missing => {
                return Err(anyhow!("ledger for {} carries no seal", args.test_id));
            }
            SealStatus::Mismatch => {
                return Err(anyhow!(
                    "ledger for {} was modified outside the monitor",
                    args.test_id
                ));
            }
        },
        Command::Clear => {
            ledger.reset();
            log::info!("cleared ledger for test {}", args.test_id);
        }
    }
    Ok(())
}
