//! CLI for inspecting and maintaining a shareplane store

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;
use shareplane::common::{open_store, Config};
use shareplane::ops::{break_expired_locks, verify_cluster};
use shareplane::provisioner::{list_locks, MetadataRepository};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shareplane")]
#[command(about = "shareplane share provisioning control plane CLI")]
#[command(version = shareplane::VERSION)]
struct Cli {
    /// Config file (TOML); SHAREPLANE_* environment variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Store directory, overriding the configured one
    #[arg(long)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show one share record
    Get {
        /// Share name
        name: String,
    },

    /// List share records
    List {
        /// Print only the names
        #[arg(long)]
        names: bool,
    },

    /// Show a backend's allocation metadata
    Backend {
        /// Backend name
        #[arg(default_value = shareplane::common::DEFAULT_BACKEND)]
        name: String,
    },

    /// List held share locks
    Locks,

    /// Cross-check share records, allocation metadata and locks
    Verify,

    /// Remove locks whose lease has expired
    BreakLocks,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        config.store.path = store;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let store = open_store(&config.store)?;
    let repo = MetadataRepository::new(store.clone());

    match cli.command {
        Commands::Get { name } => {
            print_json(&repo.require_share(&name)?)?;
        }

        Commands::List { names } => {
            let shares = repo.list_shares()?;
            if names {
                for share in shares {
                    println!("{}", share.name);
                }
            } else {
                print_json(&shares)?;
            }
        }

        Commands::Backend { name } => {
            config.backend(&name)?;
            match repo.get_backend(&name)? {
                Some(meta) => print_json(&meta)?,
                None => println!("Backend {} has no allocation metadata yet", name),
            }
        }

        Commands::Locks => {
            for (key, lock) in list_locks(store.as_ref())? {
                println!(
                    "{}  owner={}  acquired_at_ms={}  ttl_ms={}",
                    key, lock.owner, lock.acquired_at_ms, lock.ttl_ms
                );
            }
        }

        Commands::Verify => {
            let report = verify_cluster(store, &config)?;
            print_json(&report)?;
            if !report.is_healthy() {
                std::process::exit(1);
            }
        }

        Commands::BreakLocks => {
            let broken = break_expired_locks(store.as_ref())?;
            println!("Broke {} expired locks", broken);
        }
    }

    Ok(())
}
