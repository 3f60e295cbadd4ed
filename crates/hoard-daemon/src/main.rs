use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hoard_cas::Storage;
use hoard_config::logging::{init_logging, LogLevel};
use hoard_config::{log_daemon_info, Config};
use hoard_daemon::StorageServer;
use hoard_net::{CryptoKey, NetworkServer, NetworkServerConfig};
use hoard_work::WorkManagerImpl;
use tokio::signal;

/// Keys from the config file do not rotate.
const CONFIG_KEY_LIFETIME: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

#[derive(Parser)]
#[command(name = "hoardd")]
#[command(version, about = "Hoard build cache daemon", long_about = None)]
struct Cli {
    /// Config file applied over the global one
    #[arg(long, global = true, env = "HOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the storage server (default)
    Start,
    /// Verify every stored blob against its key
    Check {
        /// Delete blobs that fail verification
        #[arg(long)]
        delete: bool,
    },
    /// Print storage statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the default configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Start);
    if let Commands::Config = command {
        print!("{}", Config::default_toml()?);
        return Ok(());
    }

    init_logging(if cli.verbose { LogLevel::Debug } else { LogLevel::Info });
    let config = load_config(cli.config.as_deref())?;

    match command {
        Commands::Start => start_daemon(config).await,
        Commands::Check { delete } => check_storage(config, delete),
        Commands::Stats { json } => print_stats(config, json),
        Commands::Config => Ok(()),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(Config::global_config_path().as_deref(), Some(path)),
        None => Config::load(),
    };
    config.context("Failed to load configuration")
}

fn open_storage(config: &Config) -> Result<Arc<Storage>> {
    let storage = Storage::open(config.storage.clone())
        .with_context(|| format!("Failed to open storage at {}", config.storage.root_dir.display()))?;
    Ok(Arc::new(storage))
}

async fn start_daemon(config: Config) -> Result<()> {
    log_daemon_info!(
        "Starting hoardd",
        root = config.storage.root_dir.display().to_string(),
        port = config.network.port,
    );

    let storage = open_storage(&config)?;
    let server = NetworkServer::new(NetworkServerConfig::from(&config.network))?;
    match config.network.crypto_key_bytes()? {
        Some(bytes) => server.register_crypto_key(CryptoKey::new(bytes), SystemTime::now() + CONFIG_KEY_LIFETIME),
        None if config.network.requires_crypto => {
            bail!("network.requires_crypto is set but network.crypto_key is missing")
        }
        None => {}
    }

    let storage_server = Arc::new(StorageServer::new(Arc::clone(&storage), config.network.send_chunk_size));
    if !storage_server.register(&server) {
        bail!("Storage service already registered");
    }

    let network = &config.network;
    if !server.start_listen(network.listen_ip, network.port, network.requires_crypto).await {
        bail!("Failed to listen on {}:{}", network.listen_ip, network.port);
    }

    signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
    log_daemon_info!("Shutting down", connections = server.stats().connections);

    server.shutdown().await;
    storage.save_cas_table().context("Failed to save cas table")?;

    let stats = storage.stats();
    log_daemon_info!(
        "Stopped",
        live_entries = stats.live_entries,
        total_bytes = stats.total_bytes,
        evictions = stats.evictions,
    );
    Ok(())
}

fn check_storage(config: Config, delete: bool) -> Result<()> {
    let storage = open_storage(&config)?;
    let work_manager = WorkManagerImpl::new(config.work.worker_count, "hoard-check");

    let report = storage.check_all_cas_files(&work_manager, delete);
    println!("Checked:  {}", report.checked);
    println!("Corrupt:  {}", report.corrupt);
    println!("Missing:  {}", report.missing);
    println!("Deleted:  {}", report.deleted);

    if delete || report.missing > 0 {
        storage.save_cas_table().context("Failed to save cas table")?;
    }
    if report.corrupt > report.deleted {
        bail!("{} corrupt blobs left in storage", report.corrupt - report.deleted);
    }
    Ok(())
}

fn print_stats(config: Config, json: bool) -> Result<()> {
    let storage = open_storage(&config)?;
    let stats = storage.stats();

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Storage:  {}", config.storage.root_dir.display());
    println!("Entries:  {} ({} live)", stats.cas_entries, stats.live_entries);
    println!("Files:    {}", stats.file_entries);
    if stats.capacity == 0 {
        println!("Size:     {} bytes (unlimited)", stats.total_bytes);
    } else {
        println!(
            "Size:     {} / {} bytes ({:.1}%)",
            stats.total_bytes,
            stats.capacity,
            stats.total_bytes as f64 * 100.0 / stats.capacity as f64
        );
    }
    Ok(())
}
