mod config;
mod discovery;
mod error;
mod mirror;
mod probe;
mod selector;
mod state;
mod sync;
mod traits;
mod transfer;
mod types;
mod utils;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use config::Settings;
use discovery::{JsonDiscovery, ListSource};
use probe::{NetProbe, ProbeTimeouts};
use state::StateStore;
use std::path::PathBuf;
use std::process::ExitCode;
use sync::{CycleOptions, Syncer};
use tracing_subscriber::EnvFilter;
use transfer::RsyncTransfer;
use types::SizeClass;

#[derive(Parser)]
#[command(name = "repomirror")]
#[command(about = "Keep a local repository copy in sync with the best available mirror", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/repomirror/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State file holding mirror history and the current sync point
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync cycle into TARGET (e.g., repomirror sync /srv/mirror)
    Sync {
        /// Local mirror directory
        target: PathBuf,

        /// Delete local files that are gone from the mirror
        #[arg(long)]
        delete: bool,
    },
    /// Show the cached state of every known mirror
    Status,
    /// Benchmark mirrors (e.g., repomirror test --size medium)
    Test {
        /// Speed test file: small, medium or large
        #[arg(long, short, default_value = "small", value_parser = ["small", "medium", "large"])]
        size: String,
    },
    /// Fetch the mirror list now, ignoring the refresh interval
    Refresh,
}

/// Collaborators shared by the commands that touch the network.
struct Runtime {
    settings: Settings,
    discovery: JsonDiscovery,
    probe: NetProbe,
    transfer: RsyncTransfer,
}

impl Runtime {
    fn new(settings: Settings) -> Result<Self> {
        let discovery = JsonDiscovery::new(ListSource::from_setting(settings.mirror_list.as_deref()));
        let probe = NetProbe::new(ProbeTimeouts::from_settings(&settings))?;
        let transfer = RsyncTransfer::from_settings(&settings);
        Ok(Self {
            settings,
            discovery,
            probe,
            transfer,
        })
    }

    fn syncer(&self, target: PathBuf) -> Syncer<'_> {
        let mut options = CycleOptions::from_settings(&self.settings, target);
        options.show_progress = true;
        Syncer::new(&self.discovery, &self.probe, &self.transfer, options)
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "repomirror=warn",
        1 => "repomirror=info",
        2 => "repomirror=debug",
        _ => "repomirror=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(cache) = cli.cache {
        settings.cache_path = Some(cache);
    }
    let store = StateStore::new(settings.cache_path());

    match cli.command {
        Commands::Sync { target, delete } => {
            settings.erase_extraneous |= delete;
            handle_sync(settings, &store, target).await
        }
        Commands::Status => handle_status(&store).map(|_| ExitCode::SUCCESS),
        Commands::Test { size } => handle_test(settings, &store, &size)
            .await
            .map(|_| ExitCode::SUCCESS),
        Commands::Refresh => handle_refresh(settings, &store)
            .await
            .map(|_| ExitCode::SUCCESS),
    }
}

// --- Handlers ---

async fn handle_sync(settings: Settings, store: &StateStore, target: PathBuf) -> Result<ExitCode> {
    if settings.erase_extraneous {
        eprintln!("Note: files missing on the mirror will be deleted from {:?}.", target);
    }

    let runtime = Runtime::new(settings)?;
    let syncer = runtime.syncer(target);

    let outcome = sync::run_cycle(store, &syncer)
        .await
        .with_context(|| format!("sync cycle failed (state file {:?})", store.path()))?;

    println!("{}", outcome);

    if outcome.is_failure() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn handle_status(store: &StateStore) -> Result<()> {
    let state = store.load()?;

    println!("State file:        {:?}", store.path());
    println!("Local copy from:   {}", state.current_sync);
    println!("Next list refresh: {}", state.next_mirror_sync);
    println!("{}", "-".repeat(100));
    println!(
        "{:<32} {:<16} {:<12} {:<22} {:<14} Fails",
        "Mirror", "Country", "Status", "Timestamp", "Speed"
    );
    println!("{}", "-".repeat(100));

    for m in &state.mirrors {
        let timestamp = m
            .timestamp
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());

        // Truncate name if too long
        let mut name = m.name.clone();
        if name.chars().count() > 30 {
            name = format!("{}...", name.chars().take(27).collect::<String>());
        }

        println!(
            "{:<32} {:<16} {:<12} {:<22} {:<14} {}",
            name,
            m.country,
            m.connectivity.to_string(),
            timestamp,
            utils::format_speed(m.last_rate_speed),
            m.failed_checks
        );
    }
    println!("{}", "-".repeat(100));

    Ok(())
}

async fn handle_test(settings: Settings, store: &StateStore, size: &str) -> Result<()> {
    // 先解析参数, 无效的尺寸不能改动任何状态
    let size: SizeClass = size.parse()?;

    let runtime = Runtime::new(settings)?;
    let syncer = runtime.syncer(PathBuf::new());
    let mut state = store.load()?;
    let now = Utc::now();

    syncer.refresh_if_due(&mut state, now).await;
    syncer.probe_mirrors(&mut state, now, Some(size), false).await;
    store.save(&state)?;

    let mut online: Vec<_> = state.mirrors.iter().filter(|m| m.is_online()).collect();
    online.sort_by_key(|m| std::cmp::Reverse(m.last_rate_speed.unwrap_or(0)));

    println!();
    println!("{:<4} {:<16} {:<22} {:<32} COUNTRY", "RANK", "SPEED", "TIMESTAMP", "NAME");
    println!("{}", "-".repeat(90));

    for (i, m) in online.iter().enumerate() {
        let timestamp = m
            .timestamp
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<4} {:<16} {:<22} {:<32} {}",
            i + 1,
            utils::format_speed(m.last_rate_speed),
            timestamp,
            m.name,
            m.country
        );
    }

    let offline = state.mirrors.len() - online.len();
    if offline > 0 {
        println!("{}", "-".repeat(90));
        println!("{} mirrors unreachable or without probe endpoints.", offline);
    }

    Ok(())
}

async fn handle_refresh(settings: Settings, store: &StateStore) -> Result<()> {
    let runtime = Runtime::new(settings)?;
    let syncer = runtime.syncer(PathBuf::new());
    let mut state = store.load()?;

    let count = syncer.refresh_mirrors(&mut state, Utc::now()).await?;
    store.save(&state)?;

    println!("Success! {} mirrors known, saved to {:?}.", count, store.path());
    Ok(())
}
