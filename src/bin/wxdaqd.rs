//! Entry point of the weather acquisition daemon.

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use wxdaq::config::Settings;
use wxdaq::engine::{Engine, EngineFlags};
use wxdaq::store::{ArchiveStore, MemoryArchiveStore, MemoryStatsStore, StatsStore};
use wxdaq::vantage::console::Console;
use wxdaq::vantage::transport::SerialOpener;

#[derive(Parser)]
#[command(
    name = "wxdaqd",
    version,
    about = "Weather data acquisition daemon for Davis VantagePro consoles"
)]
struct Args {
    /// Path to the configuration file
    config_path: PathBuf,

    /// Run detached from the terminal (supervision is left to the service
    /// manager)
    #[arg(long)]
    daemon: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Arc::new(
        Settings::from_path(&args.config_path)
            .with_context(|| format!("loading configuration {}", args.config_path.display()))?,
    );

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&settings.application.log_level),
    )
    .init();

    if args.daemon {
        warn!("--daemon requested; running in the foreground, detach via the service manager");
    }
    info!("Starting wxdaqd on {}", settings.station.port);

    let flags = EngineFlags::new();
    spawn_signal_handlers(flags.clone());

    let opener = Arc::new(SerialOpener::new(
        &settings.station.port,
        settings.station.baud_rate,
        settings.station.timeout,
    ));
    let console = Console::new(settings.station.clone(), opener, 300);

    // The SQL-backed store collaborators plug in here; the in-memory
    // stores keep the daemon self-contained until they do.
    let archive: Arc<dyn ArchiveStore> = Arc::new(MemoryArchiveStore::new());
    let stats: Arc<dyn StatsStore> = Arc::new(MemoryStatsStore::new());

    let mut engine = Engine::new(
        settings,
        console,
        archive,
        stats,
        tokio::runtime::Handle::current(),
        flags,
    );

    // All serial I/O is blocking; the engine gets its own thread while the
    // runtime keeps signals and the upload worker responsive.
    tokio::task::spawn_blocking(move || engine.run())
        .await
        .context("engine thread panicked")??;

    info!("wxdaqd stopped");
    Ok(())
}

fn spawn_signal_handlers(flags: EngineFlags) {
    let shutdown_flags = flags.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down after the current phase");
            shutdown_flags.request_shutdown();
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut hangup) = signal(SignalKind::hangup()) else {
            warn!("Could not install SIGHUP handler");
            return;
        };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, restarting engine");
            flags.request_restart();
        }
    });
}
