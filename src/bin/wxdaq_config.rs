//! Station and database configurator.
//!
//! One-shot maintenance actions that should not run while the daemon owns
//! the serial port: preparing the database locations, backfilling the
//! statistics store from the archive, and reconfiguring or clearing the
//! console itself.

use anyhow::Context;
use clap::Parser;
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use wxdaq::config::Settings;
use wxdaq::store::{ArchiveStore, MemoryArchiveStore, MemoryStatsStore, StatsStore};
use wxdaq::vantage::console::Console;
use wxdaq::vantage::transport::SerialOpener;

#[derive(Parser)]
#[command(
    name = "wxdaq_config",
    version,
    about = "Configure the wxdaq databases and the weather station"
)]
struct Args {
    /// Path to the configuration file
    config_path: PathBuf,

    /// Prepare the archive database location
    #[arg(long)]
    create_database: bool,

    /// Prepare the statistics database location
    #[arg(long)]
    create_stats: bool,

    /// Rebuild the statistics store from the archive
    #[arg(long)]
    backfill_stats: bool,

    /// Migrate the archive database to the current schema
    #[arg(long)]
    reconfig_database: bool,

    /// Write the configured archive interval to the station and clear its
    /// archive memory
    #[arg(long)]
    configure_station: bool,

    /// Archive interval in seconds for --configure-station
    #[arg(long, value_name = "SECONDS", default_value_t = 300)]
    archive_interval: u32,

    /// Clear the station's archive memory
    #[arg(long)]
    clear_station: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::from_path(&args.config_path)
        .with_context(|| format!("loading configuration {}", args.config_path.display()))?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&settings.application.log_level),
    )
    .init();

    if args.create_database {
        prepare_location(&settings.database.archive)?;
        info!(
            "Archive database location ready at {} (schema creation is the archive store's job)",
            settings.database.archive.display()
        );
    }

    if args.create_stats {
        prepare_location(&settings.database.stats)?;
        info!(
            "Statistics database location ready at {}",
            settings.database.stats.display()
        );
    }

    if args.reconfig_database {
        info!(
            "Schema migration of {} is delegated to the archive store",
            settings.database.archive.display()
        );
    }

    if args.backfill_stats {
        let archive: Arc<dyn ArchiveStore> = Arc::new(MemoryArchiveStore::new());
        let stats: Arc<dyn StatsStore> = Arc::new(MemoryStatsStore::new());
        let records = archive.records_since(0)?;
        for record in &records {
            stats.update(record)?;
        }
        info!("Backfilled statistics from {} archive record(s)", records.len());
    }

    if args.configure_station || args.clear_station {
        let opener = Arc::new(SerialOpener::new(
            &settings.station.port,
            settings.station.baud_rate,
            settings.station.timeout,
        ));
        let mut console = Console::new(settings.station.clone(), opener, 300);

        if args.configure_station {
            // Changing the interval invalidates the console's archive
            // memory, so both steps belong together.
            console.set_archive_interval(args.archive_interval)?;
            console.clear_log()?;
            info!(
                "Station configured with a {} second archive interval",
                args.archive_interval
            );
        } else {
            console.clear_log()?;
            info!("Station archive memory cleared");
        }
    }

    Ok(())
}

fn prepare_location(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    Ok(())
}
