//! The acquisition engine.
//!
//! A single control thread pumps SETUP → LOOP → ARCHIVE → LOOP → … and
//! fans every packet out to the registered services in order. Within one
//! archive interval, all LOOP packets are delivered before the archive
//! record covering that interval; archive records are delivered in
//! strictly increasing timestamp order (the dump enforces it).
//!
//! Fault policy: transient console I/O backs off and restarts the cycle, a
//! port-level failure (typically a competing serial client) backs off
//! shorter, SIGHUP restarts cleanly, and anything else terminates.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::Settings;
use crate::error::{WxError, WxResult};
use crate::service::{
    ArchivePersister, RestUploader, Service, ServiceContext, StatsUpdater, TimeSync,
};
use crate::store::{ArchiveStore, StatsStore};
use crate::vantage::console::Console;

/// Backoff after a transient console fault.
const IO_RETRY_WAIT: Duration = Duration::from_secs(60);
/// Backoff when the port itself cannot be opened.
const PORT_RETRY_WAIT: Duration = Duration::from_secs(10);

/// Why a cycle ended without an error.
enum CycleOutcome {
    Shutdown,
    Restart,
}

/// Control flags the signal handlers flip.
#[derive(Clone, Default)]
pub struct EngineFlags {
    shutdown: Arc<AtomicBool>,
    restart: Arc<AtomicBool>,
}

impl EngineFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::SeqCst);
    }

    fn take_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn take_restart(&self) -> bool {
        self.restart.swap(false, Ordering::SeqCst)
    }
}

pub struct Engine {
    console: Console,
    services: Vec<Box<dyn Service>>,
    ctx: ServiceContext,
    flags: EngineFlags,
}

impl Engine {
    /// Build an engine with the stock service chain in its declared
    /// order: archive persister, stats updater, time sync, and (when
    /// enabled) the RESTful uploader.
    pub fn new(
        settings: Arc<Settings>,
        console: Console,
        archive: Arc<dyn ArchiveStore>,
        stats: Arc<dyn StatsStore>,
        runtime: tokio::runtime::Handle,
        flags: EngineFlags,
    ) -> Self {
        let mut services: Vec<Box<dyn Service>> = vec![
            Box::new(ArchivePersister::new()),
            Box::new(StatsUpdater::new()),
            Box::new(TimeSync::new()),
        ];
        if settings.uploader.enabled {
            services.push(Box::new(RestUploader::new()));
        }
        let ctx = ServiceContext {
            settings,
            archive,
            stats,
            runtime,
        };
        Self {
            console,
            services,
            ctx,
            flags,
        }
    }

    /// Append a service after the stock chain.
    pub fn register(&mut self, service: Box<dyn Service>) {
        self.services.push(service);
    }

    /// Run until shutdown is requested. Transient faults back off and
    /// restart; programming errors terminate.
    pub fn run(&mut self) -> WxResult<()> {
        loop {
            match self.run_cycle() {
                Ok(CycleOutcome::Shutdown) => {
                    info!("Shutdown requested, stopping engine");
                    self.shut_down_services();
                    return Ok(());
                }
                Ok(CycleOutcome::Restart) => {
                    info!("Restarting engine");
                    self.shut_down_services();
                }
                Err(WxError::Serial(e)) => {
                    // Typically another process has the port open.
                    warn!(
                        "Serial port unavailable ({}); retrying in {:?}",
                        e, PORT_RETRY_WAIT
                    );
                    self.shut_down_services();
                    thread::sleep(PORT_RETRY_WAIT);
                }
                Err(e) if e.is_transient() || matches!(e, WxError::RetriesExceeded { .. }) => {
                    warn!("Console I/O fault ({}); retrying in {:?}", e, IO_RETRY_WAIT);
                    self.shut_down_services();
                    thread::sleep(IO_RETRY_WAIT);
                }
                Err(e) => {
                    error!("Unrecoverable engine error: {}", e);
                    self.shut_down_services();
                    return Err(e);
                }
            }
        }
    }

    /// One SETUP followed by alternating LOOP/ARCHIVE phases.
    fn run_cycle(&mut self) -> WxResult<CycleOutcome> {
        self.setup()?;
        loop {
            if self.flags.take_shutdown() {
                return Ok(CycleOutcome::Shutdown);
            }
            if self.flags.take_restart() {
                return Ok(CycleOutcome::Restart);
            }
            self.loop_phase()?;
            if self.flags.take_shutdown() {
                return Ok(CycleOutcome::Shutdown);
            }
            self.archive_phase()?;
        }
    }

    /// Adopt the console's archive interval, run every service's setup
    /// hook, then catch up on archive records so any gap from downtime is
    /// filled before the first live packet is dispatched.
    fn setup(&mut self) -> WxResult<()> {
        let interval = self.console.refresh_archive_interval()?;
        info!("Console archive interval is {} seconds", interval);

        for service in &mut self.services {
            debug!("Setting up service '{}'", service.name());
            service.setup(&self.ctx)?;
        }

        self.archive_phase()
    }

    fn loop_phase(&mut self) -> WxResult<()> {
        for service in &mut self.services {
            service.preloop(&mut self.console)?;
        }

        let mut stream = self.console.loop_stream();
        debug!("LOOP phase until {}", stream.next_archive_ts());
        while let Some(item) = stream.next() {
            let packet = item?;
            for service in &mut self.services {
                service.new_loop_packet(&packet)?;
            }
            if self.flags.take_shutdown() {
                break;
            }
        }
        Ok(())
    }

    fn archive_phase(&mut self) -> WxResult<()> {
        let since = self.ctx.archive.last_timestamp()?.unwrap_or(0);
        let mut new_records = 0u32;

        let mut dump = self.console.archive_dump(since)?;
        while let Some(item) = dump.next() {
            let record = item?;
            for service in &mut self.services {
                service.new_archive_record(&record)?;
            }
            new_records += 1;
        }
        drop(dump);

        if new_records > 0 {
            info!("Fetched {} archive record(s) since {}", new_records, since);
        }
        for service in &mut self.services {
            service.process_archive_data()?;
        }
        Ok(())
    }

    fn shut_down_services(&mut self) {
        for service in &mut self.services {
            if let Err(e) = service.shut_down() {
                warn!("Service '{}' failed to shut down: {}", service.name(), e);
            }
        }
    }
}
