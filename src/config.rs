//! Configuration loading for the daemon.
//!
//! Settings are loaded from a TOML file merged with environment variables
//! (prefixed with `WXDAQ_`), then validated. Example:
//!
//! ```text
//! WXDAQ_STATION_PORT=/dev/ttyUSB1
//! WXDAQ_APPLICATION_LOG_LEVEL=debug
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{WxError, WxResult};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Weather station (console) settings
    pub station: StationConfig,
    /// Time synchronization service settings
    #[serde(default)]
    pub timesync: TimeSyncConfig,
    /// RESTful uploader settings
    #[serde(default)]
    pub uploader: UploaderConfig,
    /// Database paths handed to the store collaborators
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Serial console configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate of the console port
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// How long to wait for a response before giving up on a read
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
    /// Pause between wake-up / retry attempts
    #[serde(with = "humantime_serde", default = "default_wait_before_retry")]
    pub wait_before_retry: Duration,
    /// How many times to retry an exchange before giving up
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    /// Seconds to wait after an archive record is due before fetching it
    #[serde(default = "default_archive_delay")]
    pub archive_delay_secs: i64,
    /// Station number of the ISS transmitter
    #[serde(default = "default_iss_id")]
    pub iss_id: u32,
    /// Console model: 1 = original VantagePro, 2 = VantagePro2
    #[serde(default = "default_model_type")]
    pub model_type: u32,
    /// Unit system the console reports in (1 = US customary, the only
    /// system supported)
    #[serde(default = "default_unit_system")]
    pub unit_system: u8,
    /// LOOP packets requested per acquisition. The console has an
    /// undocumented cap around 220, so stay under it.
    #[serde(default = "default_loop_request_batch")]
    pub loop_request_batch: u32,
}

/// Time synchronization service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSyncConfig {
    /// How often to compare the console clock against the host
    #[serde(with = "humantime_serde", default = "default_clock_check")]
    pub clock_check: Duration,
    /// Clock error below which no correction is sent, in seconds
    #[serde(default = "default_max_drift")]
    pub max_drift_secs: f64,
}

/// RESTful uploader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// Whether the uploader service is registered at all
    #[serde(default)]
    pub enabled: bool,
    /// Bounded FIFO capacity for pending archive timestamps
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Paths handed to the archive/stats store collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Archive database path
    #[serde(default = "default_archive_db")]
    pub archive: PathBuf,
    /// Statistics database path
    #[serde(default = "default_stats_db")]
    pub stats: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            clock_check: default_clock_check(),
            max_drift_secs: default_max_drift(),
        }
    }
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            archive: default_archive_db(),
            stats: default_stats_db(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    19200
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_wait_before_retry() -> Duration {
    Duration::from_millis(1200)
}

fn default_max_tries() -> u32 {
    4
}

fn default_archive_delay() -> i64 {
    15
}

fn default_iss_id() -> u32 {
    1
}

fn default_model_type() -> u32 {
    2
}

fn default_unit_system() -> u8 {
    1
}

fn default_loop_request_batch() -> u32 {
    200
}

fn default_clock_check() -> Duration {
    Duration::from_secs(4 * 3600)
}

fn default_max_drift() -> f64 {
    5.0
}

fn default_queue_capacity() -> usize {
    32
}

fn default_archive_db() -> PathBuf {
    PathBuf::from("archive/wxdaq.sdb")
}

fn default_stats_db() -> PathBuf {
    PathBuf::from("archive/stats.sdb")
}

impl Settings {
    /// Load configuration from a TOML file merged with `WXDAQ_` environment
    /// overrides, then validate it.
    pub fn from_path<P: AsRef<Path>>(path: P) -> WxResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("WXDAQ_").split("_"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> WxResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(WxError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.station.port.is_empty() {
            return Err(WxError::Configuration(
                "station.port cannot be empty".to_string(),
            ));
        }

        let valid_bauds = [1200, 2400, 4800, 9600, 14400, 19200];
        if !valid_bauds.contains(&self.station.baud_rate) {
            return Err(WxError::Configuration(format!(
                "Invalid baud_rate {}. The console supports: 1200, 2400, 4800, 9600, 14400, 19200",
                self.station.baud_rate
            )));
        }

        if !(1..=8).contains(&self.station.iss_id) {
            return Err(WxError::Configuration(format!(
                "Invalid iss_id {}. Transmitter IDs are 1-8",
                self.station.iss_id
            )));
        }

        if !matches!(self.station.model_type, 1 | 2) {
            return Err(WxError::Configuration(format!(
                "Invalid model_type {}. Must be 1 (VantagePro) or 2 (VantagePro2)",
                self.station.model_type
            )));
        }

        if self.station.max_tries == 0 {
            return Err(WxError::Configuration(
                "station.max_tries must be at least 1".to_string(),
            ));
        }

        if self.station.loop_request_batch == 0 || self.station.loop_request_batch > 220 {
            return Err(WxError::Configuration(format!(
                "Invalid loop_request_batch {}. The console stops streaming around 220 packets",
                self.station.loop_request_batch
            )));
        }

        Ok(())
    }
}
