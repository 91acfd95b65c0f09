/*!
 * Engine configuration
 *
 * Every tunable of the transfer engine lives here. Values load from TOML;
 * any section or field left out falls back to its default.
 */

use std::path::{Path, PathBuf};
use std::time::Duration;

use cumulus_core_resilience::{BackoffPolicy, BackpressureConfig};
use serde::{Deserialize, Serialize};

use crate::crypto::MAC_BLOCK_SIZE;
use crate::error::{Result, TransferError};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub chunks: ChunkConfig,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub raid: RaidConfig,
    pub sink: SinkConfig,
    pub upload: UploadConfig,
    pub integrity: IntegrityConfig,
    pub logging: LoggingConfig,
}

/// Work queue concurrency
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Concurrent download tasks
    pub download_limit: usize,

    /// Concurrent upload tasks
    pub upload_limit: usize,

    /// Consecutive invalid entries inspected before a scan yields
    pub empty_scan_cap: usize,

    /// Delay before re-scanning after a yielded scan
    pub empty_scan_delay_ms: u64,

    /// Let a nearly-finished chunk free its slot early
    pub early_release: bool,

    /// Estimated time-to-finish under which a chunk may release early
    pub early_release_threshold_ms: u64,

    /// Upper bound on temporarily added slots
    pub max_expansion: usize,

    /// Minimum interval between progress events for one transfer
    pub progress_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            download_limit: 4,
            upload_limit: 4,
            empty_scan_cap: 64,
            empty_scan_delay_ms: 350,
            early_release: true,
            early_release_threshold_ms: 250,
            max_expansion: 4,
            progress_interval_ms: 250,
        }
    }
}

/// Chunk sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkConfig {
    /// First chunk size; later chunks grow from here
    pub initial_size: u64,

    /// Multiplier applied after each chunk
    pub growth_factor: u64,

    /// Ceiling for chunk growth
    pub max_size: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            initial_size: 128 * 1024,
            growth_factor: 2,
            max_size: 16 * 1024 * 1024,
        }
    }
}

/// Retry ceilings and backoff curves
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per chunk before the transfer fails
    pub chunk_retry_limit: u32,

    pub chunk_backoff_initial_ms: u64,
    pub chunk_backoff_max_ms: u64,

    /// Attempts at acquiring URLs or upload tickets
    pub url_retry_limit: u32,

    pub url_backoff_initial_ms: u64,
    pub url_backoff_max_ms: u64,
    pub url_backoff_factor: f64,

    /// Port tried when the default one keeps failing
    pub alternate_port: u16,

    /// Consecutive failures of a transfer before flipping ports
    pub port_switch_after: u32,

    /// Delay before retrying after quota runs out with no hint from the backend
    pub overquota_retry_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            chunk_retry_limit: 12,
            chunk_backoff_initial_ms: 1_000,
            chunk_backoff_max_ms: 15_000,
            url_retry_limit: 30,
            url_backoff_initial_ms: 1_000,
            url_backoff_max_ms: 300_000,
            url_backoff_factor: 2.0,
            alternate_port: 8080,
            port_switch_after: 2,
            overquota_retry_ms: 0,
        }
    }
}

impl RetryConfig {
    pub fn chunk_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::linear(
            Duration::from_millis(self.chunk_backoff_initial_ms),
            Duration::from_millis(self.chunk_backoff_max_ms),
        )
    }

    pub fn url_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::exponential(
            Duration::from_millis(self.url_backoff_initial_ms),
            Duration::from_millis(self.url_backoff_max_ms),
            self.url_backoff_factor,
        )
    }

    /// Automatic overquota release; `None` waits for an explicit clear.
    pub fn overquota_retry(&self) -> Option<Duration> {
        (self.overquota_retry_ms > 0).then(|| Duration::from_millis(self.overquota_retry_ms))
    }
}

/// Network deadlines
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Whole-chunk request deadline
    pub chunk_request_ms: u64,

    /// Longest silence tolerated on a single RAID part stream
    pub raid_part_stall_ms: u64,

    /// Deadline for one upload POST
    pub upload_post_ms: u64,

    /// Deadline for backend API calls
    pub api_call_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            chunk_request_ms: 120_000,
            raid_part_stall_ms: 60_000,
            upload_post_ms: 120_000,
            api_call_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn chunk_request(&self) -> Duration {
        Duration::from_millis(self.chunk_request_ms)
    }

    pub fn raid_part_stall(&self) -> Duration {
        Duration::from_millis(self.raid_part_stall_ms)
    }

    pub fn upload_post(&self) -> Duration {
        Duration::from_millis(self.upload_post_ms)
    }

    pub fn api_call(&self) -> Duration {
        Duration::from_millis(self.api_call_ms)
    }
}

/// CloudRAID fetch policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RaidConfig {
    /// Part failures tolerated within one chunk
    pub failure_ceiling: u32,

    /// Part statuses that trigger a channel swap instead of failing the chunk
    pub retryable_statuses: Vec<u16>,
}

impl Default for RaidConfig {
    fn default() -> Self {
        Self {
            failure_ceiling: 3,
            retryable_statuses: vec![408, 500, 502, 503, 504],
        }
    }
}

/// Output sink behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SinkConfig {
    /// Files smaller than this never persist resume state
    pub resumable_threshold: u64,

    /// Pending writes at which the queue is throttled
    pub throttle_pause_at: u64,

    /// Pending writes at which the throttle lifts
    pub throttle_resume_at: u64,

    /// Pending bytes at which the queue is throttled
    pub throttle_pause_bytes: u64,

    /// Write attempts before falling back to an in-memory target
    pub io_retry_limit: u32,

    pub io_backoff_ms: u64,

    /// Suffix of the in-progress file next to the destination
    pub partial_suffix: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            resumable_threshold: 1024 * 1024,
            throttle_pause_at: 6,
            throttle_resume_at: 2,
            throttle_pause_bytes: 256 * 1024 * 1024,
            io_retry_limit: 3,
            io_backoff_ms: 500,
            partial_suffix: ".cumulus-part".to_string(),
        }
    }
}

impl SinkConfig {
    pub fn backpressure(&self) -> BackpressureConfig {
        BackpressureConfig {
            pause_at_count: self.throttle_pause_at,
            resume_at_count: self.throttle_resume_at,
            pause_at_bytes: self.throttle_pause_bytes,
        }
    }
}

/// Upload pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    /// Encrypted buffers prepared ahead of the network
    pub read_ahead_depth: usize,

    /// Append the ciphertext checksum to chunk URLs
    pub checksum_suffix: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            read_ahead_depth: 31,
            checksum_suffix: true,
        }
    }
}

/// MAC verification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Longest run of blocks a gap search may exclude
    pub gap_max_window: usize,

    /// How far from the tail the gap search looks
    pub gap_search_depth: usize,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            gap_max_window: 4,
            gap_search_depth: 32,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level
    pub level: LogLevel,

    /// Log file path (None = stderr)
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for level = debug)
    pub verbose: bool,
}

/// Logging level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(contents).map_err(|e| TransferError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TransferError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| TransferError::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Deterministic settings for tests: no early release, no overquota timer.
    pub fn strict() -> Self {
        let mut config = Self::default();
        config.queue.early_release = false;
        config
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(TransferError::Config(msg.to_string()));

        if self.queue.download_limit == 0 || self.queue.upload_limit == 0 {
            return fail("queue limits must be at least 1");
        }
        if self.queue.empty_scan_cap == 0 {
            return fail("queue.empty_scan_cap must be at least 1");
        }
        if self.chunks.initial_size == 0 || self.chunks.initial_size % MAC_BLOCK_SIZE != 0 {
            return fail("chunks.initial_size must be a non-zero multiple of the MAC block size");
        }
        if self.chunks.max_size < self.chunks.initial_size
            || self.chunks.max_size % MAC_BLOCK_SIZE != 0
        {
            return fail("chunks.max_size must be a multiple of the MAC block size and >= initial_size");
        }
        if self.chunks.growth_factor == 0 {
            return fail("chunks.growth_factor must be at least 1");
        }
        if self.sink.throttle_resume_at >= self.sink.throttle_pause_at {
            return fail("sink.throttle_resume_at must be below sink.throttle_pause_at");
        }
        if self.upload.read_ahead_depth == 0 {
            return fail("upload.read_ahead_depth must be at least 1");
        }
        if self.raid.failure_ceiling == 0 {
            return fail("raid.failure_ceiling must be at least 1");
        }
        if self.integrity.gap_search_depth < self.integrity.gap_max_window {
            return fail("integrity.gap_search_depth must cover gap_max_window");
        }
        if !self.retry.url_backoff_factor.is_finite() || self.retry.url_backoff_factor < 1.0 {
            return fail("retry.url_backoff_factor must be >= 1.0");
        }
        Ok(())
    }

    /// Default directory for persisted resume records
    pub fn default_state_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("cumulus")
            .join("resume")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.queue.download_limit, 4);
        assert_eq!(config.queue.upload_limit, 4);
        assert_eq!(config.timeouts.chunk_request(), Duration::from_secs(120));
        assert_eq!(config.timeouts.raid_part_stall(), Duration::from_secs(60));
        assert_eq!(config.raid.failure_ceiling, 3);
        assert_eq!(config.retry.chunk_retry_limit, 12);
        assert_eq!(config.sink.resumable_threshold, 1024 * 1024);
        assert_eq!(config.upload.read_ahead_depth, 31);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_curves() {
        let retry = RetryConfig::default();
        let chunk = retry.chunk_backoff();
        assert_eq!(chunk.delay_for(1), Duration::from_secs(1));
        assert_eq!(chunk.delay_for(3), Duration::from_secs(3));
        assert_eq!(chunk.delay_for(40), Duration::from_secs(15));

        let url = retry.url_backoff();
        assert_eq!(url.delay_for(1), Duration::from_secs(1));
        assert_eq!(url.delay_for(2), Duration::from_secs(2));
        assert_eq!(url.delay_for(30), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_toml() {
        let toml_str = r#"
            [queue]
            download_limit = 8

            [chunks]
            initial_size = 1048576
            max_size = 1048576

            [logging]
            level = "debug"
        "#;
        let config = EngineConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.queue.download_limit, 8);
        assert_eq!(config.queue.upload_limit, 4);
        assert_eq!(config.chunks.initial_size, 1024 * 1024);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_validation_rejects_unaligned_chunks() {
        let toml_str = r#"
            [chunks]
            initial_size = 1000
        "#;
        assert!(matches!(
            EngineConfig::from_toml_str(toml_str),
            Err(TransferError::Config(_))
        ));
    }

    #[test]
    fn test_validation_rejects_inverted_throttle() {
        let mut config = EngineConfig::default();
        config.sink.throttle_resume_at = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cumulus.toml");
        let mut config = EngineConfig::strict();
        config.retry.overquota_retry_ms = 5_000;
        config.to_file(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(!loaded.queue.early_release);
        assert_eq!(loaded.retry.overquota_retry(), Some(Duration::from_secs(5)));
    }
}
