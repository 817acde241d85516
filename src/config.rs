//! Typed runtime configuration.
//!
//! Parsing a configuration file format is out of scope (spec §1); this is
//! the typed struct an embedder fills in from whatever format they use,
//! validated the way the teacher validates `DownloadEngine::new`'s
//! concurrency argument rather than trusting the caller.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Minimum worker count per direction (spec §6).
pub const MIN_WORKERS: usize = 1;
/// Maximum worker count per direction (spec §6).
pub const MAX_WORKERS: usize = 50;
/// Default worker count per direction.
pub const DEFAULT_WORKERS: usize = 4;

/// Minimum files per temp sub-directory before it rolls over (spec §6).
pub const MIN_FILES_PER_DIRECTORY: u32 = 10;
/// Maximum files per temp sub-directory (spec §6).
pub const MAX_FILES_PER_DIRECTORY: u32 = 20_000;
/// Default files per temp sub-directory.
pub const DEFAULT_FILES_PER_DIRECTORY: u32 = 500;

/// Default low-water mark for the in-memory request queue (spec §4.4).
pub const DEFAULT_LOW_QUEUE_SIZE: usize = 50;
/// Default maximum in-memory queue depth (spec §6).
pub const DEFAULT_QUEUE_MAX_SIZE: usize = 5000;

/// Default bound on `CachedNetworkFile::read`'s wait for data (spec §4.3).
pub const DEFAULT_DATA_LOAD_WAIT: Duration = Duration::from_secs(20);
/// Default per-iteration poll sleep while waiting for data (spec §4.3).
pub const DEFAULT_DATA_POLL_SLEEP: Duration = Duration::from_millis(250);
/// Default bound on `CachedNetworkFile::write`'s wait for buffer space (spec §4.3).
pub const DEFAULT_WRITE_BUFFER_WAIT: Duration = Duration::from_secs(20);

/// Cooldown before a sequential-only file's warm state may expire (spec §4.3).
pub const SEQUENTIAL_EXPIRE_COOLDOWN: Duration = Duration::from_secs(3);
/// How long a file-state lingers warm after a request finishes processing (spec §4.4).
pub const REQUEST_PROCESSED_EXPIRE: Duration = Duration::from_secs(3);
/// Requeued requests below this in-memory queue depth get a backoff sleep (spec §4.4).
pub const DEFAULT_REQUEUE_MIN_SIZE: usize = 20;
/// Sleep applied before re-appending a `Requeue` verdict (spec §4.4).
pub const DEFAULT_REQUEUE_WAIT: Duration = Duration::from_millis(500);

/// Errors constructing a [`Config`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A worker-pool size fell outside `[MIN_WORKERS, MAX_WORKERS]`.
    #[error("invalid worker count {value} for {direction} pool: must be between {MIN_WORKERS} and {MAX_WORKERS}")]
    InvalidWorkerCount {
        /// Which pool the bad value was for ("read" or "write").
        direction: &'static str,
        /// The out-of-range value supplied.
        value: usize,
    },

    /// `max_files_per_directory` fell outside its documented range.
    #[error(
        "invalid maximum_files_per_directory {value}: must be between {MIN_FILES_PER_DIRECTORY} and {MAX_FILES_PER_DIRECTORY}"
    )]
    InvalidFilesPerDirectory {
        /// The out-of-range value supplied.
        value: u32,
    },

    /// `low_queue_size` was not strictly less than `queue_max_size`.
    #[error("low_queue_size {low} must be less than queue_max_size {max}")]
    LowWaterMarkTooHigh {
        /// The configured low-water mark.
        low: usize,
        /// The configured queue capacity.
        max: usize,
    },
}

/// Runtime configuration recognized by the core (spec §6).
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the temp-file tree. Required; no default.
    pub temp_directory: PathBuf,
    /// Read-worker pool size.
    read_workers: usize,
    /// Write-worker pool size.
    write_workers: usize,
    /// Files per rolling temp sub-directory before a new `ldrN` is opened.
    max_files_per_directory: u32,
    /// Maximum in-memory request queue depth.
    queue_max_size: usize,
    /// In-memory queue depth below which a queue loader refills.
    low_queue_size: usize,
    /// Bound on `read()`'s total wait for data.
    pub data_load_wait: Duration,
    /// Per-iteration poll sleep while waiting for data.
    pub data_poll_sleep: Duration,
    /// Bound on `write()`'s wait for buffer space under backpressure.
    pub write_buffer_wait: Duration,
    /// How often the database-online probe runs.
    pub online_check_interval: Duration,
    /// Verbose tracing toggle (maps to the teacher's `Debug` option).
    pub debug: bool,
}

impl Config {
    /// Creates a configuration rooted at `temp_directory`, validating every
    /// field against spec §6's documented ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a worker count, files-per-directory value,
    /// or low/high queue-size pairing is out of range.
    pub fn new(temp_directory: PathBuf) -> std::result::Result<Self, ConfigError> {
        Self {
            temp_directory,
            read_workers: DEFAULT_WORKERS,
            write_workers: DEFAULT_WORKERS,
            max_files_per_directory: DEFAULT_FILES_PER_DIRECTORY,
            queue_max_size: DEFAULT_QUEUE_MAX_SIZE,
            low_queue_size: DEFAULT_LOW_QUEUE_SIZE,
            data_load_wait: DEFAULT_DATA_LOAD_WAIT,
            data_poll_sleep: DEFAULT_DATA_POLL_SLEEP,
            write_buffer_wait: DEFAULT_WRITE_BUFFER_WAIT,
            online_check_interval: Duration::from_secs(60),
            debug: false,
        }
        .validate()
    }

    fn validate(self) -> std::result::Result<Self, ConfigError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.read_workers) {
            return Err(ConfigError::InvalidWorkerCount {
                direction: "read",
                value: self.read_workers,
            });
        }
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.write_workers) {
            return Err(ConfigError::InvalidWorkerCount {
                direction: "write",
                value: self.write_workers,
            });
        }
        if !(MIN_FILES_PER_DIRECTORY..=MAX_FILES_PER_DIRECTORY)
            .contains(&self.max_files_per_directory)
        {
            return Err(ConfigError::InvalidFilesPerDirectory {
                value: self.max_files_per_directory,
            });
        }
        if self.low_queue_size >= self.queue_max_size {
            return Err(ConfigError::LowWaterMarkTooHigh {
                low: self.low_queue_size,
                max: self.queue_max_size,
            });
        }
        Ok(self)
    }

    /// Sets both worker-pool sizes from the teacher-style `"R:W"` shorthand,
    /// e.g. `ThreadPoolSize = "4:4"`, or a bare `"N"` applying to both.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidWorkerCount`] if either value is out of
    /// range, after parsing.
    pub fn with_thread_pool_size(mut self, spec: &str) -> std::result::Result<Self, ConfigError> {
        let (read, write) = match spec.split_once(':') {
            Some((r, w)) => (
                r.trim().parse().unwrap_or(DEFAULT_WORKERS),
                w.trim().parse().unwrap_or(DEFAULT_WORKERS),
            ),
            None => {
                let n = spec.trim().parse().unwrap_or(DEFAULT_WORKERS);
                (n, n)
            }
        };
        self.read_workers = read;
        self.write_workers = write;
        self.validate()
    }

    /// Sets `MaximumFilesPerDirectory`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidFilesPerDirectory`] if out of range.
    pub fn with_max_files_per_directory(
        mut self,
        value: u32,
    ) -> std::result::Result<Self, ConfigError> {
        self.max_files_per_directory = value;
        self.validate()
    }

    /// Sets the in-memory queue's capacity and low-water mark.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::LowWaterMarkTooHigh`] if `low >= max`.
    pub fn with_queue_sizes(
        mut self,
        max: usize,
        low: usize,
    ) -> std::result::Result<Self, ConfigError> {
        self.queue_max_size = max;
        self.low_queue_size = low;
        self.validate()
    }

    /// Read-worker pool size.
    #[must_use]
    pub fn read_workers(&self) -> usize {
        self.read_workers
    }

    /// Write-worker pool size.
    #[must_use]
    pub fn write_workers(&self) -> usize {
        self.write_workers
    }

    /// Maximum files per rolling temp sub-directory.
    #[must_use]
    pub fn max_files_per_directory(&self) -> u32 {
        self.max_files_per_directory
    }

    /// Maximum in-memory request queue depth.
    #[must_use]
    pub fn queue_max_size(&self) -> usize {
        self.queue_max_size
    }

    /// Low-water mark that triggers a queue-loader refill.
    #[must_use]
    pub fn low_queue_size(&self) -> usize {
        self.low_queue_size
    }
}
