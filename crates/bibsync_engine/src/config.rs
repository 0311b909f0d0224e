//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Default API location.
pub const DEFAULT_API_URL: &str = "https://api.zotero.org";

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Id of the user whose libraries are synced.
    pub user_id: u64,
    /// Base URL of the Web API.
    pub api_base_url: String,
    /// API key sent with every request.
    pub api_key: Option<String>,
    /// Largest number of objects fetched per request.
    pub download_batch_size: usize,
    /// Size of the first fetch batch of an object type; batches double from here.
    pub initial_download_batch_size: usize,
    /// Largest number of objects submitted per write request.
    pub write_batch_size: usize,
    /// Largest number of keys deleted per local transaction.
    pub deletion_batch_size: usize,
    /// Backoff before an object marked for resync is fetched again, by retry count.
    pub delay_intervals: Vec<Duration>,
    /// How many times a library pass restarts after remote version changes.
    pub max_version_mismatch_retries: u32,
    /// How many libraries sync concurrently.
    pub max_concurrent_libraries: usize,
    /// How many attachment uploads run concurrently.
    pub max_concurrent_uploads: usize,
    /// Whether remote data overwrites local edits on conflict.
    pub prefer_remote_data: bool,
    /// Whether attachment files are stored on WebDAV instead of Zotero storage.
    pub webdav_enabled: bool,
    /// Whether group libraries are synced.
    pub sync_groups: bool,
    /// Retry configuration for transient failures.
    pub retry: RetryConfig,
    /// Request timeout.
    pub timeout: Duration,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(user_id: u64) -> Self {
        Self {
            user_id,
            api_base_url: DEFAULT_API_URL.into(),
            api_key: None,
            download_batch_size: 50,
            initial_download_batch_size: 5,
            write_batch_size: 50,
            deletion_batch_size: 500,
            delay_intervals: default_delay_intervals(),
            max_version_mismatch_retries: 3,
            max_concurrent_libraries: 2,
            max_concurrent_uploads: 4,
            prefer_remote_data: false,
            webdav_enabled: false,
            sync_groups: true,
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the API base URL.
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    /// Sets the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the download batch size.
    pub fn with_download_batch_size(mut self, size: usize) -> Self {
        self.download_batch_size = size.max(1);
        self
    }

    /// Sets the write batch size.
    pub fn with_write_batch_size(mut self, size: usize) -> Self {
        self.write_batch_size = size.max(1);
        self
    }

    /// Sets the deletion sub-batch size.
    pub fn with_deletion_batch_size(mut self, size: usize) -> Self {
        self.deletion_batch_size = size.max(1);
        self
    }

    /// Sets the resync backoff intervals.
    pub fn with_delay_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.delay_intervals = intervals;
        self
    }

    /// Sets how many times a library pass may restart.
    pub fn with_max_version_mismatch_retries(mut self, retries: u32) -> Self {
        self.max_version_mismatch_retries = retries;
        self
    }

    /// Sets how many libraries sync concurrently.
    pub fn with_max_concurrent_libraries(mut self, limit: usize) -> Self {
        self.max_concurrent_libraries = limit.max(1);
        self
    }

    /// Sets how many uploads run concurrently.
    pub fn with_max_concurrent_uploads(mut self, limit: usize) -> Self {
        self.max_concurrent_uploads = limit.max(1);
        self
    }

    /// Sets whether remote data wins conflicts.
    pub fn with_prefer_remote_data(mut self, prefer: bool) -> Self {
        self.prefer_remote_data = prefer;
        self
    }

    /// Sets whether attachment files go to WebDAV.
    pub fn with_webdav(mut self, enabled: bool) -> Self {
        self.webdav_enabled = enabled;
        self
    }

    /// Sets whether group libraries are synced.
    pub fn with_sync_groups(mut self, enabled: bool) -> Self {
        self.sync_groups = enabled;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the resync delay after `retries` consecutive resync marks.
    pub fn resync_delay(&self, retries: u32) -> Duration {
        if self.delay_intervals.is_empty() {
            return Duration::ZERO;
        }
        let index = (retries.max(1) as usize - 1).min(self.delay_intervals.len() - 1);
        self.delay_intervals[index]
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(0)
    }
}

/// One minute, growing fourfold per retry, capped at a day.
fn default_delay_intervals() -> Vec<Duration> {
    let mut intervals = Vec::new();
    let mut seconds = 60u64;
    while seconds < 86_400 {
        intervals.push(Duration::from_secs(seconds));
        seconds *= 4;
    }
    intervals.push(Duration::from_secs(86_400));
    intervals
}

/// Backoff applied before a library pass is restarted.
///
/// The number of restarts is bounded by
/// [`SyncConfig::max_version_mismatch_retries`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that restarts without waiting.
    pub fn no_retry() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}
