//! Reader configuration
//!
//! The defaults suit most COGs. Every knob can also be set through the
//! environment, which is what [`CogReader::open`](crate::CogReader::open) uses:
//! - `COG_MAX_CONCURRENCY` - decode worker threads (0 = one per CPU core)
//! - `COG_HTTP_TIMEOUT_SECS` - timeout for each HTTP request
//! - `COG_HEADER_PREFETCH_BYTES` - bytes fetched up front to parse the IFDs

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HEADER_PREFETCH_BYTES: usize = 16 * 1024;

/// Tuning options shared by the CPU and GPU readers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Maximum number of tiles fetched and decoded at once (0 = auto-detect).
    pub max_concurrency: usize,
    /// Timeout applied to each HTTP request.
    pub http_timeout: Duration,
    /// Size of the file prefix fetched once and reused while walking IFDs.
    pub header_prefetch_bytes: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            header_prefetch_bytes: DEFAULT_HEADER_PREFETCH_BYTES,
        }
    }
}

impl ReaderConfig {
    /// Defaults overridden by `COG_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `COG_*` name.
    /// Unparsable values are logged and ignored.
    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(threads) = parse_var::<usize>(&lookup, "COG_MAX_CONCURRENCY") {
            config.max_concurrency = threads;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "COG_HTTP_TIMEOUT_SECS") {
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse_var::<usize>(&lookup, "COG_HEADER_PREFETCH_BYTES") {
            config.header_prefetch_bytes = bytes;
        }
        config
    }

    /// Set the maximum number of concurrent tile tasks.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Set the per-request HTTP timeout.
    #[must_use]
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Set how many leading bytes are prefetched for IFD parsing.
    #[must_use]
    pub fn with_header_prefetch_bytes(mut self, bytes: usize) -> Self {
        self.header_prefetch_bytes = bytes;
        self
    }

    /// Number of worker threads actually used.
    #[must_use]
    pub fn effective_concurrency(&self) -> usize {
        if self.max_concurrency == 0 {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4)
        } else {
            self.max_concurrency
        }
    }
}

fn parse_var<T: FromStr>(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}
