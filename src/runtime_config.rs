//! # Runtime Configuration Module
//!
//! Environment-variable driven configuration for the engine's runtime behavior:
//! body decoding limits, response framing, connection management and the
//! background execution pool that resolves async results.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `BRRTE_SPILL_THRESHOLD` | `16384` | Bytes kept in memory before an upload spills to a temp file |
//! | `BRRTE_MAX_FORM_BYTES` | `2097152` | Upper bound for url-encoded form bodies |
//! | `BRRTE_TEMP_DIR` | system temp | Directory for spilled upload data |
//! | `BRRTE_MAX_HEAD_BYTES` | `16384` | Largest accepted request line + headers |
//! | `BRRTE_WRITE_CHUNK_BYTES` | `8192` | Chunk size used when streaming response bodies |
//! | `BRRTE_CONNECTION_POLICY` | `conventional` | `conventional` or `legacy` close scheduling |
//! | `BRRTE_ASYNC_WORKERS` | `4` | Worker coroutines in the background pool |
//! | `BRRTE_ASYNC_QUEUE_BOUND` | `1024` | Maximum queued async computations |
//! | `BRRTE_BACKPRESSURE_MODE` | `block` | `block` or `shed` when the queue is full |
//! | `BRRTE_BACKPRESSURE_TIMEOUT_MS` | `50` | How long `block` mode waits for room |
//! | `BRRTE_STACK_SIZE` | `0x10000` | Coroutine stack size, decimal or `0x` hex |
//!
//! Values that fail to parse fall back to their defaults.
//!
//! ## Usage
//!
//! ```rust
//! use brrtengine::runtime_config::EngineConfig;
//!
//! let config = EngineConfig::from_env();
//! println!("spill threshold: {} bytes", config.decoder.spill_threshold);
//! ```

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// How the pool reacts when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressureMode {
    /// Wait (coroutine sleep) up to the backpressure timeout for room.
    #[default]
    Block,
    /// Reject the submission immediately.
    Shed,
}

impl FromStr for BackpressureMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "shed" => Ok(Self::Shed),
            _ => Err(()),
        }
    }
}

/// Decides whether a connection is closed once a response has been written.
///
/// `Conventional` closes only when keep-alive was not requested. `Legacy`
/// inverts that: it closes after the body is flushed exactly when the client
/// asked for keep-alive, for peers that depend on that behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPolicy {
    #[default]
    Conventional,
    Legacy,
}

impl ConnectionPolicy {
    /// Whether to close after the response body has been written.
    #[must_use]
    pub fn close_after_write(self, keep_alive: bool) -> bool {
        match self {
            ConnectionPolicy::Conventional => !keep_alive,
            ConnectionPolicy::Legacy => keep_alive,
        }
    }
}

impl FromStr for ConnectionPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "conventional" => Ok(Self::Conventional),
            "legacy" => Ok(Self::Legacy),
            _ => Err(()),
        }
    }
}

/// Limits applied while decoding POST/PUT bodies.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// In-memory bytes per buffer before spilling to disk
    pub spill_threshold: usize,
    /// Url-encoded bodies larger than this are a decode fault
    pub max_form_bytes: usize,
    /// Where spilled data goes (`None` = system temp dir)
    pub temp_dir: Option<PathBuf>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            spill_threshold: 16 * 1024,
            max_form_bytes: 2 * 1024 * 1024,
            temp_dir: None,
        }
    }
}

/// Configuration for the background execution pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker coroutines
    pub num_workers: usize,
    /// Maximum queue depth
    pub queue_bound: usize,
    /// Backpressure mode
    pub backpressure_mode: BackpressureMode,
    /// Timeout for block mode in milliseconds
    pub backpressure_timeout_ms: u64,
    /// Stack size for worker coroutines
    pub stack_size: usize,
}

impl PoolConfig {
    #[must_use]
    pub fn new(
        num_workers: usize,
        queue_bound: usize,
        backpressure_mode: BackpressureMode,
        backpressure_timeout_ms: u64,
        stack_size: usize,
    ) -> Self {
        Self {
            num_workers,
            queue_bound,
            backpressure_mode,
            backpressure_timeout_ms,
            stack_size,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queue_bound: 1024,
            backpressure_mode: BackpressureMode::Block,
            backpressure_timeout_ms: 50,
            stack_size: 0x10000, // 64KB
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub decoder: DecoderConfig,
    pub pool: PoolConfig,
    /// Largest accepted request head (request line + headers)
    pub max_head_bytes: usize,
    /// Chunk size for streaming response bodies
    pub write_chunk_bytes: usize,
    pub connection_policy: ConnectionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            decoder: DecoderConfig::default(),
            pool: PoolConfig::default(),
            max_head_bytes: 16 * 1024,
            write_chunk_bytes: 8192,
            connection_policy: ConnectionPolicy::Conventional,
        }
    }
}

fn env_parsed<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse a size that may be given in decimal or `0x` hexadecimal.
pub(crate) fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x") {
        usize::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();

        let decoder = DecoderConfig {
            spill_threshold: env_parsed("BRRTE_SPILL_THRESHOLD")
                .unwrap_or(defaults.decoder.spill_threshold),
            max_form_bytes: env_parsed("BRRTE_MAX_FORM_BYTES")
                .unwrap_or(defaults.decoder.max_form_bytes),
            temp_dir: env::var("BRRTE_TEMP_DIR")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        };

        let pool = PoolConfig {
            num_workers: env_parsed::<usize>("BRRTE_ASYNC_WORKERS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.pool.num_workers),
            queue_bound: env_parsed::<usize>("BRRTE_ASYNC_QUEUE_BOUND")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.pool.queue_bound),
            backpressure_mode: env_parsed("BRRTE_BACKPRESSURE_MODE")
                .unwrap_or(defaults.pool.backpressure_mode),
            backpressure_timeout_ms: env_parsed("BRRTE_BACKPRESSURE_TIMEOUT_MS")
                .unwrap_or(defaults.pool.backpressure_timeout_ms),
            stack_size: env::var("BRRTE_STACK_SIZE")
                .ok()
                .and_then(|s| parse_size(&s))
                .unwrap_or(defaults.pool.stack_size),
        };

        EngineConfig {
            decoder,
            pool,
            max_head_bytes: env_parsed("BRRTE_MAX_HEAD_BYTES").unwrap_or(defaults.max_head_bytes),
            write_chunk_bytes: env_parsed::<usize>("BRRTE_WRITE_CHUNK_BYTES")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.write_chunk_bytes),
            connection_policy: env_parsed("BRRTE_CONNECTION_POLICY")
                .unwrap_or(defaults.connection_policy),
        }
    }
}
