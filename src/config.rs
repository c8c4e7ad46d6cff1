//! Server configuration loaded from environment variables.
//!
//! Every knob has a default, so an empty environment yields a working
//! in-memory server on port 3000. `main` loads `.env` first via `dotenvy`.

use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_PRIVATE_CANVAS_SIZE: u32 = 32;
const DEFAULT_MAX_CANVAS_DIM: u32 = 512;
const DEFAULT_MAX_HISTORY_BATCH: usize = 4096;
const DEFAULT_MAX_CHAT_LENGTH: usize = 500;
const DEFAULT_CANVAS_FLUSH_INTERVAL_MS: u64 = 1000;

const DEFAULT_HISTORY_PERSIST_QUEUE_CAPACITY: usize = 8192;
const DEFAULT_HISTORY_PERSIST_BATCH_SIZE: usize = 128;
const DEFAULT_HISTORY_PERSIST_FLUSH_MS: u64 = 5;
const DEFAULT_HISTORY_PERSIST_RETRIES: usize = 2;
const DEFAULT_HISTORY_PERSIST_RETRY_BASE_MS: u64 = 20;

/// Parse `key` from the environment, falling back to `default` when unset or
/// malformed.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Tuning knobs for the history persistence worker.
#[derive(Debug, Clone, Copy)]
pub struct HistoryPersistConfig {
    /// Bounded channel capacity for queued history records.
    pub queue_capacity: usize,
    /// Maximum records written per batch.
    pub batch_size: usize,
    /// How long to wait for the batch to fill before flushing, in milliseconds.
    pub flush_ms: u64,
    /// Attempts per batch before it is dropped.
    pub retries: usize,
    /// Base delay in milliseconds for linear retry back-off.
    pub retry_base_ms: u64,
}

impl HistoryPersistConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            queue_capacity: env_parse("HISTORY_PERSIST_QUEUE_CAPACITY", DEFAULT_HISTORY_PERSIST_QUEUE_CAPACITY).max(1),
            batch_size: env_parse("HISTORY_PERSIST_BATCH_SIZE", DEFAULT_HISTORY_PERSIST_BATCH_SIZE).max(1),
            flush_ms: env_parse("HISTORY_PERSIST_FLUSH_MS", DEFAULT_HISTORY_PERSIST_FLUSH_MS).max(1),
            retries: env_parse("HISTORY_PERSIST_RETRIES", DEFAULT_HISTORY_PERSIST_RETRIES).max(1),
            retry_base_ms: env_parse("HISTORY_PERSIST_RETRY_BASE_MS", DEFAULT_HISTORY_PERSIST_RETRY_BASE_MS),
        }
    }
}

impl Default for HistoryPersistConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_HISTORY_PERSIST_QUEUE_CAPACITY,
            batch_size: DEFAULT_HISTORY_PERSIST_BATCH_SIZE,
            flush_ms: DEFAULT_HISTORY_PERSIST_FLUSH_MS,
            retries: DEFAULT_HISTORY_PERSIST_RETRIES,
            retry_base_ms: DEFAULT_HISTORY_PERSIST_RETRY_BASE_MS,
        }
    }
}

/// Limits enforced on canvases and inbound events.
#[derive(Debug, Clone, Copy)]
pub struct CanvasLimits {
    /// Side length of every private canvas.
    pub private_canvas_size: u32,
    /// Largest allowed width or height for a community canvas.
    pub max_canvas_dim: u32,
    /// Maximum pixels accepted in one `log_pixel_history` batch.
    pub max_history_batch: usize,
    /// Maximum chat message length in characters.
    pub max_chat_length: usize,
}

impl Default for CanvasLimits {
    fn default() -> Self {
        Self {
            private_canvas_size: DEFAULT_PRIVATE_CANVAS_SIZE,
            max_canvas_dim: DEFAULT_MAX_CANVAS_DIM,
            max_history_batch: DEFAULT_MAX_HISTORY_BATCH,
            max_chat_length: DEFAULT_MAX_CHAT_LENGTH,
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// `None` runs against the in-memory repository.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// Outbound frame buffer per websocket connection.
    pub client_channel_capacity: usize,
    pub canvas_flush_interval: Duration,
    pub seed_community_pubs: bool,
    pub limits: CanvasLimits,
    pub history: HistoryPersistConfig,
}

impl ServerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            database_url,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            client_channel_capacity: env_parse("CLIENT_CHANNEL_CAPACITY", DEFAULT_CLIENT_CHANNEL_CAPACITY).max(1),
            canvas_flush_interval: Duration::from_millis(
                env_parse("CANVAS_FLUSH_INTERVAL_MS", DEFAULT_CANVAS_FLUSH_INTERVAL_MS).max(1),
            ),
            seed_community_pubs: env_parse("SEED_COMMUNITY_PUBS", true),
            limits: CanvasLimits {
                private_canvas_size: env_parse("PRIVATE_CANVAS_SIZE", DEFAULT_PRIVATE_CANVAS_SIZE).max(1),
                max_canvas_dim: env_parse("MAX_CANVAS_DIM", DEFAULT_MAX_CANVAS_DIM).max(1),
                max_history_batch: env_parse("MAX_HISTORY_BATCH", DEFAULT_MAX_HISTORY_BATCH),
                max_chat_length: env_parse("MAX_CHAT_LENGTH", DEFAULT_MAX_CHAT_LENGTH),
            },
            history: HistoryPersistConfig::from_env(),
        }
    }
}
