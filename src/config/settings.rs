use serde::Deserialize;

use crate::persistence::LogStore;
use crate::utils::error::StoreError;

/// Top-level configuration for a courier process.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub queue: QueueSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    /// Fallback filter when `RUST_LOG` is unset.
    pub level: String,
}

/// Where and how long queue entries are kept.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    /// sled directory. A temporary database is used when absent.
    pub path: Option<String>,
    pub max_entries_per_topic: Option<usize>,
    pub entry_ttl_secs: Option<i64>,
}

/// Consumer group membership and redelivery policy for queue listeners.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueSettings {
    pub group: String,
    /// Generated per listener when absent.
    pub consumer: Option<String>,
    pub reclaim_interval_ms: u64,
    pub reclaim_min_idle_ms: u64,
    pub max_deliveries: u32,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from [`Settings::default`].
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub logging: Option<PartialLoggingSettings>,
    pub store: Option<PartialStoreSettings>,
    pub queue: Option<PartialQueueSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStoreSettings {
    pub path: Option<String>,
    pub max_entries_per_topic: Option<usize>,
    pub entry_ttl_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialQueueSettings {
    pub group: Option<String>,
    pub consumer: Option<String>,
    pub reclaim_interval_ms: Option<u64>,
    pub reclaim_min_idle_ms: Option<u64>,
    pub max_deliveries: Option<u32>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_entries_per_topic: Some(10_000),
            entry_ttl_secs: None,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            group: "courier".to_string(),
            consumer: None,
            reclaim_interval_ms: 1_000,
            reclaim_min_idle_ms: 5_000,
            max_deliveries: 5,
        }
    }
}

impl StoreSettings {
    /// Open the configured log store.
    pub fn open(&self) -> Result<LogStore, StoreError> {
        match &self.path {
            Some(path) => LogStore::open(path, self.entry_ttl_secs, self.max_entries_per_topic),
            None => LogStore::temporary(self.entry_ttl_secs, self.max_entries_per_topic),
        }
    }
}

impl PartialSettings {
    pub fn merge(self, default: Settings) -> Settings {
        let logging = match self.logging {
            Some(l) => LoggingSettings {
                level: l.level.unwrap_or(default.logging.level),
            },
            None => default.logging,
        };

        let store = match self.store {
            Some(s) => StoreSettings {
                path: s.path.or(default.store.path),
                max_entries_per_topic: s
                    .max_entries_per_topic
                    .or(default.store.max_entries_per_topic),
                entry_ttl_secs: s.entry_ttl_secs.or(default.store.entry_ttl_secs),
            },
            None => default.store,
        };

        let queue = match self.queue {
            Some(q) => QueueSettings {
                group: q.group.unwrap_or(default.queue.group),
                consumer: q.consumer.or(default.queue.consumer),
                reclaim_interval_ms: q
                    .reclaim_interval_ms
                    .unwrap_or(default.queue.reclaim_interval_ms),
                reclaim_min_idle_ms: q
                    .reclaim_min_idle_ms
                    .unwrap_or(default.queue.reclaim_min_idle_ms),
                max_deliveries: q.max_deliveries.unwrap_or(default.queue.max_deliveries),
            },
            None => default.queue,
        };

        Settings {
            logging,
            store,
            queue,
        }
    }
}
