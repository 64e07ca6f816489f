//! Append log backed by `sled`
//!
//! Every queue topic gets its own `sled` tree. Keys are the big-endian bytes of
//! a store-wide sequence from `Db::generate_id`, so iteration yields entries in
//! append order and ids are monotonic within a topic. Values are the append
//! timestamp (millis, big-endian) followed by the raw payload.
//!
//! Retention options:
//! - `max_entries_per_topic`: oldest entries are trimmed on append once the
//!   topic grows past the cap.
//! - `entry_ttl_secs`: entries older than the TTL are trimmed before reads.

use std::fmt;
use std::ops::Bound;
use std::str::FromStr;

use chrono::Utc;
use sled::{Db, Tree};
use tracing::{debug, warn};

use crate::utils::error::StoreError;

/// Store-assigned id of a log entry, rendered as `<millis>-<sequence>`.
///
/// Equality, hashing and ordering only consider the sequence; the millis part
/// is informational.
#[derive(Debug, Clone, Copy)]
pub struct EntryId {
    pub millis: i64,
    pub seq: u64,
}

impl PartialEq for EntryId {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for EntryId {}

impl std::hash::Hash for EntryId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.seq.hash(state);
    }
}

impl Ord for EntryId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq.cmp(&other.seq)
    }
}

impl PartialOrd for EntryId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| format!("entry id `{s}` is not <millis>-<sequence>"))?;
        Ok(Self {
            millis: millis.parse().map_err(|e| format!("bad millis in `{s}`: {e}"))?,
            seq: seq.parse().map_err(|e| format!("bad sequence in `{s}`: {e}"))?,
        })
    }
}

/// One entry read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub id: EntryId,
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Clone)]
pub struct LogStore {
    db: Db,
    ttl_seconds: Option<i64>,
    max_entries_per_topic: Option<usize>,
}

impl LogStore {
    /// Open or create a sled database at `path` with the given policy.
    pub fn open(
        path: &str,
        ttl_seconds: Option<i64>,
        max_entries_per_topic: Option<usize>,
    ) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            ttl_seconds,
            max_entries_per_topic,
        })
    }

    /// A throwaway database that is removed when the last handle drops.
    pub fn temporary(
        ttl_seconds: Option<i64>,
        max_entries_per_topic: Option<usize>,
    ) -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            db,
            ttl_seconds,
            max_entries_per_topic,
        })
    }

    fn tree(&self, topic: &str) -> Result<Tree, StoreError> {
        Ok(self.db.open_tree(topic)?)
    }

    /// Append `payload` to `topic` and return its id.
    pub fn append(&self, topic: &str, payload: &[u8]) -> Result<EntryId, StoreError> {
        let id = EntryId {
            millis: Utc::now().timestamp_millis(),
            seq: self.db.generate_id()?,
        };

        let mut value = Vec::with_capacity(8 + payload.len());
        value.extend_from_slice(&id.millis.to_be_bytes());
        value.extend_from_slice(payload);

        let tree = self.tree(topic)?;
        tree.insert(id.seq.to_be_bytes(), value)?;

        if let Some(max) = self.max_entries_per_topic {
            let total = tree.len();
            if total > max {
                let excess = total - max;
                let keys: Vec<_> = tree
                    .iter()
                    .keys()
                    .take(excess)
                    .filter_map(Result::ok)
                    .collect();
                for key in keys {
                    if let Err(e) = tree.remove(key) {
                        warn!(topic, error = %e, "failed to trim log entry");
                    }
                }
                debug!(topic, trimmed = excess, "trimmed log to max length");
            }
        }

        Ok(id)
    }

    /// Up to `limit` entries of `topic` strictly after `after` (or from the
    /// start when `None`), oldest first.
    pub fn read_after(
        &self,
        topic: &str,
        after: Option<EntryId>,
        limit: usize,
    ) -> Result<Vec<StoredEntry>, StoreError> {
        self.expire(topic)?;
        let tree = self.tree(topic)?;

        let lower = match after {
            Some(id) => Bound::Excluded(id.seq.to_be_bytes()),
            None => Bound::Unbounded,
        };

        tree.range((lower, Bound::Unbounded))
            .take(limit)
            .map(|res| {
                let (key, value) = res?;
                decode(topic, &key, &value)
            })
            .collect()
    }

    /// Look up a single entry; `None` if it was never written or was trimmed.
    pub fn get(&self, topic: &str, id: EntryId) -> Result<Option<StoredEntry>, StoreError> {
        let tree = self.tree(topic)?;
        match tree.get(id.seq.to_be_bytes())? {
            Some(value) => decode(topic, &id.seq.to_be_bytes(), &value).map(Some),
            None => Ok(None),
        }
    }

    pub fn len(&self, topic: &str) -> Result<usize, StoreError> {
        Ok(self.tree(topic)?.len())
    }

    pub fn is_empty(&self, topic: &str) -> Result<bool, StoreError> {
        Ok(self.tree(topic)?.is_empty())
    }

    /// Flush buffered writes to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Remove entries older than the TTL for a single topic.
    fn expire(&self, topic: &str) -> Result<(), StoreError> {
        let Some(ttl) = self.ttl_seconds else {
            return Ok(());
        };
        let expiry_time = Utc::now()
            .timestamp_millis()
            .saturating_sub(ttl.saturating_mul(1000));

        let tree = self.tree(topic)?;
        let old_keys: Vec<_> = tree
            .iter()
            .filter_map(Result::ok)
            .take_while(|(_, value)| millis_of(value).is_some_and(|ms| ms < expiry_time))
            .map(|(key, _)| key)
            .collect();

        for key in old_keys {
            tree.remove(key)?;
        }
        Ok(())
    }
}

fn millis_of(value: &[u8]) -> Option<i64> {
    let head: [u8; 8] = value.get(..8)?.try_into().ok()?;
    Some(i64::from_be_bytes(head))
}

fn decode(topic: &str, key: &[u8], value: &[u8]) -> Result<StoredEntry, StoreError> {
    let corrupt = || StoreError::Corrupt {
        topic: topic.to_string(),
    };
    let seq: [u8; 8] = key.try_into().map_err(|_| corrupt())?;
    let millis = millis_of(value).ok_or_else(corrupt)?;
    Ok(StoredEntry {
        id: EntryId {
            millis,
            seq: u64::from_be_bytes(seq),
        },
        topic: topic.to_string(),
        payload: value[8..].to_vec(),
    })
}

impl fmt::Debug for LogStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStore")
            .field("db", &"sled::Db")
            .field("ttl_seconds", &self.ttl_seconds)
            .field("max_entries_per_topic", &self.max_entries_per_topic)
            .finish()
    }
}
