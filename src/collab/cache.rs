//! Key-value cache collaborator and two backends.
//!
//! A zero TTL means the entry never expires. A disabled backend
//! ([`NoopCache`]) always reports not-found.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Errors reported by cache backends.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache was closed.
    #[error("cache is closed")]
    Closed,

    /// Backend-specific failure.
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Key-value memo store.
pub trait Cache: Send + Sync {
    /// Returns the stored bytes, if present and not expired.
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Stores `value` under `key`; `ttl` of zero means no expiry.
    ///
    /// # Errors
    ///
    /// Backend-specific failure or [`CacheError::Closed`].
    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Removes `key`.
    ///
    /// # Errors
    ///
    /// Backend-specific failure or [`CacheError::Closed`].
    fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Returns true if `key` is present and not expired.
    fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Removes every entry.
    ///
    /// # Errors
    ///
    /// Backend-specific failure or [`CacheError::Closed`].
    fn clear(&self) -> Result<(), CacheError>;

    /// Releases backend resources; later writes fail.
    ///
    /// # Errors
    ///
    /// Backend-specific failure.
    fn close(&self) -> Result<(), CacheError>;
}

/// Disabled cache: accepts writes, never finds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl Cache for NoopCache {
    fn get(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }

    fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    fn has(&self, _key: &str) -> bool {
        false
    }

    fn clear(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process cache backed by a concurrent map.
///
/// Expired entries are dropped lazily on access.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    closed: AtomicBool,
}

impl MemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired());
            debug!(key, "cache entry expired");
        }
        None
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        self.ensure_open()?;
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        };
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.entries.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.entries.clear();
        Ok(())
    }

    fn close(&self) -> Result<(), CacheError> {
        self.closed.store(true, Ordering::Release);
        self.entries.clear();
        Ok(())
    }
}
