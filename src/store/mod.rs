//! Key/value store seam.
//!
//! Ephemeral state (refresh tokens, pending invoices, quota counters,
//! balance cache, OAuth state) lives behind this trait so the services
//! above it are testable without a live Redis.

pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("store error: {0}")]
    Store(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    async fn del(&self, key: &str) -> Result<(), KvError>;

    /// Atomic read-and-delete; `None` when the key was absent.
    async fn get_del(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Increment two counters by `by` and (re)set both TTLs in a single
    /// atomic round-trip. Returns the new counter values.
    async fn incr_pair(
        &self,
        first: &str,
        second: &str,
        by: i64,
        first_ttl: Duration,
        second_ttl: Duration,
    ) -> Result<(i64, i64), KvError>;
}

#[cfg(test)]
pub mod mem {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    use super::*;

    struct Entry {
        value: String,
        expires_at: Option<Instant>,
    }

    /// In-memory store double for unit tests, with a switch to simulate
    /// an outage.
    #[derive(Default)]
    pub struct MemoryKv {
        entries: Mutex<HashMap<String, Entry>>,
        down: AtomicBool,
    }

    impl MemoryKv {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check_up(&self) -> Result<(), KvError> {
            if self.down.load(Ordering::SeqCst) {
                Err(KvError::Store("connection refused".into()))
            } else {
                Ok(())
            }
        }

        fn live_value(entry: &Entry) -> Option<String> {
            match entry.expires_at {
                Some(at) if at <= Instant::now() => None,
                _ => Some(entry.value.clone()),
            }
        }
    }

    #[async_trait]
    impl KvStore for MemoryKv {
        async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
            self.check_up()?;
            let entries = self.entries.lock().unwrap();
            Ok(entries.get(key).and_then(Self::live_value))
        }

        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
            self.check_up()?;
            let mut entries = self.entries.lock().unwrap();
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(())
        }

        async fn del(&self, key: &str) -> Result<(), KvError> {
            self.check_up()?;
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }

        async fn get_del(&self, key: &str) -> Result<Option<String>, KvError> {
            self.check_up()?;
            let mut entries = self.entries.lock().unwrap();
            Ok(entries.remove(key).and_then(|e| Self::live_value(&e)))
        }

        async fn incr_pair(
            &self,
            first: &str,
            second: &str,
            by: i64,
            first_ttl: Duration,
            second_ttl: Duration,
        ) -> Result<(i64, i64), KvError> {
            self.check_up()?;
            let mut entries = self.entries.lock().unwrap();
            let mut bump = |key: &str, ttl: Duration| {
                let current = entries
                    .get(key)
                    .and_then(Self::live_value)
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                let next = current + by;
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: next.to_string(),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
                next
            };
            let a = bump(first, first_ttl);
            let b = bump(second, second_ttl);
            Ok((a, b))
        }
    }
}
