use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::store::KvStore;

const FAILURE_THRESHOLD: u32 = 5;
const RECOVERY_SECS: i64 = 60;
const BALANCE_TTL: Duration = Duration::from_secs(3600);

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Trips open after 5 consecutive store failures; stays open for 60 s,
/// then lets a single probe through.
pub struct CircuitBreaker {
    state: AtomicU8,
    failures: AtomicU32,
    last_failure: AtomicI64,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(CLOSED),
            failures: AtomicU32::new(0),
            last_failure: AtomicI64::new(0),
        }
    }

    pub fn allow(&self) -> bool {
        if self.state.load(Ordering::SeqCst) != OPEN {
            return true;
        }
        let elapsed = chrono::Utc::now().timestamp() - self.last_failure.load(Ordering::SeqCst);
        if elapsed > RECOVERY_SECS {
            self.state.store(HALF_OPEN, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn success(&self) {
        self.failures.store(0, Ordering::SeqCst);
        self.state.store(CLOSED, Ordering::SeqCst);
    }

    pub fn failure(&self) {
        let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.last_failure
            .store(chrono::Utc::now().timestamp(), Ordering::SeqCst);
        if count >= FAILURE_THRESHOLD {
            self.state.store(OPEN, Ordering::SeqCst);
            tracing::warn!(failures = count, "balance cache circuit breaker open");
        }
    }
}

/// Advisory balance mirror in the key/value store. Ledger correctness never
/// depends on it: misses and errors fall back to Postgres.
pub struct BalanceCache {
    kv: Arc<dyn KvStore>,
    breaker: CircuitBreaker,
}

impl BalanceCache {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            breaker: CircuitBreaker::new(),
        }
    }

    fn key(account_id: Uuid) -> String {
        format!("balance:{account_id}")
    }

    pub async fn get(&self, account_id: Uuid) -> Option<Decimal> {
        if !self.breaker.allow() {
            return None;
        }
        match self.kv.get(&Self::key(account_id)).await {
            Ok(value) => {
                self.breaker.success();
                value.and_then(|v| v.parse().ok())
            }
            Err(err) => {
                tracing::debug!(%account_id, error = %err, "balance cache read failed");
                self.breaker.failure();
                None
            }
        }
    }

    pub async fn put(&self, account_id: Uuid, balance: Decimal) {
        if !self.breaker.allow() {
            return;
        }
        match self.kv.set_ex(&Self::key(account_id), &balance.to_string(), BALANCE_TTL).await {
            Ok(()) => self.breaker.success(),
            Err(err) => {
                tracing::debug!(%account_id, error = %err, "balance cache write failed");
                self.breaker.failure();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::store::mem::MemoryKv;

    #[tokio::test]
    async fn round_trip() {
        let kv = Arc::new(MemoryKv::new());
        let cache = BalanceCache::new(kv);
        let id = Uuid::new_v4();

        assert_eq!(cache.get(id).await, None);
        cache.put(id, dec!(12.5)).await;
        assert_eq!(cache.get(id).await, Some(dec!(12.5)));
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures() {
        let kv = Arc::new(MemoryKv::new());
        let cache = BalanceCache::new(kv.clone());
        let id = Uuid::new_v4();

        kv.set_down(true);
        for _ in 0..5 {
            assert_eq!(cache.get(id).await, None);
        }

        // Store recovers, but the breaker stays open for the cooldown,
        // so reads skip the cache entirely.
        kv.set_down(false);
        cache.put(id, dec!(1)).await;
        assert_eq!(cache.get(id).await, None);
    }

    #[test]
    fn breaker_state_machine() {
        let breaker = CircuitBreaker::new();
        assert!(breaker.allow());
        for _ in 0..4 {
            breaker.failure();
        }
        assert!(breaker.allow());
        breaker.failure();
        assert!(!breaker.allow());
        breaker.success();
        assert!(breaker.allow());
    }
}
