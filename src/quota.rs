//! Free-tier quota engine.
//!
//! Dual-window counters per (product, identity) kept entirely in the
//! key/value store: a daily counter keyed by UTC date (48 h TTL) and a
//! monthly counter keyed by `YYYY-MM` (35 d TTL). `check` is side-effect
//! free; `record` increments both windows in one atomic round-trip. If the
//! store is unreachable the engine errors and the gateway fails closed —
//! an outage must not grant unlimited free quota.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::store::{KvError, KvStore};

const DAILY_TTL: Duration = Duration::from_secs(48 * 3600);
const MONTHLY_TTL: Duration = Duration::from_secs(35 * 24 * 3600);

/// New accounts run at half limits for their first week.
const PROGRESSIVE_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error(transparent)]
    Store(#[from] KvError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub daily: i64,
    pub monthly: i64,
}

pub fn base_limits(product_id: &str) -> QuotaLimits {
    let (daily, monthly) = match product_id {
        "chart2csv" => (3, 50),
        "masker" => (100, 2_000),
        "patas" => (100, 10_000),
        "reliapi" => (1_000, 10_000),
        _ => (10, 100),
    };
    QuotaLimits { daily, monthly }
}

/// Who is consuming free quota: an anonymous caller keyed by normalized
/// IP, or an account (whose age drives the progressive reduction).
#[derive(Debug, Clone)]
pub struct QuotaSubject {
    pub key: String,
    pub account_created_at: Option<DateTime<Utc>>,
}

impl QuotaSubject {
    pub fn ip(ip: &str) -> Self {
        Self {
            key: ip.to_string(),
            account_created_at: None,
        }
    }

    pub fn account(id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            key: id.to_string(),
            account_created_at: Some(created_at),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining_daily: i64,
    pub remaining_monthly: i64,
    pub limit_daily: i64,
    pub limit_monthly: i64,
    pub resets_daily: DateTime<Utc>,
    pub resets_monthly: DateTime<Utc>,
}

/// Display-oriented usage summary for balance/pricing surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct FreeTierUsage {
    pub used_today: i64,
    pub limit_today: i64,
    pub used_month: i64,
    pub limit_month: i64,
    pub resets_at: DateTime<Utc>,
}

pub struct QuotaEngine {
    kv: Arc<dyn KvStore>,
}

impl QuotaEngine {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn effective_limits(&self, product_id: &str, subject: &QuotaSubject) -> QuotaLimits {
        self.effective_limits_at(product_id, subject, Utc::now())
    }

    fn effective_limits_at(
        &self,
        product_id: &str,
        subject: &QuotaSubject,
        now: DateTime<Utc>,
    ) -> QuotaLimits {
        let base = base_limits(product_id);
        match subject.account_created_at {
            Some(created) if (now - created).num_days() < PROGRESSIVE_DAYS => QuotaLimits {
                daily: (base.daily / 2).max(1),
                monthly: (base.monthly / 2).max(1),
            },
            _ => base,
        }
    }

    /// Side-effect-free admission check over both windows.
    pub async fn check(
        &self,
        product_id: &str,
        subject: &QuotaSubject,
        units: i64,
    ) -> Result<QuotaDecision, QuotaError> {
        self.check_at(product_id, subject, units, Utc::now()).await
    }

    async fn check_at(
        &self,
        product_id: &str,
        subject: &QuotaSubject,
        units: i64,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, QuotaError> {
        let limits = self.effective_limits_at(product_id, subject, now);

        let daily_used = self.counter(&daily_key(product_id, &subject.key, now)).await?;
        let monthly_used = self.counter(&monthly_key(product_id, &subject.key, now)).await?;

        Ok(QuotaDecision {
            allowed: daily_used + units <= limits.daily && monthly_used + units <= limits.monthly,
            remaining_daily: (limits.daily - daily_used).max(0),
            remaining_monthly: (limits.monthly - monthly_used).max(0),
            limit_daily: limits.daily,
            limit_monthly: limits.monthly,
            resets_daily: next_utc_midnight(now),
            resets_monthly: first_of_next_month(now),
        })
    }

    /// Increment both windows. Called only after the upstream call
    /// succeeded, so failures never consume quota.
    pub async fn record(
        &self,
        product_id: &str,
        subject: &QuotaSubject,
        units: i64,
    ) -> Result<(i64, i64), QuotaError> {
        let now = Utc::now();
        Ok(self
            .kv
            .incr_pair(
                &daily_key(product_id, &subject.key, now),
                &monthly_key(product_id, &subject.key, now),
                units,
                DAILY_TTL,
                MONTHLY_TTL,
            )
            .await?)
    }

    pub async fn remaining(
        &self,
        product_id: &str,
        subject: &QuotaSubject,
    ) -> Result<FreeTierUsage, QuotaError> {
        let decision = self.check(product_id, subject, 0).await?;
        Ok(FreeTierUsage {
            used_today: decision.limit_daily - decision.remaining_daily,
            limit_today: decision.limit_daily,
            used_month: decision.limit_monthly - decision.remaining_monthly,
            limit_month: decision.limit_monthly,
            resets_at: decision.resets_daily,
        })
    }

    pub async fn remaining_all(
        &self,
        subject: &QuotaSubject,
    ) -> Result<BTreeMap<&'static str, FreeTierUsage>, QuotaError> {
        let mut all = BTreeMap::new();
        for product in crate::credits::CATALOGUE {
            all.insert(product.id, self.remaining(product.id, subject).await?);
        }
        Ok(all)
    }

    async fn counter(&self, key: &str) -> Result<i64, QuotaError> {
        Ok(self
            .kv
            .get(key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }
}

fn daily_key(product_id: &str, identity: &str, now: DateTime<Utc>) -> String {
    format!("free:{product_id}:{identity}:daily:{}", now.format("%Y-%m-%d"))
}

fn monthly_key(product_id: &str, identity: &str, now: DateTime<Utc>) -> String {
    format!("free:{product_id}:{identity}:monthly:{}", now.format("%Y-%m"))
}

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    (now.date_naive() + Days::new(1))
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists")
        .and_utc()
}

fn first_of_next_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .expect("first of month exists")
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists")
        .and_utc()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::store::mem::MemoryKv;

    fn engine() -> (QuotaEngine, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        (QuotaEngine::new(kv.clone()), kv)
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn key_formats() {
        let now = at(2026, 8, 1);
        assert_eq!(
            daily_key("chart2csv", "1.2.3.4", now),
            "free:chart2csv:1.2.3.4:daily:2026-08-01"
        );
        assert_eq!(
            monthly_key("masker", "user-123", now),
            "free:masker:user-123:monthly:2026-08"
        );
    }

    #[test]
    fn reset_instants() {
        let now = at(2026, 12, 31);
        assert_eq!(next_utc_midnight(now), at(2027, 1, 1) - chrono::Duration::hours(12));
        assert_eq!(first_of_next_month(now), Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn fresh_identity_allowed_with_full_limits() {
        let (engine, _) = engine();
        let subject = QuotaSubject::ip("1.2.3.4");

        let decision = engine.check("chart2csv", &subject, 1).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining_daily, 3);
        assert_eq!(decision.remaining_monthly, 50);
    }

    #[tokio::test]
    async fn daily_limit_exhausts_after_three_pairs() {
        let (engine, _) = engine();
        let subject = QuotaSubject::ip("1.2.3.4");

        for _ in 0..3 {
            let decision = engine.check("chart2csv", &subject, 1).await.unwrap();
            assert!(decision.allowed);
            engine.record("chart2csv", &subject, 1).await.unwrap();
        }

        let decision = engine.check("chart2csv", &subject, 1).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining_daily, 0);
    }

    #[tokio::test]
    async fn monthly_window_denies_independently() {
        let (engine, kv) = engine();
        let subject = QuotaSubject::ip("9.9.9.9");
        let now = Utc::now();

        // Two daily used (fine), monthly already full.
        kv.set_ex(&daily_key("chart2csv", "9.9.9.9", now), "2", DAILY_TTL)
            .await
            .unwrap();
        kv.set_ex(&monthly_key("chart2csv", "9.9.9.9", now), "50", MONTHLY_TTL)
            .await
            .unwrap();

        let decision = engine.check("chart2csv", &subject, 1).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining_daily, 1);
        assert_eq!(decision.remaining_monthly, 0);
    }

    #[tokio::test]
    async fn batch_units_checked_against_remaining() {
        let (engine, _) = engine();
        let subject = QuotaSubject::ip("8.8.8.8");

        engine.record("patas", &subject, 80).await.unwrap();
        let decision = engine.check("patas", &subject, 30).await.unwrap();
        assert!(!decision.allowed, "80 + 30 exceeds the 100/day limit");
        let decision = engine.check("patas", &subject, 20).await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn new_accounts_get_halved_limits() {
        let (engine, _) = engine();
        let fresh = QuotaSubject::account(Uuid::new_v4(), Utc::now() - chrono::Duration::days(2));
        let seasoned = QuotaSubject::account(Uuid::new_v4(), Utc::now() - chrono::Duration::days(30));
        let anon = QuotaSubject::ip("1.1.1.1");

        assert_eq!(
            engine.effective_limits("masker", &fresh),
            QuotaLimits { daily: 50, monthly: 1000 }
        );
        // Halving floors at 1.
        assert_eq!(engine.effective_limits("chart2csv", &fresh).daily, 1);
        assert_eq!(
            engine.effective_limits("masker", &seasoned),
            QuotaLimits { daily: 100, monthly: 2000 }
        );
        assert_eq!(
            engine.effective_limits("masker", &anon),
            QuotaLimits { daily: 100, monthly: 2000 }
        );
    }

    #[tokio::test]
    async fn store_outage_fails_closed() {
        let (engine, kv) = engine();
        let subject = QuotaSubject::ip("1.2.3.4");

        kv.set_down(true);
        assert!(engine.check("chart2csv", &subject, 1).await.is_err());
    }
}
