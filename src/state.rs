use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlx::PgPool;

use crate::auth::oauth::GoogleVerifier;
use crate::config::Settings;
use crate::db;
use crate::email::{HttpMailer, LogMailer, Mailer};
use crate::ledger::Ledger;
use crate::notify::{LogNotifier, Notifier, TelegramNotifier};
use crate::payments::lemonsqueezy::LemonSqueezyProvider;
use crate::payments::paddle::PaddleProvider;
use crate::payments::stars::TelegramStarsProvider;
use crate::payments::PaymentEngine;
use crate::quota::QuotaEngine;
use crate::store::redis::RedisKv;
use crate::store::KvStore;

/// Deadline for most upstream product calls.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
/// Chart extraction is slow; it gets a longer leash.
const EXTRACTION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

impl Deref for AppState {
    type Target = Inner;

    fn deref(&self) -> &Inner {
        &self.inner
    }
}

pub struct Inner {
    pub settings: Settings,
    pub db: PgPool,
    pub kv: Arc<dyn KvStore>,
    pub ledger: Arc<Ledger>,
    pub quota: QuotaEngine,
    pub payments: PaymentEngine,
    pub google: Option<GoogleVerifier>,
    pub mailer: Arc<dyn Mailer>,
    /// Upstream client with the standard 30 s deadline.
    pub http: reqwest::Client,
    /// Upstream client for chart extraction (120 s).
    pub http_long: reqwest::Client,
    pub prometheus: PrometheusHandle,
}

impl AppState {
    pub async fn initialize(settings: Settings) -> Result<Self> {
        let prometheus = PrometheusBuilder::new()
            .install_recorder()
            .context("installing metrics recorder")?;

        let pool = db::connect(&settings.database_url).await?;
        db::migrate(&pool).await?;

        let kv: Arc<dyn KvStore> = Arc::new(
            RedisKv::connect(&settings.redis_url)
                .await
                .context("connecting to redis")?,
        );

        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .context("building http client")?;
        let http_long = reqwest::Client::builder()
            .timeout(EXTRACTION_TIMEOUT)
            .build()
            .context("building long-deadline http client")?;

        let ledger = Arc::new(Ledger::new(pool.clone(), kv.clone()));
        let quota = QuotaEngine::new(kv.clone());

        let notifier: Arc<dyn Notifier> = match &settings.telegram_bot_token {
            Some(token) => Arc::new(TelegramNotifier::new(token.clone(), http.clone())),
            None => Arc::new(LogNotifier),
        };

        let mut payments = PaymentEngine::new(
            pool.clone(),
            ledger.clone(),
            notifier,
            settings.low_balance_threshold,
        );
        if settings.lemonsqueezy.enabled
            && let (Some(api_key), Some(store_id), Some(variant_id), Some(secret)) = (
                settings.lemonsqueezy.api_key.clone(),
                settings.lemonsqueezy.store_id.clone(),
                settings.lemonsqueezy.variant_id.clone(),
                settings.lemonsqueezy.webhook_secret.clone(),
            )
        {
            payments.register(Arc::new(LemonSqueezyProvider::new(
                api_key, store_id, variant_id, secret,
            )));
        }
        if settings.paddle.enabled
            && let (Some(api_key), Some(secret)) = (
                settings.paddle.api_key.clone(),
                settings.paddle.webhook_secret.clone(),
            )
        {
            payments.register(Arc::new(PaddleProvider::new(
                api_key,
                secret,
                settings.paddle.sandbox,
            )));
        }
        if settings.telegram_bot_token.is_some() {
            payments.register(Arc::new(TelegramStarsProvider::new(kv.clone())));
        }

        let google = settings.google_client_id.clone().map(|client_id| {
            GoogleVerifier::new(client_id, settings.google_client_secret.clone(), http.clone())
        });

        let mailer: Arc<dyn Mailer> = match &settings.email_api_key {
            Some(key) => Arc::new(HttpMailer::new(key.clone(), http.clone())),
            None => Arc::new(LogMailer),
        };

        Ok(AppState {
            inner: Arc::new(Inner {
                settings,
                db: pool,
                kv,
                ledger,
                quota,
                payments,
                google,
                mailer,
                http,
                http_long,
                prometheus,
            }),
        })
    }
}
