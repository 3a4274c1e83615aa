//! Payment engine: provider registry plus the two orchestration paths,
//! checkout creation and webhook processing. The ledger's idempotency key
//! `<provider>:<event_id>` is what makes concurrent webhook redelivery
//! safe: one writer wins, the rest observe the existing row.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use super::{
    CheckoutUrls, PaymentProvider, PaymentRequest, PaymentResult, PaymentStatus, ProviderError,
    WebhookEvent,
};
use crate::ledger::{Ledger, LedgerError};
use crate::models::TransactionKind;
use crate::notify::Notifier;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown payment provider: {0}")]
    UnknownProvider(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug)]
pub enum WebhookOutcome {
    Processed { transaction_id: Uuid },
    Ignored,
    /// `silent` selects the 200-with-error-body response for providers
    /// that retry 4xx forever.
    InvalidSignature { silent: bool },
}

pub struct PaymentEngine {
    providers: HashMap<&'static str, Arc<dyn PaymentProvider>>,
    pool: PgPool,
    ledger: Arc<Ledger>,
    notifier: Arc<dyn Notifier>,
    low_balance_threshold: Decimal,
}

impl PaymentEngine {
    pub fn new(
        pool: PgPool,
        ledger: Arc<Ledger>,
        notifier: Arc<dyn Notifier>,
        low_balance_threshold: Decimal,
    ) -> Self {
        Self {
            providers: HashMap::new(),
            pool,
            ledger,
            notifier,
            low_balance_threshold,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) {
        tracing::info!(provider = provider.name(), "payment provider registered");
        self.providers.insert(provider.name(), provider);
    }

    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.providers.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    fn provider(&self, tag: &str) -> Result<&Arc<dyn PaymentProvider>, EngineError> {
        self.providers
            .get(tag)
            .ok_or_else(|| EngineError::UnknownProvider(tag.to_string()))
    }

    /// Create a checkout session. No money moves here: the ledger is only
    /// consulted to short-circuit a replayed idempotency key.
    pub async fn create_payment(
        &self,
        tag: &str,
        request: &PaymentRequest,
        urls: &CheckoutUrls,
    ) -> Result<PaymentResult, EngineError> {
        let provider = self.provider(tag)?;

        if let Some(transaction_id) = self
            .ledger
            .transaction_by_key(&request.idempotency_key)
            .await?
        {
            return Ok(PaymentResult {
                payment_id: transaction_id.to_string(),
                status: PaymentStatus::Completed,
                checkout_url: None,
                invoice_payload: None,
                expires_at: None,
            });
        }

        Ok(provider.create_checkout(request, urls).await?)
    }

    /// Verify, dedup, parse and credit a webhook delivery. Signature
    /// failures and permanent parse failures never mutate state.
    pub async fn process_webhook(
        &self,
        tag: &str,
        event: &WebhookEvent,
    ) -> Result<WebhookOutcome, EngineError> {
        let provider = self.provider(tag)?;
        let name = provider.name();

        if !provider.verify_webhook(event) {
            metrics::counter!("webhook_events_total", "provider" => name, "outcome" => "invalid_signature")
                .increment(1);
            tracing::warn!(provider = name, event_id = %event.event_id, "webhook signature rejected");
            return Ok(WebhookOutcome::InvalidSignature {
                silent: provider.retry_hostile(),
            });
        }

        let idempotency_key = format!("{name}:{}", event.event_id);
        if !event.event_id.is_empty()
            && self.ledger.transaction_by_key(&idempotency_key).await?.is_some()
        {
            metrics::counter!("webhook_events_total", "provider" => name, "outcome" => "ignored")
                .increment(1);
            return Ok(WebhookOutcome::Ignored);
        }

        let charge = match provider.process_webhook(event).await {
            Ok(Some(charge)) => charge,
            Ok(None) => {
                metrics::counter!("webhook_events_total", "provider" => name, "outcome" => "ignored")
                    .increment(1);
                return Ok(WebhookOutcome::Ignored);
            }
            Err(err) if err.is_transient() => return Err(err.into()),
            Err(err) => {
                // Unparsable events will never parse on redelivery;
                // acknowledge and log instead of feeding a retry storm.
                metrics::counter!("webhook_events_total", "provider" => name, "outcome" => "unprocessable")
                    .increment(1);
                tracing::warn!(provider = name, event_id = %event.event_id, error = %err,
                    "webhook permanently unprocessable");
                return Ok(WebhookOutcome::Ignored);
            }
        };

        // Deliveries without a provider event id fall back to the charge's
        // external id so distinct payments never share a key.
        let idempotency_key = if event.event_id.is_empty() {
            format!("{name}:{}", charge.external_id)
        } else {
            idempotency_key
        };

        let signed_amount = match charge.kind {
            TransactionKind::Refund => -charge.amount_usd,
            _ => charge.amount_usd,
        };
        let outcome = self
            .ledger
            .credit(
                charge.account_id,
                signed_amount,
                &idempotency_key,
                charge.kind,
                &charge.description,
            )
            .await?;

        if outcome.duplicate {
            metrics::counter!("webhook_events_total", "provider" => name, "outcome" => "ignored")
                .increment(1);
            return Ok(WebhookOutcome::Ignored);
        }

        metrics::counter!("webhook_events_total", "provider" => name, "outcome" => "processed")
            .increment(1);
        self.dispatch_notifications(charge.account_id, charge.kind, charge.amount_usd, outcome.balance);

        Ok(WebhookOutcome::Processed {
            transaction_id: outcome.transaction_id,
        })
    }

    /// Fire-and-forget: notification failures never fail the webhook.
    fn dispatch_notifications(
        &self,
        account_id: Uuid,
        kind: TransactionKind,
        amount_usd: Decimal,
        balance: Decimal,
    ) {
        let pool = self.pool.clone();
        let notifier = self.notifier.clone();
        let threshold = self.low_balance_threshold;

        tokio::spawn(async move {
            let account = match crate::auth::account_by_id(&pool, account_id).await {
                Ok(Some(account)) => account,
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!(%account_id, error = %err, "notification account lookup failed");
                    return;
                }
            };
            if kind == TransactionKind::Topup {
                notifier.payment_received(&account, amount_usd, balance).await;
            }
            if balance < threshold {
                notifier.low_balance(&account, balance).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;
    use crate::notify::LogNotifier;
    use crate::store::mem::MemoryKv;

    /// Provider stub that rejects every signature.
    struct RejectingProvider {
        hostile: bool,
    }

    #[async_trait]
    impl PaymentProvider for RejectingProvider {
        fn name(&self) -> &'static str {
            "rejecting"
        }

        fn retry_hostile(&self) -> bool {
            self.hostile
        }

        async fn create_checkout(
            &self,
            _request: &PaymentRequest,
            _urls: &CheckoutUrls,
        ) -> Result<PaymentResult, ProviderError> {
            Err(ProviderError::Unsupported)
        }

        fn verify_webhook(&self, _event: &WebhookEvent) -> bool {
            false
        }

        async fn process_webhook(
            &self,
            _event: &WebhookEvent,
        ) -> Result<Option<super::super::Charge>, ProviderError> {
            panic!("must not be called after signature rejection");
        }

        async fn payment_status(&self, _id: &str) -> Result<PaymentStatus, ProviderError> {
            Ok(PaymentStatus::Pending)
        }
    }

    fn engine(hostile: bool) -> PaymentEngine {
        // Lazy pool: the rejected-signature paths never reach the database.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool");
        let ledger = Arc::new(Ledger::new(pool.clone(), Arc::new(MemoryKv::new())));
        let mut engine = PaymentEngine::new(pool, ledger, Arc::new(LogNotifier), dec!(5));
        engine.register(Arc::new(RejectingProvider { hostile }));
        engine
    }

    fn event() -> WebhookEvent {
        WebhookEvent {
            event_type: "whatever".into(),
            event_id: "evt_1".into(),
            data: json!({}),
            raw_body: b"{}".to_vec(),
            signature: "bad".into(),
        }
    }

    #[tokio::test]
    async fn bad_signature_is_silent_for_retry_hostile_providers() {
        let outcome = engine(true).process_webhook("rejecting", &event()).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::InvalidSignature { silent: true }));
    }

    #[tokio::test]
    async fn bad_signature_is_a_hard_failure_otherwise() {
        let outcome = engine(false).process_webhook("rejecting", &event()).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::InvalidSignature { silent: false }));
    }

    #[tokio::test]
    async fn unknown_provider_rejected() {
        let result = engine(false).process_webhook("nope", &event()).await;
        assert!(matches!(result, Err(EngineError::UnknownProvider(_))));
    }
}
