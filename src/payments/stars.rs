//! Telegram Stars adapter.
//!
//! Checkout never calls out: it prices the top-up in stars, parks a
//! pending-invoice record in the key/value store and hands the payload to
//! the bot process, which raises the actual invoice. The webhook is the
//! bot's `successful_payment` callback; Telegram transport is trusted
//! end-to-end, so signature verification is trivially true.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    Charge, CheckoutUrls, PaymentProvider, PaymentRequest, PaymentResult, PaymentStatus,
    ProviderError, WebhookEvent,
};
use crate::models::TransactionKind;
use crate::store::KvStore;

pub const DEFAULT_STARS_PER_USD: i64 = 50;

const PENDING_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Serialize, Deserialize)]
struct PendingInvoice {
    account_id: Uuid,
    stars: i64,
    amount_usd: Decimal,
    idempotency_key: String,
    created_at: DateTime<Utc>,
}

pub struct TelegramStarsProvider {
    kv: Arc<dyn KvStore>,
    stars_per_usd: i64,
}

impl TelegramStarsProvider {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            stars_per_usd: DEFAULT_STARS_PER_USD,
        }
    }

    fn pending_key(payload: &str) -> String {
        format!("pending_invoice:{payload}")
    }

    fn stars_for(&self, amount_usd: Decimal) -> i64 {
        (amount_usd * Decimal::from(self.stars_per_usd))
            .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven)
            .to_i64()
            .unwrap_or(0)
            .max(1)
    }
}

#[async_trait::async_trait]
impl PaymentProvider for TelegramStarsProvider {
    fn name(&self) -> &'static str {
        "telegram_stars"
    }

    async fn create_checkout(
        &self,
        request: &PaymentRequest,
        _urls: &CheckoutUrls,
    ) -> Result<PaymentResult, ProviderError> {
        let stars = self.stars_for(request.amount_usd);
        let key8: String = request.idempotency_key.chars().take(8).collect();
        let now = Utc::now();
        let payload = format!("topup:{}:{}:{key8}", request.account_id, now.timestamp());

        let pending = PendingInvoice {
            account_id: request.account_id,
            stars,
            amount_usd: request.amount_usd,
            idempotency_key: request.idempotency_key.clone(),
            created_at: now,
        };
        let value = serde_json::to_string(&pending)
            .map_err(|e| ProviderError::Parse(format!("pending invoice encode: {e}")))?;
        self.kv
            .set_ex(&Self::pending_key(&payload), &value, PENDING_TTL)
            .await
            .map_err(|e| ProviderError::Config(format!("invoice store: {e}")))?;

        Ok(PaymentResult {
            payment_id: payload.clone(),
            status: PaymentStatus::Pending,
            checkout_url: None,
            invoice_payload: Some(payload),
            expires_at: Some(now + chrono::Duration::from_std(PENDING_TTL).expect("ttl fits")),
        })
    }

    fn verify_webhook(&self, _event: &WebhookEvent) -> bool {
        true
    }

    async fn process_webhook(
        &self,
        event: &WebhookEvent,
    ) -> Result<Option<Charge>, ProviderError> {
        let payload = event.data["invoice_payload"]
            .as_str()
            .ok_or_else(|| ProviderError::Parse("invoice_payload missing".into()))?;
        let payer: Uuid = event.data["account_id"]
            .as_str()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ProviderError::Parse("payer account_id missing".into()))?;

        // The payload names the account the invoice was issued for; a
        // different payer must not be able to redeem it.
        let invoice_account: Uuid = payload
            .split(':')
            .nth(1)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ProviderError::Parse(format!("malformed payload {payload}")))?;
        if invoice_account != payer {
            return Err(ProviderError::Parse(format!(
                "payload account {invoice_account} does not match payer {payer}"
            )));
        }

        let raw = self
            .kv
            .get_del(&Self::pending_key(payload))
            .await
            .map_err(|e| ProviderError::Config(format!("invoice store: {e}")))?
            .ok_or_else(|| ProviderError::Parse("unknown or expired invoice".into()))?;
        let pending: PendingInvoice = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::Parse(format!("pending invoice decode: {e}")))?;

        let external_id = event.data["telegram_payment_charge_id"]
            .as_str()
            .unwrap_or(&event.event_id)
            .to_string();

        Ok(Some(Charge {
            account_id: pending.account_id,
            amount_usd: pending.amount_usd,
            kind: TransactionKind::Topup,
            external_id,
            description: format!("Telegram Stars top-up ({} stars)", pending.stars),
        }))
    }

    async fn payment_status(&self, payment_id: &str) -> Result<PaymentStatus, ProviderError> {
        // A live pending record means unpaid; once consumed (or expired)
        // the ledger row is the authoritative record of success.
        let pending = self
            .kv
            .get(&Self::pending_key(payment_id))
            .await
            .map_err(|e| ProviderError::Config(format!("invoice store: {e}")))?;
        Ok(match pending {
            Some(_) => PaymentStatus::Pending,
            None => PaymentStatus::Completed,
        })
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;
    use crate::store::mem::MemoryKv;

    fn provider() -> TelegramStarsProvider {
        TelegramStarsProvider::new(Arc::new(MemoryKv::new()))
    }

    fn request(account_id: Uuid) -> PaymentRequest {
        PaymentRequest {
            account_id,
            amount_usd: dec!(10),
            idempotency_key: "topup_abc12345_rest".into(),
        }
    }

    #[test]
    fn star_pricing() {
        let provider = provider();
        assert_eq!(provider.stars_for(dec!(10)), 500);
        assert_eq!(provider.stars_for(dec!(1)), 50);
        // Floors at one star.
        assert_eq!(provider.stars_for(dec!(0.001)), 1);
    }

    #[tokio::test]
    async fn checkout_parks_a_pending_invoice() {
        let account_id = Uuid::new_v4();
        let provider = provider();

        let result = provider
            .create_checkout(&request(account_id), &CheckoutUrls::default())
            .await
            .unwrap();

        assert_eq!(result.status, PaymentStatus::Pending);
        let payload = result.invoice_payload.unwrap();
        assert!(payload.starts_with(&format!("topup:{account_id}:")));
        assert!(payload.ends_with(":topup_ab"));
        assert_eq!(
            provider.payment_status(&payload).await.unwrap(),
            PaymentStatus::Pending
        );
    }

    #[tokio::test]
    async fn successful_payment_consumes_the_invoice_once() {
        let account_id = Uuid::new_v4();
        let provider = provider();
        let result = provider
            .create_checkout(&request(account_id), &CheckoutUrls::default())
            .await
            .unwrap();
        let payload = result.invoice_payload.unwrap();

        let event = WebhookEvent {
            event_type: "successful_payment".into(),
            event_id: "pay_1".into(),
            data: json!({
                "invoice_payload": payload,
                "account_id": account_id,
                "total_amount": 500,
                "telegram_payment_charge_id": "tg_charge_9",
            }),
            raw_body: Vec::new(),
            signature: String::new(),
        };

        let charge = provider.process_webhook(&event).await.unwrap().unwrap();
        assert_eq!(charge.account_id, account_id);
        assert_eq!(charge.amount_usd, dec!(10));
        assert_eq!(charge.external_id, "tg_charge_9");

        // Invoice is gone; a replayed callback is a permanent parse error.
        let err = provider.process_webhook(&event).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn mismatched_payer_rejected() {
        let account_id = Uuid::new_v4();
        let provider = provider();
        let result = provider
            .create_checkout(&request(account_id), &CheckoutUrls::default())
            .await
            .unwrap();

        let event = WebhookEvent {
            event_type: "successful_payment".into(),
            event_id: "pay_2".into(),
            data: json!({
                "invoice_payload": result.invoice_payload.unwrap(),
                "account_id": Uuid::new_v4(),
                "total_amount": 500,
            }),
            raw_body: Vec::new(),
            signature: String::new(),
        };

        assert!(provider.process_webhook(&event).await.is_err());
    }
}
