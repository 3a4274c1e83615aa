//! Lemon Squeezy adapter.
//!
//! Webhooks are signed with a bare hex HMAC in `X-Signature`; mismatches
//! are answered 403 (Lemon Squeezy stops redelivering on 4xx).

use rust_decimal::Decimal;
use serde_json::{Value, json};

use super::{
    Charge, CheckoutUrls, PaymentProvider, PaymentRequest, PaymentResult, PaymentStatus,
    ProviderError, WebhookEvent, hmac_hex, http, signatures_match,
};
use crate::models::TransactionKind;

const API_BASE: &str = "https://api.lemonsqueezy.com/v1";

pub struct LemonSqueezyProvider {
    api_key: String,
    store_id: String,
    variant_id: String,
    webhook_secret: String,
    http: reqwest::Client,
}

impl LemonSqueezyProvider {
    pub fn new(
        api_key: String,
        store_id: String,
        variant_id: String,
        webhook_secret: String,
    ) -> Self {
        Self {
            api_key,
            store_id,
            variant_id,
            webhook_secret,
            http: http::client(),
        }
    }
}

#[async_trait::async_trait]
impl PaymentProvider for LemonSqueezyProvider {
    fn name(&self) -> &'static str {
        "lemonsqueezy"
    }

    async fn create_checkout(
        &self,
        request: &PaymentRequest,
        urls: &CheckoutUrls,
    ) -> Result<PaymentResult, ProviderError> {
        let cents = (request.amount_usd * Decimal::from(100)).trunc();
        let mut checkout_options = json!({ "embed": false });
        if let Some(success) = &urls.success {
            checkout_options["redirect_url"] = json!(success);
        }

        let body = json!({
            "data": {
                "type": "checkouts",
                "attributes": {
                    "custom_price": cents,
                    "checkout_options": checkout_options,
                    "checkout_data": {
                        "custom": {
                            "account_id": request.account_id,
                            "idempotency_key": request.idempotency_key,
                        },
                    },
                },
                "relationships": {
                    "store": { "data": { "type": "stores", "id": self.store_id } },
                    "variant": { "data": { "type": "variants", "id": self.variant_id } },
                },
            },
        });

        let response = http::send_with_retry("lemonsqueezy", "checkouts", || {
            self.http
                .post(format!("{API_BASE}/checkouts"))
                .bearer_auth(&self.api_key)
                .header("Accept", "application/vnd.api+json")
                .header("Content-Type", "application/vnd.api+json")
                .json(&body)
        })
        .await?;

        let parsed: Value = response.json().await?;
        let data = &parsed["data"];
        let payment_id = data["id"]
            .as_str()
            .ok_or_else(|| ProviderError::Parse("checkout id missing".into()))?
            .to_string();

        Ok(PaymentResult {
            payment_id,
            status: PaymentStatus::Pending,
            checkout_url: data["attributes"]["url"].as_str().map(str::to_string),
            invoice_payload: None,
            expires_at: data["attributes"]["expires_at"]
                .as_str()
                .and_then(|v| v.parse().ok()),
        })
    }

    fn verify_webhook(&self, event: &WebhookEvent) -> bool {
        signatures_match(
            &hmac_hex(&self.webhook_secret, &event.raw_body),
            &event.signature,
        )
    }

    async fn process_webhook(
        &self,
        event: &WebhookEvent,
    ) -> Result<Option<Charge>, ProviderError> {
        let kind = match event.event_type.as_str() {
            "order_created" => TransactionKind::Topup,
            "order_refunded" => TransactionKind::Refund,
            _ => return Ok(None),
        };

        let account_id = event.data["meta"]["custom_data"]["account_id"]
            .as_str()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ProviderError::Parse("custom_data.account_id missing".into()))?;

        let attributes = &event.data["data"]["attributes"];
        let cents = attributes["total"]
            .as_i64()
            .ok_or_else(|| ProviderError::Parse("order total missing".into()))?;
        let amount_usd = Decimal::from(cents) / Decimal::from(100);

        let external_id = event.data["data"]["id"]
            .as_str()
            .unwrap_or(&event.event_id)
            .to_string();
        let description = match kind {
            TransactionKind::Refund => format!("Lemon Squeezy refund, order {external_id}"),
            _ => format!("Lemon Squeezy top-up, order {external_id}"),
        };

        Ok(Some(Charge {
            account_id,
            amount_usd,
            kind,
            external_id,
            description,
        }))
    }

    async fn payment_status(&self, payment_id: &str) -> Result<PaymentStatus, ProviderError> {
        let response = http::send_with_retry("lemonsqueezy", "get_order", || {
            self.http
                .get(format!("{API_BASE}/orders/{payment_id}"))
                .bearer_auth(&self.api_key)
                .header("Accept", "application/vnd.api+json")
        })
        .await?;

        let parsed: Value = response.json().await?;
        Ok(match parsed["data"]["attributes"]["status"].as_str() {
            Some("paid") => PaymentStatus::Completed,
            Some("refunded") => PaymentStatus::Refunded,
            Some("failed") => PaymentStatus::Failed,
            _ => PaymentStatus::Pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn provider() -> LemonSqueezyProvider {
        LemonSqueezyProvider::new("key".into(), "1".into(), "2".into(), "whsec".into())
    }

    fn event(body: Value, signature: &str, event_type: &str) -> WebhookEvent {
        WebhookEvent {
            event_type: event_type.into(),
            event_id: "evt_7".into(),
            raw_body: body.to_string().into_bytes(),
            data: body,
            signature: signature.into(),
        }
    }

    #[test]
    fn bare_hex_signature_verifies() {
        let provider = provider();
        let body = json!({"meta": {"event_name": "order_created"}});
        let signature = hmac_hex("whsec", body.to_string().as_bytes());
        assert!(provider.verify_webhook(&event(body, &signature, "order_created")));
    }

    #[test]
    fn wrong_signature_rejected() {
        let provider = provider();
        let body = json!({"meta": {"event_name": "order_created"}});
        assert!(!provider.verify_webhook(&event(body, "deadbeef", "order_created")));
    }

    #[tokio::test]
    async fn order_created_parses_to_topup() {
        let provider = provider();
        let account_id = uuid::Uuid::new_v4();
        let body = json!({
            "meta": { "event_name": "order_created", "custom_data": { "account_id": account_id } },
            "data": { "id": "1137", "attributes": { "total": 500 } },
        });

        let charge = provider
            .process_webhook(&event(body, "", "order_created"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(charge.account_id, account_id);
        assert_eq!(charge.amount_usd, dec!(5));
        assert_eq!(charge.kind, TransactionKind::Topup);
    }

    #[tokio::test]
    async fn missing_metadata_is_permanent_error() {
        let provider = provider();
        let body = json!({
            "meta": { "event_name": "order_created" },
            "data": { "id": "1137", "attributes": { "total": 500 } },
        });

        let err = provider
            .process_webhook(&event(body, "", "order_created"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
