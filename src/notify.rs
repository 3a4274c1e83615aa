//! User notifications (top-up confirmations, low-balance warnings).
//! Delivery is best-effort; failures are logged and swallowed.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;

use crate::credits;
use crate::models::Account;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn payment_received(&self, account: &Account, amount_usd: Decimal, balance: Decimal);

    async fn low_balance(&self, account: &Account, balance: Decimal);
}

/// Sends messages through the Telegram bot API to accounts with a linked
/// Telegram identity; others are skipped.
pub struct TelegramNotifier {
    bot_token: String,
    http: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, http: reqwest::Client) -> Self {
        Self { bot_token, http }
    }

    async fn send(&self, account: &Account, text: String) {
        let Some(chat_id) = account.telegram_id else {
            return;
        };
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let result = self
            .http
            .post(url)
            .json(&json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(chat_id, status = %response.status(), "notification rejected");
            }
            Err(err) => tracing::warn!(chat_id, error = %err, "notification failed"),
            Ok(_) => {}
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn payment_received(&self, account: &Account, amount_usd: Decimal, balance: Decimal) {
        let amount = credits::format_credits(amount_usd).unwrap_or_else(|_| "credits".into());
        let total = credits::format_credits(balance).unwrap_or_else(|_| "credits".into());
        self.send(
            account,
            format!("Payment received: {amount} added. Balance: {total}."),
        )
        .await;
    }

    async fn low_balance(&self, account: &Account, balance: Decimal) {
        let total = credits::format_credits(balance.max(Decimal::ZERO))
            .unwrap_or_else(|_| "credits".into());
        self.send(
            account,
            format!("Your balance is running low ({total} left). Top up to avoid interruptions."),
        )
        .await;
    }
}

/// Used when no Telegram bot token is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn payment_received(&self, account: &Account, amount_usd: Decimal, balance: Decimal) {
        tracing::info!(account_id = %account.id, %amount_usd, %balance, "payment received");
    }

    async fn low_balance(&self, account: &Account, balance: Decimal) {
        tracing::info!(account_id = %account.id, %balance, "balance low");
    }
}
