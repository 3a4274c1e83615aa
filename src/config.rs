use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Immutable process configuration, loaded once at startup and threaded
/// through constructors. No other code reads the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub redis_url: String,

    /// Secret for API-key MACs and access-token signing.
    pub server_secret: String,

    pub frontend_url: String,
    /// Externally reachable base URL of this gateway (OAuth redirects).
    pub public_url: String,
    pub cors_origins: Vec<String>,
    pub topup_url: String,

    // Upstream product services
    pub chart2csv_url: String,
    pub masker_url: String,
    pub patas_url: String,
    pub reliapi_url: String,

    // Telegram (login widget + stars + notifications)
    pub telegram_bot_token: Option<String>,

    // Google OAuth
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,

    pub paddle: ProviderSettings,
    pub lemonsqueezy: LemonSqueezySettings,

    /// Transactional-email HTTP API key; email is disabled when unset.
    pub email_api_key: Option<String>,

    /// Balance below which a top-up prompts a low-balance notification.
    pub low_balance_threshold: Decimal,
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub sandbox: bool,
}

#[derive(Debug, Clone)]
pub struct LemonSqueezySettings {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub store_id: Option<String>,
    pub variant_id: Option<String>,
    pub webhook_secret: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let frontend_url =
            env_or("FRONTEND_URL", "http://localhost:3000").trim_end_matches('/').to_string();

        let cors_origins = env("CORS_ORIGINS")
            .unwrap_or_else(|| format!("{frontend_url},http://localhost:5173"))
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Settings {
            database_url: env("DATABASE_URL").context("DATABASE_URL is required")?,
            redis_url: env_or("REDIS_URL", "redis://localhost:6379/0"),
            server_secret: env("SERVER_SECRET").context("SERVER_SECRET is required")?,
            topup_url: env_or("TOPUP_URL", &format!("{frontend_url}/pricing")),
            public_url: env_or("PUBLIC_URL", "http://localhost:8080")
                .trim_end_matches('/')
                .to_string(),
            frontend_url,
            cors_origins,
            chart2csv_url: env_or("CHART2CSV_URL", "http://localhost:8101"),
            masker_url: env_or("MASKER_URL", "http://localhost:8102"),
            patas_url: env_or("PATAS_URL", "http://localhost:8103"),
            reliapi_url: env_or("RELIAPI_URL", "http://localhost:8104"),
            telegram_bot_token: env("TELEGRAM_BOT_TOKEN"),
            google_client_id: env("GOOGLE_CLIENT_ID"),
            google_client_secret: env("GOOGLE_CLIENT_SECRET"),
            paddle: ProviderSettings {
                enabled: env_flag("BILLING_PADDLE_ENABLED", false),
                api_key: env("PADDLE_API_KEY"),
                webhook_secret: env("PADDLE_WEBHOOK_SECRET"),
                sandbox: env_or("PADDLE_ENVIRONMENT", "sandbox") == "sandbox",
            },
            lemonsqueezy: LemonSqueezySettings {
                enabled: env_flag("BILLING_LEMONSQUEEZY_ENABLED", true),
                api_key: env("LEMONSQUEEZY_API_KEY"),
                store_id: env("LEMONSQUEEZY_STORE_ID"),
                variant_id: env("LEMONSQUEEZY_VARIANT_ID"),
                webhook_secret: env("LEMONSQUEEZY_WEBHOOK_SECRET"),
            },
            email_api_key: env("EMAIL_API_KEY"),
            low_balance_threshold: dec!(5),
        })
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env(key).unwrap_or_else(|| default.to_string())
}

fn env_flag(key: &str, default: bool) -> bool {
    match env(key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}
