use std::time::Duration;

use backon::ExponentialBuilder;
use serde::Deserialize;

use crate::gateway::{DEFAULT_BASE_URL, SplitMode};
use crate::split::Managers;
use crate::types::{InvalidWalletId, WalletId};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_asaas_api_url")]
    pub asaas_api_url: String,
    #[serde(default)]
    pub asaas_api_key: String,
    #[serde(default = "default_gateway_timeout_ms")]
    pub gateway_timeout_ms: u64,
    /// Shared secret for webhook signatures; validation is off when unset.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    pub manager_a_wallet: String,
    pub manager_b_wallet: String,
    #[serde(default)]
    pub split_mode: SplitMode,
    #[serde(default = "default_polling_max_attempts")]
    pub polling_max_attempts: u32,
    #[serde(default = "default_polling_max_elapsed_ms")]
    pub polling_max_elapsed_ms: u64,
    #[serde(default = "default_polling_initial_delay_ms")]
    pub polling_initial_delay_ms: u64,
    #[serde(default = "default_polling_max_delay_ms")]
    pub polling_max_delay_ms: u64,
    #[serde(default = "default_webhook_retry_attempts")]
    pub webhook_retry_attempts: usize,
    #[serde(default = "default_webhook_retry_delay_ms")]
    pub webhook_retry_delay_ms: u64,
    #[serde(default = "default_click_rate_limit")]
    pub click_rate_limit: u32,
    #[serde(default = "default_click_rate_window_secs")]
    pub click_rate_window_secs: u64,
    #[serde(default = "default_storefront_url")]
    pub storefront_url: String,
}

fn default_server_port() -> u16 {
    8000
}

fn default_asaas_api_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_gateway_timeout_ms() -> u64 {
    15_000
}

fn default_polling_max_attempts() -> u32 {
    10
}

fn default_polling_max_elapsed_ms() -> u64 {
    300_000
}

fn default_polling_initial_delay_ms() -> u64 {
    2_000
}

fn default_polling_max_delay_ms() -> u64 {
    30_000
}

fn default_webhook_retry_attempts() -> usize {
    3
}

fn default_webhook_retry_delay_ms() -> u64 {
    200
}

fn default_click_rate_limit() -> u32 {
    30
}

fn default_click_rate_window_secs() -> u64 {
    60
}

fn default_storefront_url() -> String {
    "http://localhost:3000".to_string()
}

/// Bounded exponential backoff, turned into a `backon` builder on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_times: usize,
}

impl BackoffPolicy {
    pub fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_times)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        config.try_deserialize()
    }

    pub fn managers(&self) -> Result<Managers, InvalidWalletId> {
        Ok(Managers {
            manager_a: WalletId::parse(&self.manager_a_wallet)?,
            manager_b: WalletId::parse(&self.manager_b_wallet)?,
        })
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    pub fn polling_max_elapsed(&self) -> Duration {
        Duration::from_millis(self.polling_max_elapsed_ms)
    }

    pub fn polling_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            min_delay: Duration::from_millis(self.polling_initial_delay_ms),
            max_delay: Duration::from_millis(self.polling_max_delay_ms),
            max_times: self.polling_max_attempts as usize,
        }
    }

    pub fn webhook_retry(&self) -> BackoffPolicy {
        let delay = Duration::from_millis(self.webhook_retry_delay_ms);
        BackoffPolicy {
            min_delay: delay,
            max_delay: delay * 10,
            max_times: self.webhook_retry_attempts,
        }
    }

    pub fn click_rate_window(&self) -> Duration {
        Duration::from_secs(self.click_rate_window_secs)
    }
}
