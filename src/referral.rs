//! Client-side referral attribution.
//!
//! The storefront captures `?ref=` from the landing URL, keeps it for
//! [`ATTRIBUTION_TTL_DAYS`], and reports clicks and conversions back to the
//! engine. Reporting is best-effort and never fails the caller.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{Campaign, normalize_referral_code};

pub const ATTRIBUTION_TTL_DAYS: i64 = 30;
pub const STORAGE_KEY: &str = "referral_attribution";

const REF_PARAM: &str = "ref";

/// A captured referral code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    pub code: String,
    pub captured_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub campaign: Campaign,
}

/// String key/value storage, `localStorage` in the browser.
pub trait AttributionStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str);
    fn remove_item(&self, key: &str);
}

#[derive(Debug, Default)]
pub struct MemoryAttributionStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryAttributionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AttributionStorage for MemoryAttributionStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) {
        self.items().insert(key.to_string(), value.to_string());
    }

    fn remove_item(&self, key: &str) {
        self.items().remove(key);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("engine returned {0}")]
    Status(u16),
}

#[async_trait]
pub trait AttributionReporter: Send + Sync {
    async fn report_click(&self, code: &str, campaign: &Campaign) -> Result<(), ReportError>;

    async fn report_conversion(&self, code: &str, order_id: Uuid) -> Result<(), ReportError>;
}

/// Posts attribution events to the engine's `/referrals/*` routes.
pub struct HttpAttributionReporter {
    client: Client,
    base_url: String,
}

impl HttpAttributionReporter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ReportError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<(), ReportError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ReportError::Status(response.status().as_u16()))
        }
    }
}

#[async_trait]
impl AttributionReporter for HttpAttributionReporter {
    async fn report_click(&self, code: &str, campaign: &Campaign) -> Result<(), ReportError> {
        self.post("/referrals/clicks", json!({ "code": code, "campaign": campaign }))
            .await
    }

    async fn report_conversion(&self, code: &str, order_id: Uuid) -> Result<(), ReportError> {
        self.post("/referrals/conversions", json!({ "code": code, "order_id": order_id }))
            .await
    }
}

pub struct ReferralTracker<S, R> {
    storage: S,
    reporter: R,
}

impl<S: AttributionStorage, R: AttributionReporter> ReferralTracker<S, R> {
    pub fn new(storage: S, reporter: R) -> Self {
        Self { storage, reporter }
    }

    pub fn capture(&self, query: &str) -> Option<Attribution> {
        self.capture_at(query, Utc::now())
    }

    /// Stores the normalized `ref` code from `query`, replacing any earlier
    /// capture. Absent or blank codes leave storage untouched.
    pub fn capture_at(&self, query: &str, now: DateTime<Utc>) -> Option<Attribution> {
        let params = query_params(query);
        let code = params
            .iter()
            .find(|(k, _)| k == REF_PARAM)
            .and_then(|(_, v)| normalize_referral_code(v))?;
        let param = |name: &str| {
            params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .filter(|v| !v.is_empty())
        };

        let attribution = Attribution {
            code,
            captured_at: now,
            expires_at: now + TimeDelta::days(ATTRIBUTION_TTL_DAYS),
            campaign: Campaign {
                utm_source: param("utm_source"),
                utm_medium: param("utm_medium"),
                utm_campaign: param("utm_campaign"),
            },
        };
        match serde_json::to_string(&attribution) {
            Ok(encoded) => self.storage.set_item(STORAGE_KEY, &encoded),
            Err(err) => warn!(error = %err, "could not encode referral attribution"),
        }
        debug!(code = %attribution.code, "referral code captured");
        Some(attribution)
    }

    pub fn get(&self) -> Option<Attribution> {
        self.get_at(Utc::now())
    }

    /// Active attribution at `now`. Expired or undecodable entries are
    /// removed on read.
    pub fn get_at(&self, now: DateTime<Utc>) -> Option<Attribution> {
        let raw = self.storage.get_item(STORAGE_KEY)?;
        let attribution: Attribution = match serde_json::from_str(&raw) {
            Ok(attribution) => attribution,
            Err(err) => {
                warn!(error = %err, "discarding unreadable referral attribution");
                self.clear();
                return None;
            }
        };
        if now >= attribution.expires_at {
            debug!(code = %attribution.code, "referral attribution expired");
            self.clear();
            return None;
        }
        Some(attribution)
    }

    pub fn clear(&self) {
        self.storage.remove_item(STORAGE_KEY);
    }

    /// Captures from `query` and reports the click. Report failures are logged.
    pub async fn track_click(&self, query: &str) -> Option<Attribution> {
        let attribution = self.capture(query)?;
        if let Err(err) = self
            .reporter
            .report_click(&attribution.code, &attribution.campaign)
            .await
        {
            warn!(code = %attribution.code, error = %err, "referral click report failed");
        }
        Some(attribution)
    }

    /// Reports the active code against `order_id` and clears it once the
    /// engine acknowledged. Returns whether a conversion was reported.
    pub async fn track_conversion(&self, order_id: Uuid) -> bool {
        let Some(attribution) = self.get() else {
            return false;
        };
        match self.reporter.report_conversion(&attribution.code, order_id).await {
            Ok(()) => {
                self.clear();
                true
            }
            Err(err) => {
                warn!(code = %attribution.code, %order_id, error = %err, "referral conversion report failed");
                false
            }
        }
    }
}

fn query_params(query: &str) -> Vec<(String, String)> {
    let query = query.trim_start_matches('?');
    match Url::parse(&format!("http://localhost/?{query}")) {
        Ok(url) => url.query_pairs().into_owned().collect(),
        Err(_) => Vec::new(),
    }
}

fn is_tracking_param(name: &str) -> bool {
    name == REF_PARAM || name.starts_with("utm_")
}

/// `url` without `ref` and `utm_*` parameters. Unparseable input is returned
/// as is.
pub fn strip_tracking_params(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .into_owned()
        .filter(|(k, _)| !is_tracking_param(k))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }
    parsed.to_string()
}
