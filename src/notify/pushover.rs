//! Pushover push transport.
//!
//! Emergency alerts are sent at Pushover priority 2, which repeats every
//! `retry` seconds until acknowledged or `expire` elapses. Everything else
//! goes out at priority 1.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::DispatchSettings;
use crate::error::DispatchError;
use crate::notify::Notifier;
use crate::pipeline::types::{Alert, Priority};

const DEFAULT_API_URL: &str = "https://api.pushover.net/1/messages.json";

/// Pushover credentials and emergency repeat settings.
#[derive(Debug, Clone)]
pub struct PushoverConfig {
    pub user_key: SecretString,
    pub app_token: SecretString,
    pub api_url: String,
    pub emergency_retry_secs: u32,
    pub emergency_expire_secs: u32,
}

impl PushoverConfig {
    /// Build config from environment variables.
    /// Returns `None` if either `PUSHOVER_USER_KEY` or `PUSHOVER_APP_TOKEN`
    /// is missing (transport disabled).
    pub fn from_env(settings: &DispatchSettings) -> Option<Self> {
        let user_key = std::env::var("PUSHOVER_USER_KEY")
            .ok()
            .filter(|s| !s.is_empty())?;
        let app_token = std::env::var("PUSHOVER_APP_TOKEN")
            .ok()
            .filter(|s| !s.is_empty())?;
        let api_url =
            std::env::var("PUSHOVER_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());

        Some(Self {
            user_key: SecretString::from(user_key),
            app_token: SecretString::from(app_token),
            api_url,
            emergency_retry_secs: settings.emergency_retry_secs,
            emergency_expire_secs: settings.emergency_expire_secs,
        })
    }
}

#[derive(Deserialize)]
struct PushoverResponse {
    status: i64,
    #[serde(default)]
    errors: Vec<String>,
}

pub struct PushoverNotifier {
    config: PushoverConfig,
    client: reqwest::Client,
}

impl PushoverNotifier {
    pub fn new(config: PushoverConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    /// Request body for one alert. Credentials are exposed only here.
    fn body(&self, alert: &Alert) -> serde_json::Value {
        let mut body = serde_json::json!({
            "token": self.config.app_token.expose_secret(),
            "user": self.config.user_key.expose_secret(),
            "title": alert.title(),
            "message": format!(
                "{}\nSources: {}",
                alert.reason, alert.source_count
            ),
        });
        match alert.priority {
            Priority::Emergency => {
                body["priority"] = 2.into();
                body["retry"] = self.config.emergency_retry_secs.max(30).into();
                body["expire"] = self.config.emergency_expire_secs.into();
            }
            Priority::Normal => {
                body["priority"] = 1.into();
            }
        }
        body
    }
}

#[async_trait]
impl Notifier for PushoverNotifier {
    fn name(&self) -> &str {
        "pushover"
    }

    fn supports_acknowledge(&self) -> bool {
        true
    }

    async fn send(&self, alert: &Alert) -> Result<(), DispatchError> {
        let resp = self
            .client
            .post(&self.config.api_url)
            .json(&self.body(alert))
            .send()
            .await
            .map_err(|e| DispatchError::RequestFailed {
                transport: "pushover".into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(DispatchError::RequestFailed {
                transport: "pushover".into(),
                reason: format!("HTTP {status}"),
            });
        }

        let parsed: Option<PushoverResponse> = resp.json().await.ok();
        match parsed {
            Some(r) if status.is_success() && r.status == 1 => {
                tracing::debug!(title = %alert.title(), "Pushover accepted alert");
                Ok(())
            }
            Some(r) => Err(DispatchError::Rejected {
                transport: "pushover".into(),
                reason: format!("HTTP {status}: {}", r.errors.join("; ")),
            }),
            None => Err(DispatchError::Rejected {
                transport: "pushover".into(),
                reason: format!("HTTP {status}: unreadable response"),
            }),
        }
    }
}
