//! Notification dispatch.
//!
//! The [`Dispatcher`] hands each decided [`Alert`] to every configured
//! transport, retrying transient failures with exponential backoff plus
//! jitter. Nothing is silently dropped: an alert that no suitable transport
//! accepted is reported as undelivered in its [`DeliveryReport`].

pub mod email;
pub mod pushover;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::DispatchSettings;
use crate::error::DispatchError;
use crate::pipeline::types::{Alert, Priority};

pub use email::{EmailConfig, EmailNotifier};
pub use pushover::{PushoverConfig, PushoverNotifier};

/// An outbound alert transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the transport can repeat until acknowledged.
    fn supports_acknowledge(&self) -> bool {
        false
    }

    /// Whether sends are only logged.
    fn is_dry_run(&self) -> bool {
        false
    }

    /// Deliver one alert. `Rejected` is permanent; `RequestFailed` is retried.
    async fn send(&self, alert: &Alert) -> Result<(), DispatchError>;
}

// ── Delivery records ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    DryRun,
    /// Transport enabled but credentials missing.
    NotConfigured,
    Failed,
}

/// Outcome for one alert on one transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDelivery {
    pub transport: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Outcome for one alert across all transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub alert: Alert,
    pub deliveries: Vec<ChannelDelivery>,
    /// False means the alert was decided but never reached a suitable channel.
    pub delivered: bool,
}

// ── Retry policy ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`: base * 2^(attempt-1) plus up to
    /// half of base in jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_backoff.as_millis() as u64;
        let exp = base_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(10));
        let jitter = if base_ms > 1 {
            rand::thread_rng().gen_range(0..base_ms / 2)
        } else {
            0
        };
        Duration::from_millis(exp + jitter)
    }
}

impl From<&DispatchSettings> for RetryPolicy {
    fn from(s: &DispatchSettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            base_backoff: Duration::from_millis(s.base_backoff_ms),
        }
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────

struct Slot {
    name: String,
    notifier: Option<Arc<dyn Notifier>>,
}

/// Fans alerts out to transports.
pub struct Dispatcher {
    slots: Vec<Slot>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            slots: Vec::new(),
            retry,
        }
    }

    /// Register a transport. `None` records the transport as not configured.
    pub fn with_transport(
        mut self,
        name: impl Into<String>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        self.slots.push(Slot {
            name: name.into(),
            notifier,
        });
        self
    }

    /// Build from settings and the environment.
    ///
    /// In dry-run mode every enabled transport is replaced by a
    /// [`LogNotifier`].
    pub fn from_settings(settings: &DispatchSettings, dry_run: bool) -> Self {
        let mut dispatcher = Self::new(RetryPolicy::from(settings));
        if settings.use_push {
            let notifier: Option<Arc<dyn Notifier>> = if dry_run {
                Some(Arc::new(LogNotifier::new("pushover").acknowledging()))
            } else {
                PushoverConfig::from_env(settings)
                    .map(|c| Arc::new(PushoverNotifier::new(c)) as Arc<dyn Notifier>)
            };
            dispatcher = dispatcher.with_transport("pushover", notifier);
        }
        if settings.use_email {
            let notifier: Option<Arc<dyn Notifier>> = if dry_run {
                Some(Arc::new(LogNotifier::new("email")))
            } else {
                EmailConfig::from_env()
                    .map(|c| Arc::new(EmailNotifier::new(c)) as Arc<dyn Notifier>)
            };
            dispatcher = dispatcher.with_transport("email", notifier);
        }
        for slot in &dispatcher.slots {
            if slot.notifier.is_none() {
                warn!(transport = %slot.name, "Transport enabled but not configured");
            }
        }
        dispatcher
    }

    /// Deliver every alert, in order.
    pub async fn dispatch_all(&self, alerts: &[Alert]) -> Vec<DeliveryReport> {
        let mut reports = Vec::with_capacity(alerts.len());
        for alert in alerts {
            reports.push(self.dispatch(alert).await);
        }
        reports
    }

    /// Deliver one alert to every transport.
    ///
    /// Emergency alerts count as delivered only when a transport with
    /// acknowledge semantics accepted them.
    pub async fn dispatch(&self, alert: &Alert) -> DeliveryReport {
        let mut deliveries = Vec::with_capacity(self.slots.len());
        let mut delivered = false;

        for slot in &self.slots {
            let Some(notifier) = &slot.notifier else {
                deliveries.push(ChannelDelivery {
                    transport: slot.name.clone(),
                    status: DeliveryStatus::NotConfigured,
                    attempts: 0,
                    error: None,
                });
                continue;
            };

            let delivery = self.send_with_retry(notifier.as_ref(), alert).await;
            let accepted = matches!(
                delivery.status,
                DeliveryStatus::Delivered | DeliveryStatus::DryRun
            );
            let suitable = match alert.priority {
                Priority::Emergency => notifier.supports_acknowledge(),
                Priority::Normal => true,
            };
            delivered |= accepted && suitable;
            deliveries.push(delivery);
        }

        if delivered {
            info!(alert = %alert.title(), priority = alert.priority.label(), "Alert dispatched");
        } else {
            warn!(
                alert = %alert.title(),
                priority = alert.priority.label(),
                "Alert decided but undelivered"
            );
        }

        DeliveryReport {
            alert: alert.clone(),
            deliveries,
            delivered,
        }
    }

    async fn send_with_retry(&self, notifier: &dyn Notifier, alert: &Alert) -> ChannelDelivery {
        let max = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max {
            match notifier.send(alert).await {
                Ok(()) => {
                    return ChannelDelivery {
                        transport: notifier.name().to_string(),
                        status: if notifier.is_dry_run() {
                            DeliveryStatus::DryRun
                        } else {
                            DeliveryStatus::Delivered
                        },
                        attempts: attempt,
                        error: None,
                    };
                }
                Err(e @ DispatchError::Rejected { .. }) => {
                    warn!(transport = notifier.name(), error = %e, "Transport rejected alert");
                    return ChannelDelivery {
                        transport: notifier.name().to_string(),
                        status: DeliveryStatus::Failed,
                        attempts: attempt,
                        error: Some(e.to_string()),
                    };
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < max {
                        let wait = self.retry.backoff(attempt);
                        debug!(
                            transport = notifier.name(),
                            attempt,
                            wait_ms = wait.as_millis() as u64,
                            error = %e,
                            "Send failed, backing off"
                        );
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        let exhausted = DispatchError::Exhausted {
            transport: notifier.name().to_string(),
            attempts: max,
            last_error,
        };
        warn!(error = %exhausted, "Giving up on transport");
        ChannelDelivery {
            transport: notifier.name().to_string(),
            status: DeliveryStatus::Failed,
            attempts: max,
            error: Some(exhausted.to_string()),
        }
    }
}

// ── Log-only transport ──────────────────────────────────────────────

/// Logs what would have been sent. Used for dry runs.
pub struct LogNotifier {
    name: String,
    acknowledge: bool,
}

impl LogNotifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            acknowledge: false,
        }
    }

    /// Stand in for a transport with acknowledge semantics.
    pub fn acknowledging(mut self) -> Self {
        self.acknowledge = true;
        self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_acknowledge(&self) -> bool {
        self.acknowledge
    }

    fn is_dry_run(&self) -> bool {
        true
    }

    async fn send(&self, alert: &Alert) -> Result<(), DispatchError> {
        info!(
            transport = %self.name,
            title = %alert.title(),
            priority = alert.priority.label(),
            reason = %alert.reason,
            "[DRY] Would send alert"
        );
        Ok(())
    }
}
