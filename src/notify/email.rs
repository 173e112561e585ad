//! Email transport: best-effort SMTP delivery via lettre.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use crate::error::DispatchError;
use crate::notify::Notifier;
use crate::pipeline::types::{Alert, Priority};

// ── Configuration ───────────────────────────────────────────────────

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub to_address: String,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `SMTP_HOST` or `ALERT_EMAIL_TO` is not set
    /// (transport disabled).
    pub fn from_env() -> Option<Self> {
        let smtp_host = std::env::var("SMTP_HOST").ok().filter(|s| !s.is_empty())?;
        let to_address = std::env::var("ALERT_EMAIL_TO")
            .ok()
            .filter(|s| !s.is_empty())?;

        let smtp_port: u16 = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(465);

        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("ALERT_EMAIL_FROM").unwrap_or_else(|_| username.clone());

        Some(Self {
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            to_address,
        })
    }
}

/// Subject and plain-text body for an alert.
pub fn render(alert: &Alert) -> (String, String) {
    let mut subject = alert.title();
    if alert.escalated {
        subject.push_str(" (escalated)");
    }
    let mut body = format!(
        "{name}: {category} at severity {severity}\n\n{reason}\n\nIndependent sources: {sources}\nDecided at: {at}\n",
        name = alert.location_name,
        category = alert.category,
        severity = alert.severity,
        reason = alert.reason,
        sources = alert.source_count,
        at = alert.emitted_at.to_rfc3339(),
    );
    if alert.priority == Priority::Emergency {
        body.push_str("\nEmergency priority: acknowledge on your push device.\n");
    }
    (subject, body)
}

// ── Notifier ────────────────────────────────────────────────────────

pub struct EmailNotifier {
    config: EmailConfig,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn build_message(&self, alert: &Alert) -> Result<Message, DispatchError> {
        let (subject, body) = render(alert);
        Message::builder()
            .from(self.config.from_address.parse().map_err(|e| {
                DispatchError::Rejected {
                    transport: "email".into(),
                    reason: format!("Invalid from address: {e}"),
                }
            })?)
            .to(self.config.to_address.parse().map_err(|e| DispatchError::Rejected {
                transport: "email".into(),
                reason: format!("Invalid to address: {e}"),
            })?)
            .subject(subject)
            .body(body)
            .map_err(|e| DispatchError::Rejected {
                transport: "email".into(),
                reason: format!("Failed to build email: {e}"),
            })
    }

    /// Send via SMTP. Blocking; called from `spawn_blocking`.
    fn send_blocking(config: &EmailConfig, email: &Message) -> Result<(), DispatchError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let builder = if config.smtp_port == 465 {
            SmtpTransport::relay(&config.smtp_host)
        } else {
            SmtpTransport::starttls_relay(&config.smtp_host)
        };
        let transport = builder
            .map_err(|e| DispatchError::Rejected {
                transport: "email".into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        transport.send(email).map_err(|e| {
            if e.is_permanent() {
                DispatchError::Rejected {
                    transport: "email".into(),
                    reason: format!("SMTP send failed: {e}"),
                }
            } else {
                DispatchError::RequestFailed {
                    transport: "email".into(),
                    reason: format!("SMTP send failed: {e}"),
                }
            }
        })?;

        tracing::info!(to = %config.to_address, "Alert email sent");
        Ok(())
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, alert: &Alert) -> Result<(), DispatchError> {
        let email = self.build_message(alert)?;
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || Self::send_blocking(&config, &email))
            .await
            .map_err(|e| DispatchError::RequestFailed {
                transport: "email".into(),
                reason: format!("SMTP task failed: {e}"),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::pipeline::types::{Category, Severity};

    fn alert(priority: Priority, escalated: bool) -> Alert {
        Alert {
            location_id: "work".into(),
            location_name: "Office".into(),
            category: Category::Hazmat,
            severity: Severity::URGENT,
            source_count: 2,
            reason: "escalated from severity 2 to 3: confirmed".into(),
            priority,
            escalated,
            emitted_at: Utc::now(),
        }
    }

    fn config(from: &str) -> EmailConfig {
        EmailConfig {
            smtp_host: "smtp.test.com".into(),
            smtp_port: 465,
            username: "alerts@test.com".into(),
            password: SecretString::from("pw"),
            from_address: from.into(),
            to_address: "me@test.com".into(),
        }
    }

    #[test]
    fn render_includes_reason_and_sources() {
        let (subject, body) = render(&alert(Priority::Normal, false));
        assert_eq!(subject, "[WORK] hazmat severity 3");
        assert!(body.starts_with("Office: hazmat at severity 3"));
        assert!(body.contains("Independent sources: 2"));
        assert!(!body.contains("Emergency priority"));
    }

    #[test]
    fn render_marks_escalation_and_emergency() {
        let (subject, body) = render(&alert(Priority::Emergency, true));
        assert!(subject.ends_with("(escalated)"));
        assert!(body.contains("Emergency priority"));
    }

    #[test]
    fn invalid_from_address_is_rejected() {
        let n = EmailNotifier::new(config("not an address"));
        let err = n.build_message(&alert(Priority::Normal, false)).unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { .. }));
    }

    #[test]
    fn valid_config_builds_message() {
        let n = EmailNotifier::new(config("alerts@test.com"));
        assert!(n.build_message(&alert(Priority::Normal, false)).is_ok());
    }

    #[test]
    fn config_from_env_returns_none_when_no_host() {
        // SAFETY: no other test reads SMTP_HOST.
        unsafe { std::env::remove_var("SMTP_HOST") };
        assert!(EmailConfig::from_env().is_none());
    }
}
