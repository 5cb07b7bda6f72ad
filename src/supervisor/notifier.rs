//! Operator notifications
//!
//! A webhook transport plus incident tracking: the alert fires once when the
//! consecutive-failure threshold is crossed, stays silent through further
//! failures of the same incident, and reports resolution once on recovery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

#[cfg(test)]
use mockall::automock;

/// Transport for operator alerts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), String>;
}

#[derive(Serialize)]
struct WebhookMessage {
    text: String,
}

/// JSON webhook alert transport
pub struct WebhookNotifier {
    client: Client,
    webhook_url: String,
}

impl WebhookNotifier {
    /// Create a notifier from the environment, if configured
    pub fn from_env() -> Option<Arc<Self>> {
        std::env::var("WARDEN_WEBHOOK_URL").ok().map(|url| {
            info!("Webhook notifications enabled");
            Self::new(url)
        })
    }

    /// Create a notifier with an explicit URL
    pub fn new(webhook_url: String) -> Arc<Self> {
        Arc::new(Self {
            client: Client::new(),
            webhook_url,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookNotifier {
    async fn send(&self, text: &str) -> Result<(), String> {
        let message = WebhookMessage {
            text: text.to_string(),
        };
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&message)
            .send()
            .await
            .map_err(|e| format!("webhook request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("webhook returned {}", response.status()));
        }
        Ok(())
    }
}

/// Once-per-incident alert gate in front of an [`AlertSink`]
pub struct IncidentNotifier {
    sink: Option<Arc<dyn AlertSink>>,
    threshold: u32,
    incident_open: bool,
    opened_at: Option<DateTime<Utc>>,
}

impl IncidentNotifier {
    pub fn new(sink: Option<Arc<dyn AlertSink>>, threshold: u32) -> Self {
        Self {
            sink,
            threshold: threshold.max(1),
            incident_open: false,
            opened_at: None,
        }
    }

    pub fn incident_open(&self) -> bool {
        self.incident_open
    }

    /// Alert once when the failure run crosses the threshold. Subsequent
    /// failures of the same incident are silent.
    pub async fn maybe_notify(&mut self, consecutive_failures: u32, detail: &str) {
        if consecutive_failures < self.threshold || self.incident_open {
            return;
        }
        self.incident_open = true;
        self.opened_at = Some(Utc::now());
        self.dispatch(&format!(
            "warden: worker failed {} consecutive restarts. {}",
            consecutive_failures, detail
        ))
        .await;
    }

    /// Report resolution once after an open incident; re-arms for the next
    pub async fn notify_recovered(&mut self) {
        if !self.incident_open {
            return;
        }
        self.incident_open = false;
        let since = self
            .opened_at
            .take()
            .map(|t| format!(" (incident opened {})", t.format("%Y-%m-%d %H:%M:%S UTC")))
            .unwrap_or_default();
        self.dispatch(&format!("warden: worker recovered{}", since))
            .await;
    }

    /// Cooldown entry routes through the same once-per-incident gate
    pub async fn notify_cooldown(&mut self, failures: u32, until: DateTime<Utc>) {
        self.maybe_notify(
            failures,
            &format!(
                "Restart budget exhausted, cooling down until {}",
                until.format("%Y-%m-%d %H:%M:%S UTC")
            ),
        )
        .await;
    }

    async fn dispatch(&self, text: &str) {
        info!("{}", text);
        if let Some(ref sink) = self.sink {
            if let Err(e) = sink.send(text).await {
                error!("Failed to deliver operator alert: {}", e);
            }
        }
    }
}
