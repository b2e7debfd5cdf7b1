//! Operator notifications.
//!
//! Delivery is best effort: a notifier never fails the operation that emits
//! the event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub level: Level,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &Event);
}

#[async_trait]
pub trait NotifierExt {
    async fn info(&self, message: String);
    async fn warning(&self, message: String);
    async fn error(&self, message: String);
    async fn success(&self, message: String);
}

#[async_trait]
impl<N: Notifier + ?Sized> NotifierExt for N {
    async fn info(&self, message: String) {
        self.notify(&Event::new(Level::Info, message)).await
    }
    async fn warning(&self, message: String) {
        self.notify(&Event::new(Level::Warning, message)).await
    }
    async fn error(&self, message: String) {
        self.notify(&Event::new(Level::Error, message)).await
    }
    async fn success(&self, message: String) {
        self.notify(&Event::new(Level::Success, message)).await
    }
}

fn log_event(event: &Event) {
    match event.level {
        Level::Info | Level::Success => info!(level = ?event.level, "{}", event.message),
        Level::Warning => warn!("{}", event.message),
        Level::Error => error!("{}", event.message),
    }
}

/// Writes events to the log only
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &Event) {
        log_event(event);
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    #[serde(flatten)]
    event: &'a Event,
    host: &'a str,
}

/// Logs events and POSTs them as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    host: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            host,
            client,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &Event) {
        log_event(event);

        let payload = WebhookPayload {
            event,
            host: &self.host,
        };
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!("Notification endpoint returned HTTP {}", resp.status()),
            Err(e) => warn!("Failed to deliver notification: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = Event::new(Level::Warning, "upload failed");
        let json = serde_json::to_value(WebhookPayload {
            event: &event,
            host: "node-1",
        })
        .unwrap();
        assert_eq!(json["level"], "WARNING");
        assert_eq!(json["message"], "upload failed");
        assert_eq!(json["host"], "node-1");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_unreachable_webhook_does_not_fail() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook");
        notifier.error("backup failed".to_string()).await;
    }
}
