use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> Result<()>;
}

/// Writes the alert to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<()> {
        info!(subject, body, "notification");
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    body: &'a str,
}

/// Posts `{subject, body}` as JSON to a webhook.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<()> {
        self.http
            .post(&self.url)
            .json(&WebhookPayload { subject, body })
            .send()
            .await
            .with_context(|| format!("posting notification to {}", self.url))?
            .error_for_status()
            .context("notification webhook rejected the request")?;
        info!(subject, "notification sent");
        Ok(())
    }
}

/// Lets exactly one caller through per run.
#[derive(Debug, Default)]
pub struct NotifyLatch {
    fired: AtomicBool,
}

impl NotifyLatch {
    pub fn try_fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
