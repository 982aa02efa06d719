//! ---
//! ats_section: "05-networking-external-interfaces"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Webhook notifier for generator events."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ats_core::ports::NotificationSink;
use serde::Serialize;
use url::Url;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
const SOURCE: &str = "atsd";

#[derive(Debug, Serialize)]
struct Notification<'a> {
    message: &'a str,
    source: &'a str,
}

/// Posts `{"message", "source"}` JSON to a webhook.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpNotifier {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint =
            Url::parse(endpoint).with_context(|| format!("invalid notifier endpoint {}", endpoint))?;
        let client = reqwest::Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl NotificationSink for HttpNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        self.client
            .post(self.endpoint.clone())
            .json(&Notification {
                message,
                source: SOURCE,
            })
            .send()
            .await
            .context("notification request failed")?
            .error_for_status()
            .context("notification endpoint rejected the message")?;
        Ok(())
    }
}
