//! Built-in webhook plugin.
//!
//! POSTs each form event as JSON to the `url` in the plugin config. When the
//! config carries a `secret`, the body is signed with HMAC-SHA256 and the
//! signature sent as `X-Formplug-Signature: sha256=<hex>`.

use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use sha2::Sha256;
use tracing::debug;
use uuid::Uuid;

use formplug_jobs::{ExecuteRequest, FormEvent, PluginContext, PluginHandler, PluginOutcome};

type HmacSha256 = Hmac<Sha256>;

pub const PLUGIN_ID: &str = "webhook";
pub const EVENT_HEADER: &str = "X-Formplug-Event";
pub const DELIVERY_HEADER: &str = "X-Formplug-Delivery";
pub const SIGNATURE_HEADER: &str = "X-Formplug-Signature";

/// Longest response body excerpt kept in a failure message.
const ERROR_BODY_LIMIT: usize = 512;

/// JSON body delivered to the webhook endpoint.
#[derive(Debug, Serialize)]
pub struct WebhookBody<'a> {
    pub job_id: Uuid,
    pub form_id: Uuid,
    pub attempt: i32,
    pub sent_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: &'a FormEvent,
}

/// Compute the `sha256=<hex>` signature for a body.
pub fn sign_payload(secret: &str, body: &[u8]) -> anyhow::Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("invalid webhook secret: {e}"))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Delivers form events over HTTP.
pub struct WebhookPlugin {
    client: reqwest::Client,
}

impl WebhookPlugin {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("formplug-worker/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building webhook HTTP client")?;
        Ok(Self { client })
    }

    /// Send one delivery and return a summary of the response.
    pub async fn deliver(&self, req: &ExecuteRequest) -> anyhow::Result<JsonValue> {
        let url = req
            .config_str("url")
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| anyhow!("webhook config has no 'url'"))?;
        let event = req.form_event()?;

        let body = serde_json::to_vec(&WebhookBody {
            job_id: req.job_id,
            form_id: req.form_id,
            attempt: req.attempt,
            sent_at: Utc::now(),
            event: &event,
        })?;

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header(EVENT_HEADER, event.name())
            .header(DELIVERY_HEADER, req.job_id.to_string());

        if let Some(secret) = req.config_str("secret").filter(|s| !s.is_empty()) {
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, &body)?);
        }

        let response = request
            .body(body)
            .send()
            .await
            .with_context(|| format!("delivering {} to {url}", event.name()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let excerpt: String = text.chars().take(ERROR_BODY_LIMIT).collect();
            bail!("webhook returned {status}: {excerpt}");
        }

        debug!(
            job_id = %req.job_id,
            url,
            status = status.as_u16(),
            "Webhook delivered"
        );
        Ok(json!({ "status": status.as_u16(), "url": url }))
    }
}

#[async_trait]
impl PluginHandler for WebhookPlugin {
    fn plugin_id(&self) -> &str {
        PLUGIN_ID
    }

    fn description(&self) -> &str {
        "POST form events to an HTTP endpoint"
    }

    async fn execute(&self, ctx: PluginContext) -> PluginOutcome {
        self.deliver(&ctx.request).await.into()
    }
}
