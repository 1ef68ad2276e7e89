//! SendGrid mail gateway — JSON REST API over reqwest.
//!
//! HTTP-level failures are absorbed into `SendOutcome` so the pipeline
//! can make the retry decision from one place: 4xx is a permanent
//! rejection, 5xx/429 and transport errors are transient.

use async_trait::async_trait;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::{DeliveryReport, DeliveryStatus, Envelope, MailGateway, SendOutcome};
use serde::Deserialize;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct SendGridConfig {
    pub api_key: String,
    /// Injectable for tests; the real endpoint otherwise.
    pub base_url: String,
    pub timeout_secs: u64,
}

impl SendGridConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.sendgrid.com".into(),
            timeout_secs: 15,
        }
    }
}

/// The SendGrid-backed `MailGateway` implementation.
pub struct SendGridGateway {
    config: SendGridConfig,
    client: reqwest::Client,
}

impl SendGridGateway {
    pub fn new(config: SendGridConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(CadenceError::Config("SendGrid API key is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CadenceError::Gateway(format!("HTTP client: {e}")))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl MailGateway for SendGridGateway {
    async fn send(&self, envelope: &Envelope) -> Result<SendOutcome> {
        let url = format!("{}/v3/mail/send", self.config.base_url);
        let body = serde_json::json!({
            "personalizations": [{ "to": [{ "email": envelope.to }] }],
            "from": { "email": envelope.from_email, "name": envelope.from_name },
            "subject": envelope.subject,
            "content": [
                { "type": "text/plain", "value": envelope.text_body },
                { "type": "text/html", "value": envelope.html_body },
            ],
        });

        let response = match self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                // Connect failures and timeouts are retryable.
                return Ok(SendOutcome::transient(format!("request failed: {e}")));
            }
        };

        let status = response.status().as_u16();
        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body_text = response.text().await.unwrap_or_default();

        let outcome = classify_send(status, message_id, &body_text);
        if outcome.accepted {
            tracing::info!("📤 Gateway accepted mail to {}", envelope.to);
        } else {
            tracing::warn!(
                "Gateway refused mail to {} ({status}): {}",
                envelope.to,
                outcome.error.as_deref().unwrap_or("no detail")
            );
        }
        Ok(outcome)
    }

    async fn query_status(&self, message_id: &str) -> Result<DeliveryReport> {
        let url = format!("{}/v3/messages", self.config.base_url);
        let query = format!("msg_id LIKE '{message_id}'");
        let response = match self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .query(&[("limit", "1"), ("query", query.as_str())])
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                return Ok(DeliveryReport {
                    status: DeliveryStatus::Unknown,
                    details: Some(format!("status query failed: {e}")),
                })
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            return Ok(DeliveryReport {
                status: DeliveryStatus::Unknown,
                details: Some(format!("status endpoint returned {status}")),
            });
        }

        let parsed: MessagesResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                return Ok(DeliveryReport {
                    status: DeliveryStatus::Unknown,
                    details: Some(format!("unparseable status response: {e}")),
                })
            }
        };

        Ok(match parsed.messages.first() {
            Some(message) => DeliveryReport {
                status: parse_delivery_status(&message.status),
                details: message.reason.clone(),
            },
            None => DeliveryReport {
                status: DeliveryStatus::Unknown,
                details: Some("message not found".into()),
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<MessageRecord>,
}

#[derive(Debug, Deserialize)]
struct MessageRecord {
    #[serde(default)]
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Map an HTTP send response onto the outcome model.
fn classify_send(status: u16, message_id: Option<String>, body: &str) -> SendOutcome {
    match status {
        200..=299 => SendOutcome {
            accepted: true,
            message_id: message_id.or_else(|| Some(synthetic_message_id())),
            error: None,
            transient: false,
        },
        429 => SendOutcome::transient(format!("rate limited (429): {}", truncate(body))),
        400..=499 => SendOutcome::rejected(format!("rejected ({status}): {}", truncate(body))),
        _ => SendOutcome::transient(format!("gateway error ({status}): {}", truncate(body))),
    }
}

/// Map the status endpoint's vocabulary onto `DeliveryStatus`.
fn parse_delivery_status(raw: &str) -> DeliveryStatus {
    match raw.to_ascii_lowercase().as_str() {
        "delivered" => DeliveryStatus::Delivered,
        "deferred" => DeliveryStatus::Deferred,
        "bounce" | "bounced" | "blocked" => DeliveryStatus::Bounced,
        "dropped" | "drop" => DeliveryStatus::Dropped,
        _ => DeliveryStatus::Unknown,
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Fallback id when the gateway accepted without echoing one back.
fn synthetic_message_id() -> String {
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("sg-{:x}-{:x}", t.as_secs(), t.subsec_nanos())
}
