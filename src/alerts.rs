use chrono::SecondsFormat;
use serde_json::json;

use crate::errors::ControllerError;

/// Sink for operator alerts, backed by a Slack incoming webhook.
///
/// Errors that carry structured context (timeouts, Kubernetes failures)
/// render as Block Kit fields; anything else posts as a plain uncaught
/// exception message. With no webhook configured every call is a no-op, so
/// callers never need to check.
#[derive(Clone)]
pub struct AlertSink {
    webhook: Option<String>,
    client: reqwest::Client,
}

impl AlertSink {
    pub fn new(webhook: Option<String>, client: reqwest::Client) -> Self {
        AlertSink { webhook, client }
    }

    pub fn disabled() -> Self {
        AlertSink { webhook: None, client: reqwest::Client::new() }
    }

    /// Report a controller error, with rich formatting when the error kind
    /// supports it.
    pub async fn post_error(&self, error: &ControllerError, user: Option<&str>) {
        let payload = match error {
            ControllerError::Timeout(timeout) => {
                let mut fields = vec![
                    field("Operation", &timeout.operation),
                    field(
                        "Started at",
                        &timeout.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    ),
                    field(
                        "Failed at",
                        &timeout.failed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    ),
                ];
                if let Some(user) = user.or(timeout.user.as_deref()) {
                    fields.push(field("User", user));
                }
                blocks(&error.to_string(), fields)
            }
            ControllerError::Kubernetes(k8s) => {
                let mut fields = vec![field("Kind", &k8s.kind)];
                if let Some(namespace) = &k8s.namespace {
                    fields.push(field("Namespace", namespace));
                }
                if let Some(name) = &k8s.name {
                    fields.push(field("Name", name));
                }
                if let Some(status) = k8s.status {
                    fields.push(field("Status", &status.to_string()));
                }
                if let Some(user) = user {
                    fields.push(field("User", user));
                }
                blocks(&error.to_string(), fields)
            }
            _ => {
                let text = match user {
                    Some(user) => format!("Error for {user}: {error}"),
                    None => error.to_string(),
                };
                json!({ "text": text })
            }
        };
        self.post(payload).await;
    }

    /// Report an uncaught failure from a background loop.
    pub async fn post_uncaught(&self, context: &str, error: &ControllerError) {
        self.post(json!({ "text": format!("Uncaught exception {context}: {error}") })).await;
    }

    async fn post(&self, payload: serde_json::Value) {
        let Some(webhook) = &self.webhook else { return };
        if let Err(error) = self.client.post(webhook).json(&payload).send().await {
            // Alerting failures must never take anything else down.
            warn!(error = %error, "Posting to Slack failed");
        }
    }
}

fn field(heading: &str, text: &str) -> serde_json::Value {
    json!({ "type": "mrkdwn", "text": format!("*{heading}*\n{text}") })
}

fn blocks(message: &str, fields: Vec<serde_json::Value>) -> serde_json::Value {
    json!({
        "blocks": [
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": message },
            },
            {
                "type": "section",
                "fields": fields,
            },
        ]
    })
}
