//! HTTP transport for the remote analytics services
//!
//! - Batching backend: `POST {host}/v1/batch` with the secret as basic-auth
//!   user and all envelopes in one body.
//! - Per-call backend: `POST {host}/track` or `POST {host}/engage` per
//!   envelope with the secret as project token.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::event::{Batch, Envelope, EnvelopeKind};

use super::{BackendKind, ClientOptions, Transport};

pub const DEFAULT_BATCHING_HOST: &str = "https://api.segment.io";
pub const DEFAULT_PER_CALL_HOST: &str = "https://api.mixpanel.com";

/// reqwest-backed [`Transport`]
pub struct HttpTransport {
    backend: BackendKind,
    connection: Option<Connection>,
}

struct Connection {
    http_client: reqwest::Client,
    base_url: String,
    secret: String,
    max_retries: usize,
}

impl HttpTransport {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            connection: None,
        }
    }

    fn default_host(&self) -> &'static str {
        match self.backend {
            BackendKind::Batching => DEFAULT_BATCHING_HOST,
            BackendKind::PerCall => DEFAULT_PER_CALL_HOST,
        }
    }
}

impl Transport for HttpTransport {
    fn configure(&mut self, options: &ClientOptions) -> Result<()> {
        let base_url = options
            .host
            .as_deref()
            .unwrap_or(self.default_host())
            .trim_end_matches('/')
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(options.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        self.connection = Some(Connection {
            http_client,
            base_url,
            secret: options.secret.clone(),
            max_retries: options.max_retries,
        });
        Ok(())
    }

    async fn deliver(&self, batch: Batch) -> Result<()> {
        let connection = self.connection.as_ref().ok_or(Error::NotInitialized)?;

        match self.backend {
            BackendKind::Batching => {
                let body = json!({
                    "batch": batch.envelopes,
                    "sentAt": chrono::Utc::now(),
                });
                connection.post_with_retry("/v1/batch", &body).await
            }
            BackendKind::PerCall => {
                for envelope in &batch.envelopes {
                    let (path, body) = per_call_request(&connection.secret, envelope);
                    connection.post_with_retry(path, &body).await?;
                }
                Ok(())
            }
        }
    }
}

impl Connection {
    async fn post(&self, path: &str, body: &Value) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .http_client
            .post(&url)
            .basic_auth(&self.secret, Option::<&str>::None)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        Err(Error::Delivery(format!(
            "API error ({}): {}",
            status.as_u16(),
            error_text
        )))
    }

    /// Retries transient failures (5xx, timeouts) with exponential backoff.
    async fn post_with_retry(&self, path: &str, body: &Value) -> Result<()> {
        let mut last_error = None;
        let mut delay = Duration::from_millis(500);

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tracing::debug!(
                    "Retrying {} (attempt {}/{}), waiting {:?}",
                    path,
                    attempt + 1,
                    self.max_retries + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }

            match self.post(path, body).await {
                Ok(()) => return Ok(()),
                Err(e) if is_retryable_error(&e) => {
                    tracing::warn!("Transient error delivering to {}: {}", path, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Delivery("max retries exceeded".to_string())))
    }
}

/// Path and body for one per-call request
fn per_call_request(secret: &str, envelope: &Envelope) -> (&'static str, Value) {
    match envelope.kind {
        EnvelopeKind::Track => {
            let mut properties: Map<String, Value> = envelope
                .properties
                .iter()
                .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                .collect();
            // Reserved keys go in last so event properties cannot replace them.
            properties.insert("token".to_string(), json!(secret));
            properties.insert("distinct_id".to_string(), json!(envelope.user_id));
            properties.insert(
                "time".to_string(),
                json!(envelope.timestamp.timestamp_millis()),
            );
            properties.insert("$insert_id".to_string(), json!(envelope.message_id));
            let body = json!([{
                "event": envelope.event.as_deref().unwrap_or_default(),
                "properties": properties,
            }]);
            ("/track", body)
        }
        EnvelopeKind::Identify => {
            let body = json!([{
                "$token": secret,
                "$distinct_id": envelope.user_id,
                "$set": envelope.traits,
            }]);
            ("/engage", body)
        }
    }
}

/// Check if an error is retryable (transient)
fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Delivery(msg) => {
            msg.starts_with("API error (5")
                || msg.contains("timeout")
                || msg.contains("timed out")
                || msg.contains("connection")
                || msg.starts_with("HTTP request failed")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventRecord, Properties};

    #[test]
    fn test_deliver_before_configure_fails() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let transport = HttpTransport::new(BackendKind::Batching);
        let result = runtime.block_on(transport.deliver(Batch::default()));
        assert!(matches!(result, Err(Error::NotInitialized)));
    }

    #[test]
    fn test_configure_uses_host_override() {
        let mut transport = HttpTransport::new(BackendKind::Batching);
        let options = ClientOptions {
            host: Some("https://collector.example.com/".to_string()),
            ..ClientOptions::new("secret")
        };
        transport.configure(&options).unwrap();
        assert_eq!(
            transport.connection.as_ref().unwrap().base_url,
            "https://collector.example.com"
        );

        let mut transport = HttpTransport::new(BackendKind::PerCall);
        transport.configure(&ClientOptions::new("token")).unwrap();
        assert_eq!(
            transport.connection.as_ref().unwrap().base_url,
            DEFAULT_PER_CALL_HOST
        );
    }

    #[test]
    fn test_per_call_track_request() {
        let mut properties = Properties::new();
        properties.insert("SomeValue".to_string(), "62".to_string());
        let envelope = Envelope::track("anon", EventRecord::with_properties("SomeEvent", properties));

        let (path, body) = per_call_request("token", &envelope);
        assert_eq!(path, "/track");
        assert_eq!(body[0]["event"], "SomeEvent");
        assert_eq!(body[0]["properties"]["token"], "token");
        assert_eq!(body[0]["properties"]["distinct_id"], "anon");
        assert_eq!(body[0]["properties"]["SomeValue"], "62");
    }

    #[test]
    fn test_per_call_track_keeps_reserved_keys() {
        let properties = Properties::from([
            ("token".to_string(), "forged".to_string()),
            ("distinct_id".to_string(), "someone-else".to_string()),
            ("$insert_id".to_string(), "dup".to_string()),
        ]);
        let envelope = Envelope::track("anon", EventRecord::with_properties("SomeEvent", properties));

        let (_, body) = per_call_request("token", &envelope);
        let sent = &body[0]["properties"];
        assert_eq!(sent["token"], "token");
        assert_eq!(sent["distinct_id"], "anon");
        assert_ne!(sent["$insert_id"], "dup");
        assert!(sent["time"].is_i64());
    }

    #[test]
    fn test_per_call_identify_request() {
        let mut traits = Properties::new();
        traits.insert("firstName".to_string(), "J1234abcd".to_string());
        let envelope = Envelope::identify("anon", &traits, &Properties::new());

        let (path, body) = per_call_request("token", &envelope);
        assert_eq!(path, "/engage");
        assert_eq!(body[0]["$distinct_id"], "anon");
        assert_eq!(body[0]["$set"]["firstName"], "J1234abcd");
    }

    #[test]
    fn test_is_retryable_error() {
        assert!(is_retryable_error(&Error::Delivery(
            "API error (500): internal error".to_string()
        )));
        assert!(is_retryable_error(&Error::Delivery(
            "HTTP request failed: operation timed out".to_string()
        )));
        assert!(!is_retryable_error(&Error::Delivery(
            "API error (400): bad request".to_string()
        )));
        assert!(!is_retryable_error(&Error::Delivery(
            "API error (401): unauthorized".to_string()
        )));
        assert!(!is_retryable_error(&Error::NotInitialized));
    }
}
