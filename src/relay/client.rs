/**
 * ============================================================================
 * COLLECTOR HTTP CLIENT MODULE
 * ============================================================================
 *
 * PURPOSE: Data plane and auth plane requests to the remote collector
 *
 * DATA PLANE:
 * - POST {data_url}/data_batch?conn=<username>
 *   Authorization: Bearer <token>, optional Content-Encoding: gzip
 *   Body {"data": [record, ...]}
 *   2xx body may carry {new_token, new_expires_at, arrived_ids}
 * - GET {data_url}/status, 2xx means reachable
 *
 * AUTH PLANE:
 * - POST {auth_url}/login with {username, password, isWebsite: "false"}
 * - POST {auth_url}/extension_sync with Authorization: Bearer <web token>
 * Both answer {success, token, username, expires_at} or {success: false, message}
 *
 * Every status code is returned to the caller; only requests that produce no
 * response at all are errors.
 *
 * ============================================================================
 */

use crate::relay::auth::SessionCredentials;
use crate::relay::config::RelayConfig;
use crate::relay::error::{AuthError, DeliveryError};
use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Client identification header sent with every request
pub const CLIENT_HEADER: &str = "X-Extension-Client";

/**
 * Optional fields of a successful batch response
 */
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeliveryAck {
    #[serde(default)]
    pub new_token: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub new_expires_at: Option<String>,
    #[serde(default)]
    pub arrived_ids: Vec<String>,
}

/// HTTP status of a batch POST plus whatever the collector acknowledged
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReply {
    pub status: u16,
    pub ack: DeliveryAck,
}

/**
 * Remote collector contract
 * The batch sender and auth session only ever talk to this trait
 */
#[async_trait]
pub trait Collector: Send + Sync {
    /// POST one encoded batch body
    async fn send_batch(
        &self,
        token: &str,
        conn: &str,
        body: Vec<u8>,
        gzip: bool,
    ) -> Result<BatchReply, DeliveryError>;

    /// True when the status endpoint answers 2xx
    async fn probe_status(&self) -> bool;

    async fn login(&self, username: &str, password: &str) -> Result<SessionCredentials, AuthError>;

    /// Trade a website token for a relay token
    async fn exchange_web_token(&self, web_token: &str) -> Result<SessionCredentials, AuthError>;
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
    #[serde(rename = "isWebsite")]
    is_website: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    expires_at: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/**
 * reqwest implementation of the collector contract
 */
pub struct HttpCollector {
    http: reqwest::Client,
    auth_url: String,
    data_url: String,
    client_id: String,
    timeout: Duration,
}

impl HttpCollector {
    /**
     * Build a client bounded by the configured request timeout
     */
    pub fn new(config: &RelayConfig) -> Result<Self, DeliveryError> {
        let timeout = config.request_timeout();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Client(e.to_string()))?;

        Ok(Self {
            http,
            auth_url: config.auth_url.trim_end_matches('/').to_string(),
            data_url: config.data_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            timeout,
        })
    }

    fn delivery_error(&self, e: reqwest::Error) -> DeliveryError {
        if e.is_timeout() {
            DeliveryError::Timeout(self.timeout)
        } else {
            DeliveryError::Transport(e.to_string())
        }
    }

    /**
     * Turn an auth-plane response into credentials
     * Anything but a 2xx with success=true and both fields is a rejection
     */
    async fn read_auth_response(response: reqwest::Response) -> Result<SessionCredentials, AuthError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        let parsed: AuthResponse = serde_json::from_str(&body).unwrap_or_default();

        if status.is_success() && parsed.success {
            if let (Some(token), Some(username)) = (parsed.token, parsed.username) {
                return Ok(SessionCredentials {
                    token,
                    username,
                    expires_at: parsed.expires_at,
                });
            }
            return Err(AuthError::Rejected(
                "response is missing token or username".to_string(),
            ));
        }

        let message = parsed
            .message
            .unwrap_or_else(|| format!("auth server answered {}", status));
        Err(AuthError::Rejected(message))
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn send_batch(
        &self,
        token: &str,
        conn: &str,
        body: Vec<u8>,
        gzip: bool,
    ) -> Result<BatchReply, DeliveryError> {
        let url = format!("{}/data_batch", self.data_url);
        log::debug!("POST {} ({} bytes, gzip: {})", url, body.len(), gzip);

        let mut request = self
            .http
            .post(&url)
            .query(&[("conn", conn)])
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/json")
            .header(CLIENT_HEADER, &self.client_id);
        if gzip {
            request = request.header(CONTENT_ENCODING, "gzip");
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| self.delivery_error(e))?;
        let status = response.status();

        // A 2xx already committed the batch; a bad ack body only loses the rotation
        let ack = if status.is_success() {
            match response.bytes().await {
                Ok(bytes) if !bytes.is_empty() => {
                    serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                        log::warn!("Ignoring unreadable batch acknowledgement: {}", e);
                        DeliveryAck::default()
                    })
                }
                Ok(_) => DeliveryAck::default(),
                Err(e) => {
                    log::warn!("Failed to read batch acknowledgement: {}", e);
                    DeliveryAck::default()
                }
            }
        } else {
            DeliveryAck::default()
        };

        Ok(BatchReply {
            status: status.as_u16(),
            ack,
        })
    }

    async fn probe_status(&self) -> bool {
        let url = format!("{}/status", self.data_url);
        match self
            .http
            .get(&url)
            .header(CLIENT_HEADER, &self.client_id)
            .send()
            .await
        {
            Ok(response) => {
                log::debug!("Status probe answered {}", response.status());
                response.status().is_success()
            }
            Err(e) => {
                log::debug!("Status probe failed: {}", e);
                false
            }
        }
    }

    async fn login(&self, username: &str, password: &str) -> Result<SessionCredentials, AuthError> {
        let url = format!("{}/login", self.auth_url);
        log::info!("Logging in as {}", username);

        let response = self
            .http
            .post(&url)
            .header(CLIENT_HEADER, &self.client_id)
            .json(&LoginRequest {
                username,
                password,
                is_website: "false",
            })
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        Self::read_auth_response(response).await
    }

    async fn exchange_web_token(&self, web_token: &str) -> Result<SessionCredentials, AuthError> {
        let url = format!("{}/extension_sync", self.auth_url);
        log::info!("Exchanging web token at {}", url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(web_token)
            .header(CONTENT_TYPE, "application/json")
            .header(CLIENT_HEADER, &self.client_id)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        Self::read_auth_response(response).await
    }
}

/**
 * Expiry fields arrive either as a timestamp string or as epoch seconds
 */
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
