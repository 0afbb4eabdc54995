//! Token exchange with the backend's token endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Body of `POST {base_url}/token`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub channel: String,
    /// Connection id: the previous one when reconnecting on the system
    /// channel, the current one for topic tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl TokenRequest {
    pub fn new(channel: impl Into<String>, id: Option<String>) -> Self {
        Self {
            channel: channel.into(),
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub id: String,
    pub token: String,
}

/// Issues tokens for the system channel and for individual topics.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn issue(&self, request: TokenRequest) -> SyncResult<TokenGrant>;
}

/// Token source backed by the HTTP token endpoint.
#[derive(Debug, Clone)]
pub struct HttpTokenSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTokenSource {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/token", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn issue(&self, request: TokenRequest) -> SyncResult<TokenGrant> {
        let fail = |message: String| SyncError::TokenFetch {
            channel: request.channel.clone(),
            message,
        };

        debug!(channel = %request.channel, reconnect = request.id.is_some(), "requesting token");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fail(format!("token endpoint returned {status}")));
        }

        response
            .json::<TokenGrant>()
            .await
            .map_err(|e| fail(format!("invalid token response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_strips_trailing_slash() {
        let source = HttpTokenSource::new("http://localhost:4000/api/");
        assert_eq!(source.endpoint(), "http://localhost:4000/api/token");
    }

    #[test]
    fn request_omits_absent_id() {
        let body = serde_json::to_value(TokenRequest::new("system", None)).unwrap();
        assert_eq!(body, serde_json::json!({"channel": "system"}));

        let body =
            serde_json::to_value(TokenRequest::new("entities", Some("conn-1".into()))).unwrap();
        assert_eq!(body, serde_json::json!({"channel": "entities", "id": "conn-1"}));
    }

    #[test]
    fn grant_deserializes() {
        let grant: TokenGrant =
            serde_json::from_str(r#"{"id":"conn-1","token":"abc"}"#).unwrap();
        assert_eq!(grant.id, "conn-1");
        assert_eq!(grant.token, "abc");
    }
}
