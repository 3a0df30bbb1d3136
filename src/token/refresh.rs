//! Refresh-token exchange against the vendor OAuth endpoint
//!
//! One form-encoded POST per refresh. The response body is always mirrored
//! to the debug file before validation so a failing endpoint can be
//! diagnosed offline. Only the supervisor calls [`RefreshClient::refresh`];
//! MQTT event tasks never block on HTTP.

use crate::token::store::{CredentialSet, TokenStore};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const TOKEN_URL: &str = "https://customer.bmwgroup.com/gcdm/oauth/token";
const TOTAL_TIMEOUT: Duration = Duration::from_secs(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Refresh exchange errors
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("HTTP transport: {0}")]
    Http(#[from] reqwest::Error),
    #[error("endpoint returned HTTP {status}")]
    Status { status: u16 },
    #[error("endpoint returned error: {0}")]
    Rejected(String),
    #[error("response is not JSON: {0}")]
    InvalidBody(#[from] serde_json::Error),
    #[error("response missing field: {0}")]
    MissingField(&'static str),
    #[error("persisting tokens: {0}")]
    Store(#[from] crate::token::store::TokenError),
}

/// Exchanges the current refresh credential for a fresh token set.
#[derive(Debug, Clone)]
pub struct RefreshClient {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
}

impl RefreshClient {
    pub fn new(client_id: impl Into<String>) -> Result<Self, RefreshError> {
        let http = reqwest::Client::builder()
            .timeout(TOTAL_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("cardata-bridge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            token_url: TOKEN_URL.to_string(),
            client_id: client_id.into(),
        })
    }

    /// Override the token endpoint (tests, staging environments).
    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    /// Perform one refresh: POST the grant, validate, persist atomically.
    ///
    /// On success the new set is durable on disk before it is returned, so
    /// the caller may hand the identity token to a new MQTT session
    /// immediately.
    pub async fn refresh(
        &self,
        store: &TokenStore,
        refresh_token: &str,
    ) -> Result<CredentialSet, RefreshError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];

        let response = self.http.post(&self.token_url).form(&params).send().await?;
        let status = response.status();
        let body = response.text().await?;

        store.write_debug_response(&body);

        if status.as_u16() != 200 {
            warn!(status = status.as_u16(), "token refresh rejected by endpoint");
            return Err(RefreshError::Status { status: status.as_u16() });
        }

        let set = parse_token_response(&body)?;
        store.persist(&set)?;
        info!("token set refreshed and persisted");
        Ok(set)
    }
}

/// Token response from the vendor endpoint. Every field is optional at the
/// wire level; validation happens in [`parse_token_response`].
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Validate a 200 response body and extract the token set (pure function).
pub fn parse_token_response(body: &str) -> Result<CredentialSet, RefreshError> {
    let response: TokenResponse = serde_json::from_str(body)?;

    if let Some(error) = response.error {
        if !error.is_null() {
            return Err(RefreshError::Rejected(error.to_string()));
        }
    }

    let require = |value: Option<String>, name: &'static str| -> Result<String, RefreshError> {
        let trimmed = value.as_deref().map(str::trim).unwrap_or("");
        if trimmed.is_empty() {
            return Err(RefreshError::MissingField(name));
        }
        Ok(trimmed.to_string())
    };

    Ok(CredentialSet {
        id_token: require(response.id_token, "id_token")?,
        refresh_token: require(response.refresh_token, "refresh_token")?,
        access_token: require(response.access_token, "access_token")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_response() {
        let body = r#"{
            "id_token": " h.c.s ",
            "refresh_token": "rt-new",
            "access_token": "at-new",
            "expires_in": 3599
        }"#;
        let set = parse_token_response(body).unwrap();
        assert_eq!(set.id_token, "h.c.s");
        assert_eq!(set.refresh_token, "rt-new");
        assert_eq!(set.access_token, "at-new");
    }

    #[test]
    fn test_parse_rejects_error_field() {
        let body = r#"{"error":"invalid_grant","error_description":"expired"}"#;
        let result = parse_token_response(body);
        assert!(matches!(result, Err(RefreshError::Rejected(_))));
    }

    #[test]
    fn test_parse_accepts_null_error() {
        let body = r#"{
            "error": null,
            "id_token": "h.c.s",
            "refresh_token": "rt",
            "access_token": "at"
        }"#;
        assert!(parse_token_response(body).is_ok());
    }

    #[test]
    fn test_parse_rejects_missing_token() {
        let body = r#"{"id_token":"h.c.s","refresh_token":"rt"}"#;
        let result = parse_token_response(body);
        assert!(matches!(
            result,
            Err(RefreshError::MissingField("access_token"))
        ));
    }

    #[test]
    fn test_parse_rejects_empty_token() {
        let body = r#"{"id_token":"","refresh_token":"rt","access_token":"at"}"#;
        let result = parse_token_response(body);
        assert!(matches!(result, Err(RefreshError::MissingField("id_token"))));
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let result = parse_token_response("<html>oops</html>");
        assert!(matches!(result, Err(RefreshError::InvalidBody(_))));
    }
}
