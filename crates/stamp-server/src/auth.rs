//! Token validation against the external identity service, verdicts cached.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use stamp_store::BoxFuture;
use tracing::debug;

use crate::error::ServerError;

const VERDICT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthVerdict {
    pub valid: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub userid: i64,
}

pub trait AuthService: Send + Sync {
    fn validate<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<AuthVerdict, ServerError>>;
}

/// HTTP client for the token-validation endpoint with a 5-minute verdict
/// cache keyed by the raw token.
pub struct HttpAuthClient {
    client: reqwest::Client,
    url: String,
    cache: Mutex<HashMap<String, (AuthVerdict, Instant)>>,
}

impl HttpAuthClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl AuthService for HttpAuthClient {
    fn validate<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<AuthVerdict, ServerError>> {
        Box::pin(async move {
            if let Some((verdict, at)) = self
                .cache
                .lock()
                .expect("auth cache lock")
                .get(token)
                .cloned()
            {
                if at.elapsed() < VERDICT_TTL {
                    debug!("auth verdict cache hit");
                    return Ok(verdict);
                }
            }

            let response = self
                .client
                .post(&self.url)
                .json(&serde_json::json!({ "token": token }))
                .send()
                .await
                .map_err(|e| ServerError::Auth(format!("validation request: {e}")))?;

            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                return Err(ServerError::Auth(format!(
                    "validation service returned status {status}"
                )));
            }
            let verdict: AuthVerdict = response
                .json()
                .await
                .map_err(|e| ServerError::Auth(format!("validation decode: {e}")))?;

            self.cache
                .lock()
                .expect("auth cache lock")
                .insert(token.to_string(), (verdict.clone(), Instant::now()));
            Ok(verdict)
        })
    }
}

/// Fixed-verdict auth used by tests.
#[derive(Debug, Clone)]
pub struct StaticAuth {
    pub verdict: AuthVerdict,
}

impl AuthService for StaticAuth {
    fn validate<'a>(&'a self, _token: &'a str) -> BoxFuture<'a, Result<AuthVerdict, ServerError>> {
        let verdict = self.verdict.clone();
        Box::pin(async move { Ok(verdict) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn verdicts_are_cached_per_token() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/validate_token");
            then.status(200).json_body(serde_json::json!({
                "valid": true, "username": "crew", "userid": 7
            }));
        });

        let client = HttpAuthClient::new(server.url("/api/validate_token"));
        let first = client.validate("tok-1").await.unwrap();
        let second = client.validate("tok-1").await.unwrap();
        assert!(first.valid);
        assert_eq!(first.userid, 7);
        assert_eq!(first, second);
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn service_failure_is_an_error_not_a_pass() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/validate_token");
            then.status(502).body("bad gateway");
        });

        let client = HttpAuthClient::new(server.url("/api/validate_token"));
        assert!(client.validate("tok-1").await.is_err());
    }
}
