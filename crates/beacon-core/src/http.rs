//! HTTP transport: signed form POSTs, short-link resolution, heartbeats.
//!
//! Thin wrapper over a shared reqwest client. Callers decide what an
//! outcome means; this module only moves bytes and logs the exchange.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::ResolveError;
use crate::signing;

/// Per-request timeout for short-link resolution.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

const POST_TIMEOUT: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Status and raw body of a completed exchange.
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub status: u16,
    pub body: String,
}

/// Shared client for all outbound traffic.
#[derive(Clone)]
pub struct SignedHttpClient {
    client: reqwest::Client,
}

impl Default for SignedHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SignedHttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Sign `payload` and POST it as a form body.
    ///
    /// `hostname` may carry an explicit scheme (`http://host:port`), which
    /// keeps local endpoints reachable; otherwise `https://` is assumed.
    ///
    /// # Errors
    ///
    /// Returns the transport error when no HTTP response was received;
    /// any received response, whatever its status, is `Ok`.
    pub async fn post_signed(
        &self,
        hostname: &str,
        endpoint: &str,
        payload: &Map<String, Value>,
        secret: &str,
    ) -> Result<WireResponse, reqwest::Error> {
        let signed = signing::sign_payload(hostname, endpoint, payload, secret);
        let url = endpoint_url(hostname, endpoint);
        tracing::info!(%endpoint, "request.send");

        let response = self
            .client
            .post(&url)
            .timeout(POST_TIMEOUT)
            .header("Accept-Charset", "UTF-8")
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(signed.body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        tracing::debug!(%endpoint, status, "request.reply");
        Ok(WireResponse { status, body })
    }

    /// GET a short link and parse its JSON reply. Bounded by
    /// [`RESOLVE_TIMEOUT`]; callers treat every error as "keep the link
    /// as-is".
    ///
    /// # Errors
    ///
    /// Returns an error for transport failures, non-success statuses, and
    /// bodies that are not JSON.
    pub async fn resolve_link(&self, url: &str) -> Result<Value, ResolveError> {
        tracing::info!(%url, "deep_link.request.send");
        let response = self
            .client
            .get(url)
            .timeout(RESOLVE_TIMEOUT)
            .header("Accept-Charset", "UTF-8")
            .header("X-Teak-DeviceType", "API")
            .send()
            .await?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(ResolveError::BadStatus { status });
        }
        let body = response.text().await?;
        tracing::debug!(%url, status, "deep_link.request.reply");
        serde_json::from_str(&body).map_err(|e| ResolveError::MalformedResponse(e.to_string()))
    }

    /// Fire a heartbeat GET; the response is ignored and errors are only
    /// logged.
    pub async fn ping(&self, url: &str) {
        match self.client.get(url).timeout(PING_TIMEOUT).send().await {
            Ok(response) => {
                tracing::debug!(status = response.status().as_u16(), "session.heartbeat")
            }
            Err(e) => tracing::debug!(error = %e, "session.heartbeat.failed"),
        }
    }
}

/// Join a hostname (with or without scheme) and an endpoint path.
pub fn endpoint_url(hostname: &str, endpoint: &str) -> String {
    if hostname.starts_with("http://") || hostname.starts_with("https://") {
        format!("{hostname}{endpoint}")
    } else {
        format!("https://{hostname}{endpoint}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_url_assumes_https() {
        assert_eq!(
            endpoint_url("example.com", "/me/events"),
            "https://example.com/me/events"
        );
        assert_eq!(
            endpoint_url("http://127.0.0.1:4444", "/me/events"),
            "http://127.0.0.1:4444/me/events"
        );
    }

    #[tokio::test]
    async fn post_signed_sends_form_with_signature() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/games/42/users.json")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(mockito::Matcher::Regex("api_key=user-1&sig=.+".into()))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = SignedHttpClient::new();
        let mut payload = Map::new();
        payload.insert("api_key".into(), json!("user-1"));
        let response = client
            .post_signed(&server.url(), "/games/42/users.json", &payload, "secret")
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "{}");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn resolve_link_parses_json() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/t/abcdef")
            .match_header("x-teak-devicetype", "API")
            .with_status(200)
            .with_body("{\"AndroidPath\":\"rewards/claim\"}")
            .create_async()
            .await;

        let client = SignedHttpClient::new();
        let value = client
            .resolve_link(&format!("{}/t/abcdef", server.url()))
            .await
            .unwrap();
        assert_eq!(value["AndroidPath"], "rewards/claim");
    }

    #[tokio::test]
    async fn resolve_link_rejects_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/t/missing")
            .with_status(404)
            .create_async()
            .await;

        let client = SignedHttpClient::new();
        let err = client
            .resolve_link(&format!("{}/t/missing", server.url()))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::BadStatus { status: 404 }));
    }

    #[tokio::test]
    async fn resolve_link_rejects_non_json_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/t/plain")
            .with_status(200)
            .with_body("<html>not json</html>")
            .create_async()
            .await;

        let client = SignedHttpClient::new();
        let err = client
            .resolve_link(&format!("{}/t/plain", server.url()))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::MalformedResponse(_)));
    }
}
