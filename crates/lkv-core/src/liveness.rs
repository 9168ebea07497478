use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Why a liveness check could not reach a verdict.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("No liveness endpoint configured for provider '{0}'")]
    UnsupportedProvider(String),
}

/// Answers "is this key accepted by the provider right now".
///
/// `Ok(true)` accepted, `Ok(false)` rejected. `Err` means the check itself
/// failed; the key manager treats that as unusable.
#[async_trait]
pub trait LivenessCheck: Send + Sync {
    async fn check(&self, provider: &str, api_key: &str) -> Result<bool, CheckError>;
}

// ---------------------------------------------------------------------------
// HttpLivenessChecker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `x-api-key: <key>` plus `anthropic-version`.
    AnthropicHeader,
}

#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub auth: AuthStyle,
}

/// Pings `GET {base_url}/v1/models` with the key. The endpoint is cheap and
/// authenticated on every provider we know about.
pub struct HttpLivenessChecker {
    client: reqwest::Client,
    endpoints: HashMap<String, ProviderEndpoint>,
}

impl HttpLivenessChecker {
    /// Checker with the built-in OpenAI and Anthropic endpoints.
    pub fn new(timeout: Duration) -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "openai".to_string(),
            ProviderEndpoint {
                base_url: "https://api.openai.com".to_string(),
                auth: AuthStyle::Bearer,
            },
        );
        endpoints.insert(
            "anthropic".to_string(),
            ProviderEndpoint {
                base_url: "https://api.anthropic.com".to_string(),
                auth: AuthStyle::AnthropicHeader,
            },
        );
        Self {
            client: http_client(timeout),
            endpoints,
        }
    }

    /// Add or replace the endpoint for `provider`.
    pub fn with_endpoint(mut self, provider: &str, endpoint: ProviderEndpoint) -> Self {
        self.endpoints.insert(provider.to_string(), endpoint);
        self
    }

    /// Point a provider at a different base URL, keeping its auth style
    /// (bearer for unknown providers).
    pub fn with_base_url(mut self, provider: &str, base_url: &str) -> Self {
        let auth = self
            .endpoints
            .get(provider)
            .map_or(AuthStyle::Bearer, |e| e.auth);
        self.endpoints.insert(
            provider.to_string(),
            ProviderEndpoint {
                base_url: base_url.trim_end_matches('/').to_string(),
                auth,
            },
        );
        self
    }

    pub fn supports(&self, provider: &str) -> bool {
        self.endpoints.contains_key(provider)
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }
}

#[async_trait]
impl LivenessCheck for HttpLivenessChecker {
    async fn check(&self, provider: &str, api_key: &str) -> Result<bool, CheckError> {
        let endpoint = self
            .endpoints
            .get(provider)
            .ok_or_else(|| CheckError::UnsupportedProvider(provider.to_string()))?;

        let url = format!("{}/v1/models", endpoint.base_url);
        let request = match endpoint.auth {
            AuthStyle::Bearer => self
                .client
                .get(&url)
                .header("Authorization", format!("Bearer {}", api_key)),
            AuthStyle::AnthropicHeader => self
                .client
                .get(&url)
                .header("x-api-key", api_key)
                .header("anthropic-version", "2023-06-01"),
        };

        let resp = request
            .send()
            .await
            .map_err(|e| CheckError::Transport(e.without_url().to_string()))?;
        check_response(resp).await
    }
}

/// HTTP client with a hard timeout so a stalled provider cannot hang validation.
fn http_client(timeout: Duration) -> reqwest::Client {
    match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "http client build failed, falling back to defaults without request timeout");
            reqwest::Client::new()
        }
    }
}

/// 2xx accepted, 401/403 rejected, anything else is an error.
async fn check_response(resp: reqwest::Response) -> Result<bool, CheckError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(true);
    }
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Ok(false);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(CheckError::Http {
        status: status.as_u16(),
        body,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn checker(server: &MockServer, provider: &str) -> HttpLivenessChecker {
        HttpLivenessChecker::new(Duration::from_secs(5)).with_base_url(provider, &server.uri())
    }

    #[tokio::test]
    async fn test_openai_bearer_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("authorization", "Bearer sk-good"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let ok = checker(&server, "openai").check("openai", "sk-good").await.unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn test_anthropic_header_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("x-api-key", "sk-ant-good"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let ok = checker(&server, "anthropic")
            .check("anthropic", "sk-ant-good")
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn test_unauthorized_is_rejected_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let ok = checker(&server, "openai").check("openai", "sk-bad").await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_server_error_is_check_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = checker(&server, "openai").check("openai", "sk-x").await.unwrap_err();
        match err {
            CheckError::Http { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_provider_unsupported() {
        let c = HttpLivenessChecker::new(Duration::from_secs(1));
        assert!(!c.supports("mistral"));
        let err = c.check("mistral", "key").await.unwrap_err();
        assert!(matches!(err, CheckError::UnsupportedProvider(_)));
    }

    #[tokio::test]
    async fn test_custom_provider_defaults_to_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("authorization", "Bearer gm-key"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let c = checker(&server, "groq");
        assert!(c.supports("groq"));
        assert!(c.check("groq", "gm-key").await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_is_transport_error() {
        let c = HttpLivenessChecker::new(Duration::from_millis(500))
            .with_base_url("openai", "http://127.0.0.1:9");
        let err = c.check("openai", "sk-x").await.unwrap_err();
        assert!(matches!(err, CheckError::Transport(_)));
    }
}
