//! Negotiate request.
//!
//! Before opening the socket the client POSTs `{endpoint}/negotiate`. The
//! server answers with a connection token, or redirects the client to
//! another endpoint (optionally with a new access token).

use anyhow::{bail, Context, Result};
use reqwest::Url;
use serde::Deserialize;

use super::socket::ws_to_http_scheme;
use crate::config::ConnectionOptions;
use crate::constants::{MAX_NEGOTIATE_REDIRECTS, NEGOTIATE_TIMEOUT, NEGOTIATE_VERSION};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    connection_id: Option<String>,
    connection_token: Option<String>,
    #[serde(default)]
    available_transports: Vec<AvailableTransport>,
    url: Option<String>,
    access_token: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailableTransport {
    transport: String,
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Negotiated {
    /// Endpoint to connect to (differs from the configured one after a redirect).
    pub(crate) endpoint: String,
    /// Value for the `id` query parameter.
    pub(crate) connection_token: Option<String>,
    /// Token to authenticate the socket with.
    pub(crate) access_token: Option<String>,
}

/// Negotiate against `options.endpoint`, following redirects.
pub(crate) async fn negotiate(
    options: &ConnectionOptions,
    access_token: Option<String>,
) -> Result<Negotiated> {
    let client = reqwest::Client::builder()
        .timeout(NEGOTIATE_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;

    let mut endpoint = options.endpoint.clone();
    let mut access_token = access_token;

    for _ in 0..MAX_NEGOTIATE_REDIRECTS {
        let url = negotiate_url(&endpoint)?;
        log::debug!("[HubSocket] Negotiating with {}", url.as_str());

        let mut request = client.post(url.clone());
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("negotiate request to {} failed", url.path()))?;

        let status = response.status();
        if !status.is_success() {
            bail!("negotiate failed: {status}");
        }

        let body: NegotiateResponse = response
            .json()
            .await
            .context("invalid negotiate response")?;

        if let Some(error) = body.error {
            bail!("negotiate rejected by server: {error}");
        }

        if let Some(redirect) = body.url {
            log::info!("[HubSocket] Negotiate redirected");
            endpoint = redirect;
            if body.access_token.is_some() {
                access_token = body.access_token;
            }
            continue;
        }

        let wanted = options.transport.negotiate_name();
        if !body.available_transports.is_empty()
            && !body
                .available_transports
                .iter()
                .any(|t| t.transport.eq_ignore_ascii_case(wanted))
        {
            bail!("server does not offer the {wanted} transport");
        }

        return Ok(Negotiated {
            endpoint,
            connection_token: body.connection_token.or(body.connection_id),
            access_token,
        });
    }

    bail!("negotiate exceeded {MAX_NEGOTIATE_REDIRECTS} redirects")
}

/// `{endpoint}/negotiate?negotiateVersion=N`, keeping any existing query.
pub(crate) fn negotiate_url(endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(&ws_to_http_scheme(endpoint))
        .with_context(|| format!("invalid hub endpoint: {endpoint}"))?;

    let path = format!("{}/negotiate", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .append_pair("negotiateVersion", &NEGOTIATE_VERSION.to_string());
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_negotiate_url() {
        assert_eq!(
            negotiate_url("http://localhost:5000/chat").unwrap().as_str(),
            "http://localhost:5000/chat/negotiate?negotiateVersion=1"
        );
        assert_eq!(
            negotiate_url("wss://example.com/chat/?tenant=a").unwrap().as_str(),
            "https://example.com/chat/negotiate?tenant=a&negotiateVersion=1"
        );
        assert!(negotiate_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_negotiate_returns_connection_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/negotiate"))
            .and(query_param("negotiateVersion", "1"))
            .and(header("X-Tenant", "acme"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "negotiateVersion": 1,
                "connectionId": "conn-id",
                "connectionToken": "conn-token",
                "availableTransports": [
                    {"transport": "WebSockets", "transferFormats": ["Text", "Binary"]},
                    {"transport": "LongPolling", "transferFormats": ["Text"]}
                ]
            })))
            .mount(&server)
            .await;

        let options =
            ConnectionOptions::new(format!("{}/chat", server.uri())).with_header("X-Tenant", "acme");
        let negotiated = negotiate(&options, Some("secret".into())).await.unwrap();

        assert_eq!(negotiated.endpoint, options.endpoint);
        assert_eq!(negotiated.connection_token.as_deref(), Some("conn-token"));
        assert_eq!(negotiated.access_token.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_negotiate_falls_back_to_connection_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/negotiate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "connectionId": "legacy-id",
                "availableTransports": []
            })))
            .mount(&server)
            .await;

        let options = ConnectionOptions::new(format!("{}/chat", server.uri()));
        let negotiated = negotiate(&options, None).await.unwrap();
        assert_eq!(negotiated.connection_token.as_deref(), Some("legacy-id"));
    }

    #[tokio::test]
    async fn test_negotiate_follows_redirect_with_new_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/negotiate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": format!("{}/edge/chat", server.uri()),
                "accessToken": "edge-token"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/edge/chat/negotiate"))
            .and(header("Authorization", "Bearer edge-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "connectionToken": "edge-conn"
            })))
            .mount(&server)
            .await;

        let options = ConnectionOptions::new(format!("{}/chat", server.uri()));
        let negotiated = negotiate(&options, Some("initial".into())).await.unwrap();

        assert_eq!(negotiated.endpoint, format!("{}/edge/chat", server.uri()));
        assert_eq!(negotiated.connection_token.as_deref(), Some("edge-conn"));
        assert_eq!(negotiated.access_token.as_deref(), Some("edge-token"));
    }

    #[tokio::test]
    async fn test_negotiate_error_field_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/negotiate"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"error": "hub disabled"})),
            )
            .mount(&server)
            .await;

        let options = ConnectionOptions::new(format!("{}/chat", server.uri()));
        let err = negotiate(&options, None).await.unwrap_err();
        assert!(format!("{err:#}").contains("hub disabled"));
    }

    #[tokio::test]
    async fn test_negotiate_http_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/negotiate"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let options = ConnectionOptions::new(format!("{}/chat", server.uri()));
        let err = negotiate(&options, None).await.unwrap_err();
        assert!(format!("{err:#}").contains("401"));
    }

    #[tokio::test]
    async fn test_negotiate_requires_websockets() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/negotiate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "connectionToken": "t",
                "availableTransports": [{"transport": "LongPolling", "transferFormats": ["Text"]}]
            })))
            .mount(&server)
            .await;

        let options = ConnectionOptions::new(format!("{}/chat", server.uri()));
        let err = negotiate(&options, None).await.unwrap_err();
        assert!(err.to_string().contains("WebSockets"));
    }
}
