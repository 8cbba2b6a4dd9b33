//! WebSocket plumbing for the hub transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing split reader/writer
//! halves. The rest of the transport never sees tungstenite types.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

/// Concrete WebSocket stream type.
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Frame received from the hub.
#[derive(Debug)]
pub(crate) enum Frame {
    /// Text payload: one or more separator-terminated records.
    Text(String),
    /// Ping that must be answered with a pong.
    Ping(Vec<u8>),
    /// Close frame.
    Close {
        /// WebSocket close code (1005 when the server sent none).
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Write half.
#[derive(Debug)]
pub(crate) struct SocketWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl SocketWriter {
    /// Send a text frame.
    pub(crate) async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send failed")
    }

    /// Answer a ping.
    pub(crate) async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket pong failed")
    }

    /// Flush and close the sink.
    pub(crate) async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half.
#[derive(Debug)]
pub(crate) struct SocketReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl SocketReader {
    /// Receive the next frame, `None` once the stream ends.
    ///
    /// Pongs and raw frames are skipped. Binary frames are accepted when
    /// they hold UTF-8, since the JSON protocol is text either way.
    pub(crate) async fn recv(&mut self) -> Option<Result<Frame>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(Frame::Text(text.to_string())));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(
                        String::from_utf8(data.to_vec())
                            .map(Frame::Text)
                            .context("binary frame is not UTF-8"),
                    );
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    return Some(Ok(Frame::Ping(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(Frame::Close { code, reason }));
                }
                Some(Ok(tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_))) => {}
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}

/// Open a WebSocket to `url`, sending `headers` with the upgrade request.
pub(crate) async fn open(
    url: &str,
    headers: &[(String, String)],
) -> Result<(SocketWriter, SocketReader)> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {}", strip_query(url)))?;

    for (name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();
    Ok((SocketWriter { sink }, SocketReader { stream }))
}

/// Convert an HTTP(S) URL to the WS(S) scheme. WS URLs pass through.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// Convert a WS(S) URL to the HTTP(S) scheme. HTTP URLs pass through.
#[must_use]
pub fn ws_to_http_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        url.to_string()
    }
}

/// URL without its query string, for log and error output (the query may
/// carry an access token).
pub(crate) fn strip_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_scheme() {
        assert_eq!(http_to_ws_scheme("https://example.com/hub"), "wss://example.com/hub");
        assert_eq!(http_to_ws_scheme("http://localhost:3000"), "ws://localhost:3000");
        assert_eq!(http_to_ws_scheme("wss://example.com/hub"), "wss://example.com/hub");
    }

    #[test]
    fn test_ws_to_http_scheme() {
        assert_eq!(ws_to_http_scheme("wss://example.com/hub"), "https://example.com/hub");
        assert_eq!(ws_to_http_scheme("ws://localhost:3000"), "http://localhost:3000");
        assert_eq!(ws_to_http_scheme("https://example.com"), "https://example.com");
    }

    #[test]
    fn test_strip_query_hides_token() {
        assert_eq!(
            strip_query("wss://example.com/hub?id=abc&access_token=secret"),
            "wss://example.com/hub"
        );
        assert_eq!(strip_query("ws://h/hub"), "ws://h/hub");
    }

    #[tokio::test]
    async fn test_open_invalid_url_returns_error() {
        assert!(open("not-a-url", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_open_unreachable_host_returns_error() {
        assert!(open("ws://127.0.0.1:1/hub", &[]).await.is_err());
    }
}
