//! Backend transport seam and the reqwest/tungstenite implementation.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use kinformer_core::{Error, Result};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Close code sent when a watch socket is stopped on purpose.
pub const MANUAL_CLOSE_CODE: u16 = 3001;
pub const MANUAL_CLOSE_REASON: &str = "MANUAL_CLOSE";

pub const CT_JSON: &str = "application/json";
pub const CT_MERGE_PATCH: &str = "application/merge-patch+json";
pub const CT_JSON_PATCH: &str = "application/json-patch+json";
pub const CT_APPLY_PATCH: &str = "application/apply-patch+yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Patch => "PATCH",
            Verb::Put => "PUT",
            Verb::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub verb: Verb,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub content_type: &'static str,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(verb: Verb, url: impl Into<String>) -> Self {
        Self { verb, url: url.into(), query: Vec::new(), content_type: CT_JSON, body: None }
    }

    pub fn get(url: impl Into<String>) -> Self { Self::new(Verb::Get, url) }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, content_type: &'static str, body: Value) -> Self {
        self.content_type = content_type;
        self.body = Some(body);
        self
    }
}

/// How events arrive on a watch connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchMode {
    /// Newline-delimited JSON in a streamed HTTP body.
    Chunked,
    /// One JSON event per WebSocket text frame.
    WebSocket,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub mode: WatchMode,
}

impl WatchRequest {
    /// `?watch=1&resourceVersion={rv}` on the collection URL.
    pub fn new(url: impl Into<String>, resource_version: &str, mode: WatchMode) -> Self {
        Self {
            url: url.into(),
            query: vec![("watch".into(), "1".into()), ("resourceVersion".into(), resource_version.to_string())],
            mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchChunk {
    Bytes(Bytes),
    Frame(String),
}

pub type WatchSource = BoxStream<'static, Result<WatchChunk>>;

/// Everything the informer and mutation client need from the network.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// One request/response round trip decoded as JSON. 404 maps to `Error::NotFound`.
    async fn request(&self, req: ApiRequest) -> Result<Value>;

    /// Open a watch stream. Cancelling `cancel` ends the stream; socket
    /// transports send a manual close frame first.
    async fn watch(&self, req: WatchRequest, cancel: CancellationToken) -> Result<WatchSource>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Option<Duration>,
}

impl HttpTransport {
    /// `timeout` bounds plain requests only; watch streams stay open.
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }

    async fn send(&self, rb: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response> {
        let resp = rb.send().await.map_err(|e| Error::transport(e.to_string()))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound { identity: url.to_string() });
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(Error::Transport { status: Some(status.as_u16()), message });
        }
        Ok(resp)
    }

    async fn watch_chunked(&self, req: WatchRequest, cancel: CancellationToken) -> Result<WatchSource> {
        let rb = self.client.get(&req.url).query(&req.query);
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = self.send(rb, &req.url) => r?,
        };
        let stream = resp
            .bytes_stream()
            .map(|r| r.map(WatchChunk::Bytes).map_err(|e| Error::transport(e.to_string())))
            .take_until(cancel.cancelled_owned());
        Ok(stream.boxed())
    }

    async fn watch_socket(&self, req: WatchRequest, cancel: CancellationToken) -> Result<WatchSource> {
        let url = reqwest::Url::parse_with_params(&req.url, &req.query)
            .map_err(|e| Error::transport(format!("invalid watch url {}: {e}", req.url)))?;
        let (ws, _) = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = tokio_tungstenite::connect_async(url.as_str()) => {
                r.map_err(|e| Error::transport(format!("websocket connect failed: {e}")))?
            }
        };
        let (mut sink, mut stream) = ws.split();
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<WatchChunk>>();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let frame = CloseFrame {
                            code: CloseCode::from(MANUAL_CLOSE_CODE),
                            reason: Cow::Borrowed(MANUAL_CLOSE_REASON),
                        };
                        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                            debug!(error = %e, "close frame not delivered");
                        }
                        break;
                    }
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            if tx.unbounded_send(Ok(WatchChunk::Frame(text))).is_err() { break; }
                        }
                        Some(Ok(Message::Binary(bin))) => {
                            let text = String::from_utf8_lossy(&bin).into_owned();
                            if tx.unbounded_send(Ok(WatchChunk::Frame(text))).is_err() { break; }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "watch socket closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "watch socket error");
                            let _ = tx.unbounded_send(Err(Error::transport(e.to_string())));
                            break;
                        }
                        None => break,
                    }
                }
            }
        });
        Ok(rx.boxed())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, req: ApiRequest) -> Result<Value> {
        let method = match req.verb {
            Verb::Get => reqwest::Method::GET,
            Verb::Post => reqwest::Method::POST,
            Verb::Patch => reqwest::Method::PATCH,
            Verb::Put => reqwest::Method::PUT,
            Verb::Delete => reqwest::Method::DELETE,
        };
        let mut rb = self.client.request(method, &req.url).query(&req.query);
        if let Some(t) = self.timeout {
            rb = rb.timeout(t);
        }
        if let Some(body) = &req.body {
            let bytes = serde_json::to_vec(body).map_err(|e| Error::Decode(e.to_string()))?;
            rb = rb.header(CONTENT_TYPE, req.content_type).body(bytes);
        }
        let resp = self.send(rb, &req.url).await?;
        resp.json::<Value>().await.map_err(|e| Error::Decode(e.to_string()))
    }

    async fn watch(&self, req: WatchRequest, cancel: CancellationToken) -> Result<WatchSource> {
        match req.mode {
            WatchMode::Chunked => self.watch_chunked(req, cancel).await,
            WatchMode::WebSocket => self.watch_socket(req, cancel).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_request_carries_resume_point() {
        let w = WatchRequest::new("http://h/api/v1/pods", "12", WatchMode::Chunked);
        assert_eq!(
            w.query,
            vec![("watch".to_string(), "1".to_string()), ("resourceVersion".to_string(), "12".to_string())]
        );
    }

    #[test]
    fn request_builder() {
        let r = ApiRequest::new(Verb::Patch, "http://h/x")
            .query("fieldManager", "kinformer")
            .body(CT_MERGE_PATCH, serde_json::json!({ "a": 1 }));
        assert_eq!(r.verb.as_str(), "PATCH");
        assert_eq!(r.content_type, CT_MERGE_PATCH);
        assert_eq!(r.query.len(), 1);
    }
}
