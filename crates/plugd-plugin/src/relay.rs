//! Resource-call relay — drains a resource stream into an HTTP response sink.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};
use crate::protocol::CallResourceResponse;
use crate::stream::ResourceReceiver;

/// Destination of a relayed resource response.
///
/// Implemented by the HTTP layer; headers must be set before
/// [`write_head`](Self::write_head) is called.
#[async_trait]
pub trait ResponseSink: Send {
    /// Headers to send with the status line.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Writes the status line and the current headers.
    async fn write_head(&mut self, status: StatusCode) -> PluginResult<()>;

    /// Writes body bytes.
    async fn write_body(&mut self, chunk: &[u8]) -> PluginResult<()>;

    /// Pushes buffered bytes to the client.
    async fn flush(&mut self) -> PluginResult<()> {
        Ok(())
    }
}

/// In-memory response sink.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    /// Status written by the relay, if any.
    pub status: Option<StatusCode>,
    /// Response headers.
    pub headers: HeaderMap,
    /// Concatenated body.
    pub body: BytesMut,
    /// Number of flushes.
    pub flushes: usize,
}

impl BufferedResponse {
    /// Creates an empty response.
    pub fn new() -> Self {
        Self::default()
    }

    /// The body written so far.
    pub fn body_bytes(&self) -> Bytes {
        self.body.clone().freeze()
    }
}

#[async_trait]
impl ResponseSink for BufferedResponse {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_head(&mut self, status: StatusCode) -> PluginResult<()> {
        self.status = Some(status);
        Ok(())
    }

    async fn write_body(&mut self, chunk: &[u8]) -> PluginResult<()> {
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    async fn flush(&mut self) -> PluginResult<()> {
        self.flushes += 1;
        Ok(())
    }
}

/// Drains `rx` into `sink` and returns the number of chunks written.
///
/// Status and headers come from the first chunk. Errors before the first
/// chunk are returned. A later receive error is logged and ends the relay;
/// a failed body write is logged and the stream is still drained.
pub async fn relay_stream<S>(
    plugin_id: &str,
    rx: &mut ResourceReceiver,
    sink: &mut S,
) -> PluginResult<usize>
where
    S: ResponseSink + ?Sized,
{
    let mut written = 0usize;

    loop {
        let chunk = match rx.recv().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) if written == 0 => {
                return Err(PluginError::ResourceReceiveFailed {
                    source: Box::new(e),
                });
            }
            Err(e) => {
                warn!(plugin_id = %plugin_id, error = %e, "Failed to receive resource response");
                break;
            }
        };

        if written == 0 {
            write_head(sink, &chunk).await?;
        }

        // The stream is drained even when the client stops accepting bytes.
        if let Err(e) = write_body(sink, &chunk.body).await {
            warn!(plugin_id = %plugin_id, error = %e, "Failed to write resource response");
        }
        written += 1;
    }

    if written == 0 {
        return Err(PluginError::EmptyResourceResponse);
    }

    debug!(plugin_id = %plugin_id, chunks = written, "Resource response relayed");
    Ok(written)
}

async fn write_head<S>(sink: &mut S, chunk: &CallResourceResponse) -> PluginResult<()>
where
    S: ResponseSink + ?Sized,
{
    apply_headers(sink.headers_mut(), &chunk.headers);

    let status = StatusCode::from_u16(chunk.status).unwrap_or_else(|_| {
        warn!(status = chunk.status, "Plugin returned invalid status code");
        StatusCode::INTERNAL_SERVER_ERROR
    });
    sink.write_head(status).await
}

async fn write_body<S>(sink: &mut S, body: &[u8]) -> PluginResult<()>
where
    S: ResponseSink + ?Sized,
{
    sink.write_body(body).await?;
    sink.flush().await
}

/// Copies plugin headers, dropping `Set-Cookie` and defaulting the content type.
fn apply_headers(target: &mut HeaderMap, headers: &HashMap<String, Vec<String>>) {
    for (name, values) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(header = %name, "Skipping invalid response header name");
            continue;
        };
        if name == SET_COOKIE {
            continue;
        }

        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    target.append(name.clone(), value);
                }
                Err(_) => warn!(header = %name, "Skipping invalid response header value"),
            }
        }
    }

    if !target.contains_key(CONTENT_TYPE) {
        target.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
}

/// Renders `err` as a JSON error response.
pub async fn write_error<S>(sink: &mut S, err: &PluginError) -> PluginResult<()>
where
    S: ResponseSink + ?Sized,
{
    let body = serde_json::json!({ "message": err.public_message() });
    let body = serde_json::to_vec(&body).map_err(|e| PluginError::Transport {
        reason: e.to_string(),
    })?;

    sink.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    sink.write_head(err.http_status()).await?;
    sink.write_body(&body).await?;
    sink.flush().await
}

/// Reduces the `Cookie` header to the named cookies.
///
/// Every `Cookie` header is removed; if any allowed cookie was present a single
/// merged header is put back.
pub fn clear_cookie_header(headers: &mut HeaderMap, keep: &[String]) {
    let kept: Vec<String> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .map(str::trim)
        .filter(|pair| {
            let name = pair.split_once('=').map(|(n, _)| n).unwrap_or(pair);
            keep.iter().any(|k| k == name)
        })
        .map(str::to_string)
        .collect();

    headers.remove(COOKIE);

    if kept.is_empty() {
        return;
    }

    if let Ok(value) = HeaderValue::from_str(&kept.join("; ")) {
        headers.insert(COOKIE, value);
    }
}

/// Converts a header map into the multimap carried by plugin requests.
pub fn header_multimap(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();

    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }

    out
}
