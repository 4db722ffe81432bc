//! JSON-RPC transports for MCP servers: stdio subprocess, streamable HTTP and SSE.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use super::McpError;
use crate::sse::{SseEvent, SseParser};

const SESSION_HEADER: &str = "mcp-session-id";

type PendingMap = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Value>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A registered waiter for one request id. Dropping it removes the entry,
/// so a caller that times out or is cancelled leaves nothing behind.
struct PendingSlot {
    pending: PendingMap,
    id: u64,
}

impl PendingSlot {
    fn register(pending: &PendingMap, id: u64) -> (Self, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        lock_pending(pending).insert(id, tx);
        let slot = Self {
            pending: Arc::clone(pending),
            id,
        };
        (slot, rx)
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.id);
    }
}

/// A bidirectional JSON-RPC channel to one MCP server.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for its response's `result`.
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError>;

    /// Send a notification; no response is expected.
    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError>;

    /// Tear the channel down. Safe to call more than once.
    async fn close(&self) -> Result<(), McpError>;
}

fn request_message(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params
    })
}

fn notification_message(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params
    })
}

fn response_id(value: &Value) -> Option<u64> {
    match value.get("id")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Split a JSON-RPC response into its `result` or a typed error.
pub fn into_result(response: Value) -> Result<Value, McpError> {
    if let Some(error) = response.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32603);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(McpError::Rpc { code, message });
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

/// Route a server message to the request waiting on its id.
fn dispatch(pending: &PendingMap, value: Value) {
    // Server-initiated requests and notifications carry a method.
    if let Some(method) = value.get("method") {
        let method = method.as_str().unwrap_or_default();
        tracing::debug!(method, "Ignoring server-initiated MCP message");
        return;
    }
    let Some(id) = response_id(&value) else {
        return;
    };
    let waiter = lock_pending(pending).remove(&id);
    if let Some(tx) = waiter {
        let _ = tx.send(value);
    }
}

fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| McpError::Http(format!("Invalid header name '{key}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| McpError::Http(format!("Invalid value for header '{key}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

async fn http_error(response: reqwest::Response) -> McpError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    McpError::Http(format!("HTTP {}: {}", status.as_u16(), body))
}

// === Stdio ===

/// Newline-delimited JSON-RPC over a child process's stdin/stdout.
pub struct StdioTransport {
    name: String,
    child: Mutex<Option<Child>>,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    disconnected: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Spawn the server and start reading its stdout.
    pub fn spawn(name: &str, mut command: Command) -> Result<Self, McpError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| McpError::Spawn {
            server: name.to_string(),
            message: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Spawn {
            server: name.to_string(),
            message: "stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Spawn {
            server: name.to_string(),
            message: "stdout unavailable".to_string(),
        })?;

        let pending = PendingMap::default();
        let disconnected = Arc::new(AtomicBool::new(false));
        tokio::spawn(read_stdout(
            name.to_string(),
            stdout,
            Arc::clone(&pending),
            Arc::clone(&disconnected),
        ));

        Ok(Self {
            name: name.to_string(),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            disconnected,
        })
    }

    async fn write(&self, message: &Value) -> Result<(), McpError> {
        let line = serde_json::to_string(message)? + "\n";
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

async fn read_stdout(
    name: String,
    stdout: ChildStdout,
    pending: PendingMap,
    disconnected: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(server = %name, "MCP stdout read failed: {err}");
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => dispatch(&pending, value),
            Err(_) => tracing::debug!(server = %name, "Skipping non-JSON MCP output line"),
        }
    }

    disconnected.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with a disconnect.
    lock_pending(&pending).clear();
    tracing::debug!(server = %name, "MCP stdio reader finished");
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(McpError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (_slot, rx) = PendingSlot::register(&self.pending, id);
        self.write(&request_message(id, method, params)).await?;

        let response = rx.await.map_err(|_| McpError::Disconnected)?;
        into_result(response)
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(McpError::Disconnected);
        }
        self.write(&notification_message(method, params)).await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.disconnected.store(true, Ordering::SeqCst);
        lock_pending(&self.pending).clear();
        if let Some(mut child) = self.child.lock().await.take()
            && let Err(err) = child.kill().await
        {
            tracing::debug!(server = %self.name, "MCP child already exited: {err}");
        }
        Ok(())
    }
}

// === Streamable HTTP ===

/// Single-endpoint HTTP transport; responses come back as JSON or as an SSE body.
pub struct StreamableHttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    session_id: std::sync::Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl StreamableHttpTransport {
    pub fn new(url: &str, headers: &HashMap<String, String>) -> Result<Self, McpError> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            url: url.to_string(),
            headers: header_map(headers)?,
            session_id: std::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|guard| guard.clone())
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = self.session_id() {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder
    }

    fn remember_session(&self, response: &reqwest::Response) {
        if let Some(value) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            && let Ok(mut guard) = self.session_id.lock()
        {
            *guard = Some(value.to_string());
        }
    }
}

fn match_event(event: &SseEvent, id: u64) -> Option<Value> {
    let value = serde_json::from_str::<Value>(&event.data).ok()?;
    (response_id(&value) == Some(id) && value.get("method").is_none()).then_some(value)
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self
            .post(&request_message(id, method, params))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }
        self.remember_session(&response);

        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if !is_sse {
            let value: Value = response.json().await?;
            return into_result(value);
        }

        let mut parser = SseParser::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for event in parser.feed(&chunk) {
                if let Some(value) = match_event(&event, id) {
                    return into_result(value);
                }
            }
        }
        if let Some(value) = parser.finish().and_then(|event| match_event(&event, id)) {
            return into_result(value);
        }
        Err(McpError::Protocol(format!(
            "event stream ended before a response to '{method}'"
        )))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let response = self
            .post(&notification_message(method, params))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        let Some(session) = self.session_id() else {
            return Ok(());
        };
        // Servers may not support explicit termination.
        if let Err(err) = self
            .client
            .delete(&self.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session)
            .send()
            .await
        {
            tracing::debug!(url = %self.url, "MCP session delete failed: {err}");
        }
        if let Ok(mut guard) = self.session_id.lock() {
            *guard = None;
        }
        Ok(())
    }
}

// === SSE ===

/// Legacy HTTP+SSE transport: a long-lived event stream for responses and a
/// POST endpoint, announced by the first `endpoint` event, for requests.
pub struct SseTransport {
    client: reqwest::Client,
    headers: HeaderMap,
    endpoint: String,
    pending: PendingMap,
    next_id: AtomicU64,
    disconnected: Arc<AtomicBool>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the endpoint announcement.
    pub async fn connect(url: &str, headers: &HashMap<String, String>) -> Result<Self, McpError> {
        let headers = header_map(headers)?;
        let client = reqwest::Client::builder().build()?;
        let response = client
            .get(url)
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }

        let base = response.url().clone();
        let mut stream = response.bytes_stream();
        let mut parser = SseParser::default();

        let endpoint = loop {
            let Some(chunk) = stream.next().await else {
                return Err(McpError::Protocol(
                    "event stream closed before the endpoint event".to_string(),
                ));
            };
            let chunk = chunk?;
            let announced = parser
                .feed(&chunk)
                .into_iter()
                .find(|event| event.event == "endpoint");
            if let Some(event) = announced {
                break base
                    .join(event.data.trim())
                    .map_err(|e| McpError::Protocol(format!("Invalid endpoint: {e}")))?;
            }
        };

        let pending = PendingMap::default();
        let disconnected = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_events(
            stream,
            parser,
            Arc::clone(&pending),
            Arc::clone(&disconnected),
        ));

        Ok(Self {
            client,
            headers,
            endpoint: endpoint.to_string(),
            pending,
            next_id: AtomicU64::new(1),
            disconnected,
            reader: std::sync::Mutex::new(Some(reader)),
        })
    }

    async fn post(&self, message: &Value) -> Result<(), McpError> {
        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .json(message)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }
        Ok(())
    }
}

async fn read_events<S>(
    mut stream: S,
    mut parser: SseParser,
    pending: PendingMap,
    disconnected: Arc<AtomicBool>,
) where
    S: Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin + Send + 'static,
{
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!("MCP event stream error: {err}");
                break;
            }
        };
        for event in parser.feed(&chunk) {
            if event.event != "message" {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(&event.data) {
                dispatch(&pending, value);
            }
        }
    }
    disconnected.store(true, Ordering::SeqCst);
    lock_pending(&pending).clear();
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(McpError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (_slot, rx) = PendingSlot::register(&self.pending, id);
        self.post(&request_message(id, method, params)).await?;

        let response = rx.await.map_err(|_| McpError::Disconnected)?;
        into_result(response)
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        self.post(&notification_message(method, params)).await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.disconnected.store(true, Ordering::SeqCst);
        let reader = self.reader.lock().ok().and_then(|mut guard| guard.take());
        if let Some(reader) = reader {
            reader.abort();
        }
        lock_pending(&self.pending).clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn test_into_result_error() {
        let err = into_result(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "Method not found"}
        }))
        .unwrap_err();
        assert!(matches!(err, McpError::Rpc { code: -32601, .. }));
        assert!(err.to_string().contains("Method not found"));
    }

    #[test]
    fn test_response_id_accepts_strings() {
        assert_eq!(response_id(&json!({"id": "7"})), Some(7));
        assert_eq!(response_id(&json!({"id": 7})), Some(7));
        assert_eq!(response_id(&json!({"method": "x"})), None);
    }

    #[tokio::test]
    async fn test_dispatch_ignores_server_requests() {
        let pending = PendingMap::default();
        let (_slot, mut rx) = PendingSlot::register(&pending, 1);

        dispatch(&pending, json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}));
        assert!(rx.try_recv().is_err());

        dispatch(&pending, json!({"jsonrpc": "2.0", "id": 1, "result": {}}));
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_streamable_http_json_response_and_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "abc")
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transport =
            StreamableHttpTransport::new(&format!("{}/mcp", server.uri()), &HashMap::new())
                .unwrap();
        let result = transport.request("initialize", json!({})).await.unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(transport.session_id().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_streamable_http_sse_response() {
        let server = MockServer::start().await;
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"tools\":[]}}\n\n";
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let transport =
            StreamableHttpTransport::new(&format!("{}/mcp", server.uri()), &HashMap::new())
                .unwrap();
        let result = transport.request("tools/list", json!({})).await.unwrap();
        assert_eq!(result, json!({"tools": []}));
    }

    #[tokio::test]
    async fn test_streamable_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .mount(&server)
            .await;

        let transport =
            StreamableHttpTransport::new(&format!("{}/mcp", server.uri()), &HashMap::new())
                .unwrap();
        let err = transport.request("initialize", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("HTTP 404"));
    }

    #[test]
    fn test_header_map_rejects_bad_name() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(header_map(&headers).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_round_trip_with_cat() {
        // `cat` echoes our request back; its id matches and it has a method,
        // so it is ignored. Closing must not hang.
        let transport = StdioTransport::spawn("cat", Command::new("cat")).unwrap();
        transport
            .notify("notifications/initialized", json!({}))
            .await
            .unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(matches!(
            transport.request("tools/list", json!({})).await,
            Err(McpError::Disconnected)
        ));
    }

    #[test]
    fn test_dropped_slot_removes_waiter() {
        let pending = PendingMap::default();
        let (slot, _rx) = PendingSlot::register(&pending, 4);
        assert_eq!(lock_pending(&pending).len(), 1);
        drop(slot);
        assert!(lock_pending(&pending).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timed_out_requests_leave_no_waiters() {
        let mut command = Command::new("sh");
        command.args(["-c", "cat > /dev/null"]);
        let transport = StdioTransport::spawn("sink", command).unwrap();

        for _ in 0..5 {
            let result = tokio::time::timeout(
                std::time::Duration::from_millis(20),
                transport.request("tools/list", json!({})),
            )
            .await;
            assert!(result.is_err());
        }

        assert!(lock_pending(&transport.pending).is_empty());
        transport.close().await.unwrap();
    }
}
