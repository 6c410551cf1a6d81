//! Driver protocol client
//!
//! Drivers speak newline-delimited JSON envelopes over any byte stream
//! (child stdio, Unix socket, in-memory pipe). Requests and responses are
//! correlated by `id`; events flow independently.

use crate::error::ProtocolError;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, trace, warn};

/// Read half of a driver transport
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a driver transport
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Upper bound for a single envelope line
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

const EVENT_BUFFER: usize = 256;

/// Reserved protocol methods
pub mod methods {
    /// Event a driver emits once it accepts requests
    pub const READY: &str = "ready";
    /// Liveness probe request
    pub const PING: &str = "ping";
    /// Graceful shutdown request
    pub const SHUTDOWN: &str = "shutdown";
    /// Log line event
    pub const LOG: &str = "log";
    /// Progress event
    pub const PROGRESS: &str = "progress";
}

/// Envelope kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
}

/// Error object carried by a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default)]
    pub code: i64,
    pub message: String,
}

/// Protocol envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl Message {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Request,
            method: method.into(),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn response(id: impl Into<String>, method: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Response,
            method: method.into(),
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error_response(
        id: impl Into<String>,
        method: impl Into<String>,
        code: i64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Response,
            method: method.into(),
            params: None,
            result: None,
            error: Some(RemoteError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn event(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: String::new(),
            message_type: MessageType::Event,
            method: method.into(),
            params: Some(params),
            result: None,
            error: None,
        }
    }
}

/// Event emitted by a driver outside of request/response
#[derive(Debug, Clone, PartialEq)]
pub struct DriverEvent {
    pub driver_id: String,
    pub method: String,
    pub params: Value,
}

/// Connection readiness as seen by the client
#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Ready,
    Closed(String),
}

type PendingSender = oneshot::Sender<Result<Value, ProtocolError>>;

/// State shared between the client and its reader task
struct Shared {
    pending: Mutex<HashMap<String, PendingSender>>,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn reason(&self) -> String {
        self.close_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "connection closed".to_string())
    }

    /// Register a pending request; refused once the connection is closed
    fn register(&self, id: &str, tx: PendingSender) -> Result<(), ProtocolError> {
        let mut pending = self.pending.lock();
        if self.is_closed() {
            return Err(ProtocolError::connection_lost(self.reason()));
        }
        pending.insert(id.to_string(), tx);
        Ok(())
    }

    fn take(&self, id: &str) -> Option<PendingSender> {
        self.pending.lock().remove(id)
    }

    /// Mark closed and fail every pending request
    fn close(&self, reason: &str) -> usize {
        let drained: Vec<PendingSender> = {
            let mut pending = self.pending.lock();
            if self.closed.swap(true, Ordering::SeqCst) {
                return 0;
            }
            *self.close_reason.lock() = Some(reason.to_string());
            pending.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(ProtocolError::connection_lost(reason.to_string())));
        }
        count
    }
}

/// Client for one driver connection
pub struct DriverClient {
    driver_id: String,
    writer: tokio::sync::Mutex<FramedWrite<BoxedWriter, LinesCodec>>,
    shared: Arc<Shared>,
    /// Serializes `invoke` calls; tokio's mutex is fair so callers queue FIFO
    invoke_gate: tokio::sync::Mutex<()>,
    events: broadcast::Sender<DriverEvent>,
    link: watch::Receiver<LinkState>,
    reader: JoinHandle<()>,
}

impl DriverClient {
    /// Wrap a transport. Must be called from within a tokio runtime.
    pub fn new(driver_id: impl Into<String>, reader: BoxedReader, writer: BoxedWriter) -> Self {
        let driver_id = driver_id.into();
        let shared = Arc::new(Shared::new());
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (link_tx, link) = watch::channel(LinkState::Connecting);

        let lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let reader = tokio::spawn(read_loop(
            driver_id.clone(),
            lines,
            shared.clone(),
            events.clone(),
            link_tx,
        ));

        Self {
            driver_id,
            writer: tokio::sync::Mutex::new(FramedWrite::new(
                writer,
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            )),
            shared,
            invoke_gate: tokio::sync::Mutex::new(()),
            events,
            link,
            reader,
        }
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    /// Check if the connection has been lost or closed
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Why the connection closed, if it did
    pub fn close_reason(&self) -> Option<String> {
        self.is_closed().then(|| self.shared.reason())
    }

    /// True while an invocation holds the connection
    pub fn is_busy(&self) -> bool {
        self.invoke_gate.try_lock().is_err()
    }

    /// Subscribe to driver events
    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }

    /// Wait for the driver's `ready` event
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ProtocolError> {
        let mut link = self.link.clone();
        let waited = tokio::time::timeout(
            timeout,
            link.wait_for(|state| *state != LinkState::Connecting),
        )
        .await;

        match waited {
            Err(_) => Err(ProtocolError::timeout(methods::READY, timeout)),
            Ok(Err(_)) => Err(ProtocolError::connection_lost(self.shared.reason())),
            Ok(Ok(state)) => match &*state {
                LinkState::Ready => Ok(()),
                LinkState::Closed(reason) => Err(ProtocolError::connection_lost(reason.clone())),
                LinkState::Connecting => Err(ProtocolError::timeout(methods::READY, timeout)),
            },
        }
    }

    /// Invoke a driver action. Calls on one connection run one at a time in
    /// arrival order; a timeout is reported and never retried here.
    pub async fn invoke(
        &self,
        action: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ProtocolError> {
        let _slot = self.invoke_gate.lock().await;
        self.request(action, params, timeout).await
    }

    /// Liveness probe. Does not queue behind invocations.
    pub async fn ping(&self, timeout: Duration) -> Result<(), ProtocolError> {
        self.request(methods::PING, Value::Object(Default::default()), timeout)
            .await
            .map(|_| ())
    }

    /// Ask the driver to shut down gracefully
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ProtocolError> {
        self.request(methods::SHUTDOWN, Value::Object(Default::default()), timeout)
            .await
            .map(|_| ())
    }

    /// Close the connection, failing anything still pending
    pub fn close(&self) {
        let failed = self.shared.close("connection closed by client");
        if failed > 0 {
            debug!(driver_id = %self.driver_id, failed, "Closed connection with pending requests");
        }
        self.reader.abort();
    }

    /// One deadline bounds the whole request: the writer slot, the write
    /// itself and the response.
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ProtocolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.shared.register(&id, tx)?;

        let line = match serde_json::to_string(&Message::request(&id, method, params)) {
            Ok(line) => line,
            Err(e) => {
                self.shared.take(&id);
                return Err(ProtocolError::malformed(format!("cannot encode request: {}", e)));
            }
        };
        trace!(driver_id = %self.driver_id, correlation_id = %id, "-> {}", line);

        // Nothing written yet, so the connection stays usable
        let Ok(mut writer) = tokio::time::timeout_at(deadline, self.writer.lock()).await else {
            self.shared.take(&id);
            debug!(driver_id = %self.driver_id, correlation_id = %id, method, "Timed out waiting to write");
            return Err(ProtocolError::timeout(method, timeout));
        };

        let sent = tokio::time::timeout_at(deadline, writer.send(line)).await;
        drop(writer);
        let failure = match sent {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("write failed: {}", e)),
            // A partially written frame leaves the stream unusable
            Err(_) => Some(format!(
                "driver stopped reading; write stalled past {}ms",
                timeout.as_millis()
            )),
        };
        if let Some(reason) = failure {
            self.shared.take(&id);
            self.shared.close(&reason);
            warn!(driver_id = %self.driver_id, correlation_id = %id, method, "{}", reason);
            return Err(ProtocolError::connection_lost(reason));
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProtocolError::connection_lost(self.shared.reason())),
            Err(_) => {
                self.shared.take(&id);
                debug!(driver_id = %self.driver_id, correlation_id = %id, method, "Request timed out");
                Err(ProtocolError::timeout(method, timeout))
            }
        }
    }
}

impl Drop for DriverClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for DriverClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverClient")
            .field("driver_id", &self.driver_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop(
    driver_id: String,
    mut lines: FramedRead<BoxedReader, LinesCodec>,
    shared: Arc<Shared>,
    events: broadcast::Sender<DriverEvent>,
    link: watch::Sender<LinkState>,
) {
    let reason = loop {
        match lines.next().await {
            Some(Ok(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                trace!(driver_id = %driver_id, "<- {}", line);
                dispatch(&driver_id, &line, &shared, &events, &link);
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!(driver_id = %driver_id, "Discarding oversized message");
            }
            Some(Err(LinesCodecError::Io(e))) => break format!("read failed: {}", e),
            None => break "driver closed the connection".to_string(),
        }
    };

    let failed = shared.close(&reason);
    link.send_replace(LinkState::Closed(reason.clone()));
    warn!(driver_id = %driver_id, failed, "Connection lost: {}", reason);
}

fn dispatch(
    driver_id: &str,
    line: &str,
    shared: &Shared,
    events: &broadcast::Sender<DriverEvent>,
    link: &watch::Sender<LinkState>,
) {
    let message: Message = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(e) => {
            // Fail the matching request if the id is still recoverable
            let id = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string));
            match id.and_then(|id| shared.take(&id)) {
                Some(tx) => {
                    let _ = tx.send(Err(ProtocolError::malformed(format!(
                        "invalid response envelope: {}",
                        e
                    ))));
                }
                None => warn!(driver_id, "Discarding malformed message: {}", e),
            }
            return;
        }
    };

    match message.message_type {
        MessageType::Response => {
            let Some(tx) = shared.take(&message.id) else {
                warn!(driver_id, correlation_id = %message.id, "Discarding response with unknown id");
                return;
            };
            let outcome = match (message.error, message.result) {
                (Some(error), _) => Err(ProtocolError::remote(error.code, error.message)),
                (None, Some(result)) => Ok(result),
                (None, None) => Ok(Value::Null),
            };
            let _ = tx.send(outcome);
        }
        MessageType::Event => {
            let params = message.params.unwrap_or(Value::Null);
            match message.method.as_str() {
                methods::READY => {
                    link.send_if_modified(|state| {
                        if *state == LinkState::Connecting {
                            *state = LinkState::Ready;
                            true
                        } else {
                            false
                        }
                    });
                }
                methods::LOG => {
                    let text = params
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| params.to_string());
                    info!(driver_id, "[driver] {}", text);
                }
                methods::PROGRESS => debug!(driver_id, progress = %params, "Driver progress"),
                other => trace!(driver_id, event = other, "Driver event"),
            }
            // No subscribers is fine; events never block the reader
            let _ = events.send(DriverEvent {
                driver_id: driver_id.to_string(),
                method: message.method,
                params,
            });
        }
        MessageType::Request => {
            warn!(driver_id, method = %message.method, "Ignoring driver-originated request");
        }
    }
}

/// Connect to a driver's Unix socket, retrying until it appears
#[cfg(unix)]
pub async fn connect_unix(
    socket_path: &std::path::Path,
    timeout: Duration,
) -> std::io::Result<(BoxedReader, BoxedWriter)> {
    let start = std::time::Instant::now();

    loop {
        if socket_path.exists() {
            match tokio::net::UnixStream::connect(socket_path).await {
                Ok(stream) => {
                    let (read, write) = stream.into_split();
                    return Ok((Box::new(read), Box::new(write)));
                }
                Err(e) => trace!("Driver socket not ready: {}", e),
            }
        }

        if start.elapsed() > timeout {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("socket {} did not accept connections", socket_path.display()),
            ));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
