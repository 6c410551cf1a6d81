//! In-memory drivers for unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stepwise_common::{
    capability, DriverDescriptor, Error, Message, MessageType, ProtocolKind, Result,
    StepDefinition,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::launcher::{LaunchedDriver, Launcher};

/// Reply of a scripted driver to one request
#[derive(Debug, Clone)]
pub(crate) enum FakeReply {
    Value(Value),
    Error(i64, String),
    Delay(Duration, Value),
    Silent,
    Hangup,
}

type Handler = Arc<dyn Fn(&str, &Value) -> FakeReply + Send + Sync>;

/// Script for one fake driver
#[derive(Clone)]
pub(crate) struct FakeDriver {
    handler: Handler,
    ready: bool,
    answer_pings: bool,
}

impl FakeDriver {
    pub fn new(handler: impl Fn(&str, &Value) -> FakeReply + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            ready: true,
            answer_pings: true,
        }
    }

    /// Answers every action with `{"action": ..., "params": ...}`
    pub fn echo() -> Self {
        Self::new(|action, params| FakeReply::Value(json!({"action": action, "params": params})))
    }

    pub fn never_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    pub fn ignore_pings(mut self) -> Self {
        self.answer_pings = false;
        self
    }
}

/// An invocation observed by a fake driver
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub driver_id: String,
    pub instance_id: String,
    pub action: String,
    pub params: Value,
}

#[derive(Default)]
struct InstanceStats {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Launcher that wires drivers to in-memory pipes
#[derive(Default)]
pub(crate) struct FakeLauncher {
    drivers: Mutex<HashMap<String, FakeDriver>>,
    calls: Arc<Mutex<Vec<Call>>>,
    launches: Mutex<Vec<(String, String)>>,
    launch_limits: Mutex<HashMap<String, usize>>,
    stats: Mutex<Vec<Arc<InstanceStats>>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_driver(self, driver_id: &str, driver: FakeDriver) -> Self {
        self.drivers.lock().insert(driver_id.to_string(), driver);
        self
    }

    /// Refuse launches of `driver_id` beyond the first `limit`
    pub fn with_launch_limit(self, driver_id: &str, limit: usize) -> Self {
        self.launch_limits.lock().insert(driver_id.to_string(), limit);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.action.clone()).collect()
    }

    pub fn launches(&self, driver_id: &str) -> usize {
        self.launches
            .lock()
            .iter()
            .filter(|(d, _)| d == driver_id)
            .count()
    }

    /// Highest number of concurrent invocations any single instance saw
    pub fn max_in_flight(&self) -> usize {
        self.stats
            .lock()
            .iter()
            .map(|s| s.max_in_flight.load(Ordering::SeqCst))
            .max()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, descriptor: &DriverDescriptor, instance_id: &str) -> Result<LaunchedDriver> {
        let driver = self
            .drivers
            .lock()
            .get(&descriptor.id)
            .cloned()
            .ok_or_else(|| Error::DriverUnavailable {
                driver_id: descriptor.id.clone(),
                reason: "no fake driver scripted".to_string(),
            })?;
        if let Some(limit) = self.launch_limits.lock().get(&descriptor.id) {
            if self.launches(&descriptor.id) >= *limit {
                return Err(Error::DriverUnavailable {
                    driver_id: descriptor.id.clone(),
                    reason: "launch refused".to_string(),
                });
            }
        }
        self.launches
            .lock()
            .push((descriptor.id.clone(), instance_id.to_string()));

        let stats = Arc::new(InstanceStats::default());
        self.stats.lock().push(stats.clone());

        let (client_side, driver_side) = tokio::io::duplex(256 * 1024);
        let (reader, writer) = tokio::io::split(client_side);
        tokio::spawn(serve(
            descriptor.id.clone(),
            instance_id.to_string(),
            driver,
            driver_side,
            self.calls.clone(),
            stats,
        ));

        Ok(LaunchedDriver {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: None,
        })
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<Option<tokio::io::WriteHalf<tokio::io::DuplexStream>>>>;

async fn write_line(writer: &SharedWriter, message: &Message) {
    let line = format!("{}\n", serde_json::to_string(message).unwrap());
    if let Some(w) = writer.lock().await.as_mut() {
        let _ = w.write_all(line.as_bytes()).await;
    }
}

async fn serve(
    driver_id: String,
    instance_id: String,
    driver: FakeDriver,
    stream: tokio::io::DuplexStream,
    calls: Arc<Mutex<Vec<Call>>>,
    stats: Arc<InstanceStats>,
) {
    let (read, write) = tokio::io::split(stream);
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Some(write)));
    if driver.ready {
        write_line(&writer, &Message::event("ready", Value::Null)).await;
    }

    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let request: Message = serde_json::from_str(&line).unwrap();
        assert_eq!(request.message_type, MessageType::Request);

        match request.method.as_str() {
            "ping" => {
                if driver.answer_pings {
                    write_line(&writer, &Message::response(request.id, "ping", json!({}))).await;
                }
                continue;
            }
            "shutdown" => {
                write_line(&writer, &Message::response(request.id, "shutdown", json!({}))).await;
                break;
            }
            _ => {}
        }

        let params = request.params.clone().unwrap_or(Value::Null);
        calls.lock().push(Call {
            driver_id: driver_id.clone(),
            instance_id: instance_id.clone(),
            action: request.method.clone(),
            params: params.clone(),
        });

        let reply = (driver.handler)(&request.method, &params);
        if matches!(reply, FakeReply::Hangup) {
            writer.lock().await.take();
            break;
        }

        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let writer = writer.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            let response = match reply {
                FakeReply::Value(value) => Some(Message::response(request.id, request.method, value)),
                FakeReply::Error(code, message) => Some(Message::error_response(
                    request.id,
                    request.method,
                    code,
                    message,
                )),
                FakeReply::Delay(delay, value) => {
                    tokio::time::sleep(delay).await;
                    Some(Message::response(request.id, request.method, value))
                }
                FakeReply::Silent | FakeReply::Hangup => None,
            };
            stats.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some(response) = response {
                write_line(&writer, &response).await;
            }
        });
    }
}

/// Descriptor for a fake driver with one step per `(id, pattern)`
pub(crate) fn descriptor(driver_id: &str, steps: &[(&str, &str)]) -> DriverDescriptor {
    DriverDescriptor {
        id: driver_id.to_string(),
        name: driver_id.to_string(),
        description: String::new(),
        version: "0.1.0".to_string(),
        author: String::new(),
        license: String::new(),
        executable: format!("{}-driver", driver_id).into(),
        protocol: ProtocolKind::Stdio,
        capabilities: BTreeSet::from([capability::EXECUTE.to_string()]),
        actions: steps.iter().map(|(id, _)| id.to_string()).collect(),
        steps: steps
            .iter()
            .map(|(id, pattern)| StepDefinition {
                id: id.to_string(),
                driver_id: driver_id.to_string(),
                pattern: pattern.to_string(),
                action: id.to_string(),
                description: String::new(),
                examples: vec![],
                parameters: vec![],
            })
            .collect(),
        category: String::new(),
        tags: vec![],
        root: ".".into(),
    }
}
