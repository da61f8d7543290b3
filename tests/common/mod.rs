//! In-process stand-in for the amplifier's WebSocket interface

#![allow(dead_code)]

use acmax24::{ChangeEvent, MatrixConfig, Subscription};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Debug, Clone)]
pub struct FakeInput {
    pub label: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct FakeOutput {
    pub label: String,
    pub enabled: bool,
    pub volume: i32,
    pub muted: bool,
    pub input: i32,
}

/// Device state and behavior switches, shared with the test
#[derive(Debug, Default)]
pub struct FakeState {
    pub inputs: BTreeMap<u16, FakeInput>,
    pub outputs: BTreeMap<u16, FakeOutput>,
    /// Never answer anything
    pub silent: bool,
    /// Include the updated output record in command acknowledgements
    pub ack_with_record: bool,
    /// Answer commands with this error
    pub reject: Option<String>,
    /// Hold command acknowledgements back this long
    pub ack_delay: Option<Duration>,
    /// Every request received, in order
    pub requests: Vec<Value>,
}

impl FakeState {
    fn state_data(&self) -> Value {
        json!({
            "inputs": self.inputs.iter().map(|(index, input)| json!({
                "index": index,
                "label": input.label,
                "enabled": input.enabled,
            })).collect::<Vec<_>>(),
            "outputs": self.outputs.iter().map(|(index, output)| output_record(*index, output)).collect::<Vec<_>>(),
        })
    }

    fn labels_data(&self) -> Value {
        json!({
            "inputs": self.inputs.iter().map(|(index, input)| json!({
                "index": index,
                "label": input.label,
            })).collect::<Vec<_>>(),
            "outputs": self.outputs.iter().map(|(index, output)| json!({
                "index": index,
                "label": output.label,
            })).collect::<Vec<_>>(),
        })
    }
}

fn output_record(index: u16, output: &FakeOutput) -> Value {
    json!({
        "index": index,
        "label": output.label,
        "enabled": output.enabled,
        "volume": output.volume,
        "mute": output.muted,
        "input": output.input,
    })
}

#[derive(Debug, Clone)]
enum Control {
    Push(String),
    Kick,
}

pub struct FakeAmplifier {
    addr: SocketAddr,
    pub state: Arc<Mutex<FakeState>>,
    control: broadcast::Sender<Control>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeAmplifier {
    /// Two outputs and two inputs, as in a minimal install
    pub async fn living_room_and_kitchen() -> Self {
        let mut state = FakeState {
            ack_with_record: true,
            ..Default::default()
        };
        state.inputs.insert(1, input("TV"));
        state.inputs.insert(2, input("Radio"));
        state.outputs.insert(1, output("Living Room", 40, 1));
        state.outputs.insert(2, output("Kitchen", 25, 0));
        Self::spawn(state).await
    }

    pub async fn spawn(state: FakeState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(state));
        let (control, _) = broadcast::channel(64);
        let connections = Arc::new(AtomicUsize::new(0));

        let task = {
            let state = state.clone();
            let control = control.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, state.clone(), control.subscribe()));
                }
            })
        };

        Self {
            addr,
            state,
            control,
            connections,
            task,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    /// Requests received for one endpoint
    pub fn requests_for(&self, endpoint: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r["meta"]["endpoint"] == endpoint)
            .cloned()
            .collect()
    }

    /// Send an unsolicited notification to every connected client
    pub fn push(&self, kind: &str, data: Value) {
        let message = json!({
            "meta": { "id": uuid::Uuid::new_v4(), "method": "notify", "type": kind },
            "data": data,
        });
        let _ = self.control.send(Control::Push(message.to_string()));
    }

    /// Drop every open connection
    pub fn kick(&self) {
        let _ = self.control.send(Control::Kick);
    }
}

impl Drop for FakeAmplifier {
    fn drop(&mut self) {
        self.task.abort();
        let _ = self.control.send(Control::Kick);
    }
}

pub fn input(label: &str) -> FakeInput {
    FakeInput {
        label: label.to_string(),
        enabled: true,
    }
}

pub fn output(label: &str, volume: i32, input: i32) -> FakeOutput {
    FakeOutput {
        label: label.to_string(),
        enabled: true,
        volume,
        muted: false,
        input,
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<FakeState>>, mut control: broadcast::Receiver<Control>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(request) = serde_json::from_str::<Value>(&text) else { continue };
                let delay = ack_delay(&state, &request);
                let reply = answer(&state, request);
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if let Some(reply) = reply {
                    if write.send(Message::Text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
            }
            control = control.recv() => {
                match control {
                    Ok(Control::Push(text)) => {
                        if write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Control::Kick) | Err(broadcast::error::RecvError::Closed) => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        }
    }
}

fn ack_delay(state: &Arc<Mutex<FakeState>>, request: &Value) -> Option<Duration> {
    match request["meta"]["endpoint"].as_str() {
        Some("input" | "volume" | "mute") => state.lock().unwrap().ack_delay,
        _ => None,
    }
}

fn answer(state: &Arc<Mutex<FakeState>>, request: Value) -> Option<Value> {
    let mut state = state.lock().unwrap();
    state.requests.push(request.clone());
    if state.silent {
        return None;
    }

    let meta = json!({ "id": request["meta"]["id"], "method": request["meta"]["method"] });
    let endpoint = request["meta"]["endpoint"].as_str().unwrap_or_default().to_string();
    let target: Option<u16> = request["meta"]["target"]
        .as_str()
        .and_then(|t| t.parse().ok());

    match endpoint.as_str() {
        "state" => Some(json!({ "meta": meta, "data": state.state_data() })),
        "labels" => Some(json!({ "meta": meta, "data": state.labels_data() })),
        "ping" => Some(json!({ "meta": meta })),
        "input" | "volume" | "mute" => {
            if let Some(detail) = state.reject.clone() {
                return Some(json!({ "meta": meta, "errors": [{ "detail": detail }] }));
            }
            let index = target?;
            let ack_with_record = state.ack_with_record;
            let output = state.outputs.get_mut(&index)?;
            let data = &request["data"];
            match endpoint.as_str() {
                "input" => output.input = data["input"].as_i64().unwrap_or(0) as i32,
                "volume" => output.volume = data["volume"].as_i64().unwrap_or(-1) as i32,
                _ => output.muted = data["mute"].as_bool().unwrap_or(false),
            }
            if ack_with_record {
                Some(json!({ "meta": meta, "data": output_record(index, output) }))
            } else {
                Some(json!({ "meta": meta }))
            }
        }
        _ => Some(json!({ "meta": meta, "errors": [{ "detail": "unknown endpoint" }] })),
    }
}

/// Settings tight enough for tests to observe failures quickly
pub fn fast_config() -> MatrixConfig {
    MatrixConfig::default()
        .with_connect_timeout(Duration::from_secs(1))
        .with_command_timeout(Duration::from_millis(300))
        .with_keepalive(Duration::from_millis(100), 2)
        .with_reconnect_backoff(Duration::from_millis(50), Duration::from_millis(200))
}

/// Settings for tests that hold commands in flight: no keep-alive traffic
/// to speak of and a command timeout that outlasts the test
pub fn patient_config() -> MatrixConfig {
    fast_config()
        .with_command_timeout(Duration::from_secs(5))
        .with_keepalive(Duration::from_secs(5), 3)
}

/// Wait for the first event matching `pred`
pub async fn wait_for_event<F>(sub: &mut Subscription, pred: F) -> ChangeEvent
where
    F: Fn(&ChangeEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match sub.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("change bus closed"),
            }
        }
    })
    .await
    .expect("expected change event never arrived")
}

/// Poll `check` until it holds
pub async fn eventually<F>(check: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
