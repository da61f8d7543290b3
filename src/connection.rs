use crate::cache::StateCache;
use crate::error::{MatrixError, Result};
use crate::protocol::{Request, Response, WireInput, WireOutput, WireState};
use crate::types::{OutputIndex, ZoneValue};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

/// What the reader applies to the cache when a request is acknowledged
#[derive(Debug, Clone)]
pub(crate) enum AckAction {
    None,
    /// Response data is a full snapshot
    Snapshot,
    /// Response data carries refreshed labels
    Labels,
    /// Output command; applied from the response record when present,
    /// otherwise from the requested values
    Output {
        output: OutputIndex,
        updates: Vec<ZoneValue>,
    },
}

struct PendingRequest {
    tx: oneshot::Sender<Response>,
    on_ack: AckAction,
}

/// WebSocket connection state
struct ConnectionState {
    /// Pending requests waiting for responses
    pending_requests: HashMap<Uuid, PendingRequest>,
    /// Channel for sending outgoing messages
    ws_tx: mpsc::UnboundedSender<Message>,
}

/// One WebSocket link to the amplifier
///
/// A reader task owns the inbound half and is the only writer of the state
/// cache while the link is up. Outbound frames go through a single writer
/// task in send order.
pub(crate) struct Connection {
    state: Arc<Mutex<ConnectionState>>,
    closed: Arc<watch::Sender<bool>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Connect to a WebSocket URL
    pub async fn connect(url: &str, connect_timeout: Duration, cache: StateCache) -> Result<Self> {
        tracing::info!("Connecting to {}", url);

        let (ws_stream, _) = match timeout(connect_timeout, connect_async(url)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(MatrixError::Connection(format!("{}: {}", url, e)));
            }
            Err(_) => {
                return Err(MatrixError::Connection(format!(
                    "{}: no answer within {:?}",
                    url, connect_timeout
                )));
            }
        };
        let (mut write, mut read) = ws_stream.split();

        let (ws_tx, mut ws_rx) = mpsc::unbounded_channel::<Message>();
        let closed = Arc::new(watch::Sender::new(false));
        let closed_tx = closed.clone();

        let state = Arc::new(Mutex::new(ConnectionState {
            pending_requests: HashMap::new(),
            ws_tx,
        }));

        // Forward outgoing messages to the WebSocket
        let write_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send message: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // Receive and process incoming messages
        let state_clone = state.clone();
        let read_handle = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if let Err(e) = Self::handle_message(&state_clone, &cache, &text).await {
                            tracing::error!("Error handling message: {}", e);
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket connection closed by amplifier");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Mark closed first so woken waiters never see a live link.
            // Dropping the senders resolves every waiter as cancelled.
            closed_tx.send_replace(true);
            state_clone.lock().await.pending_requests.clear();
        });

        Ok(Self {
            state,
            closed,
            tasks: std::sync::Mutex::new(vec![write_handle, read_handle]),
        })
    }

    /// Handle an incoming message
    async fn handle_message(
        state: &Arc<Mutex<ConnectionState>>,
        cache: &StateCache,
        text: &str,
    ) -> Result<()> {
        tracing::debug!("Received: {}", text);

        let response: Response = serde_json::from_str(text)?;

        let pending = state.lock().await.pending_requests.remove(&response.meta.id);
        match pending {
            Some(pending) => {
                if !response.has_errors() {
                    if let Err(e) = apply_ack(cache, &pending.on_ack, &response) {
                        tracing::warn!("Could not apply acknowledgement: {}", e);
                    }
                }
                // Waiter may have timed out already
                let _ = pending.tx.send(response);
            }
            None if response.is_notification() => apply_notification(cache, &response)?,
            None => {
                tracing::debug!("Dropping response for unknown request {}", response.meta.id);
            }
        }

        Ok(())
    }

    /// Send a request and wait for the response
    pub async fn send_request(
        &self,
        request: Request,
        on_ack: AckAction,
        wait: Duration,
    ) -> Result<Response> {
        if self.is_closed() {
            return Err(MatrixError::Connection("link is closed".to_string()));
        }

        let request_id = request.id();
        let (tx, mut rx) = oneshot::channel();

        {
            let mut state = self.state.lock().await;
            // The reader may have stopped while we waited for the lock
            if self.is_closed() {
                return Err(MatrixError::Connection("link is closed".to_string()));
            }
            let json = serde_json::to_string(&request)?;
            tracing::debug!("Sending: {}", json);

            state
                .ws_tx
                .send(Message::Text(json))
                .map_err(|_| MatrixError::Connection("link is closed".to_string()))?;
            state
                .pending_requests
                .insert(request_id, PendingRequest { tx, on_ack });
        }

        let response = match timeout(wait, &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(MatrixError::Cancelled),
            Err(_) => {
                let expired = self.state.lock().await.pending_requests.remove(&request_id);
                if expired.is_some() {
                    return Err(MatrixError::CommandTimeout);
                }
                // The reader already claimed the response and is applying it
                rx.await.map_err(|_| MatrixError::Cancelled)?
            }
        };

        if response.has_errors() {
            if let Some(detail) = response.error_message() {
                return Err(MatrixError::ApiError { detail });
            }
        }

        Ok(response)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the reader has stopped
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Close the link and cancel everything pending on it
    pub async fn close(&self) {
        self.closed.send_replace(true);
        {
            let mut state = self.state.lock().await;
            state.pending_requests.clear();
            let _ = state.ws_tx.send(Message::Close(None));
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        let mut tasks = tasks.into_iter();
        if let Some(mut writer) = tasks.next() {
            // Let the close frame go out
            if timeout(Duration::from_millis(250), &mut writer).await.is_err() {
                writer.abort();
            }
        }
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

fn apply_ack(cache: &StateCache, action: &AckAction, response: &Response) -> Result<()> {
    match action {
        AckAction::None => Ok(()),
        AckAction::Snapshot => {
            let data = response
                .data
                .clone()
                .ok_or_else(|| MatrixError::InvalidResponse("No data in state response".to_string()))?;
            apply_state(cache, serde_json::from_value(data)?);
            Ok(())
        }
        AckAction::Labels => {
            let data = response
                .data
                .clone()
                .ok_or_else(|| MatrixError::InvalidResponse("No data in labels response".to_string()))?;
            apply_labels(cache, serde_json::from_value(data)?);
            Ok(())
        }
        AckAction::Output { output, updates } => {
            let record = response
                .data
                .clone()
                .and_then(|data| serde_json::from_value::<WireOutput>(data).ok())
                .filter(|record| record.index == *output);
            let updates = match record {
                Some(record) => record.updates(),
                None => updates.clone(),
            };
            for update in updates {
                cache.apply_delta(*output, update)?;
            }
            Ok(())
        }
    }
}

fn apply_notification(cache: &StateCache, response: &Response) -> Result<()> {
    let Some(data) = response.data.clone() else {
        return Ok(());
    };

    match response.meta.response_type.as_deref() {
        Some("output") => {
            let record: WireOutput = serde_json::from_value(data)?;
            for update in record.updates() {
                if let Err(e) = cache.apply_delta(record.index, update) {
                    tracing::warn!("Ignoring output update: {}", e);
                }
            }
        }
        Some("input") => {
            let record: WireInput = serde_json::from_value(data)?;
            if let Some(label) = record.label {
                if let Err(e) = cache.apply_source_label(record.index, label) {
                    tracing::warn!("Ignoring input update: {}", e);
                }
            }
        }
        Some("state") => apply_state(cache, serde_json::from_value(data)?),
        other => tracing::debug!("Ignoring notification of type {:?}", other),
    }
    Ok(())
}

fn apply_state(cache: &StateCache, state: WireState) {
    let sources = state.inputs.into_iter().map(WireInput::into_source).collect();
    let zones = state.outputs.into_iter().map(WireOutput::into_zone).collect();
    cache.apply_snapshot(sources, zones);
}

fn apply_labels(cache: &StateCache, labels: WireState) {
    for input in labels.inputs {
        if let Some(label) = input.label {
            if let Err(e) = cache.apply_source_label(input.index, label) {
                tracing::warn!("Ignoring label: {}", e);
            }
        }
    }
    for output in labels.outputs {
        if let Some(label) = output.label {
            if let Err(e) = cache.apply_delta(output.index, ZoneValue::Label(label)) {
                tracing::warn!("Ignoring label: {}", e);
            }
        }
    }
}
