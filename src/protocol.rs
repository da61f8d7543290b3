use crate::types::{GroupState, InputIndex, OutputIndex, Source, Zone, ZoneValue, MAX_VOLUME};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// API request structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub meta: RequestMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Request metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMeta {
    pub id: Uuid,
    pub endpoint: String,
    pub method: Method,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// API response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub meta: ResponseMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ApiError>>,
}

/// Response metadata
///
/// Device pushes carry a fresh id that matches no pending request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub id: Uuid,
    pub method: Method,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "type")]
    pub response_type: Option<String>,
}

/// API error structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub detail: String,
}

/// API endpoint names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Full input/output snapshot
    State,
    /// Input and output labels only
    Labels,
    /// Keep-alive probe
    Ping,
    /// Output routing
    Input,
    Volume,
    Mute,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::State => "state",
            Endpoint::Labels => "labels",
            Endpoint::Ping => "ping",
            Endpoint::Input => "input",
            Endpoint::Volume => "volume",
            Endpoint::Mute => "mute",
        }
    }
}

/// API methods
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Read,
    Update,
    Notify,
}

impl Request {
    /// Create a new request with the given endpoint and method
    pub fn new(endpoint: Endpoint, method: Method) -> Self {
        Self {
            meta: RequestMeta {
                id: Uuid::new_v4(),
                endpoint: endpoint.as_str().to_string(),
                method,
                target: None,
            },
            data: None,
        }
    }

    /// Address the request to one output
    pub fn with_output(mut self, output: OutputIndex) -> Self {
        self.meta.target = Some(output.to_string());
        self
    }

    /// Set the request data
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Get the request ID
    pub fn id(&self) -> Uuid {
        self.meta.id
    }

    pub fn state_sync() -> Self {
        Self::new(Endpoint::State, Method::Read)
    }

    pub fn labels() -> Self {
        Self::new(Endpoint::Labels, Method::Read)
    }

    pub fn ping() -> Self {
        Self::new(Endpoint::Ping, Method::Read)
    }

    pub fn route(output: OutputIndex, input: InputIndex) -> Self {
        Self::new(Endpoint::Input, Method::Update)
            .with_output(output)
            .with_data(json!({ "input": input }))
    }

    pub fn volume(output: OutputIndex, volume: u8) -> Self {
        Self::new(Endpoint::Volume, Method::Update)
            .with_output(output)
            .with_data(json!({ "volume": volume }))
    }

    pub fn mute(output: OutputIndex, muted: bool) -> Self {
        Self::new(Endpoint::Mute, Method::Update)
            .with_output(output)
            .with_data(json!({ "mute": muted }))
    }
}

impl Response {
    /// Check if the response contains errors
    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Get the first error message, if any
    pub fn error_message(&self) -> Option<String> {
        self.errors
            .as_ref()
            .and_then(|e| e.first())
            .map(|e| e.detail.clone())
    }

    /// Whether this is an unsolicited device push
    pub fn is_notification(&self) -> bool {
        self.meta.method == Method::Notify
    }
}

/// Input record as sent by the device; every field but `index` is optional
/// in pushes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireInput {
    pub index: InputIndex,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Output record as sent by the device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireOutput {
    pub index: OutputIndex,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Negative means "not reported"
    #[serde(default)]
    pub volume: Option<i32>,
    #[serde(default)]
    pub mute: Option<bool>,
    /// Zero or negative means "unassigned"
    #[serde(default)]
    pub input: Option<i32>,
}

/// Full device state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireState {
    #[serde(default)]
    pub inputs: Vec<WireInput>,
    #[serde(default)]
    pub outputs: Vec<WireOutput>,
}

impl WireInput {
    pub fn into_source(self) -> Source {
        Source {
            index: self.index,
            label: self
                .label
                .unwrap_or_else(|| format!("Input {}", self.index)),
            enabled: self.enabled.unwrap_or(true),
        }
    }
}

impl WireOutput {
    pub fn into_zone(self) -> Zone {
        Zone {
            index: self.index,
            label: self
                .label
                .clone()
                .unwrap_or_else(|| format!("Output {}", self.index)),
            enabled: self.enabled.unwrap_or(true),
            volume: self.volume.and_then(|v| decode_volume(self.index, v)),
            muted: self.mute.unwrap_or(false),
            input_channel: self.input.and_then(decode_input),
            group: GroupState::Ungrouped,
        }
    }

    /// Attribute updates carried by a partial record
    pub fn updates(&self) -> Vec<ZoneValue> {
        let mut updates = Vec::new();
        if let Some(label) = &self.label {
            updates.push(ZoneValue::Label(label.clone()));
        }
        if let Some(enabled) = self.enabled {
            updates.push(ZoneValue::Enabled(enabled));
        }
        if let Some(volume) = self.volume {
            updates.push(ZoneValue::Volume(decode_volume(self.index, volume)));
        }
        if let Some(muted) = self.mute {
            updates.push(ZoneValue::Muted(muted));
        }
        if let Some(input) = self.input {
            updates.push(ZoneValue::InputChannel(decode_input(input)));
        }
        updates
    }
}

fn decode_volume(output: OutputIndex, raw: i32) -> Option<u8> {
    if raw < 0 {
        return None;
    }
    if raw > i32::from(MAX_VOLUME) {
        tracing::warn!("Output {} reported out-of-range volume {}", output, raw);
        return None;
    }
    Some(raw as u8)
}

fn decode_input(raw: i32) -> Option<InputIndex> {
    if raw <= 0 {
        return None;
    }
    InputIndex::try_from(raw).ok()
}
