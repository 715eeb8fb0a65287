use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Param;

pub const PROTOCOL_VERSION: &str = "1";
pub const MAX_FRAME_SIZE: usize = 2048;

pub type FrameBuffer = ArrayString<MAX_FRAME_SIZE>;

/// Envelope keys that never belong to a nested payload.
const ENVELOPE_KEYS: &[&str] = &[
    "protocol",
    "module_id",
    "submodule_id",
    "type",
    "sent_at",
    "payload",
    "command",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid JSON frame")]
    InvalidJson,
    #[error("frame exceeds {MAX_FRAME_SIZE} bytes")]
    MessageTooLarge,
    #[error("unsupported protocol version {0:?}")]
    ProtocolMismatch(String),
    #[error("frame is missing required field {0:?}")]
    MissingField(&'static str),
    #[error("aliased fields disagree: {0} vs {1}")]
    AliasMismatch(String, String),
    #[error("invalid value for {0}")]
    InvalidValue(String),
    #[error("serialization failed")]
    Serialization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Push payload for one alarm assert/clear transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmPayload {
    pub code: String,
    pub severity: Severity,
    pub active: bool,
    pub timestamp_s: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Immutable record of one completed actuation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleLogPayload {
    pub timestamp_s: u64,
    pub cycle_type: String,
    pub duration_ms: u64,
    pub trigger: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timeout: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtoMode {
    Auto,
    Manual,
    Paused,
}

impl AtoMode {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(AtoMode::Auto),
            1 => Some(AtoMode::Manual),
            2 => Some(AtoMode::Paused),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            AtoMode::Auto => 0,
            AtoMode::Manual => 1,
            AtoMode::Paused => 2,
        }
    }
}

/// Hub→module commands, decoded once at the frame boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    RequestStatus,
    RequestConfig,
    SetParam { param: Param, value: f64 },
    SetParams(Vec<(Param, f64)>),
    SpoolReset { value: u32 },
    CalibrateStart,
    CalibrateFinish { roll_length_mm: u32 },
    CalibrateCancel,
    MarkRefilled,
    SetAtoMode(AtoMode),
    /// Unknown command or parameter name; logged, never fatal.
    Unknown(String),
}

impl Command {
    /// Wire form: command name plus argument object.
    pub fn to_wire(&self) -> (&'static str, Value) {
        match self {
            Command::RequestStatus => ("status_request", Value::Object(Map::new())),
            Command::RequestConfig => ("config_request", Value::Object(Map::new())),
            Command::SetParam { param, value } => (
                "set_param",
                serde_json::json!({ "param": param.wire_name(), "value": value }),
            ),
            Command::SetParams(entries) => {
                let mut map = Map::new();
                for (param, value) in entries {
                    map.insert(param.wire_name().to_string(), serde_json::json!(value));
                }
                ("set_param", serde_json::json!({ "parameters": map }))
            }
            Command::SpoolReset { value } => (
                "set_param",
                serde_json::json!({ "param": "spool_reset", "value": value }),
            ),
            Command::CalibrateStart => (
                "set_param",
                serde_json::json!({ "param": "spool_calibrate_start", "value": 1 }),
            ),
            Command::CalibrateFinish { roll_length_mm } => (
                "set_param",
                serde_json::json!({ "param": "spool_calibrate_finish", "value": roll_length_mm }),
            ),
            Command::CalibrateCancel => (
                "set_param",
                serde_json::json!({ "param": "spool_calibrate_cancel", "value": 1 }),
            ),
            Command::MarkRefilled => ("mark_refilled", Value::Object(Map::new())),
            Command::SetAtoMode(mode) => (
                "set_param",
                serde_json::json!({ "param": "ato_mode", "value": mode.to_wire() }),
            ),
            Command::Unknown(name) => {
                debug!(command = %name, "encoding unknown command as no-op");
                ("unknown", Value::Object(Map::new()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    Status(Value),
    Config(Value),
    Control(Command),
    Alarm(AlarmPayload),
    CycleLog(CycleLogPayload),
    /// Unknown frame type; carried so callers can log and drop it.
    Unknown(String),
}

impl FrameBody {
    pub fn type_name(&self) -> &str {
        match self {
            FrameBody::Status(_) => "status",
            FrameBody::Config(_) => "config",
            FrameBody::Control(_) => "control",
            FrameBody::Alarm(_) => "alarm",
            FrameBody::CycleLog(_) => "cycle_log",
            FrameBody::Unknown(name) => name,
        }
    }
}

/// One protocol frame: the envelope plus its decoded body.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub module_id: String,
    pub submodule_id: Option<String>,
    pub sent_at: u64,
    pub body: FrameBody,
}

impl Frame {
    pub fn status(module_id: &str, sent_at: u64, payload: Value) -> Self {
        Self::new(module_id, sent_at, FrameBody::Status(payload))
    }

    pub fn config(module_id: &str, sent_at: u64, payload: Value) -> Self {
        Self::new(module_id, sent_at, FrameBody::Config(payload))
    }

    pub fn control(module_id: &str, sent_at: u64, command: Command) -> Self {
        Self::new(module_id, sent_at, FrameBody::Control(command))
    }

    pub fn alarm(module_id: &str, sent_at: u64, payload: AlarmPayload) -> Self {
        Self::new(module_id, sent_at, FrameBody::Alarm(payload))
    }

    pub fn cycle_log(module_id: &str, sent_at: u64, payload: CycleLogPayload) -> Self {
        Self::new(module_id, sent_at, FrameBody::CycleLog(payload))
    }

    fn new(module_id: &str, sent_at: u64, body: FrameBody) -> Self {
        Self {
            module_id: module_id.to_string(),
            submodule_id: None,
            sent_at,
            body,
        }
    }
}

/// Parses and serializes envelope frames over a preallocated buffer.
#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    encode_buffer: FrameBuffer,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            encode_buffer: ArrayString::new(),
        }
    }

    /// Decode one textual frame. The protocol version is checked before any
    /// payload field is inspected; legacy frames without a `protocol` field
    /// are accepted as version 1.
    pub fn decode(&self, raw: &str) -> Result<Frame, ProtocolError> {
        if raw.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        let value: Value = serde_json::from_str(raw).map_err(|_| ProtocolError::InvalidJson)?;
        let obj = value.as_object().ok_or(ProtocolError::InvalidJson)?;

        if let Some(protocol) = obj.get("protocol") {
            let version = protocol.as_str().unwrap_or_default();
            if version != PROTOCOL_VERSION {
                return Err(ProtocolError::ProtocolMismatch(version.to_string()));
            }
        }

        let frame_type = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("type"))?
            .to_string();

        let module_id = obj
            .get("module_id")
            .or_else(|| obj.get("module"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let submodule_id = obj
            .get("submodule_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let sent_at = obj.get("sent_at").and_then(Value::as_u64).unwrap_or(0);

        let payload = Self::normalize_payload(obj);

        let body = match frame_type.as_str() {
            "status" => FrameBody::Status(Value::Object(payload)),
            "config" => FrameBody::Config(Value::Object(payload)),
            "alarm" => {
                let alarm = serde_json::from_value(Value::Object(payload))
                    .map_err(|_| ProtocolError::InvalidValue("alarm".to_string()))?;
                FrameBody::Alarm(alarm)
            }
            "cycle_log" => {
                let entry = serde_json::from_value(Value::Object(payload))
                    .map_err(|_| ProtocolError::InvalidValue("cycle_log".to_string()))?;
                FrameBody::CycleLog(entry)
            }
            "control" => {
                let command = obj
                    .get("command")
                    .and_then(Value::as_str)
                    .ok_or(ProtocolError::MissingField("command"))?;
                FrameBody::Control(decode_command(command, &payload)?)
            }
            // Legacy form: a bare command name as the top-level type.
            other => match decode_command(other, &payload)? {
                Command::Unknown(_) => {
                    debug!(frame_type = %other, "ignoring unknown frame type");
                    FrameBody::Unknown(other.to_string())
                }
                command => FrameBody::Control(command),
            },
        };

        Ok(Frame {
            module_id,
            submodule_id,
            sent_at,
            body,
        })
    }

    /// Serialize one frame into the shared buffer and return it as a str.
    pub fn encode(&mut self, frame: &Frame) -> Result<&str, ProtocolError> {
        let mut envelope = Map::new();
        envelope.insert("protocol".into(), Value::String(PROTOCOL_VERSION.into()));
        envelope.insert("module_id".into(), Value::String(frame.module_id.clone()));
        if let Some(sub) = &frame.submodule_id {
            envelope.insert("submodule_id".into(), Value::String(sub.clone()));
        }
        envelope.insert("sent_at".into(), serde_json::json!(frame.sent_at));

        match &frame.body {
            FrameBody::Status(payload) => {
                envelope.insert("type".into(), Value::String("status".into()));
                envelope.insert("payload".into(), payload.clone());
            }
            FrameBody::Config(payload) => {
                envelope.insert("type".into(), Value::String("config".into()));
                envelope.insert("payload".into(), payload.clone());
            }
            FrameBody::Control(command) => {
                let (name, payload) = command.to_wire();
                envelope.insert("type".into(), Value::String("control".into()));
                envelope.insert("command".into(), Value::String(name.into()));
                envelope.insert("payload".into(), payload);
            }
            FrameBody::Alarm(alarm) => {
                envelope.insert("type".into(), Value::String("alarm".into()));
                envelope.insert(
                    "payload".into(),
                    serde_json::to_value(alarm).map_err(|_| ProtocolError::Serialization)?,
                );
            }
            FrameBody::CycleLog(entry) => {
                envelope.insert("type".into(), Value::String("cycle_log".into()));
                envelope.insert(
                    "payload".into(),
                    serde_json::to_value(entry).map_err(|_| ProtocolError::Serialization)?,
                );
            }
            FrameBody::Unknown(name) => {
                envelope.insert("type".into(), Value::String(name.clone()));
            }
        }

        let json = serde_json::to_string(&Value::Object(envelope))
            .map_err(|_| ProtocolError::Serialization)?;
        if json.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        self.encode_buffer.clear();
        self.encode_buffer.push_str(&json);
        Ok(&self.encode_buffer)
    }

    /// Lift the frame body out of a wrapped `payload` object, or fall back
    /// to the top-level fields for legacy flat frames. Envelope defaults
    /// (module id, timestamp) are inherited by the payload when absent.
    fn normalize_payload(obj: &Map<String, Value>) -> Map<String, Value> {
        let mut payload = match obj.get("payload") {
            Some(Value::Object(inner)) => inner.clone(),
            _ => {
                let mut flat = obj.clone();
                for key in ENVELOPE_KEYS {
                    flat.remove(*key);
                }
                return flat;
            }
        };
        for key in ["module_id", "submodule_id", "sent_at"] {
            if let Some(value) = obj.get(key) {
                payload
                    .entry(key.to_string())
                    .or_insert_with(|| value.clone());
            }
        }
        payload
    }
}

/// Resolve the parameter-name field, honoring the `param`/`name` alias pair.
/// Sending both is always safe; when both are present they must agree.
fn resolve_param_field(obj: &Map<String, Value>) -> Result<Option<String>, ProtocolError> {
    let param = obj.get("param").and_then(Value::as_str);
    let name = obj.get("name").and_then(Value::as_str);
    match (param, name) {
        (Some(a), Some(b)) => {
            if a != b && Param::from_wire(a) != Param::from_wire(b) {
                return Err(ProtocolError::AliasMismatch(a.to_string(), b.to_string()));
            }
            Ok(Some(a.to_string()))
        }
        (Some(a), None) => Ok(Some(a.to_string())),
        (None, Some(b)) => Ok(Some(b.to_string())),
        (None, None) => Ok(None),
    }
}

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn decode_command(name: &str, args: &Map<String, Value>) -> Result<Command, ProtocolError> {
    match name {
        "status_request" | "request_status" => Ok(Command::RequestStatus),
        "config_request" | "request_config" => Ok(Command::RequestConfig),
        "mark_refilled" | "tank_refilled" => Ok(Command::MarkRefilled),
        "set_param" | "set_params" => decode_set_param(args),
        other => Ok(Command::Unknown(other.to_string())),
    }
}

fn decode_set_param(args: &Map<String, Value>) -> Result<Command, ProtocolError> {
    // Batch form: every entry staged, persisted as one atomic write.
    if let Some(Value::Object(parameters)) = args.get("parameters") {
        let mut entries: Vec<(Param, f64)> = Vec::new();
        for (key, raw) in parameters {
            let Some(param) = Param::from_wire(key) else {
                warn!(param = %key, "ignoring unknown parameter in batch");
                continue;
            };
            let value =
                numeric_value(raw).ok_or_else(|| ProtocolError::InvalidValue(key.clone()))?;
            // Two wire names resolving to the same parameter must agree.
            if let Some((_, existing)) = entries.iter().find(|(p, _)| *p == param) {
                if (existing - value).abs() > f64::EPSILON {
                    return Err(ProtocolError::AliasMismatch(
                        param.wire_name().to_string(),
                        key.clone(),
                    ));
                }
                continue;
            }
            entries.push((param, value));
        }
        return Ok(Command::SetParams(entries));
    }

    let Some(param_name) = resolve_param_field(args)? else {
        return Err(ProtocolError::MissingField("param"));
    };
    let value = args
        .get("value")
        .and_then(numeric_value)
        .ok_or_else(|| ProtocolError::InvalidValue(param_name.clone()))?;

    // Trigger-style parameters decode to their own command variants.
    match param_name.as_str() {
        "spool_reset" => return Ok(Command::SpoolReset { value: value as u32 }),
        "spool_calibrate_start" => return Ok(Command::CalibrateStart),
        "spool_calibrate_finish" => {
            return Ok(Command::CalibrateFinish {
                roll_length_mm: value as u32,
            })
        }
        "spool_calibrate_cancel" => return Ok(Command::CalibrateCancel),
        "ato_mode" => {
            let mode = AtoMode::from_wire(value as u8)
                .ok_or_else(|| ProtocolError::InvalidValue("ato_mode".to_string()))?;
            return Ok(Command::SetAtoMode(mode));
        }
        _ => {}
    }

    match Param::from_wire(&param_name) {
        Some(param) => Ok(Command::SetParam { param, value }),
        None => Ok(Command::Unknown(format!("set_param:{param_name}"))),
    }
}
