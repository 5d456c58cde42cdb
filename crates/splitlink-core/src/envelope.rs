//! Splitlink wire format — command envelopes for all role-to-role traffic.
//!
//! These types ARE the protocol. One UTF-8 JSON envelope per TCP connection
//! or UDP datagram; bulk payloads are base64-armored strings inside the
//! envelope. The numeric command namespace is fixed — do not renumber.
//!
//! Requests carry `command` + `request_id` plus per-command fields.
//! Responses carry `code` + `request_id` + `message` + a tagged `payload`
//! union. Every TCP request receives exactly one response before the
//! connection closes; UDP requests receive none.

use serde::{Deserialize, Serialize};

use crate::settings::Settings;

/// Fresh opaque request token. Correlates a response to its request; not
/// used for deduplication.
pub fn new_request_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// The closed set of protocol commands.
///
/// Grouped by the role that receives them: 1xxx controller, 2xxx relay,
/// 3xxx source. The x999 commands terminate the receiving role's listener
/// and are handled outside the normal dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    /// source → controller: pull the current run settings.
    SourceGetSettings = 1100,
    /// source → controller: phase-boundary timing report.
    SourceProcessTime = 1111,
    /// relay → controller: pull the current run settings.
    RelayGetSettings = 1200,
    /// relay → controller: final classification for one target.
    RelayInferenceResult = 1210,
    /// relay → controller: phase-boundary timing report.
    RelayProcessTime = 1211,
    /// stops the controller's listener.
    ControllerEnd = 1999,
    /// source → relay: declares the transfer that follows.
    ResultSummary = 2000,
    /// source → relay: one data packet.
    ResultData = 2010,
    /// controller → relay: settings push.
    SettingsToRelay = 2110,
    /// stops the relay's listeners.
    RelayEnd = 2999,
    /// relay → source: transfer outcome (sufficient data / time exceeded).
    ReceivedResult = 3000,
    /// controller → source: settings push.
    SettingsToSource = 3001,
    /// stops the source's listener.
    SourceEnd = 3999,
}

impl Command {
    /// True for the commands that terminate a listener loop.
    pub fn is_termination(self) -> bool {
        matches!(
            self,
            Command::ControllerEnd | Command::RelayEnd | Command::SourceEnd
        )
    }
}

impl TryFrom<u16> for Command {
    type Error = EnvelopeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1100 => Ok(Command::SourceGetSettings),
            1111 => Ok(Command::SourceProcessTime),
            1200 => Ok(Command::RelayGetSettings),
            1210 => Ok(Command::RelayInferenceResult),
            1211 => Ok(Command::RelayProcessTime),
            1999 => Ok(Command::ControllerEnd),
            2000 => Ok(Command::ResultSummary),
            2010 => Ok(Command::ResultData),
            2110 => Ok(Command::SettingsToRelay),
            2999 => Ok(Command::RelayEnd),
            3000 => Ok(Command::ReceivedResult),
            3001 => Ok(Command::SettingsToSource),
            3999 => Ok(Command::SourceEnd),
            other => Err(EnvelopeError::UnknownCommand(other)),
        }
    }
}

impl From<Command> for u16 {
    fn from(c: Command) -> u16 {
        c as u16
    }
}

// ── Response codes ────────────────────────────────────────────────────────────

/// Response status codes. `SufficientData` and `TimeExceeded` also travel
/// in the body of the received-result request (relay → source).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum ResponseCode {
    Success,
    SufficientData,
    TimeExceeded,
    MalformedEnvelope,
}

impl From<ResponseCode> for u16 {
    fn from(c: ResponseCode) -> u16 {
        match c {
            ResponseCode::Success => 0,
            ResponseCode::SufficientData => 1,
            ResponseCode::TimeExceeded => 2,
            ResponseCode::MalformedEnvelope => 100,
        }
    }
}

impl TryFrom<u16> for ResponseCode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResponseCode::Success),
            1 => Ok(ResponseCode::SufficientData),
            2 => Ok(ResponseCode::TimeExceeded),
            100 => Ok(ResponseCode::MalformedEnvelope),
            other => Err(format!("unknown response code: {other}")),
        }
    }
}

// ── Request bodies ────────────────────────────────────────────────────────────

/// Body of a bare request (terminations, settings pulls).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plain {
    pub request_id: String,
}

/// Settings push body (controller → source / relay).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsPush {
    pub request_id: String,
    pub settings: Settings,
}

/// Declares the exact size of the transfer that follows. Sent once per
/// inference target, before any data packets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub request_id: String,
    pub num_packets: u32,
    pub num_elements: u64,
    pub random_seed: u64,
    /// Target name (file stem), echoed back in the inference result.
    pub target: String,
    /// Pre-flatten tensor shape. Absent in byte-string mode.
    #[serde(default)]
    pub shape: Option<Vec<usize>>,
}

/// One data packet. Sequence numbers are dense `0..num_packets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultData {
    pub request_id: String,
    pub sequence: u32,
    /// Base64-armored chunk (byte mode) or encoded element block
    /// (numeric mode).
    pub payload: String,
}

/// Transfer outcome notification (relay → source). `code` is
/// `SufficientData` or `TimeExceeded`; either one stops the source's
/// packet stream for the current target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedResult {
    pub request_id: String,
    pub code: ResponseCode,
}

/// Final classification for one target (relay → controller).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResult {
    pub request_id: String,
    pub result: String,
    pub target: String,
}

/// Phase-boundary timing report (source / relay → controller).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessTime {
    pub request_id: String,
    pub process_name: String,
    /// Seconds since the Unix epoch at the reporting side.
    pub process_time: f64,
}

// ── Request ───────────────────────────────────────────────────────────────────

/// A decoded request envelope. Matched exhaustively by every dispatcher so
/// an unhandled command is a compile-time-visible case, not a runtime
/// lookup miss.
#[derive(Debug, Clone)]
pub enum Request {
    SourceGetSettings(Plain),
    SourceProcessTime(ProcessTime),
    RelayGetSettings(Plain),
    RelayInferenceResult(InferenceResult),
    RelayProcessTime(ProcessTime),
    ControllerEnd(Plain),
    ResultSummary(ResultSummary),
    ResultData(ResultData),
    SettingsToRelay(SettingsPush),
    RelayEnd(Plain),
    ReceivedResult(ReceivedResult),
    SettingsToSource(SettingsPush),
    SourceEnd(Plain),
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::SourceGetSettings(_) => Command::SourceGetSettings,
            Request::SourceProcessTime(_) => Command::SourceProcessTime,
            Request::RelayGetSettings(_) => Command::RelayGetSettings,
            Request::RelayInferenceResult(_) => Command::RelayInferenceResult,
            Request::RelayProcessTime(_) => Command::RelayProcessTime,
            Request::ControllerEnd(_) => Command::ControllerEnd,
            Request::ResultSummary(_) => Command::ResultSummary,
            Request::ResultData(_) => Command::ResultData,
            Request::SettingsToRelay(_) => Command::SettingsToRelay,
            Request::RelayEnd(_) => Command::RelayEnd,
            Request::ReceivedResult(_) => Command::ReceivedResult,
            Request::SettingsToSource(_) => Command::SettingsToSource,
            Request::SourceEnd(_) => Command::SourceEnd,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Request::SourceGetSettings(b)
            | Request::ControllerEnd(b)
            | Request::RelayGetSettings(b)
            | Request::RelayEnd(b)
            | Request::SourceEnd(b) => &b.request_id,
            Request::SourceProcessTime(b) | Request::RelayProcessTime(b) => &b.request_id,
            Request::RelayInferenceResult(b) => &b.request_id,
            Request::ResultSummary(b) => &b.request_id,
            Request::ResultData(b) => &b.request_id,
            Request::SettingsToRelay(b) | Request::SettingsToSource(b) => &b.request_id,
            Request::ReceivedResult(b) => &b.request_id,
        }
    }

    /// Encode to the newline-free JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let body = match self {
            Request::SourceGetSettings(b)
            | Request::ControllerEnd(b)
            | Request::RelayGetSettings(b)
            | Request::RelayEnd(b)
            | Request::SourceEnd(b) => serde_json::to_value(b)?,
            Request::SourceProcessTime(b) | Request::RelayProcessTime(b) => {
                serde_json::to_value(b)?
            }
            Request::RelayInferenceResult(b) => serde_json::to_value(b)?,
            Request::ResultSummary(b) => serde_json::to_value(b)?,
            Request::ResultData(b) => serde_json::to_value(b)?,
            Request::SettingsToRelay(b) | Request::SettingsToSource(b) => {
                serde_json::to_value(b)?
            }
            Request::ReceivedResult(b) => serde_json::to_value(b)?,
        };

        let mut object = match body {
            serde_json::Value::Object(map) => map,
            _ => return Err(EnvelopeError::NotAnObject),
        };
        object.insert(
            "command".to_string(),
            serde_json::Value::from(u16::from(self.command())),
        );
        Ok(serde_json::to_vec(&serde_json::Value::Object(object))?)
    }

    /// Decode a wire envelope. A malformed envelope or unknown command is a
    /// local, non-retried error — the receiver drops the connection.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let command = value
            .get("command")
            .and_then(serde_json::Value::as_u64)
            .ok_or(EnvelopeError::MissingField("command"))?;
        if value.get("request_id").is_none() {
            return Err(EnvelopeError::MissingField("request_id"));
        }
        let command = Command::try_from(command as u16)?;

        // Unknown extra fields (including `command` itself) are ignored by
        // the body deserializers.
        Ok(match command {
            Command::SourceGetSettings => Request::SourceGetSettings(serde_json::from_value(value)?),
            Command::SourceProcessTime => Request::SourceProcessTime(serde_json::from_value(value)?),
            Command::RelayGetSettings => Request::RelayGetSettings(serde_json::from_value(value)?),
            Command::RelayInferenceResult => {
                Request::RelayInferenceResult(serde_json::from_value(value)?)
            }
            Command::RelayProcessTime => Request::RelayProcessTime(serde_json::from_value(value)?),
            Command::ControllerEnd => Request::ControllerEnd(serde_json::from_value(value)?),
            Command::ResultSummary => Request::ResultSummary(serde_json::from_value(value)?),
            Command::ResultData => Request::ResultData(serde_json::from_value(value)?),
            Command::SettingsToRelay => Request::SettingsToRelay(serde_json::from_value(value)?),
            Command::RelayEnd => Request::RelayEnd(serde_json::from_value(value)?),
            Command::ReceivedResult => Request::ReceivedResult(serde_json::from_value(value)?),
            Command::SettingsToSource => Request::SettingsToSource(serde_json::from_value(value)?),
            Command::SourceEnd => Request::SourceEnd(serde_json::from_value(value)?),
        })
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

/// Tagged payload union for responses. One variant per payload-bearing
/// response kind; `Empty` everywhere else.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponsePayload {
    #[default]
    Empty,
    /// Current run settings, returned for the settings-pull commands.
    Settings { settings: Settings },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub code: ResponseCode,
    pub request_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: ResponsePayload,
}

impl Response {
    /// Success response with an empty payload — the normal ack.
    pub fn ok(request_id: &str) -> Self {
        Self {
            code: ResponseCode::Success,
            request_id: request_id.to_string(),
            message: String::new(),
            payload: ResponsePayload::Empty,
        }
    }

    pub fn with_payload(request_id: &str, payload: ResponsePayload) -> Self {
        Self {
            code: ResponseCode::Success,
            request_id: request_id.to_string(),
            message: String::new(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unknown command: {0}")]
    UnknownCommand(u16),

    #[error("required field missing: {0}")]
    MissingField(&'static str),

    #[error("envelope body is not a JSON object")]
    NotAnObject,

    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
