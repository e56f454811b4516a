//! Message/Response envelope that crosses every component boundary

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AgentError, ErrorKind};

/// Splits an action into `<prefix>` and `<verb>`
pub const ACTION_SEPARATOR: char = '_';

/// Split an action on the first separator only.
///
/// `task_add_bulk` yields `("task", "add_bulk")`. Returns `None` when there is
/// no separator or either half is empty.
pub fn split_action(action: &str) -> Option<(&str, &str)> {
    let (prefix, verb) = action.split_once(ACTION_SEPARATOR)?;
    if prefix.is_empty() || verb.is_empty() {
        return None;
    }
    Some((prefix, verb))
}

/// Untrusted wire form of a message, before validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMessage {
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawMessage {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Validate into a [`Message`]
    pub fn build(self) -> Result<Message, AgentError> {
        Message::try_from(self)
    }
}

/// A validated request addressed to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage")]
pub struct Message {
    action: String,
    payload: Map<String, Value>,
    correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender: Option<String>,
    timestamp: DateTime<Utc>,
}

impl TryFrom<RawMessage> for Message {
    type Error = AgentError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let action = raw.action.trim();
        if action.is_empty() {
            return Err(AgentError::invalid_field("action", "Action cannot be empty"));
        }
        if split_action(action).is_none() {
            return Err(AgentError::invalid_field(
                "action",
                format!(
                    "Action '{}' must have the form <prefix>{}<verb>",
                    action, ACTION_SEPARATOR
                ),
            ));
        }

        let payload = match raw.payload {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(AgentError::invalid_field(
                    "payload",
                    format!("Payload must be a mapping, got {}", json_type_name(&other)),
                ));
            }
        };

        let correlation_id = raw
            .correlation_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_correlation_id);

        Ok(Self {
            action: action.to_string(),
            payload,
            correlation_id,
            sender: raw.sender,
            timestamp: raw.timestamp.unwrap_or_else(Utc::now),
        })
    }
}

impl Message {
    /// Build and validate a message with a generated correlation id
    pub fn new(action: impl Into<String>, payload: Value) -> Result<Self, AgentError> {
        RawMessage::new(action).payload(payload).build()
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    /// Routing key: everything before the first separator
    pub fn prefix(&self) -> &str {
        split_action(&self.action).map(|(p, _)| p).unwrap_or_default()
    }

    /// Everything after the first separator
    pub fn verb(&self) -> &str {
        split_action(&self.action).map(|(_, v)| v).unwrap_or_default()
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// String field from the payload, if present and a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Non-empty string field from the payload, or a validation error naming it
    pub fn require_str(&self, key: &str) -> Result<&str, AgentError> {
        match self.get_str(key) {
            Some(s) if !s.trim().is_empty() => Ok(s),
            _ => Err(AgentError::invalid_field(
                key,
                format!("Missing '{}' in payload", key),
            )),
        }
    }

    /// A derived message for a follow-up action that keeps this correlation id
    pub fn follow_up(&self, action: impl Into<String>, payload: Value) -> Result<Self, AgentError> {
        let mut raw = RawMessage::new(action)
            .payload(payload)
            .correlation_id(self.correlation_id.clone());
        raw.sender = self.sender.clone();
        raw.build()
    }

    /// Successful response correlated with this message
    pub fn reply(&self, data: Value) -> Response {
        Response::ok(self.correlation_id.clone(), data)
    }

    /// Failed response correlated with this message
    pub fn reply_error(&self, err: &AgentError) -> Response {
        Response::error(self.correlation_id.clone(), err)
    }
}

fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Error details carried by a failed [`Response`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub correlation_id: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            correlation_id: correlation_id.into(),
        }
    }

    pub fn from_error(err: &AgentError, correlation_id: impl Into<String>) -> Self {
        Self::new(err.kind(), err.to_string(), correlation_id)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} [{}]", self.kind, self.message, self.correlation_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawResponse {
    success: bool,
    #[serde(default)]
    data: Option<Map<String, Value>>,
    #[serde(default)]
    error: Option<ErrorInfo>,
    correlation_id: String,
    #[serde(default)]
    handled_by: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Result of a dispatch.
///
/// `data` is present exactly when `success` is true and `error` exactly when
/// it is false. Fields are private so the pairing cannot be broken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResponse")]
pub struct Response {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorInfo>,
    correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    handled_by: Option<String>,
    timestamp: DateTime<Utc>,
}

impl TryFrom<RawResponse> for Response {
    type Error = AgentError;

    fn try_from(raw: RawResponse) -> Result<Self, Self::Error> {
        match (raw.success, raw.data, raw.error) {
            (true, Some(data), None) => Ok(Self {
                success: true,
                data: Some(data),
                error: None,
                correlation_id: raw.correlation_id,
                handled_by: raw.handled_by,
                timestamp: raw.timestamp.unwrap_or_else(Utc::now),
            }),
            (false, None, Some(error)) => Ok(Self {
                success: false,
                data: None,
                error: Some(error),
                correlation_id: raw.correlation_id,
                handled_by: raw.handled_by,
                timestamp: raw.timestamp.unwrap_or_else(Utc::now),
            }),
            (true, ..) => Err(AgentError::validation(
                "Successful response must carry data and no error",
            )),
            (false, ..) => Err(AgentError::validation(
                "Failed response must carry an error and no data",
            )),
        }
    }
}

impl Response {
    /// Successful response. Non-object data is wrapped as `{"value": data}`.
    pub fn ok(correlation_id: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            success: true,
            data: Some(data),
            error: None,
            correlation_id: correlation_id.into(),
            handled_by: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(correlation_id: impl Into<String>, err: &AgentError) -> Self {
        let correlation_id = correlation_id.into();
        Self::from_info(ErrorInfo::from_error(err, correlation_id))
    }

    pub fn from_info(info: ErrorInfo) -> Self {
        Self {
            success: false,
            data: None,
            correlation_id: info.correlation_id.clone(),
            error: Some(info),
            handled_by: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> Option<&Map<String, Value>> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<Map<String, Value>> {
        self.data
    }

    pub fn error_info(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn handled_by(&self) -> Option<&str> {
        self.handled_by.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Rewrite the correlation id everywhere it appears
    pub(crate) fn set_correlation_id(&mut self, id: &str) {
        self.correlation_id = id.to_string();
        if let Some(error) = self.error.as_mut() {
            error.correlation_id = id.to_string();
        }
    }

    pub(crate) fn set_handled_by(&mut self, name: &str) {
        if self.handled_by.is_none() {
            self.handled_by = Some(name.to_string());
        }
    }
}

/// Lifecycle status reported for an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Registered,
    Active,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registered => write!(f, "registered"),
            Self::Active => write!(f, "active"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Descriptive metadata about a registered agent. Never used for routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub version: String,
    pub prefixes: BTreeSet<String>,
    #[serde(default)]
    pub supported_actions: Vec<String>,
    pub status: AgentStatus,
}
