//! Wire envelopes exchanged with the automation client.
//!
//! Every frame is one JSON object whose `type` field selects the variant.
//! Outbound envelopes are serialized straight from [`Outbound`]; inbound
//! frames go through [`parse_inbound`], which is lenient about
//! `payload` and strict about the identifying fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Messages the bridge sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Outbound {
    #[serde(rename = "hello", rename_all = "camelCase")]
    Hello {
        session_id: String,
        host_name: String,
        host_version: String,
        bridge_version: String,
        platform: String,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: i64 },
    #[serde(rename = "context:update")]
    ContextUpdate {
        timestamp: i64,
        payload: Map<String, Value>,
    },
    #[serde(rename = "command:result", rename_all = "camelCase")]
    CommandResult {
        command_id: String,
        ok: bool,
        result: Value,
        error_message: Option<String>,
    },
    #[serde(rename = "compilation:started")]
    CompilationStarted { timestamp: i64 },
    #[serde(rename = "compilation:progress", rename_all = "camelCase")]
    CompilationProgress {
        timestamp: i64,
        elapsed_seconds: f64,
        status: String,
    },
    #[serde(rename = "compilation:complete")]
    CompilationComplete {
        timestamp: i64,
        result: CompilationResult,
    },
    #[serde(rename = "bridge:restarted", rename_all = "camelCase")]
    BridgeRestarted {
        timestamp: i64,
        reason: String,
        session_id: String,
    },
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Hello { .. } => "hello",
            Outbound::Heartbeat { .. } => "heartbeat",
            Outbound::ContextUpdate { .. } => "context:update",
            Outbound::CommandResult { .. } => "command:result",
            Outbound::CompilationStarted { .. } => "compilation:started",
            Outbound::CompilationProgress { .. } => "compilation:progress",
            Outbound::CompilationComplete { .. } => "compilation:complete",
            Outbound::BridgeRestarted { .. } => "bridge:restarted",
        }
    }

    pub fn command_ok(command_id: &str, result: Value) -> Self {
        Outbound::CommandResult {
            command_id: command_id.to_string(),
            ok: true,
            result,
            error_message: None,
        }
    }

    pub fn command_failed(command_id: &str, message: impl Into<String>) -> Self {
        Outbound::CommandResult {
            command_id: command_id.to_string(),
            ok: false,
            result: Value::Null,
            error_message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// Outcome of one script compilation, as delivered in `compilation:complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilationResult {
    pub success: bool,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    pub elapsed_seconds: f64,
}

impl CompilationResult {
    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }
}

/// Self-reported metadata of the connected client (`server:info`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub server_version: Option<String>,
    #[serde(default)]
    pub python_version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub command_id: String,
    pub tool_name: String,
    pub payload: Map<String, Value>,
}

/// Messages the client sends to the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    ServerInfo(ClientInfo),
    Command(CommandRequest),
    Heartbeat,
}

#[derive(Debug, Error, PartialEq)]
pub enum InboundError {
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("frame has no string `type`")]
    MissingType,
    #[error("unsupported envelope type {0:?}")]
    UnknownType(String),
    #[error("{0} is missing or not a string")]
    MissingField(&'static str),
}

pub fn parse_inbound(text: &str) -> Result<Inbound, InboundError> {
    let value: Value = serde_json::from_str(text).map_err(|_| InboundError::NotAnObject)?;
    let Some(obj) = value.as_object() else {
        return Err(InboundError::NotAnObject);
    };
    let ty = obj
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or(InboundError::MissingType)?;

    match ty {
        "server:info" => {
            let info = obj
                .get("clientInfo")
                .and_then(|v| serde_json::from_value::<ClientInfo>(v.clone()).ok())
                .unwrap_or_default();
            Ok(Inbound::ServerInfo(info))
        }
        "command:execute" => {
            let command_id = string_field(obj, "commandId")?;
            let tool_name = string_field(obj, "toolName")?;
            let payload = obj
                .get("payload")
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default();
            Ok(Inbound::Command(CommandRequest {
                command_id,
                tool_name,
                payload,
            }))
        }
        "heartbeat" => Ok(Inbound::Heartbeat),
        other => Err(InboundError::UnknownType(other.to_string())),
    }
}

fn string_field(obj: &Map<String, Value>, key: &'static str) -> Result<String, InboundError> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or(InboundError::MissingField(key))
}
