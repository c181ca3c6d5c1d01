//! JSON-RPC 2.0 codec for the MCP method set.
//!
//! The inbound side parses one message into the tagged [`Message`] variant
//! the dispatcher matches on. The method set is closed: anything not listed
//! in [`Method`] parses successfully as [`Method::Unknown`] and is answered
//! with a *method not found* error downstream.
//!
//! Classification follows JSON-RPC 2.0 as the firmware speaks it: a request
//! carries `method` + `params` + an integer `id`; a notification carries
//! `method` and no `id`; everything else — including client→server response
//! envelopes — is rejected as an invalid request.
//!
//! The `tools/call` `arguments` object is captured as raw JSON and forwarded
//! to the tool callback byte-for-byte; the codec never canonicalises tool
//! payloads.

use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_json::value::RawValue;
use serde_json::Value;

use emcp_core::{Error, Result};

use crate::config::ServerConfig;
use crate::tool::ToolMetadata;

/// Protocol revision implemented by this runtime. `initialize` requests
/// quoting any other revision are refused.
pub const PROTOCOL_VERSION: &str = "2025-11-25";

/// Identifier of an MCP method, including the catch-all [`Method::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// A method name outside the supported set.
    Unknown,
    /// `initialize`
    Initialize,
    /// `ping`
    Ping,
    /// `tools/list`
    ToolsList,
    /// `tools/call`
    ToolsCall,
    /// `notifications/initialized`
    NotifInitialized,
    /// `notifications/cancelled`
    NotifCancelled,
}

impl Method {
    fn from_name(name: &str) -> Self {
        match name {
            "initialize" => Self::Initialize,
            "ping" => Self::Ping,
            "tools/list" => Self::ToolsList,
            "tools/call" => Self::ToolsCall,
            "notifications/initialized" => Self::NotifInitialized,
            "notifications/cancelled" => Self::NotifCancelled,
            _ => Self::Unknown,
        }
    }

    /// Wire name of the method, or `"unknown"`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Initialize => "initialize",
            Self::Ping => "ping",
            Self::ToolsList => "tools/list",
            Self::ToolsCall => "tools/call",
            Self::NotifInitialized => "notifications/initialized",
            Self::NotifCancelled => "notifications/cancelled",
        }
    }
}

/// One parsed inbound message, tagged per method.
#[derive(Debug)]
pub(crate) enum Message {
    Initialize {
        id: i64,
        protocol_version: String,
    },
    Ping {
        id: i64,
    },
    ToolsList {
        id: i64,
    },
    ToolsCall {
        id: i64,
        name: String,
        /// Raw JSON of the `arguments` object, verbatim.
        arguments: Option<String>,
    },
    Initialized,
    Cancelled {
        request_id: i64,
        reason: Option<String>,
    },
    Unknown {
        id: Option<i64>,
    },
}

impl Message {
    pub(crate) fn method(&self) -> Method {
        match self {
            Self::Initialize { .. } => Method::Initialize,
            Self::Ping { .. } => Method::Ping,
            Self::ToolsList { .. } => Method::ToolsList,
            Self::ToolsCall { .. } => Method::ToolsCall,
            Self::Initialized => Method::NotifInitialized,
            Self::Cancelled { .. } => Method::NotifCancelled,
            Self::Unknown { .. } => Method::Unknown,
        }
    }

    pub(crate) fn is_notification(&self) -> bool {
        matches!(self, Self::Initialized | Self::Cancelled { .. })
    }

    /// The JSON-RPC id to quote in a reply, when the message carries one.
    pub(crate) fn request_id(&self) -> Option<i64> {
        match self {
            Self::Initialize { id, .. }
            | Self::Ping { id }
            | Self::ToolsList { id }
            | Self::ToolsCall { id, .. } => Some(*id),
            Self::Unknown { id } => *id,
            Self::Initialized | Self::Cancelled { .. } => None,
        }
    }
}

#[derive(Deserialize)]
struct Envelope<'a> {
    jsonrpc: &'a str,
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(borrow, default)]
    params: Option<&'a RawValue>,
}

#[derive(Deserialize)]
struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    protocol_version: String,
}

#[derive(Deserialize)]
struct ToolsCallParams<'a> {
    name: String,
    #[serde(borrow, default)]
    arguments: Option<&'a RawValue>,
}

#[derive(Deserialize)]
struct CancelledParams {
    #[serde(rename = "requestId")]
    request_id: i64,
    #[serde(default)]
    reason: Option<String>,
}

fn invalid<E: std::fmt::Display>(err: E) -> Error {
    Error::InvalidRequest(err.to_string())
}

/// Parse one inbound JSON-RPC message.
pub(crate) fn parse_message(raw: &str, config: &ServerConfig) -> Result<Message> {
    if raw.len() > config.max_message_size {
        return Err(Error::InvalidRequest(format!(
            "message of {} bytes exceeds limit of {}",
            raw.len(),
            config.max_message_size
        )));
    }

    let env: Envelope<'_> = serde_json::from_str(raw).map_err(invalid)?;
    if env.jsonrpc != "2.0" {
        return Err(Error::InvalidRequest(format!(
            "unsupported jsonrpc version '{}'",
            env.jsonrpc
        )));
    }

    let method = env.method.as_deref().map(Method::from_name);
    match (method, env.id, env.params) {
        // Request: method + params + id.
        (Some(method), Some(id), Some(params)) => parse_request(method, id, params, config),
        // Notification: method, no id.
        (Some(method), None, params) => parse_notification(method, params),
        _ => Err(Error::InvalidRequest(
            "message is neither a request nor a notification".to_string(),
        )),
    }
}

fn parse_request(method: Method, id: i64, params: &RawValue, config: &ServerConfig) -> Result<Message> {
    match method {
        Method::Initialize => {
            let p: InitializeParams = serde_json::from_str(params.get()).map_err(invalid)?;
            Ok(Message::Initialize {
                id,
                protocol_version: p.protocol_version,
            })
        }
        // Ping and tools/list params are opaque and ignored.
        Method::Ping => Ok(Message::Ping { id }),
        Method::ToolsList => Ok(Message::ToolsList { id }),
        Method::ToolsCall => {
            let p: ToolsCallParams<'_> = serde_json::from_str(params.get()).map_err(invalid)?;
            if p.name.is_empty() {
                return Err(Error::InvalidRequest("tool name is required".to_string()));
            }
            if p.name.len() > config.tool_name_max_len {
                return Err(Error::InvalidRequest(format!(
                    "tool name exceeds {} bytes",
                    config.tool_name_max_len
                )));
            }
            let arguments = match p.arguments {
                None => None,
                Some(args) => {
                    let raw_args = args.get();
                    if !raw_args.trim_start().starts_with('{') {
                        return Err(Error::InvalidRequest(
                            "arguments must be a JSON object".to_string(),
                        ));
                    }
                    if raw_args.len() > config.tool_input_args_max_len {
                        return Err(Error::InvalidRequest(format!(
                            "arguments exceed {} bytes",
                            config.tool_input_args_max_len
                        )));
                    }
                    Some(raw_args.to_string())
                }
            };
            Ok(Message::ToolsCall {
                id,
                name: p.name,
                arguments,
            })
        }
        // Known notifications arriving with an id, or unknown methods:
        // hand back Unknown so the dispatcher answers "method not found".
        Method::Unknown | Method::NotifInitialized | Method::NotifCancelled => {
            Ok(Message::Unknown { id: Some(id) })
        }
    }
}

fn parse_notification(method: Method, params: Option<&RawValue>) -> Result<Message> {
    match method {
        Method::NotifInitialized => Ok(Message::Initialized),
        Method::NotifCancelled => {
            let params = params.ok_or_else(|| {
                Error::InvalidRequest("notifications/cancelled requires params".to_string())
            })?;
            let p: CancelledParams = serde_json::from_str(params.get()).map_err(invalid)?;
            Ok(Message::Cancelled {
                request_id: p.request_id,
                reason: p.reason,
            })
        }
        _ => Ok(Message::Unknown { id: None }),
    }
}

// ---------------------------------------------------------------------------
// Serializers (server → client)
// ---------------------------------------------------------------------------

/// Payload of a successful `initialize` reply.
pub(crate) struct InitializeResult<'a> {
    pub(crate) server_name: &'a str,
    pub(crate) server_version: &'a str,
    pub(crate) capabilities: Value,
}

#[derive(Serialize)]
struct ToolListEntry<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(rename = "inputSchema")]
    input_schema: &'a Value,
    #[serde(rename = "outputSchema", skip_serializing_if = "Option::is_none")]
    output_schema: Option<&'a Value>,
}

fn bounded(body: Value, max: usize) -> Result<String> {
    let out = body.to_string();
    if out.len() > max {
        return Err(Error::OutOfSpace { max });
    }
    Ok(out)
}

pub(crate) fn serialize_initialize_result(
    id: i64,
    result: &InitializeResult<'_>,
    max: usize,
) -> Result<String> {
    bounded(
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {
                    "name": result.server_name,
                    "version": result.server_version,
                },
                "capabilities": result.capabilities,
            },
        }),
        max,
    )
}

pub(crate) fn serialize_ping_result(id: i64, max: usize) -> Result<String> {
    bounded(json!({"jsonrpc": "2.0", "id": id, "result": {}}), max)
}

pub(crate) fn serialize_tools_list_result(
    id: i64,
    tools: &[ToolMetadata],
    max: usize,
) -> Result<String> {
    let entries: Vec<ToolListEntry<'_>> = tools
        .iter()
        .map(|tool| ToolListEntry {
            name: &tool.name,
            title: tool.title.as_deref(),
            description: tool.description.as_deref(),
            input_schema: &tool.input_schema,
            output_schema: tool.output_schema.as_ref(),
        })
        .collect();
    bounded(
        json!({"jsonrpc": "2.0", "id": id, "result": {"tools": entries}}),
        max,
    )
}

pub(crate) fn serialize_tools_call_result(
    id: i64,
    text: &str,
    is_error: bool,
    max: usize,
) -> Result<String> {
    bounded(
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "content": [{"type": "text", "text": text}],
                "isError": is_error,
            },
        }),
        max,
    )
}

pub(crate) fn serialize_error(
    id: Option<i64>,
    code: i32,
    message: &str,
    data: Option<Value>,
    max: usize,
) -> Result<String> {
    let mut error = json!({"code": code, "message": message});
    if let (Some(obj), Some(data)) = (error.as_object_mut(), data) {
        obj.insert("data".to_string(), data);
    }
    bounded(json!({"jsonrpc": "2.0", "id": id, "error": error}), max)
}

/// Build a `notifications/message` logging notification.
///
/// Outgoing only; transports may use this to surface server-side log lines
/// to interested clients.
///
/// # Errors
///
/// Returns [`Error::OutOfSpace`] if the notification exceeds `max` bytes.
pub fn serialize_logging_notification(
    level: &str,
    logger: &str,
    message: &str,
    data: Option<Value>,
    max: usize,
) -> Result<String> {
    let mut params = json!({"level": level, "logger": logger, "message": message});
    if let (Some(obj), Some(data)) = (params.as_object_mut(), data) {
        obj.insert("data".to_string(), data);
    }
    bounded(
        json!({"jsonrpc": "2.0", "method": "notifications/message", "params": params}),
        max,
    )
}

/// Build a `notifications/tools/list_changed` notification.
///
/// # Errors
///
/// Returns [`Error::OutOfSpace`] if the notification exceeds `max` bytes.
pub fn serialize_tools_list_changed_notification(max: usize) -> Result<String> {
    bounded(
        json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed", "params": {}}),
        max,
    )
}
