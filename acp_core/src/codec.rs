//! JSON shapes exchanged with the fuzzing engine.
//!
//! Request bodies are decoded into the `*Body` structs below; replies are
//! built as [`Reply`] values and serialized by the transport. Binary members
//! travel as standard padded base64 strings.

use crate::error::AgentError;
use crate::fault::FaultRecord;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Body of the catch-all reply for unrecognised paths.
pub const UNKNOWN_COMMAND_MESSAGE: &str = "Error, unknown command.";

pub fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>, AgentError> {
    Ok(STANDARD.decode(text.trim())?)
}

/// `#[serde(with = "base64_bytes")]` for `Vec<u8>` members.
pub mod base64_bytes {
    use super::*;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode_base64(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.trim())
            .map_err(serde::de::Error::custom)
    }
}

/// `#[serde(with = "opt_base64_bytes")]` for `Option<Vec<u8>>` members;
/// `None` is written as `null`.
pub mod opt_base64_bytes {
    use super::*;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&encode_base64(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD
                .decode(text.trim())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Decodes a JSON request body. An empty body is read as `{}` so that
/// optional-only bodies may be omitted entirely.
pub fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, AgentError> {
    let is_blank = body.iter().all(|b| b.is_ascii_whitespace());
    let text: &[u8] = if is_blank { b"{}" } else { body };
    Ok(serde_json::from_slice(text)?)
}

/// Query-string booleans arrive as `true`, `True` or `1`.
pub fn parse_bool(name: &str, text: &str) -> Result<bool, AgentError> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        other => Err(AgentError::Decode(format!(
            "parameter '{name}' is not a boolean: {other}"
        ))),
    }
}

fn value_as_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Argument maps may carry numbers and booleans; monitors and publishers see
/// them as strings.
fn stringly_map<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<HashMap<String, String>, D::Error> {
    let raw = Option::<HashMap<String, serde_json::Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, value_as_string(v)))
        .collect())
}

fn stringly_tag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.map(value_as_string).unwrap_or_default())
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct StartMonitorBody {
    pub name: Option<String>,
    #[serde(alias = "cls")]
    pub class: Option<String>,
    #[serde(default, deserialize_with = "stringly_map")]
    pub args: HashMap<String, String>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct StopMonitorBody {
    pub name: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IterationStartingBody {
    pub iteration_count: Option<u32>,
    pub is_reproduction: Option<bool>,
    pub last_was_fault: Option<bool>,
}

/// Body of `CreatePublisher`, in either path family.
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreatePublisherBody {
    #[serde(rename = "Cls", alias = "cls", alias = "class")]
    pub class: Option<String>,
    pub name: Option<String>,
    #[serde(default, deserialize_with = "stringly_map")]
    pub args: HashMap<String, String>,
    pub iteration: Option<u32>,
    pub is_control_iteration: Option<bool>,
    pub is_control_recording_iteration: Option<bool>,
    pub is_iteration_after_fault: Option<bool>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SetIterationBody {
    pub iteration: u32,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetIsControlIterationBody {
    pub is_control_iteration: bool,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetIsControlRecordingIterationBody {
    pub is_control_recording_iteration: bool,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetIsIterationAfterFaultBody {
    pub is_iteration_after_fault: bool,
}

/// One argument of a publisher `call`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CallArgument {
    pub name: String,
    /// Declared type tag, kept opaque (`"bytes"`, `0`, ...).
    #[serde(rename = "type", default, deserialize_with = "stringly_tag")]
    pub type_tag: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CallBody {
    pub method: String,
    #[serde(default)]
    pub args: Vec<CallArgument>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SetPropertyBody {
    #[serde(alias = "name")]
    pub property: String,
    #[serde(alias = "value", with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// `getProperty` is sent either as a bare JSON string or as an object.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum GetPropertyBody {
    Bare(String),
    Named {
        #[serde(alias = "name")]
        property: String,
    },
    Empty {},
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DataBody {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SetResultBody {
    #[serde(with = "opt_base64_bytes", default)]
    pub value: Option<Vec<u8>>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CountBody {
    pub count: u64,
}

/// `{"Status": bool}` envelope of agent commands.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusReply {
    #[serde(rename = "Status")]
    pub status: bool,
    #[serde(rename = "Reason", skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Extra members carried by a successful publisher reply.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum PublisherPayload {
    Empty {},
    Value {
        #[serde(with = "opt_base64_bytes")]
        value: Option<Vec<u8>>,
    },
    Data {
        #[serde(with = "opt_base64_bytes")]
        data: Option<Vec<u8>>,
    },
    Read {
        #[serde(with = "opt_base64_bytes")]
        data: Option<Vec<u8>>,
        ready: bool,
    },
}

/// `{"error": bool, "errorString": ...}` envelope of publisher commands.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PublisherReply {
    pub error: bool,
    #[serde(rename = "errorString")]
    pub error_string: Option<String>,
    #[serde(flatten)]
    pub payload: PublisherPayload,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct MonitorDataReply {
    #[serde(rename = "Results")]
    pub results: Vec<FaultRecord>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommandReply {
    #[serde(rename = "Error")]
    pub error: String,
}

/// Everything the dispatcher can answer with.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Reply {
    Status(StatusReply),
    Publisher(PublisherReply),
    MonitorData(MonitorDataReply),
    UnknownCommand(UnknownCommandReply),
}

impl Reply {
    pub fn status(value: bool) -> Self {
        Reply::Status(StatusReply {
            status: value,
            reason: None,
        })
    }

    pub fn agent_error(err: &AgentError) -> Self {
        Reply::Status(StatusReply {
            status: false,
            reason: Some(err.to_string()),
        })
    }

    pub fn publisher_ok(payload: PublisherPayload) -> Self {
        Reply::Publisher(PublisherReply {
            error: false,
            error_string: None,
            payload,
        })
    }

    pub fn publisher_error(err: &AgentError) -> Self {
        Reply::Publisher(PublisherReply {
            error: true,
            error_string: Some(err.to_string()),
            payload: PublisherPayload::Empty {},
        })
    }

    pub fn monitor_data(results: Vec<FaultRecord>) -> Self {
        Reply::MonitorData(MonitorDataReply { results })
    }

    pub fn unknown_command() -> Self {
        Reply::UnknownCommand(UnknownCommandReply {
            error: UNKNOWN_COMMAND_MESSAGE.to_string(),
        })
    }

    /// Whether the reply reports success, regardless of envelope shape.
    pub fn is_success(&self) -> bool {
        match self {
            Reply::Status(s) => s.status || s.reason.is_none(),
            Reply::Publisher(p) => !p.error,
            Reply::MonitorData(_) => true,
            Reply::UnknownCommand(_) => false,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        // Every variant is a plain struct of strings, bools and numbers.
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({ "Error": format!("failed to encode reply: {e}") })
        })
    }
}
