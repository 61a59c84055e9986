//* Line-delimited JSON events shared by the control socket and the
//* receiver-link. One JSON object per line, dispatched on the `type` tag.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "request")]
    Request(Request),
    #[serde(rename = "response")]
    Response(Response),
    #[serde(rename = "error")]
    Error(ErrorEvent),
    #[serde(rename = "sync-success")]
    SyncSuccess(SyncSuccess),
    #[serde(rename = "progress")]
    Progress(Progress),
}

/// A command sent to a peer. Command-specific arguments ride alongside the
/// envelope fields; the peer ignores what it does not know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(rename = "eventId")]
    pub event_id: u64,
    #[serde(flatten)]
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(rename = "eventId")]
    pub event_id: u64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Response {
    /// Read a string-array field. Anything that is not an array of strings
    /// is treated as empty; remote agents are not trusted to be tidy.
    pub fn string_array(&self, key: &str) -> Vec<String> {
        match self.fields.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn string_field(&self, key: &str) -> Option<String> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(rename = "eventId", skip_serializing_if = "Option::is_none")]
    pub event_id: Option<u64>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSuccess {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub phase: String,
    pub state: String,
    pub current_progress: u64,
    pub total_progress: u64,
    pub store: bool,
}

impl Event {
    pub fn request(command: &str, event_id: u64, args: Map<String, Value>) -> Self {
        Event::Request(Request {
            command: command.to_string(),
            event_id,
            args,
        })
    }

    pub fn response(command: &str, event_id: u64, fields: Map<String, Value>) -> Self {
        Event::Response(Response {
            command: Some(command.to_string()),
            event_id,
            fields,
        })
    }

    pub fn error(command: Option<&str>, event_id: Option<u64>, message: &str) -> Self {
        Event::Error(ErrorEvent {
            command: command.map(str::to_string),
            event_id,
            message: message.to_string(),
        })
    }
}

pub fn parse_event(line: &str) -> Result<Event, serde_json::Error> {
    serde_json::from_str(line)
}

/// Serialize one event followed by a newline. Writes are not interleaved
/// by callers; each socket has a single writer at any time.
pub async fn write_event<W: AsyncWrite + Unpin>(
    writer: &mut W,
    event: &Event,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(event).map_err(std::io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}
