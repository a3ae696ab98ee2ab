use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected event type: expected '{expected}', got '{actual}'")]
    UnexpectedType { expected: String, actual: String },
}

/// Event header, the JSON line that starts every event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Byte length of the JSON data block following the header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_length: Option<usize>,

    /// Byte length of the raw payload following the data block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_length: Option<usize>,

    /// Header fields this crate does not interpret, relayed as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Header {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            version: None,
            data_length: None,
            payload_length: None,
            extra: Map::new(),
        }
    }
}

/// A single protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub header: Header,
    pub data: Option<Value>,
    pub payload: Option<Vec<u8>>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            header: Header::new(event_type),
            data: None,
            payload: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.header.version = Some(version.into());
        self
    }

    pub fn event_type(&self) -> &str {
        &self.header.event_type
    }

    /// Deserialize the data section into a typed shape.
    ///
    /// A missing data section is treated as an empty object, so shapes whose
    /// fields are all optional still parse.
    pub fn parse_data<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let data = self
            .data
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()));
        serde_json::from_value(data).map_err(|e| {
            ProtocolError::Decode(format!(
                "invalid data for '{}' event: {}",
                self.event_type(),
                e
            ))
        })
    }
}
