use crate::event::{Event, Header, ProtocolError};
use log::debug;
use serde_json::Value;

const NEWLINE: u8 = b'\n';

/// Consumed bytes are only shifted out of the buffer once they pass this size
const COMPACT_THRESHOLD: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitingHeader,
    AwaitingData,
    AwaitingPayload,
}

/// Incremental Wyoming event decoder and stateless encoder.
///
/// Bytes may be fed in arbitrary pieces; partial headers, data blocks and
/// payloads are kept between calls so decoding resumes exactly where the
/// previous chunk ended.
#[derive(Debug)]
pub struct EventCodec {
    buffer: Vec<u8>,
    offset: usize,
    state: DecodeState,
    pending: Option<Event>,
    expected_data_length: usize,
    expected_payload_length: usize,
}

impl Default for EventCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EventCodec {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            offset: 0,
            state: DecodeState::AwaitingHeader,
            pending: None,
            expected_data_length: 0,
            expected_payload_length: 0,
        }
    }

    /// Append `chunk` and return a lazy sequence of the events it completes.
    ///
    /// Events are parsed one at a time as the sequence is advanced. Anything
    /// left unread stays buffered and is returned by the next call.
    pub fn decode(&mut self, chunk: &[u8]) -> Decoded<'_> {
        self.feed(chunk);
        Decoded {
            codec: self,
            failed: false,
        }
    }

    /// Buffer `chunk` without parsing; pull events with [`next_event`](Self::next_event)
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Parse the next complete event from the buffered bytes, if any.
    ///
    /// A malformed header is fatal: the stream position is lost and the
    /// caller has to drop the connection (or `reset()` the codec).
    pub fn next_event(&mut self) -> Result<Option<Event>, ProtocolError> {
        loop {
            match self.state {
                DecodeState::AwaitingHeader => {
                    let newline = match self.available().iter().position(|b| *b == NEWLINE) {
                        Some(index) => index,
                        None => return Ok(None),
                    };

                    let header = parse_header(&self.available()[..newline])?;
                    self.consume(newline + 1);

                    self.expected_data_length = header.data_length.unwrap_or(0);
                    self.expected_payload_length = header.payload_length.unwrap_or(0);
                    self.pending = Some(Event {
                        header,
                        data: None,
                        payload: None,
                    });

                    if self.expected_data_length > 0 {
                        self.state = DecodeState::AwaitingData;
                    } else if self.expected_payload_length > 0 {
                        self.state = DecodeState::AwaitingPayload;
                    } else {
                        return Ok(self.finish_event());
                    }
                }
                DecodeState::AwaitingData => {
                    let needed = self.expected_data_length;
                    if self.available().len() < needed {
                        return Ok(None);
                    }

                    let data: Value =
                        serde_json::from_slice(&self.available()[..needed]).map_err(|e| {
                            ProtocolError::Decode(format!("malformed event data: {}", e))
                        })?;
                    self.consume(needed);

                    if let Some(event) = self.pending.as_mut() {
                        event.data = Some(data);
                    }

                    if self.expected_payload_length > 0 {
                        self.state = DecodeState::AwaitingPayload;
                    } else {
                        return Ok(self.finish_event());
                    }
                }
                DecodeState::AwaitingPayload => {
                    let needed = self.expected_payload_length;
                    if self.available().len() < needed {
                        return Ok(None);
                    }

                    let payload = self.available()[..needed].to_vec();
                    self.consume(needed);

                    if let Some(event) = self.pending.as_mut() {
                        event.payload = Some(payload);
                    }
                    return Ok(self.finish_event());
                }
            }
        }
    }

    /// Serialize an event to its wire form.
    ///
    /// `data_length`/`payload_length` are computed from the encoded sections
    /// and written into the header; any values already present are replaced.
    pub fn encode(event: &Event) -> Result<Vec<u8>, ProtocolError> {
        let mut header = event.header.clone();
        header.data_length = None;
        header.payload_length = None;

        let data_bytes = match &event.data {
            None => None,
            Some(Value::Object(map)) => Some(serde_json::to_vec(map)?),
            Some(other) => {
                return Err(ProtocolError::Encode(format!(
                    "the data of a '{}' event must be a JSON object, got {}",
                    event.event_type(),
                    json_kind(other)
                )))
            }
        };

        if let Some(bytes) = &data_bytes {
            header.data_length = Some(bytes.len());
        }
        if let Some(payload) = &event.payload {
            header.payload_length = Some(payload.len());
        }

        let mut bytes = serde_json::to_vec(&header)
            .map_err(|e| ProtocolError::Encode(format!("unserializable header: {}", e)))?;
        bytes.push(NEWLINE);

        if let Some(data) = data_bytes {
            bytes.extend_from_slice(&data);
        }
        if let Some(payload) = &event.payload {
            bytes.extend_from_slice(payload);
        }

        Ok(bytes)
    }

    /// Discard buffered bytes and any partially decoded event
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.offset = 0;
        self.state = DecodeState::AwaitingHeader;
        self.pending = None;
        self.expected_data_length = 0;
        self.expected_payload_length = 0;
    }

    /// Number of received bytes not yet turned into an event section
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() - self.offset
    }

    fn available(&self) -> &[u8] {
        &self.buffer[self.offset..]
    }

    fn consume(&mut self, count: usize) {
        self.offset += count;

        if self.offset == self.buffer.len() {
            self.buffer.clear();
            self.offset = 0;
        } else if self.offset >= COMPACT_THRESHOLD {
            self.buffer.drain(..self.offset);
            self.offset = 0;
        }
    }

    fn finish_event(&mut self) -> Option<Event> {
        self.state = DecodeState::AwaitingHeader;
        self.expected_data_length = 0;
        self.expected_payload_length = 0;

        let event = self.pending.take();
        if let Some(event) = &event {
            debug!(
                "Decoded '{}' event ({} payload bytes)",
                event.event_type(),
                event.payload.as_ref().map_or(0, Vec::len)
            );
        }
        event
    }
}

/// Lazy sequence of events produced by [`EventCodec::decode`].
///
/// Ends when the buffered bytes run out, or right after yielding an error.
#[must_use = "events are only parsed as the sequence is advanced; use `feed` to just buffer"]
pub struct Decoded<'a> {
    codec: &'a mut EventCodec,
    failed: bool,
}

impl Iterator for Decoded<'_> {
    type Item = Result<Event, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        match self.codec.next_event() {
            Ok(event) => event.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn parse_header(bytes: &[u8]) -> Result<Header, ProtocolError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| ProtocolError::Decode(format!("malformed event header: {}", e)))?;

    if !value.is_object() {
        return Err(ProtocolError::Decode(format!(
            "event header must be a JSON object, got {}",
            json_kind(&value)
        )));
    }

    serde_json::from_value(value)
        .map_err(|e| ProtocolError::Decode(format!("invalid event header: {}", e)))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
