//! # Wyoming Protocol
//!
//! Event framing and catalog for the Wyoming voice assistant protocol.
//!
//! This crate provides:
//! - The event model (JSON header, optional JSON data, optional raw payload)
//! - An incremental codec that turns a byte stream into events and back
//! - The catalog of known event types and typed data for the common ones
//! - A small blocking client for one-shot requests
//!
//! Every event on the wire looks like this:
//!
//! ```text
//! {"type":"audio-chunk","data_length":43,"payload_length":2048}\n
//! {"rate":16000,"width":2,"channels":1}<2048 raw PCM bytes>
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use wyoming_protocol::{Event, EventCodec};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), wyoming_protocol::ProtocolError> {
//! let event = Event::new("ping").with_data(json!({ "text": "hello" }));
//! let bytes = EventCodec::encode(&event)?;
//!
//! let mut codec = EventCodec::new();
//! let decoded: Vec<Event> = codec.decode(&bytes).collect::<Result<_, _>>()?;
//! assert_eq!(decoded[0].event_type(), "ping");
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod client;
pub mod codec;
pub mod event;

// Re-export commonly used types
pub use catalog::{
    AsrProgram, AudioChunkData, AudioFormat, AudioStart, AudioStop, Describe, EventType,
    Eventable, Info, Ping, Pong, Transcribe, Transcript, TranscriptChunk, TranscriptStart,
    TranscriptStop,
};
pub use client::WyomingClient;
pub use codec::{Decoded, EventCodec};
pub use event::{Event, Header, ProtocolError};
