//! Catalog of Wyoming event types and the data carried by the common ones.
//!
//! Only the events a server interprets get a typed shape here; everything
//! else travels as an opaque [`Event`].

use crate::event::{Event, ProtocolError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Every event type known to the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum EventType {
    // Audio
    AudioChunk,
    AudioStart,
    AudioStop,

    // Info
    Describe,
    Info,

    // Speech to text
    Transcribe,
    Transcript,
    TranscriptStart,
    TranscriptChunk,
    TranscriptStop,

    // Text to speech
    Synthesize,
    SynthesizeStart,
    SynthesizeChunk,
    SynthesizeStop,
    SynthesizeStopped,

    // Wake word
    Detect,
    Detection,
    NotDetected,

    // Voice activity
    VoiceStarted,
    VoiceStopped,

    // Intent recognition
    Recognize,
    Intent,
    NotRecognized,

    // Intent handling
    Handled,
    NotHandled,
    HandledStart,
    HandledChunk,
    HandledStop,

    // Audio output
    Played,

    // Satellite
    RunSatellite,
    PauseSatellite,
    SatelliteConnected,
    SatelliteDisconnected,
    StreamingStarted,
    StreamingStopped,
    RunPipeline,

    // Timers
    TimerStarted,
    TimerUpdated,
    TimerCancelled,
    TimerFinished,

    // Health check
    Ping,
    Pong,
}

impl EventType {
    /// Wire name of this event type
    pub fn as_str(&self) -> &'static str {
        (*self).into()
    }

    /// Whether events of this type may carry a raw payload
    pub fn allows_payload(&self) -> bool {
        matches!(self, EventType::AudioChunk)
    }
}

/// Typed data that converts to and from an [`Event`]
pub trait Eventable: Sized {
    const EVENT_TYPE: EventType;

    fn to_event(&self) -> Result<Event, ProtocolError>;

    fn from_event(event: &Event) -> Result<Self, ProtocolError>;

    /// Whether `event` has this shape's type tag
    fn is_type(event: &Event) -> bool {
        event.event_type() == Self::EVENT_TYPE.as_str()
    }
}

fn data_event<T: Serialize>(event_type: EventType, data: &T) -> Result<Event, ProtocolError> {
    Ok(Event::new(event_type.as_str()).with_data(serde_json::to_value(data)?))
}

fn expect_type(event: &Event, expected: EventType) -> Result<(), ProtocolError> {
    if event.event_type() == expected.as_str() {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedType {
            expected: expected.to_string(),
            actual: event.event_type().to_string(),
        })
    }
}

fn parse_typed<T: DeserializeOwned>(
    event: &Event,
    expected: EventType,
) -> Result<T, ProtocolError> {
    expect_type(event, expected)?;
    event.parse_data()
}

/// Implements [`Eventable`] for a shape that is sent as a JSON data block
macro_rules! data_eventable {
    ($shape:ty, $event_type:expr) => {
        impl Eventable for $shape {
            const EVENT_TYPE: EventType = $event_type;

            fn to_event(&self) -> Result<Event, ProtocolError> {
                data_event(Self::EVENT_TYPE, self)
            }

            fn from_event(event: &Event) -> Result<Self, ProtocolError> {
                parse_typed(event, Self::EVENT_TYPE)
            }
        }
    };
}

// Audio

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in hertz
    pub rate: u32,
    /// Bytes per sample
    pub width: u16,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            rate: 16000,
            width: 2,
            channels: 1,
        }
    }
}

/// Audio chunk header data; the samples travel in the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioChunkData {
    #[serde(flatten)]
    pub format: AudioFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl AudioChunkData {
    pub fn to_event(&self, audio: Vec<u8>) -> Result<Event, ProtocolError> {
        Ok(data_event(EventType::AudioChunk, self)?.with_payload(audio))
    }

    /// Parse the data section and take the audio payload (empty if absent)
    pub fn from_event(event: &Event) -> Result<(Self, Vec<u8>), ProtocolError> {
        let data = parse_typed(event, EventType::AudioChunk)?;
        Ok((data, event.payload.clone().unwrap_or_default()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioStart {
    #[serde(flatten)]
    pub format: AudioFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

data_eventable!(AudioStart, EventType::AudioStart);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioStop {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

data_eventable!(AudioStop, EventType::AudioStop);

// Info

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Describe {}

data_eventable!(Describe, EventType::Describe);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    pub name: String,
    pub url: String,
}

/// Common description of an installable model or program
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub attribution: Attribution,
    pub installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A model that supports a set of languages (asr, handle, wake, intent)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    #[serde(flatten)]
    pub artifact: Artifact,
    #[serde(default)]
    pub languages: Vec<String>,
    /// Wake word phrase, only used by wake models
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phrase: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AsrProgram {
    #[serde(flatten)]
    pub artifact: Artifact,
    #[serde(default)]
    pub models: Vec<Model>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_transcript_streaming: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TtsVoiceSpeaker {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TtsVoice {
    #[serde(flatten)]
    pub artifact: Artifact,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speakers: Option<Vec<TtsVoiceSpeaker>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TtsProgram {
    #[serde(flatten)]
    pub artifact: Artifact,
    #[serde(default)]
    pub voices: Vec<TtsVoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_synthesize_streaming: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandleProgram {
    #[serde(flatten)]
    pub artifact: Artifact,
    #[serde(default)]
    pub models: Vec<Model>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_handled_streaming: Option<bool>,
}

/// Program exposing plain language models (wake and intent)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelProgram {
    #[serde(flatten)]
    pub artifact: Artifact,
    #[serde(default)]
    pub models: Vec<Model>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicProgram {
    #[serde(flatten)]
    pub artifact: Artifact,
    pub mic_format: AudioFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SndProgram {
    #[serde(flatten)]
    pub artifact: Artifact,
    pub snd_format: AudioFormat,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Satellite {
    #[serde(flatten)]
    pub artifact: Artifact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_vad: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_wake_words: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_active_wake_words: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_trigger: Option<bool>,
}

/// Capability snapshot returned in response to `describe`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Info {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asr: Vec<AsrProgram>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tts: Vec<TtsProgram>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handle: Vec<HandleProgram>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intent: Vec<ModelProgram>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wake: Vec<ModelProgram>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mic: Vec<MicProgram>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snd: Vec<SndProgram>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satellite: Option<Satellite>,
}

data_eventable!(Info, EventType::Info);

// Speech to text

/// Request to transcribe the audio stream that follows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcribe {
    /// Model name to use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

data_eventable!(Transcribe, EventType::Transcribe);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

data_eventable!(Transcript, EventType::Transcript);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptStart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

data_eventable!(TranscriptStart, EventType::TranscriptStart);

/// One piece of a streamed transcript
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptChunk {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl TranscriptChunk {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

data_eventable!(TranscriptChunk, EventType::TranscriptChunk);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptStop {}

data_eventable!(TranscriptStop, EventType::TranscriptStop);

// Health check

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

data_eventable!(Ping, EventType::Ping);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

data_eventable!(Pong, EventType::Pong);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EventCodec;
    use serde_json::json;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(EventType::AudioChunk.to_string(), "audio-chunk");
        assert_eq!(EventType::TranscriptStart.as_str(), "transcript-start");
        assert_eq!(EventType::SatelliteDisconnected.as_str(), "satellite-disconnected");
        assert_eq!(
            EventType::from_str("timer-cancelled").unwrap(),
            EventType::TimerCancelled
        );
        assert!(EventType::from_str("not-a-real-event").is_err());
    }

    #[test]
    fn test_every_wire_name_parses_back() {
        for event_type in EventType::iter() {
            assert_eq!(EventType::from_str(event_type.as_str()).unwrap(), event_type);
        }
        assert_eq!(EventType::iter().count(), 42);
    }

    #[test]
    fn test_only_audio_chunk_allows_payload() {
        let with_payload: Vec<EventType> =
            EventType::iter().filter(EventType::allows_payload).collect();
        assert_eq!(with_payload, vec![EventType::AudioChunk]);
    }

    #[test]
    fn test_default_info_is_empty_object() {
        let event = Info::default().to_event().unwrap();
        assert_eq!(event.event_type(), "info");
        assert_eq!(event.data, Some(json!({})));
    }

    #[test]
    fn test_audio_chunk_flattens_format() {
        let data = AudioChunkData {
            format: AudioFormat {
                rate: 22050,
                width: 2,
                channels: 2,
            },
            timestamp: Some(40),
        };
        let event = data.to_event(vec![1, 2, 3, 4]).unwrap();
        assert_eq!(
            event.data,
            Some(json!({ "rate": 22050, "width": 2, "channels": 2, "timestamp": 40 }))
        );

        let (parsed, audio) = AudioChunkData::from_event(&event).unwrap();
        assert_eq!(parsed, data);
        assert_eq!(audio, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_info_with_asr_program_survives_the_wire() {
        let info = Info {
            asr: vec![AsrProgram {
                artifact: Artifact {
                    name: "faster-whisper".to_string(),
                    attribution: Attribution {
                        name: "Systran".to_string(),
                        url: "https://github.com/SYSTRAN/faster-whisper".to_string(),
                    },
                    installed: true,
                    description: None,
                    version: Some("1.0".to_string()),
                },
                models: vec![Model {
                    artifact: Artifact {
                        name: "tiny-int8".to_string(),
                        installed: true,
                        ..Default::default()
                    },
                    languages: vec!["en".to_string()],
                    phrase: None,
                }],
                supports_transcript_streaming: Some(true),
            }],
            ..Default::default()
        };

        let bytes = EventCodec::encode(&info.to_event().unwrap()).unwrap();
        let mut codec = EventCodec::new();
        let event = codec.decode(&bytes).next().unwrap().unwrap();

        assert_eq!(Info::from_event(&event).unwrap(), info);
    }

    #[test]
    fn test_from_event_checks_type() {
        let event = Pong {
            text: Some("x".to_string()),
        }
        .to_event()
        .unwrap();

        let err = Ping::from_event(&event).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedType { .. }));
        assert!(Pong::is_type(&event));
    }

    #[test]
    fn test_transcribe_fields_are_optional() {
        let parsed = Transcribe::from_event(&Event::new("transcribe")).unwrap();
        assert_eq!(parsed, Transcribe::default());

        let event = Event::new("transcribe").with_data(json!({ "language": "nl" }));
        let parsed = Transcribe::from_event(&event).unwrap();
        assert_eq!(parsed.language.as_deref(), Some("nl"));
    }
}
