//! Pluggable handler contract.
//!
//! A [`HandlerSet`] bundles the optional capabilities a service offers.
//! The server resolves one set per connection through a [`HandlerSource`].

use crate::connection::Connection;
use crate::error::HandlerError;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use wyoming_protocol::{AudioFormat, Info, Transcribe, Transcript, TranscriptChunk};

/// One piece of inbound audio, format and samples together
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub format: AudioFormat,
    pub timestamp: Option<u64>,
    pub audio: Vec<u8>,
}

/// Audio fed to a streaming transcriber, ends at `audio-stop`
pub type AudioStream = Pin<Box<dyn Stream<Item = AudioChunk> + Send>>;

/// Transcript pieces produced by a streaming transcriber
pub type TranscriptStream = Pin<Box<dyn Stream<Item = TranscriptChunk> + Send>>;

#[async_trait]
pub trait PingHandler: Send + Sync {
    /// Transform the ping text into the pong text
    async fn ping(&self, text: Option<String>) -> Result<Option<String>, HandlerError>;
}

#[async_trait]
pub trait DescribeHandler: Send + Sync {
    async fn describe(&self) -> Result<Info, HandlerError>;
}

/// Transcribes a complete recording in one call
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio: AudioChunk,
        request: Transcribe,
    ) -> Result<Option<Transcript>, HandlerError>;
}

/// Transcribes audio while it is still arriving
#[async_trait]
pub trait StreamingTranscriber: Send + Sync {
    async fn transcribe_stream(
        &self,
        audio: AudioStream,
        request: Transcribe,
    ) -> Result<TranscriptStream, HandlerError>;
}

/// Handlers available to one connection
#[derive(Clone, Default)]
pub struct HandlerSet {
    pub ping: Option<Arc<dyn PingHandler>>,
    pub describe: Option<Arc<dyn DescribeHandler>>,
    pub transcribe: Option<Arc<dyn Transcriber>>,
    pub transcribe_stream: Option<Arc<dyn StreamingTranscriber>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ping(mut self, handler: impl PingHandler + 'static) -> Self {
        self.ping = Some(Arc::new(handler));
        self
    }

    pub fn with_describe(mut self, handler: impl DescribeHandler + 'static) -> Self {
        self.describe = Some(Arc::new(handler));
        self
    }

    pub fn with_transcriber(mut self, handler: impl Transcriber + 'static) -> Self {
        self.transcribe = Some(Arc::new(handler));
        self
    }

    pub fn with_streaming_transcriber(
        mut self,
        handler: impl StreamingTranscriber + 'static,
    ) -> Self {
        self.transcribe_stream = Some(Arc::new(handler));
        self
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("ping", &self.ping.is_some())
            .field("describe", &self.describe.is_some())
            .field("transcribe", &self.transcribe.is_some())
            .field("transcribe_stream", &self.transcribe_stream.is_some())
            .finish()
    }
}

/// Builds a handler set per connection.
///
/// `construct` is tried first; when it fails, `create` is used instead.
#[async_trait]
pub trait HandlerFactory: Send + Sync {
    fn construct(&self, _connection: &Connection) -> Result<HandlerSet, HandlerError> {
        Err("handler factory does not support construction".into())
    }

    async fn create(&self, connection: &Connection) -> Result<HandlerSet, HandlerError>;
}

/// Adapts an async closure into a [`HandlerFactory`]
pub struct FnFactory<F>(pub F);

#[async_trait]
impl<F, Fut> HandlerFactory for FnFactory<F>
where
    F: Fn(Connection) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerSet, HandlerError>> + Send,
{
    async fn create(&self, connection: &Connection) -> Result<HandlerSet, HandlerError> {
        (self.0)(connection.clone()).await
    }
}

/// Where a connection's handlers come from
#[derive(Clone)]
pub enum HandlerSource {
    /// The same handlers for every connection
    Fixed(HandlerSet),
    Factory(Arc<dyn HandlerFactory>),
}

impl HandlerSource {
    pub fn factory(factory: impl HandlerFactory + 'static) -> Self {
        HandlerSource::Factory(Arc::new(factory))
    }

    pub async fn resolve(&self, connection: &Connection) -> Result<ResolvedHandlers, HandlerError> {
        let set = match self {
            HandlerSource::Fixed(set) => set.clone(),
            HandlerSource::Factory(factory) => match factory.construct(connection) {
                Ok(set) => set,
                Err(e) => {
                    log::debug!(
                        "[{}] Handler construction failed ({}), calling factory",
                        connection.id(),
                        e
                    );
                    factory.create(connection).await?
                }
            },
        };
        Ok(ResolvedHandlers::from(set))
    }
}

impl From<HandlerSet> for HandlerSource {
    fn from(set: HandlerSet) -> Self {
        HandlerSource::Fixed(set)
    }
}

/// How transcription requests are served
#[derive(Clone)]
pub enum TranscriptionMode {
    /// Chunks go to the handler as they arrive; output is streamed back
    Streaming(Arc<dyn StreamingTranscriber>),
    /// Audio is collected until `audio-stop`, then transcribed once
    Buffered(Arc<dyn Transcriber>),
}

/// A handler set after resolution, ready for a controller
#[derive(Clone, Default)]
pub struct ResolvedHandlers {
    pub ping: Option<Arc<dyn PingHandler>>,
    pub describe: Option<Arc<dyn DescribeHandler>>,
    pub transcription: Option<TranscriptionMode>,
}

impl From<HandlerSet> for ResolvedHandlers {
    fn from(set: HandlerSet) -> Self {
        let transcription = match (set.transcribe_stream, set.transcribe) {
            (Some(streaming), _) => Some(TranscriptionMode::Streaming(streaming)),
            (None, Some(buffered)) => Some(TranscriptionMode::Buffered(buffered)),
            (None, None) => None,
        };
        Self {
            ping: set.ping,
            describe: set.describe,
            transcription,
        }
    }
}

/// Drain `audio` into one chunk: payloads concatenated in order, format of
/// the first chunk. `None` if the stream ended without audio.
pub async fn collect_audio(mut audio: AudioStream) -> Option<AudioChunk> {
    let mut collected: Option<AudioChunk> = None;
    while let Some(chunk) = audio.next().await {
        match collected.as_mut() {
            Some(buffer) => buffer.audio.extend_from_slice(&chunk.audio),
            None => collected = Some(chunk),
        }
    }
    collected
}
