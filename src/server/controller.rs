//! Per-connection session.
//!
//! A [`Controller`] turns decoded events from one connection into handler
//! calls and writes the replies back to that connection. Transcription runs
//! in its own task so audio keeps flowing into the session queue while the
//! handler works.

use super::handler::{
    collect_audio, AudioChunk, AudioStream, ResolvedHandlers, StreamingTranscriber, Transcriber,
    TranscriptionMode,
};
use crate::connectable::{BusEvent, EventBus};
use crate::connection::Connection;
use crate::error::{HandlerError, Result, WyomingError};
use futures_util::StreamExt;
use serde_json::Value;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use wyoming_protocol::{
    AudioChunkData, Event, EventType, Eventable, Info, Ping, Pong, Transcribe, Transcript,
    TranscriptStart, TranscriptStop,
};

struct TranscriptionSession {
    /// Dropped on `audio-stop`, which ends the handler's audio stream
    input: Option<mpsc::UnboundedSender<AudioChunk>>,
    task: JoinHandle<()>,
}

pub struct Controller {
    connection: Connection,
    handlers: ResolvedHandlers,
    session: Option<TranscriptionSession>,
    /// Superseded sessions still finishing with the audio they were given
    retired: Vec<JoinHandle<()>>,
    info: Option<Info>,
    bus: EventBus,
    handler_timeout: Option<Duration>,
}

impl Controller {
    /// `bus` receives `error` events from transcription sessions
    pub fn new(
        connection: Connection,
        handlers: ResolvedHandlers,
        bus: EventBus,
        handler_timeout: Option<Duration>,
    ) -> Self {
        Self {
            connection,
            handlers,
            session: None,
            retired: Vec::new(),
            info: None,
            bus,
            handler_timeout,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Last capability snapshot sent in reply to `describe`
    pub fn info(&self) -> Option<&Info> {
        self.info.as_ref()
    }

    /// Dispatch one event. Event types without a handler here are ignored.
    pub async fn handle(&mut self, event: Event) -> Result<()> {
        let Ok(event_type) = EventType::from_str(event.event_type()) else {
            log::debug!(
                "[{}] Ignoring unknown event type '{}'",
                self.connection.id(),
                event.event_type()
            );
            return Ok(());
        };

        match event_type {
            EventType::Ping => self.handle_ping(&event).await,
            EventType::Describe => self.handle_describe().await,
            EventType::Transcribe => self.handle_transcribe(&event),
            EventType::AudioChunk => self.handle_audio_chunk(&event),
            EventType::AudioStop => {
                self.close_input();
                Ok(())
            }
            other => {
                log::debug!("[{}] No handling for '{}'", self.connection.id(), other);
                Ok(())
            }
        }
    }

    async fn handle_ping(&mut self, event: &Event) -> Result<()> {
        let ping = Ping::from_event(event)?;
        let text = match &self.handlers.ping {
            Some(handler) => {
                run_handler(self.handler_timeout, "ping", handler.ping(ping.text)).await?
            }
            None => ping.text,
        };
        self.connection.send(&Pong { text }.to_event()?)
    }

    async fn handle_describe(&mut self) -> Result<()> {
        let info = match &self.handlers.describe {
            Some(handler) => {
                run_handler(self.handler_timeout, "describe", handler.describe()).await?
            }
            None => Info::default(),
        };
        let event = info.to_event()?;
        self.info = Some(info);
        self.connection.send(&event)
    }

    fn handle_transcribe(&mut self, event: &Event) -> Result<()> {
        let request = Transcribe::from_event(event)?;
        self.retire_session();

        let Some(mode) = self.handlers.transcription.clone() else {
            log::warn!(
                "⚠️ [{}] Transcription requested but no transcriber is configured",
                self.connection.id()
            );
            return Ok(());
        };

        log::info!(
            "📝 [{}] Transcription started (language: {:?})",
            self.connection.id(),
            request.language
        );

        let (input, queued) = mpsc::unbounded_channel();
        let audio: AudioStream = Box::pin(UnboundedReceiverStream::new(queued));
        let task = tokio::spawn(run_session(
            mode,
            audio,
            request,
            self.connection.clone(),
            self.bus.clone(),
            self.handler_timeout,
        ));

        self.session = Some(TranscriptionSession {
            input: Some(input),
            task,
        });
        Ok(())
    }

    fn handle_audio_chunk(&mut self, event: &Event) -> Result<()> {
        let Some(input) = self.session.as_ref().and_then(|s| s.input.as_ref()) else {
            log::debug!(
                "[{}] Dropping audio chunk, no transcription in progress",
                self.connection.id()
            );
            return Ok(());
        };

        let (data, audio) = AudioChunkData::from_event(event)?;
        let chunk = AudioChunk {
            format: data.format,
            timestamp: data.timestamp,
            audio,
        };
        if input.send(chunk).is_err() {
            log::warn!(
                "⚠️ [{}] Dropping audio chunk, transcriber stopped listening",
                self.connection.id()
            );
        }
        Ok(())
    }

    fn close_input(&mut self) {
        if let Some(session) = self.session.as_mut() {
            if session.input.take().is_some() {
                log::debug!("[{}] End of audio", self.connection.id());
            }
        }
    }

    /// Close the active session's input and let its handler run to completion
    fn retire_session(&mut self) {
        self.retired.retain(|task| !task.is_finished());
        if let Some(session) = self.session.take() {
            drop(session.input);
            log::debug!("[{}] Transcription superseded", self.connection.id());
            self.retired.push(session.task);
        }
    }

    /// Cancel every transcription task, finished or not. Used on disconnect.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.task.abort();
            drop(session.input);
        }
        for task in self.retired.drain(..) {
            task.abort();
        }
    }

    #[cfg(test)]
    async fn join_session(&mut self) {
        for task in std::mem::take(&mut self.retired) {
            let _ = task.await;
        }
        if let Some(session) = self.session.take() {
            drop(session.input);
            let _ = session.task.await;
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_handler<T, F>(timeout: Option<Duration>, name: &str, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, HandlerError>>,
{
    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
            WyomingError::Handler(format!("{} handler timed out after {:?}", name, limit))
        })?,
        None => call.await,
    };
    outcome.map_err(|e| WyomingError::Handler(format!("{} handler failed: {}", name, e)))
}

async fn run_session(
    mode: TranscriptionMode,
    audio: AudioStream,
    request: Transcribe,
    connection: Connection,
    bus: EventBus,
    timeout: Option<Duration>,
) {
    let result = match mode {
        TranscriptionMode::Streaming(handler) => {
            stream_transcript(handler, audio, request, &connection, timeout).await
        }
        TranscriptionMode::Buffered(handler) => {
            buffered_transcript(handler, audio, request, &connection, timeout).await
        }
    };

    if let Err(e) = result {
        log::warn!("⚠️ [{}] Transcription failed: {}", connection.id(), e);
        bus.emit(&BusEvent::Error(e));
    }
}

async fn buffered_transcript(
    handler: Arc<dyn Transcriber>,
    audio: AudioStream,
    request: Transcribe,
    connection: &Connection,
    timeout: Option<Duration>,
) -> Result<()> {
    let Some(audio) = collect_audio(audio).await else {
        log::debug!("[{}] No audio received, skipping transcription", connection.id());
        return Ok(());
    };

    log::info!(
        "📝 [{}] Transcribing {} bytes of audio",
        connection.id(),
        audio.audio.len()
    );
    let transcript = run_handler(timeout, "transcribe", handler.transcribe(audio, request)).await?;

    if let Some(transcript) = transcript {
        log::info!("✨ [{}] Transcript: \"{}\"", connection.id(), transcript.text);
        connection.send(&transcript.to_event()?)?;
    }
    Ok(())
}

async fn stream_transcript(
    handler: Arc<dyn StreamingTranscriber>,
    audio: AudioStream,
    request: Transcribe,
    connection: &Connection,
    timeout: Option<Duration>,
) -> Result<()> {
    let mut chunks = run_handler(
        timeout,
        "transcribe_stream",
        handler.transcribe_stream(audio, request),
    )
    .await?;

    let mut transcript: Option<Transcript> = None;
    while let Some(chunk) = chunks.next().await {
        if transcript.is_none() {
            let start = TranscriptStart {
                language: chunk.language.clone(),
                context: chunk.context.clone(),
            };
            connection.send(&start.to_event()?)?;
        }
        connection.send(&chunk.to_event()?)?;

        let running = transcript.get_or_insert_with(Transcript::default);
        running.text.push_str(&chunk.text);
        if chunk.language.is_some() {
            running.language = chunk.language;
        }
        running.context = merge_context(running.context.take(), chunk.context);
    }

    if let Some(transcript) = transcript {
        log::info!("✨ [{}] Transcript: \"{}\"", connection.id(), transcript.text);
        connection.send(&transcript.to_event()?)?;
        connection.send(&TranscriptStop::default().to_event()?)?;
    }
    Ok(())
}

/// Shallow merge of two context objects; keys from `update` win
fn merge_context(current: Option<Value>, update: Option<Value>) -> Option<Value> {
    match (current, update) {
        (Some(Value::Object(mut base)), Some(Value::Object(update))) => {
            base.extend(update);
            Some(Value::Object(base))
        }
        (current, None) => current,
        (_, update) => update,
    }
}
