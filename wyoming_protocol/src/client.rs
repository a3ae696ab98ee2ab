use crate::catalog::{Describe, Eventable, Info, Ping, Pong};
use crate::codec::EventCodec;
use crate::event::{Event, ProtocolError};
use log::{debug, info, warn};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const READ_CHUNK_SIZE: usize = 8192;

/// Blocking TCP client for one-shot Wyoming requests
pub struct WyomingClient {
    stream: TcpStream,
    codec: EventCodec,
    server_address: String,
}

impl WyomingClient {
    /// Connect to a Wyoming server
    pub fn connect(address: &str) -> Result<Self, ProtocolError> {
        info!("📡 Connecting to Wyoming server at {}", address);

        let stream = TcpStream::connect(address)?;
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;

        info!("✅ Connected to Wyoming server");

        Ok(WyomingClient {
            stream,
            codec: EventCodec::new(),
            server_address: address.to_string(),
        })
    }

    /// Write a single event
    pub fn write_event(&mut self, event: &Event) -> Result<(), ProtocolError> {
        debug!("📤 Sending '{}' event", event.event_type());
        let bytes = EventCodec::encode(event)?;
        self.stream.write_all(&bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Read the next event (blocking)
    /// Returns `None` if the server closed the connection
    pub fn read_event(&mut self) -> Result<Option<Event>, ProtocolError> {
        let mut buf = [0u8; READ_CHUNK_SIZE];

        loop {
            if let Some(event) = self.codec.next_event()? {
                debug!("📥 Received '{}' event", event.event_type());
                return Ok(Some(event));
            }

            match self.stream.read(&mut buf) {
                Ok(0) => {
                    info!("🔌 Connection closed by server");
                    return Ok(None);
                }
                Ok(n) => self.codec.feed(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read events until one of type `T` arrives, skipping anything else
    pub fn read_until<T: Eventable>(&mut self) -> Result<Option<T>, ProtocolError> {
        while let Some(event) = self.read_event()? {
            if T::is_type(&event) {
                return T::from_event(&event).map(Some);
            }
            warn!(
                "⚠️ Skipping '{}' event while waiting for '{}'",
                event.event_type(),
                T::EVENT_TYPE
            );
        }
        Ok(None)
    }

    /// Send a ping and wait for the matching pong
    pub fn ping(&mut self, text: Option<String>) -> Result<Option<Pong>, ProtocolError> {
        self.write_event(&Ping { text }.to_event()?)?;
        self.read_until::<Pong>()
    }

    /// Ask the server to describe its capabilities
    pub fn describe(&mut self) -> Result<Option<Info>, ProtocolError> {
        self.write_event(&Describe::default().to_event()?)?;
        self.read_until::<Info>()
    }

    /// Get the server address this client is connected to
    pub fn server_address(&self) -> &str {
        &self.server_address
    }
}
