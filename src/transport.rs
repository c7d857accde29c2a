//! Transport layer toward the slicing engine.
//!
//! Abstracts the engine connection for testability. Provides:
//! - `MessageSink` trait: fire-and-forget message transmission
//! - `RecordingSink`: in-process sink capturing messages for tests
//! - `JsonLineSink`: envelope-per-line writer for streams and files

use std::io::Write;
use std::sync::Mutex;

use slicebridge_proto::{Envelope, EngineMessage, ProtoError};

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),
}

/// Fire-and-forget message transmission toward the engine.
pub trait MessageSink: Send + Sync {
    /// Transmit one message.
    fn send(&self, message: EngineMessage) -> Result<(), TransportError>;
}

/// In-process sink that records every sent message.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<EngineMessage>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the messages sent so far, in order.
    pub fn sent(&self) -> Vec<EngineMessage> {
        self.messages.lock().expect("recording sink poisoned").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.messages.lock().expect("recording sink poisoned").len()
    }
}

impl MessageSink for RecordingSink {
    fn send(&self, message: EngineMessage) -> Result<(), TransportError> {
        self.messages
            .lock()
            .expect("recording sink poisoned")
            .push(message);
        Ok(())
    }
}

/// Writes one JSON envelope per line to the wrapped writer.
pub struct JsonLineSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLineSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Consume the sink and return the writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner().expect("json line sink poisoned")
    }
}

impl<W: Write + Send> MessageSink for JsonLineSink<W> {
    fn send(&self, message: EngineMessage) -> Result<(), TransportError> {
        let line = Envelope::from_message(&message)?.to_json_line()?;
        let mut writer = self.writer.lock().expect("json line sink poisoned");
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }
}
