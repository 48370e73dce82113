//! Outbound command writer and its audit trail.

use std::io::Write;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapters::SerialIo;
use crate::error::SendError;
use crate::protocol;

/// A command that was written to the device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRecord {
    /// Command text without terminator
    pub text: String,
    /// When the write completed
    pub timestamp: DateTime<Utc>,
}

/// Writes command lines and keeps an append-only record of them.
///
/// The caller supplies the writer; `LinkManager` does so while holding the
/// connection's writer lock, which `disconnect` also takes before closing.
#[derive(Debug, Default)]
pub struct CommandSender {
    history: Mutex<Vec<OutboundRecord>>,
}

impl CommandSender {
    /// Create a sender with an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    fn history_lock(&self) -> MutexGuard<'_, Vec<OutboundRecord>> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write `text` plus a line terminator to `writer` and flush.
    pub fn send(&self, writer: &mut dyn SerialIo, text: &str) -> Result<OutboundRecord, SendError> {
        let bytes = protocol::encode_command(text).ok_or(SendError::Empty)?;
        writer.write_all(&bytes)?;
        writer.flush()?;

        let record = OutboundRecord {
            text: text.trim().to_string(),
            timestamp: Utc::now(),
        };
        debug!("Sent command: {}", record.text);
        self.history_lock().push(record.clone());
        Ok(record)
    }

    /// Every command sent so far, oldest first.
    pub fn history(&self) -> Vec<OutboundRecord> {
        self.history_lock().clone()
    }
}
