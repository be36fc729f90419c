//! Observable session state
//!
//! The protocol engine is the only writer. Observers subscribe to watch
//! channels for the latest value of each field and to a broadcast channel
//! for diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use super::{Command, FrameError, Measurement};

/// Events reported on the diagnostics channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A frame could not be classified and was dropped
    MalformedFrame {
        /// Hex rendering of the frame
        raw: String,
        /// Why it was rejected
        reason: FrameError,
    },
    /// Bytes skipped while looking for a frame header
    DiscardedBytes {
        /// Hex rendering of the skipped bytes
        raw: String,
    },
    /// A status code missing from the status table
    UnknownStatusCode {
        /// The code as received
        code: String,
    },
    /// A command could not be written
    WriteFailed {
        /// The command being sent
        command: Command,
        /// Error text
        error: String,
    },
    /// The read loop stopped on an error or end of stream
    StreamError {
        /// Error text
        error: String,
    },
}

/// Snapshot of link counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    /// Bytes written to the sensor
    pub bytes_sent: u64,
    /// Bytes read from the sensor
    pub bytes_received: u64,
    /// Commands written successfully
    pub commands_sent: u64,
    /// Frames handed to the classifier
    pub frames_received: u64,
    /// Frames rejected by the classifier
    pub frames_malformed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    commands_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_malformed: AtomicU64,
}

/// Latest values published by the protocol engine
#[derive(Debug)]
pub struct Session {
    raw_frame: watch::Sender<String>,
    status_message: watch::Sender<String>,
    measurement: watch::Sender<Option<Measurement>>,
    diagnostics: broadcast::Sender<Diagnostic>,
    counters: Counters,
}

impl Session {
    /// Create a session whose diagnostics channel buffers `diagnostics_capacity` events
    pub fn new(diagnostics_capacity: usize) -> Self {
        let (diagnostics, _) = broadcast::channel(diagnostics_capacity.max(1));
        Self {
            raw_frame: watch::Sender::new(String::new()),
            status_message: watch::Sender::new(String::new()),
            measurement: watch::Sender::new(None),
            diagnostics,
            counters: Counters::default(),
        }
    }

    /// Clear all values, keeping subscribers attached
    pub fn reset(&self) {
        self.raw_frame.send_replace(String::new());
        self.status_message.send_replace(String::new());
        self.measurement.send_replace(None);
        for counter in [
            &self.counters.bytes_sent,
            &self.counters.bytes_received,
            &self.counters.commands_sent,
            &self.counters.frames_received,
            &self.counters.frames_malformed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Subscribe to the last raw frame, as space separated hex
    pub fn subscribe_raw_frame(&self) -> watch::Receiver<String> {
        self.raw_frame.subscribe()
    }

    /// Subscribe to the last status or error description
    pub fn subscribe_status(&self) -> watch::Receiver<String> {
        self.status_message.subscribe()
    }

    /// Subscribe to the last measurement
    pub fn subscribe_measurement(&self) -> watch::Receiver<Option<Measurement>> {
        self.measurement.subscribe()
    }

    /// Subscribe to diagnostic events
    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.diagnostics.subscribe()
    }

    /// Last raw frame
    pub fn raw_frame(&self) -> String {
        self.raw_frame.borrow().clone()
    }

    /// Last status or error description
    pub fn status_message(&self) -> String {
        self.status_message.borrow().clone()
    }

    /// Last measurement, if any arrived since the session was opened
    pub fn measurement(&self) -> Option<Measurement> {
        *self.measurement.borrow()
    }

    /// Current counter values
    pub fn stats(&self) -> LinkStats {
        let c = &self.counters;
        LinkStats {
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            commands_sent: c.commands_sent.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            frames_malformed: c.frames_malformed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn publish_raw_frame(&self, raw: String) {
        self.raw_frame.send_replace(raw);
    }

    pub(crate) fn publish_status(&self, message: String) {
        self.status_message.send_replace(message);
    }

    pub(crate) fn publish_measurement(&self, measurement: Measurement) {
        self.measurement.send_replace(Some(measurement));
    }

    pub(crate) fn report(&self, diagnostic: Diagnostic) {
        if let Diagnostic::MalformedFrame { .. } = diagnostic {
            self.counters.frames_malformed.fetch_add(1, Ordering::Relaxed);
        }
        // No subscribers is fine
        let _ = self.diagnostics.send(diagnostic);
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.counters
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.counters.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.counters
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_frame(&self) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(64)
    }
}
