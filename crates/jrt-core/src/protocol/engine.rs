//! Protocol engine
//!
//! Owns the open stream: writes command frames, runs the read loop and turns
//! each received frame into session updates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::frame::to_hex_string;
use super::{
    status, Command, Diagnostic, Frame, Inbound, InboundCodec, ProtocolError, Response, Session,
    STATUS_NO_ERROR,
};
use crate::config::SensorConfig;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Shared {
    /// Write half of the stream, `None` once closed
    writer: Mutex<Option<BoxedWriter>>,
    write_timeout: Duration,
    session: Arc<Session>,
    /// Cancelled once the link is unusable: end of stream, read error or a failed write
    closed: CancellationToken,
    laser_on: AtomicBool,
    continuous: AtomicBool,
}

/// Command and frame handling for one open sensor stream.
///
/// Cheap to clone; all clones drive the same stream. Writes from different
/// clones are serialized.
#[derive(Clone)]
pub struct ProtocolEngine {
    shared: Arc<Shared>,
}

/// Handle to the background read loop of a [`ProtocolEngine`]
pub struct ReadLoop {
    cancel: CancellationToken,
    closed: CancellationToken,
    task: JoinHandle<()>,
}

impl ReadLoop {
    /// Stop the read loop and wait for it to exit. A pending read is abandoned.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                warn!("read loop ended abnormally: {}", e);
            }
        }
    }

    /// Whether the loop has already exited (end of stream or read error)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Token cancelled when the link dies on its own, not when [`ReadLoop::stop`] is called
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for ReadLoop {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ProtocolEngine {
    /// Split `stream`, spawn the read loop and return the engine with its loop handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S>(stream: S, session: Arc<Session>, config: &SensorConfig) -> (Self, ReadLoop)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let closed = CancellationToken::new();
        let engine = Self {
            shared: Arc::new(Shared {
                writer: Mutex::new(Some(Box::new(writer))),
                write_timeout: config.write_timeout(),
                session,
                closed: closed.clone(),
                laser_on: AtomicBool::new(false),
                continuous: AtomicBool::new(false),
            }),
        };

        let cancel = CancellationToken::new();
        let codec = InboundCodec::new(config.reassemble_frames, config.max_payload_words);
        let task = tokio::spawn(read_loop(
            reader,
            codec,
            engine.clone(),
            cancel.clone(),
            config.read_buffer_size,
        ));

        (
            engine,
            ReadLoop {
                cancel,
                closed,
                task,
            },
        )
    }

    /// Session this engine publishes to
    pub fn session(&self) -> &Arc<Session> {
        &self.shared.session
    }

    /// Power the laser on
    pub async fn send_laser_on(&self) -> Result<(), ProtocolError> {
        self.send(Command::PowerLaserOn).await?;
        self.shared.laser_on.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Power the laser off
    pub async fn send_laser_off(&self) -> Result<(), ProtocolError> {
        self.send(Command::PowerLaserOff).await?;
        self.shared.laser_on.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Switch the laser to the opposite of its last commanded state
    pub async fn toggle_laser(&self) -> Result<bool, ProtocolError> {
        if self.is_laser_on() {
            self.send_laser_off().await?;
        } else {
            self.send_laser_on().await?;
        }
        Ok(self.is_laser_on())
    }

    /// Ask the sensor for its status register
    pub async fn request_status(&self) -> Result<(), ProtocolError> {
        self.send(Command::ReadStatus).await
    }

    /// Take one measurement
    pub async fn request_single_shot(&self) -> Result<(), ProtocolError> {
        self.send(Command::SingleShotAuto).await
    }

    /// Start continuous measurement
    pub async fn start_continuous(&self) -> Result<(), ProtocolError> {
        self.send(Command::StartContinuousAuto).await?;
        self.shared.continuous.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Stop continuous measurement
    pub async fn stop_continuous(&self) -> Result<(), ProtocolError> {
        self.send(Command::StopContinuous).await?;
        self.shared.continuous.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Start or stop continuous measurement, whichever is not active
    pub async fn toggle_continuous(&self) -> Result<bool, ProtocolError> {
        if self.is_continuous() {
            self.stop_continuous().await?;
        } else {
            self.start_continuous().await?;
        }
        Ok(self.is_continuous())
    }

    /// Whether the laser was last commanded on
    pub fn is_laser_on(&self) -> bool {
        self.shared.laser_on.load(Ordering::Relaxed)
    }

    /// Whether continuous measurement was last commanded on
    pub fn is_continuous(&self) -> bool {
        self.shared.continuous.load(Ordering::Relaxed)
    }

    /// Whether the link has died. A closed engine accepts no further commands.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    pub(crate) async fn send_handshake(&self) -> Result<(), ProtocolError> {
        self.send(Command::SetAutoBaudRate).await
    }

    /// Write one command frame.
    ///
    /// Failures are reported on the diagnostics channel and returned. A write
    /// that times out or fails part way may leave a partial frame on the wire,
    /// so it also closes the link: later sends fail with
    /// [`ProtocolError::NotConnected`] until the caller reconnects.
    pub async fn send(&self, command: Command) -> Result<(), ProtocolError> {
        let bytes = command.encode();
        match self.write_frame(bytes).await {
            Ok(()) => {
                self.shared.session.record_sent(bytes.len());
                debug!(
                    command = command.name(),
                    bytes = %to_hex_string(bytes),
                    "sent command"
                );
                Ok(())
            }
            Err(e) => {
                warn!(command = command.name(), "write failed: {}", e);
                self.shared.session.report(Diagnostic::WriteFailed {
                    command,
                    error: e.to_string(),
                });
                if !matches!(e, ProtocolError::NotConnected) {
                    self.on_stream_error(&e);
                }
                Err(e)
            }
        }
    }

    async fn write_frame(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let mut guard = self.shared.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::NotConnected)?;

        let write = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        };

        let result = match tokio::time::timeout(self.shared.write_timeout, write).await {
            Ok(result) => result.map_err(ProtocolError::from),
            Err(_) => Err(ProtocolError::WriteTimeout(self.shared.write_timeout)),
        };
        if result.is_err() {
            // Never append a command to a torn frame
            guard.take();
        }
        result
    }

    /// Handle one received frame.
    ///
    /// The raw frame is always published. Frames that cannot be classified
    /// are reported as [`Diagnostic::MalformedFrame`] and change nothing else.
    pub fn on_frame_arrived(&self, bytes: &[u8]) {
        let session = &self.shared.session;
        let raw = to_hex_string(bytes);
        session.publish_raw_frame(raw.clone());
        session.record_frame();

        let response = match Frame::decode(bytes).and_then(|frame| frame.classify()) {
            Ok(response) => response,
            Err(reason) => {
                debug!(frame = %raw, "dropping malformed frame: {}", reason);
                session.report(Diagnostic::MalformedFrame { raw, reason });
                return;
            }
        };

        match response {
            Response::Status { code } => {
                let message = self.publish_status_code(&code);
                debug!(code = %code, "status: {}", message);
            }
            Response::Measurement(measurement) => {
                debug!(
                    distance = measurement.distance,
                    signal_quality = measurement.signal_quality,
                    "measurement"
                );
                session.publish_measurement(measurement);
                session.publish_status(status::describe(STATUS_NO_ERROR));
            }
            Response::Laser { on } => {
                debug!(on, "laser echo");
                self.shared.laser_on.store(on, Ordering::Relaxed);
            }
            Response::Error { code } => {
                let message = self.publish_status_code(&code);
                warn!(code = %code, "sensor reported error: {}", message);
            }
        }
    }

    /// Report a terminal stream error and mark the link closed.
    ///
    /// The error text is published as the status message. The engine does not
    /// reconnect.
    pub fn on_stream_error(&self, err: &ProtocolError) {
        error!("sensor stream error: {}", err);
        let session = &self.shared.session;
        session.publish_status(err.to_string());
        session.report(Diagnostic::StreamError {
            error: err.to_string(),
        });
        self.shared.closed.cancel();
    }

    /// Shut the write half down. Later sends fail with [`ProtocolError::NotConnected`].
    pub async fn close(&self) {
        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("error shutting down writer: {}", e);
            }
            info!("sensor stream closed");
        }
        self.shared.laser_on.store(false, Ordering::Relaxed);
        self.shared.continuous.store(false, Ordering::Relaxed);
    }

    fn publish_status_code(&self, code: &str) -> String {
        let session = &self.shared.session;
        if status::lookup(code).is_none() {
            session.report(Diagnostic::UnknownStatusCode {
                code: code.to_string(),
            });
        }
        let message = status::describe(code);
        session.publish_status(message.clone());
        message
    }

    fn report_discarded(&self, bytes: &[u8]) {
        let raw = to_hex_string(bytes);
        debug!(bytes = %raw, "discarding bytes outside a frame");
        self.shared
            .session
            .report(Diagnostic::DiscardedBytes { raw });
    }

    fn drain(&self, codec: &mut InboundCodec, buf: &mut BytesMut, eof: bool) {
        loop {
            let item = if eof {
                codec.decode_eof(buf)
            } else {
                codec.decode(buf)
            };
            match item {
                Ok(Some(Inbound::Frame(bytes))) => self.on_frame_arrived(&bytes),
                Ok(Some(Inbound::Discarded(bytes))) => self.report_discarded(&bytes),
                Ok(None) => break,
                Err(e) => {
                    warn!("frame decoder error: {}", e);
                    buf.clear();
                    break;
                }
            }
        }
    }
}

async fn read_loop<R>(
    mut reader: R,
    mut codec: InboundCodec,
    engine: ProtocolEngine,
    cancel: CancellationToken,
    buffer_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(buffer_size);
    let closed = engine.shared.closed.clone();
    debug!("read loop started");

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("read loop cancelled");
                return;
            }
            _ = closed.cancelled() => {
                debug!("link closed, read loop exiting");
                return;
            }
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                engine.drain(&mut codec, &mut buf, true);
                engine.on_stream_error(&ProtocolError::StreamClosed);
                return;
            }
            Ok(n) => {
                engine.session().record_received(n);
                engine.drain(&mut codec, &mut buf, false);
            }
            Err(e) => {
                engine.on_stream_error(&ProtocolError::IoError(e));
                return;
            }
        }
    }
}
