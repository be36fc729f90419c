//! Connection management
//!
//! Handles the connection lifecycle: device probing, permission checks,
//! opening the port, the settling delay and the baud-rate handshake.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{DeviceProvider, ProtocolEngine, ProtocolError, ReadLoop, SerialSettings, Session};
use crate::config::SensorConfig;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Nothing attempted yet
    Idle,
    /// Looking for devices
    Probing,
    /// No serial-capable device attached
    NoDeviceFound,
    /// A device was found but this process may not open it
    PermissionRequired,
    /// Port open, waiting for the sensor to settle before the handshake
    Opening,
    /// Handshake sent, commands accepted
    Connected,
    /// Opening the port or the handshake failed
    ConnectionError,
    /// Port closed
    Disconnected,
}

/// Sensor connection driven through a [`DeviceProvider`]
pub struct SensorConnection<P: DeviceProvider> {
    provider: P,
    config: SensorConfig,
    session: Arc<Session>,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Device chosen by the last probe
    device: Option<P::Device>,
    engine: Option<ProtocolEngine>,
    read_loop: Option<ReadLoop>,
    last_error: Option<String>,
}

impl<P: DeviceProvider> SensorConnection<P> {
    /// Create a connection (not yet connected)
    pub fn new(provider: P, config: SensorConfig) -> Result<Self, ProtocolError> {
        config.validate()?;
        let session = Arc::new(Session::new(config.diagnostics_capacity));
        Ok(Self {
            provider,
            config,
            session,
            state: Arc::new(watch::Sender::new(ConnectionState::Idle)),
            device: None,
            engine: None,
            read_loop: None,
            last_error: None,
        })
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Session state shared with the engine; survives reconnects
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Engine for the open stream, `None` unless connected
    pub fn engine(&self) -> Option<&ProtocolEngine> {
        self.engine.as_ref()
    }

    /// Device selected by the last `connect()`
    pub fn device(&self) -> Option<&P::Device> {
        self.device.as_ref()
    }

    /// Message of the last failed open
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Active configuration
    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// Whether the read loop is still receiving from the device
    pub fn is_streaming(&self) -> bool {
        self.read_loop
            .as_ref()
            .map(|r| !r.is_finished())
            .unwrap_or(false)
    }

    /// Probe for devices and open the first one.
    ///
    /// Returns `NoDeviceFound` or `PermissionRequired` without touching any
    /// port. After obtaining permission, call `connect()` again. A link that
    /// died since the last connect is released first.
    pub async fn connect(&mut self) -> Result<ConnectionState, ProtocolError> {
        self.release_dead_link().await?;

        self.set_state(ConnectionState::Probing);

        // Probe on every call so hot-plugged devices are picked up
        let Some(device) = self.provider.find_candidate_devices().into_iter().next() else {
            info!("no sensor device found");
            self.device = None;
            return Ok(self.set_state(ConnectionState::NoDeviceFound));
        };

        debug!(?device, "selected device");
        self.device = Some(device.clone());

        if !self.provider.has_permission(&device) {
            info!(?device, "device requires permission");
            return Ok(self.set_state(ConnectionState::PermissionRequired));
        }

        self.open().await
    }

    /// Ask the provider for access to the selected device
    pub async fn request_permission(&mut self) -> Result<bool, ProtocolError> {
        let device = self.device.as_ref().ok_or(ProtocolError::NoDeviceSelected)?;
        let granted = self.provider.request_permission(device).await;
        info!(?device, granted, "permission request finished");
        Ok(granted)
    }

    /// Open the selected device, wait for it to settle and send the handshake.
    ///
    /// The read loop runs during the settling delay, so frames sent by the
    /// sensor while waiting are not lost.
    pub async fn open(&mut self) -> Result<ConnectionState, ProtocolError> {
        self.release_dead_link().await?;
        let device = self.device.clone().ok_or(ProtocolError::NoDeviceSelected)?;

        self.set_state(ConnectionState::Opening);
        self.last_error = None;
        self.session.reset();

        let stream = match self.provider.open(&device, &SerialSettings::JRT) {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail(e)),
        };
        let (engine, read_loop) =
            ProtocolEngine::start(stream, Arc::clone(&self.session), &self.config);

        let delay = self.config.settling_delay();
        info!(?device, "port opened, waiting {:?} before handshake", delay);
        tokio::time::sleep(delay).await;

        let handshake = match engine.send_handshake().await {
            Ok(()) if engine.is_closed() => Err(ProtocolError::StreamClosed),
            result => result,
        };
        if let Err(e) = handshake {
            read_loop.stop().await;
            engine.close().await;
            return Err(self.fail(e));
        }

        self.watch_link(&read_loop);
        self.engine = Some(engine);
        self.read_loop = Some(read_loop);
        info!(?device, "sensor connected");
        Ok(self.set_state(ConnectionState::Connected))
    }

    /// Stop the read loop and close the port. Safe to call in any state.
    pub async fn disconnect(&mut self) -> ConnectionState {
        self.shutdown().await;
        self.set_state(ConnectionState::Disconnected)
    }

    async fn shutdown(&mut self) {
        if let Some(read_loop) = self.read_loop.take() {
            read_loop.stop().await;
        }
        if let Some(engine) = self.engine.take() {
            engine.close().await;
            info!("sensor disconnected");
        }
    }

    /// Drop an engine whose link has died; refuse while the link is alive
    async fn release_dead_link(&mut self) -> Result<(), ProtocolError> {
        let Some(engine) = &self.engine else {
            return Ok(());
        };
        if !engine.is_closed() && self.is_streaming() {
            return Err(ProtocolError::AlreadyConnected);
        }
        debug!("releasing closed sensor link");
        self.shutdown().await;
        Ok(())
    }

    /// Move to `ConnectionError` when the link dies while connected
    fn watch_link(&self, read_loop: &ReadLoop) {
        let closed = read_loop.closed();
        let stopped = read_loop.stop_token();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = stopped.cancelled() => {}
                _ = closed.cancelled() => {
                    let lost = state.send_if_modified(|s| {
                        if *s == ConnectionState::Connected {
                            *s = ConnectionState::ConnectionError;
                            true
                        } else {
                            false
                        }
                    });
                    if lost {
                        warn!("sensor link lost");
                    }
                }
            }
        });
    }

    fn fail(&mut self, err: ProtocolError) -> ProtocolError {
        let message = err.to_string();
        error!("connection failed: {}", message);
        self.session.publish_status(message.clone());
        self.last_error = Some(message.clone());
        self.set_state(ConnectionState::ConnectionError);
        ProtocolError::ConnectionFailed(message)
    }

    fn set_state(&self, state: ConnectionState) -> ConnectionState {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("connection state {:?} -> {:?}", previous, state);
        }
        state
    }
}
