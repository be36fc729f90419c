//! Connection lifecycle tests with a fake device provider and a paused clock

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use jrt_core::config::SensorConfig;
use jrt_core::protocol::{
    Command, ConnectionState, DeviceProvider, ProtocolError, SensorConnection, SerialSettings,
};
use pretty_assertions::assert_eq;
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::time::Instant;

const DISTANCE_FRAME: [u8; 13] = [
    0xAA, 0x00, 0x00, 0x22, 0x00, 0x03, 0x00, 0x00, 0x00, 0x64, 0x00, 0x50, 0xD9,
];

type WriteLog = Arc<Mutex<Vec<(Instant, Vec<u8>)>>>;

/// Duplex stream that timestamps every write
struct RecordingStream {
    inner: DuplexStream,
    writes: WriteLog,
    fail_writes: bool,
}

impl AsyncRead for RecordingStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RecordingStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.fail_writes {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "cable pulled")));
        }
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.writes
                .lock()
                .unwrap()
                .push((Instant::now(), buf[..*n].to_vec()));
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[derive(Default)]
struct FakeState {
    devices: Vec<String>,
    permitted: AtomicBool,
    grant_on_request: bool,
    fail_open: bool,
    fail_writes: bool,
    opened_at: Mutex<Vec<Instant>>,
    peer: Mutex<Option<DuplexStream>>,
    writes: WriteLog,
}

#[derive(Clone, Default)]
struct FakeProvider {
    state: Arc<FakeState>,
}

impl FakeProvider {
    fn new(state: FakeState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    fn with_device() -> Self {
        Self::new(FakeState {
            devices: vec!["/dev/ttyUSB0".to_string()],
            permitted: AtomicBool::new(true),
            ..FakeState::default()
        })
    }

    fn open_count(&self) -> usize {
        self.state.opened_at.lock().unwrap().len()
    }

    fn take_peer(&self) -> Option<DuplexStream> {
        self.state.peer.lock().unwrap().take()
    }

    fn writes(&self) -> Vec<(Instant, Vec<u8>)> {
        self.state.writes.lock().unwrap().clone()
    }
}

impl DeviceProvider for FakeProvider {
    type Device = String;
    type Stream = RecordingStream;

    fn find_candidate_devices(&self) -> Vec<String> {
        self.state.devices.clone()
    }

    fn has_permission(&self, _device: &String) -> bool {
        self.state.permitted.load(Ordering::SeqCst)
    }

    async fn request_permission(&self, _device: &String) -> bool {
        if self.state.grant_on_request {
            self.state.permitted.store(true, Ordering::SeqCst);
        }
        self.state.grant_on_request
    }

    fn open(
        &self,
        device: &String,
        settings: &SerialSettings,
    ) -> Result<RecordingStream, ProtocolError> {
        assert_eq!(*settings, SerialSettings::JRT);
        if self.state.fail_open {
            return Err(ProtocolError::SerialError(format!("{}: device busy", device)));
        }
        let (ours, peer) = duplex(256);
        self.state.opened_at.lock().unwrap().push(Instant::now());
        *self.state.peer.lock().unwrap() = Some(peer);
        Ok(RecordingStream {
            inner: ours,
            writes: Arc::clone(&self.state.writes),
            fail_writes: self.state.fail_writes,
        })
    }
}

fn connection(provider: &FakeProvider) -> SensorConnection<FakeProvider> {
    SensorConnection::new(provider.clone(), SensorConfig::default()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_no_device_found() {
    let provider = FakeProvider::default();
    let mut conn = connection(&provider);

    assert_eq!(conn.connect().await.unwrap(), ConnectionState::NoDeviceFound);
    assert_eq!(conn.state(), ConnectionState::NoDeviceFound);
    assert_eq!(provider.open_count(), 0);
    assert!(conn.engine().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_permission_required_then_granted() {
    let provider = FakeProvider::new(FakeState {
        devices: vec!["/dev/ttyACM0".to_string()],
        grant_on_request: true,
        ..FakeState::default()
    });
    let mut conn = connection(&provider);

    assert_eq!(
        conn.connect().await.unwrap(),
        ConnectionState::PermissionRequired
    );
    assert_eq!(provider.open_count(), 0);
    assert_eq!(conn.device().map(String::as_str), Some("/dev/ttyACM0"));

    assert!(conn.request_permission().await.unwrap());
    assert_eq!(conn.connect().await.unwrap(), ConnectionState::Connected);
    assert_eq!(provider.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied() {
    let provider = FakeProvider::new(FakeState {
        devices: vec!["/dev/ttyACM0".to_string()],
        ..FakeState::default()
    });
    let mut conn = connection(&provider);

    conn.connect().await.unwrap();
    assert!(!conn.request_permission().await.unwrap());
    assert_eq!(
        conn.connect().await.unwrap(),
        ConnectionState::PermissionRequired
    );
}

#[tokio::test(start_paused = true)]
async fn test_request_permission_without_device() {
    let provider = FakeProvider::default();
    let mut conn = connection(&provider);

    let err = conn.request_permission().await.unwrap_err();
    assert!(matches!(err, ProtocolError::NoDeviceSelected));
}

#[tokio::test(start_paused = true)]
async fn test_handshake_waits_for_settling_delay() {
    let provider = FakeProvider::with_device();
    let mut conn = connection(&provider);

    assert_eq!(conn.connect().await.unwrap(), ConnectionState::Connected);

    let opened_at = provider.state.opened_at.lock().unwrap()[0];
    let writes = provider.writes();
    assert_eq!(writes.len(), 1);
    let (written_at, bytes) = &writes[0];
    assert_eq!(bytes.as_slice(), Command::SetAutoBaudRate.encode());
    assert!(
        written_at.duration_since(opened_at) >= Duration::from_millis(1000),
        "handshake sent after {:?}",
        written_at.duration_since(opened_at)
    );
}

#[tokio::test(start_paused = true)]
async fn test_frames_received_during_settling_delay() {
    let provider = FakeProvider::with_device();
    let mut conn = connection(&provider);
    let mut state = conn.subscribe_state();
    let mut measurements = conn.session().subscribe_measurement();

    let task = tokio::spawn(async move {
        let result = conn.connect().await;
        (conn, result)
    });

    // Yielding keeps the runtime busy, so the paused clock does not advance
    let mut peer = loop {
        if let Some(peer) = provider.take_peer() {
            break peer;
        }
        tokio::task::yield_now().await;
    };
    peer.write_all(&DISTANCE_FRAME).await.unwrap();

    loop {
        measurements.changed().await.unwrap();
        if measurements.borrow_and_update().is_some() {
            break;
        }
    }
    assert_eq!(*state.borrow_and_update(), ConnectionState::Opening);
    assert!(provider.writes().is_empty(), "handshake sent too early");

    let (conn, result) = task.await.unwrap();
    assert_eq!(result.unwrap(), ConnectionState::Connected);
    assert_eq!(conn.session().measurement().map(|m| m.distance), Some(100));

    let mut handshake = [0u8; 1];
    peer.read_exact(&mut handshake).await.unwrap();
    assert_eq!(handshake, [0x55]);
}

#[tokio::test(start_paused = true)]
async fn test_commands_follow_handshake() {
    let provider = FakeProvider::with_device();
    let mut conn = connection(&provider);
    conn.connect().await.unwrap();
    let mut peer = provider.take_peer().unwrap();

    let engine = conn.engine().expect("engine after connect");
    engine.request_single_shot().await.unwrap();

    let mut expected = Command::SetAutoBaudRate.encode().to_vec();
    expected.extend_from_slice(Command::SingleShotAuto.encode());
    let mut received = vec![0u8; expected.len()];
    peer.read_exact(&mut received).await.unwrap();
    assert_eq!(received, expected);
}

#[tokio::test(start_paused = true)]
async fn test_open_failure_yields_connection_error() {
    let provider = FakeProvider::new(FakeState {
        devices: vec!["/dev/ttyUSB0".to_string()],
        permitted: AtomicBool::new(true),
        fail_open: true,
        ..FakeState::default()
    });
    let mut conn = connection(&provider);

    let err = conn.connect().await.unwrap_err();

    assert!(matches!(err, ProtocolError::ConnectionFailed(_)));
    assert_eq!(conn.state(), ConnectionState::ConnectionError);
    assert_eq!(
        conn.last_error(),
        Some("Serial port error: /dev/ttyUSB0: device busy")
    );
    assert_eq!(
        conn.session().status_message(),
        "Serial port error: /dev/ttyUSB0: device busy"
    );
    assert!(conn.engine().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_handshake_failure_yields_connection_error() {
    let provider = FakeProvider::new(FakeState {
        devices: vec!["/dev/ttyUSB0".to_string()],
        permitted: AtomicBool::new(true),
        fail_writes: true,
        ..FakeState::default()
    });
    let mut conn = connection(&provider);

    let err = conn.connect().await.unwrap_err();

    assert!(matches!(err, ProtocolError::ConnectionFailed(_)));
    assert_eq!(conn.state(), ConnectionState::ConnectionError);
    assert!(conn.engine().is_none());
    assert!(!conn.is_streaming());

    // Caller may retry once the cause is fixed
    assert_eq!(provider.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_twice_is_rejected() {
    let provider = FakeProvider::with_device();
    let mut conn = connection(&provider);

    conn.connect().await.unwrap();
    let err = conn.connect().await.unwrap_err();

    assert!(matches!(err, ProtocolError::AlreadyConnected));
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(provider.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_without_device() {
    let provider = FakeProvider::with_device();
    let mut conn = connection(&provider);

    let err = conn.open().await.unwrap_err();
    assert!(matches!(err, ProtocolError::NoDeviceSelected));
    assert_eq!(conn.state(), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let provider = FakeProvider::with_device();
    let mut conn = connection(&provider);

    assert_eq!(conn.disconnect().await, ConnectionState::Disconnected);

    conn.connect().await.unwrap();
    let mut peer = provider.take_peer().unwrap();
    assert!(conn.is_streaming());

    assert_eq!(conn.disconnect().await, ConnectionState::Disconnected);
    assert_eq!(conn.disconnect().await, ConnectionState::Disconnected);
    assert!(conn.engine().is_none());
    assert!(!conn.is_streaming());

    // Port handle is closed: the device side sees end of stream after the handshake
    let mut rest = Vec::new();
    peer.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, vec![0x55]);
}

#[tokio::test(start_paused = true)]
async fn test_lost_link_is_reported_and_can_reconnect() {
    let provider = FakeProvider::with_device();
    let mut conn = connection(&provider);
    let mut state = conn.subscribe_state();

    assert_eq!(conn.connect().await.unwrap(), ConnectionState::Connected);
    drop(provider.take_peer());

    tokio::time::timeout(
        Duration::from_secs(1),
        state.wait_for(|s| *s == ConnectionState::ConnectionError),
    )
    .await
    .expect("state change after the device went away")
    .unwrap();
    assert!(!conn.is_streaming());
    assert_eq!(conn.session().status_message(), "Stream closed by device");

    assert_eq!(conn.connect().await.unwrap(), ConnectionState::Connected);
    assert_eq!(provider.open_count(), 2);
    assert!(conn.is_streaming());
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_is_reported_and_can_reconnect() {
    let provider = FakeProvider::with_device();
    let mut conn = connection(&provider);
    let mut state = conn.subscribe_state();
    conn.connect().await.unwrap();
    // Peer stays attached but never reads, so the write stalls
    let _peer = provider.take_peer();

    let engine = conn.engine().cloned().unwrap();
    let filler = vec![Command::SingleShotAuto; 40];
    let mut failed = None;
    for cmd in filler {
        if let Err(e) = engine.send(cmd).await {
            failed = Some(e);
            break;
        }
    }
    assert!(matches!(failed, Some(ProtocolError::WriteTimeout(_))));

    tokio::time::timeout(
        Duration::from_secs(1),
        state.wait_for(|s| *s == ConnectionState::ConnectionError),
    )
    .await
    .expect("state change after the write timed out")
    .unwrap();

    assert_eq!(conn.connect().await.unwrap(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_does_not_report_link_loss() {
    let provider = FakeProvider::with_device();
    let mut conn = connection(&provider);
    conn.connect().await.unwrap();
    let _peer = provider.take_peer();

    assert_eq!(conn.disconnect().await, ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resets_session() {
    let provider = FakeProvider::with_device();
    let mut conn = connection(&provider);

    conn.connect().await.unwrap();
    conn.engine().unwrap().on_frame_arrived(&DISTANCE_FRAME);
    assert!(conn.session().measurement().is_some());

    conn.disconnect().await;
    assert_eq!(conn.connect().await.unwrap(), ConnectionState::Connected);
    assert_eq!(conn.session().measurement(), None);
    assert_eq!(conn.session().stats().commands_sent, 1);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let config = SensorConfig {
        write_timeout_ms: 0,
        ..SensorConfig::default()
    };
    let result = SensorConnection::new(FakeProvider::default(), config);
    assert!(matches!(result, Err(ProtocolError::InvalidConfig(_))));
}
