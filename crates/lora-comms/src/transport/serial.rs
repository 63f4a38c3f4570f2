//! Serial port session with baud rate detection
//!
//! Radios ship with different console speeds, so [`SerialSession::open`]
//! walks the configured candidate list and keeps the first rate at which a
//! valid frame arrives within the probe timeout. Bytes read while probing
//! at the winning rate are not lost: they are returned by the first
//! [`recv`](TransportSession::recv).
//!
//! The port itself is reached through a [`SerialOpener`], so the probing
//! logic runs against in-memory links in tests and against `tokio-serial`
//! with the `serial` feature.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex as SyncMutex;
#[cfg(feature = "serial")]
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{TransportId, TransportKind, TransportSession};
use crate::config::SerialConfig;
use crate::error::{ConnectError, TransportError};
use crate::frame::FrameCodec;

/// A bidirectional byte stream to a serial device
pub trait SerialLink: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialLink for T {}

/// Opens a serial device at a given speed
#[async_trait]
pub trait SerialOpener: Send + Sync {
    /// Open `path` at `baud_rate`
    async fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>, ConnectError>;
}

/// Serial session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialState {
    /// No link
    Disconnected,
    /// Waiting for a valid frame at this rate
    Probing {
        /// Rate under test
        baud_rate: u32,
    },
    /// Link established
    Connected {
        /// Detected rate
        baud_rate: u32,
    },
}

type Link = Box<dyn SerialLink>;

/// An open serial link to a radio
pub struct SerialSession {
    id: TransportId,
    path: String,
    baud_rate: u32,
    reader: Mutex<Option<ReadHalf<Link>>>,
    writer: Mutex<Option<WriteHalf<Link>>>,
    pending: SyncMutex<Option<Bytes>>,
    read_buffer_size: usize,
    state: watch::Sender<SerialState>,
    cancel: CancellationToken,
}

impl SerialSession {
    /// Open `path`, probing each configured baud rate in order.
    ///
    /// Fails with [`ConnectError::NoResponse`] when no rate produced a valid
    /// frame, or with the opener's error if the port cannot be opened.
    pub async fn open(
        path: &str,
        opener: &dyn SerialOpener,
        config: &SerialConfig,
    ) -> Result<Self, ConnectError> {
        let (state, _) = watch::channel(SerialState::Disconnected);
        Self::open_with_state(path, opener, config, state).await
    }

    /// Like [`open`](Self::open), publishing probe progress on `state`
    pub async fn open_with_state(
        path: &str,
        opener: &dyn SerialOpener,
        config: &SerialConfig,
        state: watch::Sender<SerialState>,
    ) -> Result<Self, ConnectError> {
        let mut tried = Vec::with_capacity(config.baud_rates.len());

        for &baud_rate in &config.baud_rates {
            state.send_replace(SerialState::Probing { baud_rate });
            tried.push(baud_rate);
            info!(port = path, baud_rate, "Probing serial port");

            let mut link = match opener.open(path, baud_rate).await {
                Ok(link) => link,
                Err(e) => {
                    state.send_replace(SerialState::Disconnected);
                    return Err(e);
                }
            };

            match probe(&mut link, config).await {
                Some(seen) => {
                    info!(port = path, baud_rate, "Connected to serial device");
                    state.send_replace(SerialState::Connected { baud_rate });
                    let (reader, writer) = tokio::io::split(link);
                    return Ok(Self {
                        id: TransportId::new(format!("serial:{path}")),
                        path: path.to_string(),
                        baud_rate,
                        reader: Mutex::new(Some(reader)),
                        writer: Mutex::new(Some(writer)),
                        pending: SyncMutex::new((!seen.is_empty()).then_some(seen)),
                        read_buffer_size: config.read_buffer_size.max(1),
                        state,
                        cancel: CancellationToken::new(),
                    });
                }
                None => debug!(port = path, baud_rate, "No valid frame at this rate"),
            }
        }

        state.send_replace(SerialState::Disconnected);
        warn!(port = path, ?tried, "No response at any baud rate");
        Err(ConnectError::NoResponse {
            port: path.to_string(),
            tried,
        })
    }

    /// Open a real serial port
    #[cfg(feature = "serial")]
    pub async fn open_port(path: &str, config: &SerialConfig) -> Result<Self, ConnectError> {
        Self::open(path, &TokioSerialOpener::default(), config).await
    }

    /// Port path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Detected baud rate
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Current state
    pub fn state(&self) -> SerialState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SerialState> {
        self.state.subscribe()
    }

    fn mark_disconnected(&self) {
        self.state.send_replace(SerialState::Disconnected);
    }
}

/// Read until a valid frame shows up or the probe window closes.
/// Returns every byte read on success.
async fn probe(link: &mut Link, config: &SerialConfig) -> Option<Bytes> {
    let deadline = Instant::now() + config.probe_timeout;
    let mut codec = FrameCodec::with_max_packet_size(config.max_packet_size);
    let mut seen = BytesMut::new();
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, link.read(&mut buf)).await {
            Err(_) => return None,
            Ok(Ok(0)) => return None,
            Ok(Ok(n)) => {
                seen.extend_from_slice(&buf[..n]);
                if codec.feed(&buf[..n]).any(|frame| frame.is_ok()) {
                    return Some(seen.freeze());
                }
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Read failed while probing");
                return None;
            }
        }
    }
}

#[async_trait]
impl TransportSession for SerialSession {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn is_connected(&self) -> bool {
        matches!(self.state(), SerialState::Connected { .. }) && !self.cancel.is_cancelled()
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let pending = self.pending.lock().take();
        if let Some(pending) = pending {
            return Ok(pending);
        }

        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::Closed)?;
        let mut buf = vec![0u8; self.read_buffer_size];

        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    warn!(port = %self.path, "Serial device closed the stream");
                    self.mark_disconnected();
                    Err(TransportError::Disconnected("end of stream".to_string()))
                }
                Ok(n) => {
                    trace!(bytes = n, "Read from serial port");
                    buf.truncate(n);
                    Ok(Bytes::from(buf))
                }
                Err(e) => {
                    error!(error = %e, "Serial read error");
                    self.mark_disconnected();
                    Err(TransportError::Read(e.to_string()))
                }
            },
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;

        debug!(size = data.len(), "Writing frame");
        writer.write_all(data).await.map_err(|e| {
            error!(error = %e, "Serial write error");
            self.mark_disconnected();
            TransportError::Write(e.to_string())
        })?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::Write(format!("Flush failed: {e}")))
    }

    async fn close(&self) {
        self.cancel.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Shutdown on close failed");
            }
        }
        self.reader.lock().await.take();
        let _ = self.pending.lock().take();
        if self.state() != SerialState::Disconnected {
            self.mark_disconnected();
            info!(port = %self.path, "Serial session closed");
        }
    }
}

impl std::fmt::Debug for SerialSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialSession")
            .field("port", &self.path)
            .field("baud_rate", &self.baud_rate)
            .field("state", &self.state())
            .finish()
    }
}

/// Opens serial ports with `tokio-serial`
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct TokioSerialOpener {
    timeout: Duration,
}

#[cfg(feature = "serial")]
impl TokioSerialOpener {
    /// Create an opener with a port-level IO timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[cfg(feature = "serial")]
impl Default for TokioSerialOpener {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl SerialOpener for TokioSerialOpener {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>, ConnectError> {
        use tokio_serial::SerialPortBuilderExt;

        #[cfg(unix)]
        if !std::path::Path::new(path).exists() {
            return Err(ConnectError::PortNotFound(path.to_string()));
        }

        let stream = tokio_serial::new(path, baud_rate)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| ConnectError::PortOpenFailed {
                port: path.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockSerialOpener;
    use std::time::Duration;

    fn fast_config() -> SerialConfig {
        SerialConfig {
            probe_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_detects_second_candidate_rate() {
        let opener = MockSerialOpener::answering_at(921_600);
        let session = SerialSession::open("/dev/ttyMOCK0", &opener, &fast_config())
            .await
            .unwrap();

        assert_eq!(session.baud_rate(), 921_600);
        assert_eq!(session.state(), SerialState::Connected { baud_rate: 921_600 });
        assert_eq!(opener.tried(), vec![115_200, 921_600]);
        assert!(session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_bytes_are_delivered() {
        let opener = MockSerialOpener::answering_at(115_200);
        let session = SerialSession::open("/dev/ttyMOCK0", &opener, &fast_config())
            .await
            .unwrap();

        let first = session.recv().await.unwrap();
        let mut codec = FrameCodec::new();
        let frames: Vec<_> = codec.feed(&first).collect();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_response_lists_every_rate() {
        let opener = MockSerialOpener::silent();
        let err = SerialSession::open("/dev/ttyMOCK0", &opener, &fast_config())
            .await
            .unwrap_err();

        match err {
            ConnectError::NoResponse { port, tried } => {
                assert_eq!(port, "/dev/ttyMOCK0");
                assert_eq!(tried, vec![115_200, 921_600, 57_600, 38_400, 19_200]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_propagates() {
        let opener = MockSerialOpener::missing();
        let err = SerialSession::open("/dev/ttyNONE", &opener, &fast_config())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::PortNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_reaches_device() {
        let opener = MockSerialOpener::answering_at(115_200);
        let session = SerialSession::open("/dev/ttyMOCK0", &opener, &fast_config())
            .await
            .unwrap();

        session.write(&[1, 2, 3]).await.unwrap();
        let written = opener.read_device_input(3).await;
        assert_eq!(written, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_interrupts_recv() {
        let opener = MockSerialOpener::answering_at(115_200);
        let session = std::sync::Arc::new(
            SerialSession::open("/dev/ttyMOCK0", &opener, &fast_config())
                .await
                .unwrap(),
        );
        // Drain the probe bytes
        session.recv().await.unwrap();

        let reader = session.clone();
        let pending = tokio::spawn(async move { reader.recv().await });
        tokio::task::yield_now().await;

        session.close().await;
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert_eq!(session.state(), SerialState::Disconnected);
        assert!(matches!(session.write(&[0]).await, Err(TransportError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_watch_reports_connection() {
        let opener = MockSerialOpener::answering_at(921_600);
        let (tx, mut rx) = watch::channel(SerialState::Disconnected);
        let session = SerialSession::open_with_state("/dev/ttyMOCK0", &opener, &fast_config(), tx)
            .await
            .unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), SerialState::Connected { baud_rate: 921_600 });
        drop(session);
    }
}
