//! Test doubles for transports and packet builders
//!
//! Everything here runs in memory: [`MockTransport`] stands in for an
//! established session, [`MockSerialOpener`] for a serial port that only
//! answers at one baud rate, and [`MockBleCentral`] / [`MockPeripheral`]
//! for a BLE radio.
//!
//! # Example
//!
//! ```rust,ignore
//! use lora_comms::test_utils::{encode_frame, text_packet, MockTransport};
//!
//! let transport = Arc::new(MockTransport::new("mock"));
//! processor.attach(transport.clone());
//! transport.push(encode_frame(&text_packet(100, 0, 7, "hello mesh")));
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc as fmpsc;
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::content::{MessageContent, Routing};
use crate::discovery::DeviceInfo;
use crate::error::{ConnectError, TransportError};
use crate::frame::FrameCodec;
use crate::packet::{Data, MeshPacket, MeshPacketCodec, Payload};
use crate::transport::ble::{
    BleCentral, BlePeripheral, CharProps, GattCharacteristic, NotificationStream, WriteMode,
    FROM_NUM_UUID, FROM_RADIO_UUID, SERVICE_UUID, TO_RADIO_UUID,
};
use crate::transport::serial::{SerialLink, SerialOpener};
use crate::transport::{TransportId, TransportKind, TransportSession};

// ---------------------------------------------------------------------------
// Packet builders
// ---------------------------------------------------------------------------

/// Packet carrying typed content
pub fn packet_with(from: u32, to: u32, id: u32, content: &MessageContent) -> MeshPacket {
    MeshPacket::new(from, to, id, Payload::Decoded(Data::from_content(content)))
}

/// Text message packet
pub fn text_packet(from: u32, to: u32, id: u32, text: &str) -> MeshPacket {
    packet_with(from, to, id, &MessageContent::Text(text.to_string()))
}

/// Routing acknowledgement for `request_id`
pub fn ack_packet(from: u32, to: u32, id: u32, request_id: u32) -> MeshPacket {
    let data = Data::from_content(&MessageContent::Routing(Routing::ack())).with_request_id(request_id);
    MeshPacket::new(from, to, id, Payload::Decoded(data))
}

/// Routing rejection for `request_id`
pub fn nak_packet(from: u32, to: u32, id: u32, request_id: u32, reason: i32) -> MeshPacket {
    let data = Data::from_content(&MessageContent::Routing(Routing::Error { reason }))
        .with_request_id(request_id);
    MeshPacket::new(from, to, id, Payload::Decoded(data))
}

/// Encode a packet into a complete wire frame
pub fn encode_frame(packet: &MeshPacket) -> Bytes {
    FrameCodec::encode(&MeshPacketCodec::encode(packet))
}

/// Decode every complete packet in `bytes`, skipping bad frames
pub fn decode_frames(bytes: &[u8]) -> Vec<MeshPacket> {
    let mut codec = FrameCodec::new();
    codec
        .feed(bytes)
        .filter_map(Result::ok)
        .filter_map(|body| MeshPacketCodec::decode(&body).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

type Inbound = mpsc::UnboundedReceiver<Result<Bytes, TransportError>>;

/// In-memory session: tests push inbound bytes and inspect writes
pub struct MockTransport {
    id: TransportId,
    inbound_tx: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
    inbound_rx: Mutex<Inbound>,
    written: SyncMutex<Vec<Bytes>>,
    write_count: watch::Sender<usize>,
    fail_writes: AtomicBool,
    cancel: CancellationToken,
}

impl MockTransport {
    /// Create a connected mock
    pub fn new(id: &str) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (write_count, _) = watch::channel(0);
        Self {
            id: TransportId::new(id),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            written: SyncMutex::new(Vec::new()),
            write_count,
            fail_writes: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Queue bytes for the next `recv`
    pub fn push(&self, bytes: impl Into<Bytes>) {
        let _ = self.inbound_tx.send(Ok(bytes.into()));
    }

    /// Queue an error for the next `recv`, simulating link loss
    pub fn fail(&self, error: TransportError) {
        let _ = self.inbound_tx.send(Err(error));
    }

    /// Make subsequent writes fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Everything written so far
    pub fn written(&self) -> Vec<Bytes> {
        self.written.lock().clone()
    }

    /// Written frames decoded back into packets
    pub fn written_packets(&self) -> Vec<MeshPacket> {
        self.written()
            .iter()
            .flat_map(|frame| decode_frames(frame))
            .collect()
    }

    /// Wait until at least `n` writes happened
    pub async fn wait_for_writes(&self, n: usize) {
        let mut rx = self.write_count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

#[async_trait]
impl TransportSession for MockTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Virtual
    }

    fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
            next = rx.recv() => next.unwrap_or(Err(TransportError::Closed)),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Write("mock write failure".to_string()));
        }
        let count = {
            let mut written = self.written.lock();
            written.push(Bytes::copy_from_slice(data));
            written.len()
        };
        self.write_count.send_replace(count);
        Ok(())
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// MockSerialOpener
// ---------------------------------------------------------------------------

/// Line noise a radio produces at the wrong baud rate
const NOISE: &[u8] = &[0x00, 0xF0, 0x13, 0x37, 0x0F, 0xC3];

/// Serial port double that only speaks frames at one baud rate
pub struct MockSerialOpener {
    answer_at: Option<u32>,
    missing: bool,
    greeting: Bytes,
    tried: SyncMutex<Vec<u32>>,
    devices: SyncMutex<Vec<DuplexStream>>,
}

impl MockSerialOpener {
    fn build(answer_at: Option<u32>, missing: bool) -> Self {
        Self {
            answer_at,
            missing,
            greeting: encode_frame(&text_packet(0x1234_5678, 0, 1, "boot")),
            tried: SyncMutex::new(Vec::new()),
            devices: SyncMutex::new(Vec::new()),
        }
    }

    /// Radio that emits a frame as soon as it is opened at `baud_rate`
    pub fn answering_at(baud_rate: u32) -> Self {
        Self::build(Some(baud_rate), false)
    }

    /// Radio that never produces a valid frame
    pub fn silent() -> Self {
        Self::build(None, false)
    }

    /// Port that does not exist
    pub fn missing() -> Self {
        Self::build(None, true)
    }

    /// Baud rates opened so far, in order
    pub fn tried(&self) -> Vec<u32> {
        self.tried.lock().clone()
    }

    /// Drop the device side of every opened port, as if the cable was pulled
    pub fn unplug(&self) {
        self.devices.lock().clear();
    }

    /// Read `n` bytes the host wrote to the most recently opened port
    pub async fn read_device_input(&self, n: usize) -> Vec<u8> {
        let Some(mut device) = self.devices.lock().pop() else {
            return Vec::new();
        };
        let mut buf = vec![0u8; n];
        let read = device.read_exact(&mut buf).await;
        self.devices.lock().push(device);
        match read {
            Ok(_) => buf,
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl SerialOpener for MockSerialOpener {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>, ConnectError> {
        self.tried.lock().push(baud_rate);
        if self.missing {
            return Err(ConnectError::PortNotFound(path.to_string()));
        }

        let (host, mut device) = tokio::io::duplex(4096);
        let output: &[u8] = if self.answer_at == Some(baud_rate) {
            &self.greeting
        } else {
            NOISE
        };
        device
            .write_all(output)
            .await
            .map_err(|e| ConnectError::PortOpenFailed {
                port: path.to_string(),
                reason: e.to_string(),
            })?;
        self.devices.lock().push(device);
        Ok(Box::new(host))
    }
}

// ---------------------------------------------------------------------------
// MockBleCentral / MockPeripheral
// ---------------------------------------------------------------------------

/// BLE central that knows a fixed set of peripherals
#[derive(Default)]
pub struct MockBleCentral {
    peripherals: SyncMutex<HashMap<String, Arc<MockPeripheral>>>,
}

impl MockBleCentral {
    /// Create an empty central
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a peripheral visible
    pub fn add(&self, peripheral: Arc<MockPeripheral>) {
        self.peripherals
            .lock()
            .insert(peripheral.address.clone(), peripheral);
    }
}

#[async_trait]
impl BleCentral for MockBleCentral {
    async fn scan(&self, _timeout: std::time::Duration) -> Result<Vec<DeviceInfo>, ConnectError> {
        Ok(self
            .peripherals
            .lock()
            .keys()
            .map(|addr| DeviceInfo::ble(addr.clone(), Some(format!("Mock_{addr}")), Some(-60)))
            .collect())
    }

    async fn peripheral(&self, id: &str) -> Result<Option<Arc<dyn BlePeripheral>>, ConnectError> {
        Ok(self
            .peripherals
            .lock()
            .get(id)
            .cloned()
            .map(|p| p as Arc<dyn BlePeripheral>))
    }
}

/// In-memory GATT peripheral
pub struct MockPeripheral {
    address: String,
    services: Vec<Uuid>,
    characteristics: Vec<GattCharacteristic>,
    max_write_len: usize,
    fail_connect: AtomicBool,
    link_up: AtomicBool,
    writes: SyncMutex<Vec<Vec<u8>>>,
    reads: SyncMutex<VecDeque<Vec<u8>>>,
    notify_tx: SyncMutex<Option<fmpsc::UnboundedSender<(Uuid, Vec<u8>)>>>,
}

impl MockPeripheral {
    fn build(address: &str, services: Vec<Uuid>, characteristics: Vec<GattCharacteristic>) -> Self {
        Self {
            address: address.to_string(),
            services,
            characteristics,
            max_write_len: crate::config::DEFAULT_BLE_WRITE_SIZE,
            fail_connect: AtomicBool::new(false),
            link_up: AtomicBool::new(false),
            writes: SyncMutex::new(Vec::new()),
            reads: SyncMutex::new(VecDeque::new()),
            notify_tx: SyncMutex::new(None),
        }
    }

    fn radio_characteristics() -> Vec<GattCharacteristic> {
        let ch = |uuid, props| GattCharacteristic {
            uuid,
            service_uuid: SERVICE_UUID,
            props,
        };
        vec![
            ch(
                TO_RADIO_UUID,
                CharProps {
                    write: true,
                    write_without_response: true,
                    ..Default::default()
                },
            ),
            ch(
                FROM_RADIO_UUID,
                CharProps {
                    read: true,
                    notify: true,
                    ..Default::default()
                },
            ),
            ch(
                FROM_NUM_UUID,
                CharProps {
                    read: true,
                    notify: true,
                    ..Default::default()
                },
            ),
        ]
    }

    /// Peripheral exposing the full radio service
    pub fn radio(address: &str) -> Self {
        Self::build(address, vec![SERVICE_UUID], Self::radio_characteristics())
    }

    /// Peripheral without the radio service
    pub fn without_service(address: &str) -> Self {
        Self::build(address, Vec::new(), Vec::new())
    }

    /// Radio service with one characteristic missing
    pub fn without_characteristic(address: &str, missing: Uuid) -> Self {
        let characteristics = Self::radio_characteristics()
            .into_iter()
            .filter(|c| c.uuid != missing)
            .collect();
        Self::build(address, vec![SERVICE_UUID], characteristics)
    }

    /// Limit single writes to `len` bytes
    pub fn with_max_write_len(mut self, len: usize) -> Self {
        self.max_write_len = len;
        self
    }

    /// Make `connect` fail
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Check if the link is up
    pub fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    /// Every chunk written to the to-radio characteristic
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    /// Deliver a notification
    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        if let Some(tx) = self.notify_tx.lock().as_ref() {
            let _ = tx.unbounded_send((characteristic, value));
        }
    }

    /// Queue a value for the next from-radio read
    pub fn queue_read(&self, value: Vec<u8>) {
        self.reads.lock().push_back(value);
    }

    /// Simulate the radio going out of range
    pub fn drop_link(&self) {
        self.link_up.store(false, Ordering::SeqCst);
        self.notify_tx.lock().take();
    }
}

#[async_trait]
impl BlePeripheral for MockPeripheral {
    fn id(&self) -> String {
        self.address.clone()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Ble("connection refused".to_string()));
        }
        self.link_up.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<Uuid>, TransportError> {
        Ok(self.services.clone())
    }

    async fn characteristics(&self) -> Result<Vec<GattCharacteristic>, TransportError> {
        Ok(self.characteristics.clone())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        if self.characteristics.iter().any(|c| c.uuid == characteristic) {
            Ok(())
        } else {
            Err(TransportError::Ble(format!("no characteristic {characteristic}")))
        }
    }

    async fn notifications(&self) -> Result<NotificationStream, TransportError> {
        let (tx, rx) = fmpsc::unbounded();
        *self.notify_tx.lock() = Some(tx);
        Ok(Box::pin(rx))
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        if characteristic != FROM_RADIO_UUID {
            return Ok(Vec::new());
        }
        Ok(self.reads.lock().pop_front().unwrap_or_default())
    }

    async fn write(
        &self,
        characteristic: Uuid,
        data: &[u8],
        _mode: WriteMode,
    ) -> Result<(), TransportError> {
        if !self.is_link_up() {
            return Err(TransportError::Ble("not connected".to_string()));
        }
        if characteristic == TO_RADIO_UUID {
            self.writes.lock().push(data.to_vec());
        }
        Ok(())
    }

    fn max_write_len(&self) -> usize {
        self.max_write_len
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.link_up.store(false, Ordering::SeqCst);
        self.notify_tx.lock().take();
        Ok(())
    }
}
