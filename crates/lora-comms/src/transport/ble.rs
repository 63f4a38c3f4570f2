//! Bluetooth LE session
//!
//! The radio exposes one GATT service with three characteristics:
//!
//! - to-radio: written with outbound frames
//! - from-radio: notifies (and can be read) with inbound bytes
//! - from-num: notifies when the radio has queued more from-radio data
//!
//! [`BleSession::connect`] walks `Scanning -> Connecting ->
//! DiscoveringServices -> DiscoveringCharacteristics -> Ready`. The current
//! state is kept on a watch channel; every transition is also published on
//! a broadcast channel ([`BleSession::subscribe_transitions`]) so no
//! intermediate step is lost. A missing service or characteristic aborts
//! the attempt and disconnects the half-open link.
//!
//! Outbound writes are split into chunks no larger than the peripheral's
//! write limit and the configured packet ceiling, with a pause between
//! chunks. One write lock per session keeps concurrent writers from
//! interleaving their chunks.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{TransportId, TransportKind, TransportSession};
use crate::config::BleConfig;
use crate::discovery::DeviceInfo;
use crate::error::{ConnectError, TransportError};

/// Radio GATT service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6ba1b218_15a8_461f_9fa8_5dcae273eafd);

/// Outbound characteristic (write)
pub const TO_RADIO_UUID: Uuid = Uuid::from_u128(0xf75c76d2_129e_4dad_a1dd_7866124401e7);

/// Inbound characteristic (notify, read)
pub const FROM_RADIO_UUID: Uuid = Uuid::from_u128(0x8ba2bcc2_ee02_4a55_a531_c525c5e454d5);

/// Inbound-queue counter characteristic (notify)
pub const FROM_NUM_UUID: Uuid = Uuid::from_u128(0xed9da18c_a800_4f66_a670_aa7547e34453);

/// Upper bound on from-radio reads per from-num notification
const MAX_DRAIN_READS: usize = 64;

/// GATT write flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Acknowledged write
    WithResponse,
    /// Unacknowledged write command
    WithoutResponse,
}

/// Characteristic capabilities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProps {
    /// Readable
    pub read: bool,
    /// Writable with response
    pub write: bool,
    /// Writable without response
    pub write_without_response: bool,
    /// Notifies
    pub notify: bool,
}

/// A discovered characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Owning service
    pub service_uuid: Uuid,
    /// Capabilities
    pub props: CharProps,
}

/// Stream of `(characteristic, value)` notifications
pub type NotificationStream = Pin<Box<dyn Stream<Item = (Uuid, Vec<u8>)> + Send>>;

/// A BLE peripheral as seen by a central
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    /// Address or platform id
    fn id(&self) -> String;

    /// Establish the link
    async fn connect(&self) -> Result<(), TransportError>;

    /// Run service discovery; returns the primary service UUIDs
    async fn discover_services(&self) -> Result<Vec<Uuid>, TransportError>;

    /// Characteristics found by the last discovery
    async fn characteristics(&self) -> Result<Vec<GattCharacteristic>, TransportError>;

    /// Enable notifications on a characteristic
    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError>;

    /// Notifications from every subscribed characteristic
    async fn notifications(&self) -> Result<NotificationStream, TransportError>;

    /// Read a characteristic value
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError>;

    /// Write a characteristic value
    async fn write(
        &self,
        characteristic: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;

    /// Largest single write the link accepts
    fn max_write_len(&self) -> usize;

    /// Drop the link
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// The host side of BLE: scanning and peripheral lookup
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Scan for radios advertising [`SERVICE_UUID`]
    async fn scan(&self, timeout: Duration) -> Result<Vec<DeviceInfo>, ConnectError>;

    /// Look up a peripheral seen by a previous scan
    async fn peripheral(&self, id: &str) -> Result<Option<Arc<dyn BlePeripheral>>, ConnectError>;
}

/// BLE session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleState {
    /// Never connected, or explicitly disconnected
    Idle,
    /// Looking for the peripheral
    Scanning,
    /// Establishing the link
    Connecting,
    /// Discovering GATT services
    DiscoveringServices,
    /// Resolving the radio characteristics
    DiscoveringCharacteristics,
    /// Ready for traffic
    Ready,
    /// Link lost or connect attempt failed
    Disconnected,
}

impl std::fmt::Display for BleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BleState::Idle => "idle",
            BleState::Scanning => "scanning",
            BleState::Connecting => "connecting",
            BleState::DiscoveringServices => "discovering services",
            BleState::DiscoveringCharacteristics => "discovering characteristics",
            BleState::Ready => "ready",
            BleState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

type Inbound = mpsc::Receiver<Result<Bytes, TransportError>>;

/// Transitions kept for slow subscribers
const TRANSITION_CAPACITY: usize = 32;

/// Current state plus a log of every change
struct StateCell {
    current: watch::Sender<BleState>,
    transitions: broadcast::Sender<BleState>,
}

impl StateCell {
    fn new() -> Self {
        let (current, _) = watch::channel(BleState::Idle);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            current,
            transitions,
        }
    }

    fn get(&self) -> BleState {
        *self.current.borrow()
    }

    fn set(&self, state: BleState) {
        let previous = self.current.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "BLE state change");
            // No subscribers is not an error
            let _ = self.transitions.send(state);
        }
    }
}

struct Link {
    peripheral: Arc<dyn BlePeripheral>,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

/// Session with one BLE radio
pub struct BleSession {
    central: Arc<dyn BleCentral>,
    config: BleConfig,
    state: Arc<StateCell>,
    device_id: RwLock<Option<String>>,
    link: SyncMutex<Option<Link>>,
    inbound: Mutex<Option<Inbound>>,
    write_lock: Mutex<()>,
}

impl BleSession {
    /// Create an idle session
    pub fn new(central: Arc<dyn BleCentral>, config: BleConfig) -> Self {
        Self {
            central,
            config,
            state: Arc::new(StateCell::new()),
            device_id: RwLock::new(None),
            link: SyncMutex::new(None),
            inbound: Mutex::new(None),
            write_lock: Mutex::new(()),
        }
    }

    /// Current state
    pub fn state(&self) -> BleState {
        self.state.get()
    }

    /// Watch the current state; intermediate states may be skipped
    pub fn subscribe_state(&self) -> watch::Receiver<BleState> {
        self.state.current.subscribe()
    }

    /// Receive every state transition from now on, in order
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<BleState> {
        self.state.transitions.subscribe()
    }

    /// Connected peripheral id
    pub fn device_id(&self) -> Option<String> {
        self.device_id.read().clone()
    }

    fn set_state(&self, state: BleState) {
        self.state.set(state);
    }

    /// Scan for radios
    pub async fn scan(&self) -> Result<Vec<DeviceInfo>, ConnectError> {
        self.central.scan(self.config.scan_timeout).await
    }

    /// Connect to the peripheral with `device_id` and bring the radio
    /// service up.
    pub async fn connect(&self, device_id: &str) -> Result<(), ConnectError> {
        if self.state() != BleState::Idle && self.state() != BleState::Disconnected {
            self.disconnect().await;
        }

        self.set_state(BleState::Scanning);
        let peripheral = match self.find_peripheral(device_id).await {
            Ok(p) => p,
            Err(e) => {
                self.set_state(BleState::Disconnected);
                return Err(e);
            }
        };

        let notifications = match self.establish(&peripheral).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(device = device_id, error = %e, "BLE connect failed, tearing down");
                if let Err(err) = peripheral.disconnect().await {
                    debug!(error = %err, "Disconnect during teardown failed");
                }
                self.set_state(BleState::Disconnected);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(self.config.notify_queue_size.max(1));
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_notifications(
            peripheral.clone(),
            notifications,
            tx,
            cancel.clone(),
            self.state.clone(),
        ));

        *self.inbound.lock().await = Some(rx);
        *self.link.lock() = Some(Link {
            peripheral,
            cancel,
            pump,
        });
        *self.device_id.write() = Some(device_id.to_string());
        self.set_state(BleState::Ready);
        info!(device = device_id, "BLE radio ready");
        Ok(())
    }

    async fn find_peripheral(&self, device_id: &str) -> Result<Arc<dyn BlePeripheral>, ConnectError> {
        if let Some(p) = self.central.peripheral(device_id).await? {
            return Ok(p);
        }
        debug!(device = device_id, "Peripheral unknown, scanning");
        self.central.scan(self.config.scan_timeout).await?;
        self.central
            .peripheral(device_id)
            .await?
            .ok_or_else(|| ConnectError::PeripheralNotFound(device_id.to_string()))
    }

    async fn establish(
        &self,
        peripheral: &Arc<dyn BlePeripheral>,
    ) -> Result<NotificationStream, ConnectError> {
        self.set_state(BleState::Connecting);
        match tokio::time::timeout(self.config.connect_timeout, peripheral.connect()).await {
            Err(_) => {
                return Err(ConnectError::Timeout {
                    duration_ms: self.config.connect_timeout.as_millis() as u64,
                })
            }
            Ok(Err(e)) => return Err(ConnectError::UnableToConnect(e.to_string())),
            Ok(Ok(())) => {}
        }

        self.set_state(BleState::DiscoveringServices);
        let services = peripheral.discover_services().await?;
        if !services.contains(&SERVICE_UUID) {
            return Err(ConnectError::MissingService(SERVICE_UUID));
        }

        self.set_state(BleState::DiscoveringCharacteristics);
        let characteristics = peripheral.characteristics().await?;
        for required in [TO_RADIO_UUID, FROM_RADIO_UUID, FROM_NUM_UUID] {
            let found = characteristics
                .iter()
                .any(|c| c.uuid == required && c.service_uuid == SERVICE_UUID);
            if !found {
                return Err(ConnectError::MissingCharacteristic(required));
            }
        }

        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(FROM_RADIO_UUID).await?;
        peripheral.subscribe(FROM_NUM_UUID).await?;
        Ok(notifications)
    }

    /// Drop the link and return to `Idle`
    pub async fn disconnect(&self) {
        let link = self.link.lock().take();
        if let Some(link) = link {
            link.cancel.cancel();
            link.pump.abort();
            if let Err(e) = link.peripheral.disconnect().await {
                debug!(error = %e, "Peripheral disconnect failed");
            }
            info!(device = %link.peripheral.id(), "BLE session disconnected");
        }
        self.inbound.lock().await.take();
        self.device_id.write().take();
        self.set_state(BleState::Idle);
    }

    fn peripheral(&self) -> Option<Arc<dyn BlePeripheral>> {
        self.link.lock().as_ref().map(|l| l.peripheral.clone())
    }

    /// Size of each outbound chunk
    pub fn chunk_size(&self) -> Option<usize> {
        self.peripheral()
            .map(|p| p.max_write_len().min(self.config.max_packet_size).max(1))
    }
}

async fn pump_notifications(
    peripheral: Arc<dyn BlePeripheral>,
    mut notifications: NotificationStream,
    tx: mpsc::Sender<Result<Bytes, TransportError>>,
    cancel: CancellationToken,
    state: Arc<StateCell>,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = notifications.next() => next,
        };

        match next {
            Some((uuid, value)) if uuid == FROM_RADIO_UUID => {
                if value.is_empty() {
                    continue;
                }
                trace!(bytes = value.len(), "from-radio notification");
                if tx.send(Ok(Bytes::from(value))).await.is_err() {
                    return;
                }
            }
            Some((uuid, _)) if uuid == FROM_NUM_UUID => {
                for _ in 0..MAX_DRAIN_READS {
                    match peripheral.read(FROM_RADIO_UUID).await {
                        Ok(value) if value.is_empty() => break,
                        Ok(value) => {
                            if tx.send(Ok(Bytes::from(value))).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "from-radio read failed");
                            break;
                        }
                    }
                }
            }
            Some(_) => {}
            None => {
                if cancel.is_cancelled() {
                    return;
                }
                warn!(device = %peripheral.id(), "BLE link lost");
                state.set(BleState::Disconnected);
                let _ = tx
                    .send(Err(TransportError::Disconnected(
                        "notification stream ended".to_string(),
                    )))
                    .await;
                return;
            }
        }
    }
}

#[async_trait]
impl TransportSession for BleSession {
    fn id(&self) -> TransportId {
        match self.device_id.read().as_deref() {
            Some(device) => TransportId::new(format!("ble:{device}")),
            None => TransportId::new("ble"),
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn is_connected(&self) -> bool {
        self.state() == BleState::Ready
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        let mut guard = self.inbound.lock().await;
        let inbound = guard.as_mut().ok_or(TransportError::NotConnected)?;
        match inbound.recv().await {
            Some(result) => result,
            None => Err(TransportError::Closed),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.state() != BleState::Ready {
            return Err(TransportError::NotConnected);
        }
        let peripheral = self.peripheral().ok_or(TransportError::NotConnected)?;
        let chunk_size = peripheral
            .max_write_len()
            .min(self.config.max_packet_size)
            .max(1);

        let _serialised = self.write_lock.lock().await;
        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            if i > 0 && !self.config.chunk_delay.is_zero() {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
            peripheral
                .write(TO_RADIO_UUID, chunk, WriteMode::WithResponse)
                .await
                .map_err(|e| {
                    warn!(error = %e, chunk = i, "BLE write failed");
                    e
                })?;
        }
        trace!(size = data.len(), chunk_size, "BLE write complete");
        Ok(())
    }

    async fn close(&self) {
        self.disconnect().await;
    }
}

impl std::fmt::Debug for BleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleSession")
            .field("device", &self.device_id())
            .field("state", &self.state())
            .finish()
    }
}
