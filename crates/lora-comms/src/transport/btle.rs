//! `btleplug` backed BLE central

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::ble::{
    BleCentral, BlePeripheral, CharProps, GattCharacteristic, NotificationStream, WriteMode,
    SERVICE_UUID,
};
use crate::config::DEFAULT_BLE_WRITE_SIZE;
use crate::discovery::DeviceInfo;
use crate::error::{ConnectError, TransportError};

fn ble_err(context: &str, err: btleplug::Error) -> TransportError {
    TransportError::Ble(format!("{context}: {err}"))
}

/// BLE central on the first host adapter
pub struct BtleplugCentral {
    adapter: Adapter,
    seen: Mutex<HashMap<String, Peripheral>>,
}

impl BtleplugCentral {
    /// Open the first Bluetooth adapter
    pub async fn new() -> Result<Self, ConnectError> {
        let manager = Manager::new()
            .await
            .map_err(|e| ConnectError::BluetoothUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| ConnectError::BluetoothUnavailable(format!("enumerate adapters: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| ConnectError::BluetoothUnavailable("no BLE adapters on host".into()))?;

        Ok(Self {
            adapter,
            seen: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    async fn scan(&self, timeout: Duration) -> Result<Vec<DeviceInfo>, ConnectError> {
        self.adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await
            .map_err(|e| ConnectError::BluetoothUnavailable(format!("start scan: {e}")))?;
        tokio::time::sleep(timeout).await;
        if let Err(e) = self.adapter.stop_scan().await {
            debug!(error = %e, "stop scan failed");
        }

        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| ConnectError::BluetoothUnavailable(format!("list peripherals: {e}")))?;

        let mut found = Vec::new();
        for peripheral in peripherals {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            if !props.services.contains(&SERVICE_UUID) {
                continue;
            }
            let address = props.address.to_string();
            found.push(DeviceInfo::ble(address.clone(), props.local_name, props.rssi));
            self.seen.lock().insert(address, peripheral);
        }

        info!(count = found.len(), "BLE scan complete");
        Ok(found)
    }

    async fn peripheral(&self, id: &str) -> Result<Option<Arc<dyn BlePeripheral>>, ConnectError> {
        let found = self
            .seen
            .lock()
            .iter()
            .find(|(address, _)| address.eq_ignore_ascii_case(id))
            .map(|(_, p)| p.clone());
        Ok(found.map(|peripheral| Arc::new(BtleplugPeripheral { peripheral }) as Arc<dyn BlePeripheral>))
    }
}

struct BtleplugPeripheral {
    peripheral: Peripheral,
}

impl BtleplugPeripheral {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| TransportError::Ble(format!("characteristic {uuid} not discovered")))
    }
}

fn props(flags: CharPropFlags) -> CharProps {
    CharProps {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY) || flags.contains(CharPropFlags::INDICATE),
    }
}

#[async_trait]
impl BlePeripheral for BtleplugPeripheral {
    fn id(&self) -> String {
        self.peripheral.address().to_string()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let connected = self
            .peripheral
            .is_connected()
            .await
            .map_err(|e| ble_err("read connection state", e))?;
        if !connected {
            self.peripheral
                .connect()
                .await
                .map_err(|e| ble_err("connect peripheral", e))?;
        }
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<Uuid>, TransportError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| ble_err("discover GATT services", e))?;
        Ok(self.peripheral.services().iter().map(|s| s.uuid).collect())
    }

    async fn characteristics(&self) -> Result<Vec<GattCharacteristic>, TransportError> {
        Ok(self
            .peripheral
            .characteristics()
            .into_iter()
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                service_uuid: c.service_uuid,
                props: props(c.properties),
            })
            .collect())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let ch = self.characteristic(characteristic)?;
        self.peripheral
            .subscribe(&ch)
            .await
            .map_err(|e| ble_err("subscribe", e))
    }

    async fn notifications(&self) -> Result<NotificationStream, TransportError> {
        let stream = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| ble_err("open notification stream", e))?;
        Ok(Box::pin(stream.map(|n| (n.uuid, n.value))))
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let ch = self.characteristic(characteristic)?;
        self.peripheral
            .read(&ch)
            .await
            .map_err(|e| ble_err("read", e))
    }

    async fn write(
        &self,
        characteristic: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let ch = self.characteristic(characteristic)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        self.peripheral
            .write(&ch, data, write_type)
            .await
            .map_err(|e| ble_err("write", e))
    }

    fn max_write_len(&self) -> usize {
        // btleplug does not expose the negotiated MTU
        DEFAULT_BLE_WRITE_SIZE
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| ble_err("disconnect", e))
    }
}
