//! Connectable device metadata
//!
//! Discovery only describes what could be connected to; opening a session
//! is the job of [`crate::transport`]. With the `serial` feature USB serial
//! ports are enumerated and matched against adapters commonly found on
//! LoRa boards. BLE discovery goes through [`crate::transport::ble::BleCentral::scan`].

use serde::{Deserialize, Serialize};
#[cfg(feature = "serial")]
use tracing::{debug, info};

/// How a device is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Serial port
    Serial,
    /// Bluetooth LE peripheral
    Ble,
}

/// Information about a discovered device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Handle passed back to connect: port path or BLE address
    pub id: String,
    /// Human readable name (product string or advertised name)
    pub name: Option<String>,
    /// Link type
    pub kind: DeviceKind,
    /// Manufacturer (if available)
    pub manufacturer: Option<String>,
    /// Serial number (if available)
    pub serial_number: Option<String>,
    /// USB Vendor ID (if available)
    pub vendor_id: Option<u16>,
    /// USB Product ID (if available)
    pub product_id: Option<u16>,
    /// Advertised signal strength, BLE only
    pub rssi: Option<i16>,
    /// Whether this is likely a mesh radio
    pub is_likely_meshtastic: bool,
}

impl DeviceInfo {
    /// Bare serial port with no USB metadata
    pub fn serial(path: impl Into<String>) -> Self {
        Self {
            id: path.into(),
            name: None,
            kind: DeviceKind::Serial,
            manufacturer: None,
            serial_number: None,
            vendor_id: None,
            product_id: None,
            rssi: None,
            is_likely_meshtastic: false,
        }
    }

    /// BLE peripheral seen advertising the radio service
    pub fn ble(address: impl Into<String>, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            id: address.into(),
            name,
            kind: DeviceKind::Ble,
            manufacturer: None,
            serial_number: None,
            vendor_id: None,
            product_id: None,
            rssi,
            is_likely_meshtastic: true,
        }
    }

    /// Attach USB identity and re-evaluate the likelihood heuristic
    pub fn with_usb(mut self, vendor_id: u16, product_id: u16, product: Option<String>) -> Self {
        self.vendor_id = Some(vendor_id);
        self.product_id = Some(product_id);
        self.is_likely_meshtastic =
            is_known_usb_device(vendor_id, product_id) || product.as_deref().is_some_and(product_hint);
        self.name = product;
        self
    }
}

/// USB VID/PID pairs of serial adapters found on LoRa boards
pub const KNOWN_USB_DEVICES: &[(u16, u16)] = &[
    // Silicon Labs CP210x (T-Beam, Heltec)
    (0x10c4, 0xea60),
    // CH340
    (0x1a86, 0x7523),
    // FTDI FT232R, FT2232, FT4232H, FT232H, FT-X
    (0x0403, 0x6001),
    (0x0403, 0x6010),
    (0x0403, 0x6011),
    (0x0403, 0x6014),
    (0x0403, 0x6015),
    // Adafruit ESP32-S2 boards
    (0x239a, 0x80f2),
    (0x239a, 0x8014),
    // Espressif native USB
    (0x303a, 0x1001),
    (0x303a, 0x0002),
    // TTGO LoRa32 (CH9102)
    (0x1a86, 0x55d4),
];

/// Check a USB identity against [`KNOWN_USB_DEVICES`]
pub fn is_known_usb_device(vendor_id: u16, product_id: u16) -> bool {
    KNOWN_USB_DEVICES
        .iter()
        .any(|&(vid, pid)| vid == vendor_id && pid == product_id)
}

/// Product strings that suggest a mesh radio
pub fn product_hint(product: &str) -> bool {
    let product = product.to_lowercase();
    ["meshtastic", "lora", "heltec", "ttgo", "t-beam", "t-echo", "rak"]
        .iter()
        .any(|hint| product.contains(hint))
}

/// Common serial port paths on different platforms
#[cfg(feature = "serial")]
const COMMON_DEVICE_PATHS: &[&str] = &[
    // Linux
    "/dev/ttyUSB*",
    "/dev/ttyACM*",
    // macOS
    "/dev/cu.usbserial-*",
    "/dev/cu.SLAB_USBtoUART*",
    "/dev/cu.usbmodem*",
];

/// List serial ports, most likely radios first.
///
/// Falls back to well-known device paths when the platform cannot
/// enumerate USB metadata.
#[cfg(feature = "serial")]
pub fn list_serial_devices() -> Vec<DeviceInfo> {
    let mut devices: Vec<DeviceInfo> = match serialport::available_ports() {
        Ok(ports) => ports.iter().map(from_serial_port).collect(),
        Err(e) => {
            debug!(error = %e, "Port enumeration failed");
            Vec::new()
        }
    };

    if devices.is_empty() {
        for pattern in COMMON_DEVICE_PATHS {
            if let Ok(entries) = glob::glob(pattern) {
                for entry in entries.flatten() {
                    devices.push(DeviceInfo::serial(entry.to_string_lossy()));
                }
            }
        }
    }

    devices.sort_by_key(|d| !d.is_likely_meshtastic);
    info!(count = devices.len(), "Serial devices listed");
    devices
}

/// First serial port that looks like a radio
#[cfg(feature = "serial")]
pub fn find_serial_device() -> Option<DeviceInfo> {
    list_serial_devices()
        .into_iter()
        .find(|d| d.is_likely_meshtastic)
}

#[cfg(feature = "serial")]
fn from_serial_port(port: &serialport::SerialPortInfo) -> DeviceInfo {
    use serialport::SerialPortType;

    let info = DeviceInfo::serial(port.port_name.clone());
    match &port.port_type {
        SerialPortType::UsbPort(usb) => {
            let mut info = info.with_usb(usb.vid, usb.pid, usb.product.clone());
            info.manufacturer = usb.manufacturer.clone();
            info.serial_number = usb.serial_number.clone();
            if info.is_likely_meshtastic {
                debug!(
                    port = %port.port_name,
                    vid = usb.vid,
                    pid = usb.pid,
                    "USB device matches a known radio adapter"
                );
            }
            info
        }
        SerialPortType::BluetoothPort => DeviceInfo {
            name: Some("Bluetooth".to_string()),
            ..info
        },
        SerialPortType::PciPort | SerialPortType::Unknown => info,
    }
}
