//! Attached board discovery
//!
//! A [`DeviceBackend`] lists what is plugged in; [`DeviceLocator`] narrows that
//! down to one board family. Callers only ever see the locator's ordered list
//! of upload targets, never which backend produced it.

pub mod serial;
pub mod usb;

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::LocateError;

pub use serial::SerialPortBackend;
pub use usb::UsbSysfsBackend;

/// An attached board
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Device {
    /// Upload target handed to the flash tool, e.g. `/dev/ttyACM0`
    pub identifier: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:04x}:{:04x})",
            self.identifier, self.vendor_id, self.product_id
        )
    }
}

/// The (vendorId, productId) pair identifying the boards to flash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardFamily {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl BoardFamily {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    pub fn matches(&self, device: &Device) -> bool {
        device.vendor_id == self.vendor_id && device.product_id == self.product_id
    }
}

impl Default for BoardFamily {
    /// Arduino Uno
    fn default() -> Self {
        Self::new(0x2341, 0x0043)
    }
}

/// Which enumeration backend to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Serial ports from `/sys/class/tty`
    #[default]
    Serial,

    /// USB devices from `/sys/bus/usb/devices`
    Usb,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "serial" | "tty" => Ok(BackendKind::Serial),
            "usb" => Ok(BackendKind::Usb),
            _ => Err(format!("Invalid device backend: {}", s)),
        }
    }
}

/// Enumerates everything currently attached that the backend can see.
///
/// Implementations must not mutate anything and must report devices in a
/// stable order. Any handle opened during enumeration is closed before
/// returning.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Backend name used in logs and errors
    fn name(&self) -> &'static str;

    async fn enumerate(&self) -> Result<Vec<Device>, LocateError>;
}

/// Create the configured backend against the live system
pub fn backend_for(kind: BackendKind) -> Arc<dyn DeviceBackend> {
    match kind {
        BackendKind::Serial => Arc::new(SerialPortBackend::default()),
        BackendKind::Usb => Arc::new(UsbSysfsBackend::default()),
    }
}

/// Finds the attached boards of one family
pub struct DeviceLocator {
    backend: Arc<dyn DeviceBackend>,
    family: BoardFamily,
}

impl DeviceLocator {
    pub fn new(backend: Arc<dyn DeviceBackend>, family: BoardFamily) -> Self {
        Self { backend, family }
    }

    pub fn family(&self) -> BoardFamily {
        self.family
    }

    /// Matching devices in discovery order, without duplicates. Never empty.
    pub async fn locate(&self) -> Result<Vec<Device>, LocateError> {
        let all = self.backend.enumerate().await?;
        debug!(
            "{} backend reported {} device(s)",
            self.backend.name(),
            all.len()
        );

        let devices = filter_devices(all, &self.family);
        if devices.is_empty() {
            return Err(LocateError::NoDeviceFound {
                vendor_id: self.family.vendor_id,
                product_id: self.family.product_id,
            });
        }

        info!(
            "Found {} matching device(s): {}",
            devices.len(),
            devices
                .iter()
                .map(|d| d.identifier.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(devices)
    }
}

/// Keep devices of `family`, dropping repeated identifiers after their first
/// occurrence
pub fn filter_devices(devices: Vec<Device>, family: &BoardFamily) -> Vec<Device> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|d| family.matches(d))
        .filter(|d| seen.insert(d.identifier.clone()))
        .collect()
}

/// Read a 4-digit hex id attribute such as `idVendor`
pub(crate) async fn read_hex_id(path: &Path) -> Option<u16> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    u16::from_str_radix(raw.trim(), 16).ok()
}

pub(crate) fn enumeration_error(backend: &str, path: &Path, err: impl fmt::Display) -> LocateError {
    LocateError::Enumeration {
        backend: backend.to_string(),
        reason: format!("{}: {}", path.display(), err),
    }
}
