//! Serial port enumeration over `/sys/class/tty`

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::trace;

use crate::deploy::devices::{enumeration_error, read_hex_id, Device, DeviceBackend};
use crate::errors::LocateError;
use crate::filesys::dir::Dir;

pub const DEFAULT_TTY_CLASS_ROOT: &str = "/sys/class/tty";
pub const DEFAULT_DEV_ROOT: &str = "/dev";

/// How far above the tty's `device` link the USB device may sit
/// (`ttyUSB0` -> interface -> device)
const MAX_ANCESTOR_DEPTH: usize = 4;

/// Lists serial ports backed by a USB device, tagged with that device's ids.
#[derive(Debug, Clone)]
pub struct SerialPortBackend {
    class_root: PathBuf,
    dev_root: PathBuf,
}

impl SerialPortBackend {
    pub fn new(class_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            class_root: class_root.into(),
            dev_root: dev_root.into(),
        }
    }

    async fn describe(&self, tty: &Path) -> Option<Device> {
        let name = tty.file_name()?.to_string_lossy().into_owned();
        let device_dir = tokio::fs::canonicalize(tty.join("device")).await.ok()?;
        let usb_device = usb_ancestor(&device_dir).await?;

        Some(Device {
            identifier: self.dev_root.join(name).to_string_lossy().into_owned(),
            vendor_id: read_hex_id(&usb_device.join("idVendor")).await?,
            product_id: read_hex_id(&usb_device.join("idProduct")).await?,
        })
    }
}

impl Default for SerialPortBackend {
    fn default() -> Self {
        Self::new(DEFAULT_TTY_CLASS_ROOT, DEFAULT_DEV_ROOT)
    }
}

#[async_trait]
impl DeviceBackend for SerialPortBackend {
    fn name(&self) -> &'static str {
        "serial"
    }

    async fn enumerate(&self) -> Result<Vec<Device>, LocateError> {
        let mut ttys = Dir::new(&self.class_root)
            .list_dirs()
            .await
            .map_err(|e| enumeration_error(self.name(), &self.class_root, e))?;
        ttys.sort();

        let mut devices = Vec::new();
        for tty in ttys {
            match self.describe(&tty).await {
                Some(device) => devices.push(device),
                None => trace!("{}: not a USB serial port", tty.display()),
            }
        }
        Ok(devices)
    }
}

/// Nearest directory at or above `start` carrying USB descriptor ids
async fn usb_ancestor(start: &Path) -> Option<PathBuf> {
    for dir in start.ancestors().take(MAX_ANCESTOR_DEPTH) {
        if tokio::fs::metadata(dir.join("idVendor")).await.is_ok() {
            return Some(dir.to_path_buf());
        }
    }
    None
}
