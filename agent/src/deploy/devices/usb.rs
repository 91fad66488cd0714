//! Raw USB descriptor walk over `/sys/bus/usb/devices`

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::trace;

use crate::deploy::devices::{enumeration_error, read_hex_id, Device, DeviceBackend};
use crate::errors::LocateError;
use crate::filesys::dir::Dir;

pub const DEFAULT_USB_ROOT: &str = "/sys/bus/usb/devices";
pub const DEFAULT_DEV_ROOT: &str = "/dev";

/// Lists USB devices by their descriptors.
///
/// A device exposing serial interfaces is reported once per tty node; one
/// without is reported by its `/dev/bus/usb/BBB/DDD` node.
#[derive(Debug, Clone)]
pub struct UsbSysfsBackend {
    root: PathBuf,
    dev_root: PathBuf,
}

impl UsbSysfsBackend {
    pub fn new(root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dev_root: dev_root.into(),
        }
    }

    async fn describe(&self, path: &Path) -> Vec<Device> {
        let (Some(vendor_id), Some(product_id)) = (
            read_hex_id(&path.join("idVendor")).await,
            read_hex_id(&path.join("idProduct")).await,
        ) else {
            // Interfaces and hubs without descriptors of their own
            return Vec::new();
        };

        let ttys = tty_nodes(path).await;
        if !ttys.is_empty() {
            return ttys
                .into_iter()
                .map(|tty| Device {
                    identifier: self.dev_root.join(tty).to_string_lossy().into_owned(),
                    vendor_id,
                    product_id,
                })
                .collect();
        }

        match bus_node(path).await {
            Some(node) => vec![Device {
                identifier: self.dev_root.join(node).to_string_lossy().into_owned(),
                vendor_id,
                product_id,
            }],
            None => Vec::new(),
        }
    }
}

impl Default for UsbSysfsBackend {
    fn default() -> Self {
        Self::new(DEFAULT_USB_ROOT, DEFAULT_DEV_ROOT)
    }
}

#[async_trait]
impl DeviceBackend for UsbSysfsBackend {
    fn name(&self) -> &'static str {
        "usb"
    }

    async fn enumerate(&self) -> Result<Vec<Device>, LocateError> {
        let entries = sorted_dirs(&self.root)
            .await
            .map_err(|e| enumeration_error(self.name(), &self.root, e))?;

        let mut devices = Vec::new();
        for path in entries {
            let found = self.describe(&path).await;
            trace!("{}: {} device node(s)", path.display(), found.len());
            devices.extend(found);
        }
        Ok(devices)
    }
}

async fn sorted_dirs(path: &Path) -> Result<Vec<PathBuf>, crate::errors::AgentError> {
    let mut dirs = Dir::new(path).list_dirs().await?;
    dirs.sort();
    Ok(dirs)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// tty names under the device's interfaces (`1-1:1.0/tty/ttyACM0` for CDC ACM,
/// `1-1:1.0/ttyUSB0` for usb-serial drivers)
async fn tty_nodes(device: &Path) -> Vec<String> {
    let mut ttys = Vec::new();
    for iface in sorted_dirs(device).await.unwrap_or_default() {
        let is_interface = file_name(&iface).is_some_and(|n| n.contains(':'));
        if !is_interface {
            continue;
        }
        for node in sorted_dirs(&iface.join("tty")).await.unwrap_or_default() {
            ttys.extend(file_name(&node));
        }
        for node in sorted_dirs(&iface).await.unwrap_or_default() {
            if let Some(name) = file_name(&node).filter(|n| n.starts_with("tty") && n != "tty") {
                ttys.push(name);
            }
        }
    }
    ttys
}

async fn bus_node(device: &Path) -> Option<String> {
    let read = |name: &'static str| async move {
        let raw = tokio::fs::read_to_string(device.join(name)).await.ok()?;
        raw.trim().parse::<u32>().ok()
    };
    let busnum = read("busnum").await?;
    let devnum = read("devnum").await?;
    Some(format!("bus/usb/{:03}/{:03}", busnum, devnum))
}
