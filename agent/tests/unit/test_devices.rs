//! Device discovery tests over fake sysfs trees

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tagflash::deploy::devices::{
    BoardFamily, DeviceBackend, DeviceLocator, SerialPortBackend, UsbSysfsBackend,
};
use tagflash::errors::LocateError;

use crate::support::{other_board, uno, StaticBackend};

fn usb_device(root: &Path, name: &str, ids: (&str, &str), bus: (u32, u32)) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("idVendor"), format!("{}\n", ids.0)).unwrap();
    fs::write(dir.join("idProduct"), format!("{}\n", ids.1)).unwrap();
    fs::write(dir.join("busnum"), format!("{}\n", bus.0)).unwrap();
    fs::write(dir.join("devnum"), format!("{}\n", bus.1)).unwrap();
}

#[tokio::test]
async fn test_locator_filters_in_discovery_order() {
    let backend = StaticBackend::new(vec![
        other_board("/dev/ttyUSB0"),
        uno("/dev/ttyACM1"),
        uno("/dev/ttyACM0"),
        uno("/dev/ttyACM1"),
    ]);
    let locator = DeviceLocator::new(backend, BoardFamily::default());

    let found: Vec<_> = locator
        .locate()
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.identifier)
        .collect();
    assert_eq!(found, vec!["/dev/ttyACM1", "/dev/ttyACM0"]);
}

#[tokio::test]
async fn test_locator_reports_no_device() {
    let backend = StaticBackend::new(vec![other_board("/dev/ttyUSB0")]);
    let locator = DeviceLocator::new(backend, BoardFamily::default());

    let err = locator.locate().await.unwrap_err();
    assert_eq!(
        err,
        LocateError::NoDeviceFound {
            vendor_id: 0x2341,
            product_id: 0x0043
        }
    );
}

#[tokio::test]
async fn test_usb_backend_walks_descriptors() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("bus/usb/devices");

    // Uno with a CDC ACM interface
    usb_device(&root, "1-1", ("2341", "0043"), (1, 5));
    fs::create_dir_all(root.join("1-1/1-1:1.0/tty/ttyACM0")).unwrap();
    // Interface entries at the top level carry no descriptor ids
    fs::create_dir_all(root.join("1-1:1.0")).unwrap();
    // CH340 clone behind a usb-serial driver
    usb_device(&root, "1-2", ("1a86", "7523"), (1, 6));
    fs::create_dir_all(root.join("1-2/1-2:1.0/ttyUSB0")).unwrap();
    // Uno without a bound serial driver
    usb_device(&root, "1-3", ("2341", "0043"), (1, 7));
    // Root hub
    usb_device(&root, "usb1", ("1d6b", "0002"), (1, 1));

    let backend = UsbSysfsBackend::new(&root, "/dev");
    assert_eq!(backend.name(), "usb");

    let devices = backend.enumerate().await.unwrap();
    let ids: Vec<_> = devices
        .iter()
        .map(|d| (d.identifier.as_str(), d.vendor_id, d.product_id))
        .collect();
    assert_eq!(
        ids,
        vec![
            ("/dev/ttyACM0", 0x2341, 0x0043),
            ("/dev/ttyUSB0", 0x1a86, 0x7523),
            ("/dev/bus/usb/001/007", 0x2341, 0x0043),
            ("/dev/bus/usb/001/001", 0x1d6b, 0x0002),
        ]
    );

    let locator = DeviceLocator::new(Arc::new(backend), BoardFamily::default());
    let found: Vec<_> = locator
        .locate()
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.identifier)
        .collect();
    assert_eq!(found, vec!["/dev/ttyACM0", "/dev/bus/usb/001/007"]);
}

#[tokio::test]
async fn test_usb_backend_missing_root() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = UsbSysfsBackend::new(tmp.path().join("absent"), "/dev");

    let err = backend.enumerate().await.unwrap_err();
    assert!(matches!(err, LocateError::Enumeration { ref backend, .. } if backend == "usb"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_serial_backend_follows_device_links() {
    use std::os::unix::fs::symlink;

    let tmp = tempfile::tempdir().unwrap();
    let devices = tmp.path().join("devices/pci0000:00/0000:00:14.0/usb1");
    let class = tmp.path().join("class/tty");

    usb_device(&devices, "1-1", ("2341", "0043"), (1, 5));
    fs::create_dir_all(devices.join("1-1/1-1:1.0")).unwrap();
    usb_device(&devices, "1-2", ("1a86", "7523"), (1, 6));
    fs::create_dir_all(devices.join("1-2/1-2:1.0/ttyUSB0")).unwrap();
    usb_device(&devices, "1-3", ("2341", "0043"), (1, 7));
    fs::create_dir_all(devices.join("1-3/1-3:1.0")).unwrap();

    for (tty, target) in [
        ("ttyACM0", devices.join("1-1/1-1:1.0")),
        ("ttyACM1", devices.join("1-3/1-3:1.0")),
        ("ttyUSB0", devices.join("1-2/1-2:1.0/ttyUSB0")),
    ] {
        fs::create_dir_all(class.join(tty)).unwrap();
        symlink(target, class.join(tty).join("device")).unwrap();
    }
    // Built-in UART, no USB parent
    fs::create_dir_all(class.join("ttyS0")).unwrap();

    let backend = SerialPortBackend::new(&class, "/dev");
    assert_eq!(backend.name(), "serial");

    let found: Vec<_> = backend
        .enumerate()
        .await
        .unwrap()
        .into_iter()
        .map(|d| (d.identifier, d.vendor_id))
        .collect();
    assert_eq!(
        found,
        vec![
            ("/dev/ttyACM0".to_string(), 0x2341),
            ("/dev/ttyACM1".to_string(), 0x2341),
            ("/dev/ttyUSB0".to_string(), 0x1a86),
        ]
    );

    let locator = DeviceLocator::new(Arc::new(backend), BoardFamily::new(0x1a86, 0x7523));
    let found = locator.locate().await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].identifier, "/dev/ttyUSB0");
}
