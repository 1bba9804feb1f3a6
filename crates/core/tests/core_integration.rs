//! Cross-module integration tests: `Core` lifecycle, the transfer
//! engine's timeout-vs-cancel asymmetry, and the IPC gateway's request/
//! response round trip, exercised together the way a driver process
//! would actually see them rather than module-by-module.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use usbcore::descriptor::UsbDeviceDescriptor;
use usbcore::device::DeviceId;
use usbcore::error::CoreError;
use usbcore::hcd::test_support::FakeHcd;
use usbcore::location::LocationId;
use usbcore::registry::{Filter, InternalHandlers};
use usbcore::transfer::UrbId;
use usbcore::{Core, CoreConfig};

mod support;
use support::fake_hcd::ScriptedHcd;

fn config() -> CoreConfig {
    CoreConfig::default()
}

/// Shrinks every wall-clock timing window the hub state machine waits
/// on, so enumeration in these tests finishes in milliseconds instead
/// of the real-world default (over a second of debounce alone).
fn fast_config() -> CoreConfig {
    CoreConfig::builder()
        .debounce_sample_interval(Duration::from_millis(1))
        .debounce_stable_window(Duration::from_millis(3))
        .debounce_timeout(Duration::from_millis(200))
        .reset_poll_interval(Duration::from_millis(1))
        .reset_poll_attempts(3)
        .scheduler_tick(Duration::from_millis(5))
        .build()
}

/// The enumeration tests below drive a real hub-manager thread through
/// debounce/reset/addressing; on failure `RUST_LOG=debug` against this
/// suite shows exactly which control transfer the scripted HCD balked
/// at, rather than just a deadline-exceeded panic.
fn init_logging() {
    let _ = env_logger::try_init();
}

fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

#[derive(Default)]
struct Recorder {
    insertions: Mutex<Vec<(DeviceId, UsbDeviceDescriptor, LocationId)>>,
    deletions: Mutex<Vec<DeviceId>>,
}

impl InternalHandlers for Recorder {
    fn on_insertion(&self, device: DeviceId, descriptor: UsbDeviceDescriptor, location: LocationId) {
        self.insertions.lock().unwrap().push((device, descriptor, location));
    }

    fn on_deletion(&self, device: DeviceId) {
        self.deletions.lock().unwrap().push(device);
    }

    fn on_completion(&self, _urb: UrbId, _transferred: usize, _error: Option<CoreError>) {}
}

/// S2: plugging a device into a root-hub port drives it all the way
/// through debounce/reset/addressing/configuring, binds its one
/// interface to a matching registered driver, and publishes its
/// `/dev/usb-*` symlink.
#[test]
fn s2_connecting_a_device_enumerates_it_and_binds_a_matching_driver() {
    init_logging();
    let core = Core::new(fast_config());
    core.start();
    let hcd = Arc::new(ScriptedHcd::new(core.engine.clone(), 4));
    core.add_hcd(1, hcd.clone());

    let recorder = Arc::new(Recorder::default());
    core.connect_internal_driver(
        vec![Filter {
            class: Some(support::fake_hcd::DEVICE_CLASS),
            ..Default::default()
        }],
        recorder.clone(),
    );

    hcd.connect(1);
    core.notify_root_hub_change(1);

    assert!(
        wait_until(Duration::from_secs(2), || !recorder.insertions.lock().unwrap().is_empty()),
        "no insertion notified within the deadline"
    );

    let (device, descriptor, location) = recorder.insertions.lock().unwrap()[0].clone();
    assert_eq!(descriptor.id_vendor, support::fake_hcd::VENDOR);
    assert_eq!(descriptor.id_product, support::fake_hcd::PRODUCT);
    assert_eq!(location.hcd_ordinal(), 1);
    assert_eq!(location.port_at(0), 1);

    let dev = core.tree.get(device).expect("enumerated device present in the tree");
    assert_eq!(dev.address, 1);

    let path = usbcore::registry::symlink_path(
        support::fake_hcd::VENDOR,
        support::fake_hcd::PRODUCT,
        support::fake_hcd::INTERFACE_INDEX,
    );
    assert_eq!(core.registry.symlink_target(&path), Some(device));
}

/// S3: once enumerated, a driver can still read the device descriptor
/// back through a plain synchronous control IN transfer, not just
/// through the cached copy in the tree.
#[test]
fn s3_sync_control_read_of_the_device_descriptor_round_trips() {
    init_logging();
    let core = Core::new(fast_config());
    core.start();
    let hcd = Arc::new(ScriptedHcd::new(core.engine.clone(), 4));
    core.add_hcd(1, hcd.clone());

    let recorder = Arc::new(Recorder::default());
    core.connect_internal_driver(
        vec![Filter {
            class: Some(support::fake_hcd::DEVICE_CLASS),
            ..Default::default()
        }],
        recorder.clone(),
    );

    hcd.connect(1);
    core.notify_root_hub_change(1);
    assert!(wait_until(Duration::from_secs(2), || !recorder.insertions.lock().unwrap().is_empty()));
    let device = recorder.insertions.lock().unwrap()[0].0;

    let (tx, _rx) = mpsc::channel();
    let driver = core.connect_driver(Vec::new(), tx);
    let opened = core.handle_request(
        driver,
        usbcore::ipc::Request::Open {
            device,
            interface: None,
            transfer_type: usbcore::descriptor::TransferType::Control,
            direction: usbcore::descriptor::EndpointDirection::Out,
            location_id: 0,
        },
    );
    let pipe = match opened {
        usbcore::ipc::Response::Opened { pipe } => pipe,
        other => panic!("unexpected response: {other:?}"),
    };

    let resp = core.handle_request(
        driver,
        usbcore::ipc::Request::Urb {
            pipe,
            transfer_type: usbcore::descriptor::TransferType::Control,
            direction: usbcore::descriptor::EndpointDirection::In,
            size: 18,
            sync: true,
            setup: Some([0x80, 0x06, 0, 1, 0, 0, 18, 0]),
            timeout_ms: 2000,
            data: Vec::new(),
        },
    );
    match resp {
        usbcore::ipc::Response::UrbSync { transferred, error, data } => {
            assert!(error.is_none());
            assert_eq!(transferred, 18);
            let id_vendor = u16::from_le_bytes([data[8], data[9]]);
            assert_eq!(id_vendor, support::fake_hcd::VENDOR);
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

/// S6: a hub reporting a port disconnect tears the subtree down
/// depth-first, notifies deletion for every bound interface, and
/// frees the device's address back to the bitmap.
#[test]
fn s6_disconnecting_a_device_tears_down_its_subtree_and_frees_its_address() {
    init_logging();
    let core = Core::new(fast_config());
    core.start();
    let hcd = Arc::new(ScriptedHcd::new(core.engine.clone(), 4));
    core.add_hcd(1, hcd.clone());

    let recorder = Arc::new(Recorder::default());
    core.connect_internal_driver(
        vec![Filter {
            class: Some(support::fake_hcd::DEVICE_CLASS),
            ..Default::default()
        }],
        recorder.clone(),
    );

    hcd.connect(1);
    core.notify_root_hub_change(1);
    assert!(wait_until(Duration::from_secs(2), || !recorder.insertions.lock().unwrap().is_empty()));
    let device = recorder.insertions.lock().unwrap()[0].0;
    assert!(core.tree.get(device).is_some());

    hcd.disconnect(1);
    core.notify_root_hub_change(1);

    assert!(
        wait_until(Duration::from_secs(2), || core.tree.get(device).is_none()),
        "device was not torn down within the deadline"
    );
    assert_eq!(recorder.deletions.lock().unwrap().as_slice(), &[device]);
}

#[test]
fn no_connected_devices_means_only_the_root_hub_exists() {
    let core = Core::new(config());
    core.add_hcd(1, Arc::new(FakeHcd::new()));

    let root = core.tree.root_of(1).expect("root hub installed");
    let device = core.tree.get(root).expect("root hub node present");
    assert_eq!(device.children.len(), 4);
    assert!(device.children.iter().all(|c| c.is_none()));
}

#[test]
fn removing_an_hcd_tears_down_every_device_under_its_root_hub() {
    let core = Core::new(config());
    core.add_hcd(1, Arc::new(FakeHcd::new()));
    let root = core.tree.root_of(1).unwrap();
    assert!(core.tree.get(root).is_some());

    core.remove_hcd(1);

    assert!(core.tree.root_of(1).is_none());
    assert!(core.tree.get(root).is_none());
    assert!(core.hcds.get(1).is_none());
}

#[test]
fn a_failed_hcd_never_joins_the_active_set_and_leaves_others_alone() {
    let core = Core::new(config());
    core.add_hcd(1, Arc::new(FakeHcd::new()));

    let mut bad = FakeHcd::new();
    bad.fail_init = true;
    core.add_hcd(2, Arc::new(bad));

    assert!(core.hcds.get(1).is_some());
    assert!(core.hcds.get(2).is_none());
    assert!(core.tree.root_of(1).is_some());
    assert!(core.tree.root_of(2).is_none());
}

#[test]
fn connecting_a_driver_assigns_an_id_distinct_from_the_enumeration_sentinel() {
    let core = Core::new(config());
    let (tx, _rx) = mpsc::channel();
    let driver = core.connect_driver(Vec::new(), tx);
    assert_ne!(driver, usbcore::registry::ENUMERATION_DRIVER);
}

#[test]
fn devdesc_request_reports_the_descriptor_and_strings_stored_on_the_device() {
    let core = Core::new(config());
    core.add_hcd(1, Arc::new(FakeHcd::new()));
    let root = core.tree.root_of(1).unwrap();

    let (tx, _rx) = mpsc::channel();
    let driver = core.connect_driver(Vec::new(), tx);
    let resp = core.handle_request(driver, usbcore::ipc::Request::DevDesc { device: root });
    match resp {
        usbcore::ipc::Response::DeviceInfo { descriptor, manufacturer, .. } => {
            assert_eq!(descriptor.b_max_packet_size_0, 8);
            assert_eq!(manufacturer, "root hub");
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[test]
fn an_unopened_pipe_id_is_rejected_rather_than_silently_accepted() {
    let core = Core::new(config());
    core.add_hcd(1, Arc::new(FakeHcd::new()));
    let (tx, _rx) = mpsc::channel();
    let driver = core.connect_driver(Vec::new(), tx);

    let resp = core.handle_request(
        driver,
        usbcore::ipc::Request::Urb {
            pipe: 9999,
            transfer_type: usbcore::descriptor::TransferType::Bulk,
            direction: usbcore::descriptor::EndpointDirection::In,
            size: 64,
            sync: true,
            setup: None,
            timeout_ms: 0,
            data: Vec::new(),
        },
    );
    assert!(matches!(resp, usbcore::ipc::Response::Error { .. }));
}

#[test]
fn alloc_and_free_round_trip_through_the_shared_pool() {
    let core = Core::new(config());
    let (tx, _rx) = mpsc::channel();
    let driver = core.connect_driver(Vec::new(), tx);

    let resp = core.handle_request(driver, usbcore::ipc::Request::Alloc { size: 128 });
    let addr = match resp {
        usbcore::ipc::Response::Allocated { address } => address,
        other => panic!("unexpected response: {other:?}"),
    };
    let resp = core.handle_request(driver, usbcore::ipc::Request::Free { address: addr, size: 128 });
    assert!(matches!(resp, usbcore::ipc::Response::Freed));
}

#[test]
fn timed_out_urb_completes_itself_without_any_hcd_callback() {
    let engine = usbcore::transfer::TransferEngine::new();
    let hcds = usbcore::hcd::HcdSet::new();
    hcds.insert(1, Arc::new(FakeHcd::new())).unwrap();

    let urb = make_bulk_urb(1);
    let id = engine.submit(&hcds, urb, false).unwrap();
    assert!(!engine.check(id));

    engine.tick(&hcds, 1, 10_000);

    assert!(engine.check(id));
    let (_, error) = engine.result(id).unwrap();
    assert_eq!(error, Some(usbcore::CoreError::Timeout));
}

#[test]
fn cancel_only_flags_the_urb_and_waits_for_the_hcds_own_completion() {
    let engine = usbcore::transfer::TransferEngine::new();
    let hcds = usbcore::hcd::HcdSet::new();
    hcds.insert(1, Arc::new(FakeHcd::new())).unwrap();

    let urb = make_bulk_urb(1);
    let id = engine.submit(&hcds, urb, false).unwrap();

    engine.cancel(&hcds, id);
    assert!(!engine.check(id), "cancel alone must not finish the URB");

    engine.on_complete(id, -1);
    assert!(engine.check(id));
    let (_, error) = engine.result(id).unwrap();
    assert_eq!(error, Some(usbcore::CoreError::Aborted));
}

fn make_bulk_urb(hcd_ordinal: u8) -> usbcore::transfer::Urb {
    usbcore::transfer::Urb {
        id: 0,
        pipe: 0,
        driver: usbcore::registry::ENUMERATION_DRIVER,
        device: 0,
        hcd_ordinal,
        transfer_type: usbcore::descriptor::TransferType::Bulk,
        direction: usbcore::descriptor::EndpointDirection::In,
        setup: None,
        buffer: 0,
        length: 0,
        transferred: 0,
        error: None,
        state: usbcore::transfer::UrbState::Idle,
        synchronous: false,
        timeout_ms: 5,
        elapsed_ms: 0,
        hcd_private: 0,
        recipient: usbcore::transfer::Recipient::Driver(usbcore::registry::ENUMERATION_DRIVER),
        is_root_hub: false,
        aborted: false,
        hub_status_endpoint_of: None,
    }
}

#[test]
fn ipc_wire_round_trip_through_bincode_preserves_a_request() {
    let req = usbcore::ipc::Request::Open {
        device: 3,
        interface: Some(0),
        transfer_type: usbcore::descriptor::TransferType::Interrupt,
        direction: usbcore::descriptor::EndpointDirection::In,
        location_id: 42,
    };
    let bytes = bincode::serialize(&req).unwrap();
    let decoded: usbcore::ipc::Request = bincode::deserialize(&bytes).unwrap();
    match decoded {
        usbcore::ipc::Request::Open { device, location_id, .. } => {
            assert_eq!(device, 3);
            assert_eq!(location_id, 42);
        }
        other => panic!("unexpected request: {other:?}"),
    }
}

