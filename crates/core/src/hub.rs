//! Enumeration and the hub state machine (spec §4.7). One hub thread
//! serializes work for the whole topology, the way the teacher's
//! scheduler serializes run-queue decisions behind one lock: events
//! come off a queue fed by root-hub polling and by downstream hubs'
//! interrupt-IN status endpoints, and each port runs the
//! Disconnected → Debouncing → Resetting → Addressing → Configuring →
//! Active state diagram independently.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::address::AddressBitmap;
use crate::buffer_pool::BufferPool;
use crate::config::CoreConfig;
use crate::descriptor::{
    self, EndpointDirection, TransferType, UsbDeviceDescriptor, DEVICE_DESCRIPTOR_LEN,
};
use crate::device::{Device, DeviceId, DeviceKind, DeviceTree, Interface, InterfaceBinding, Speed};
use crate::error::CoreError;
use crate::hcd::{HcdSet, PortStatus};
use crate::location::LocationId;
use crate::pipe::{PipeDescriptor, ENUMERATION_DRIVER};
use crate::registry::{symlink_path, DriverRegistry, MatchContext, MatchContextOwned, OrphanInterface};
use crate::transfer::{Recipient, TransferEngine, Urb, UrbState};

const HUB_CLASS_GET_STATUS: u8 = 0x00;
const HUB_CLASS_CLEAR_FEATURE: u8 = 0x01;
const HUB_CLASS_SET_FEATURE: u8 = 0x03;

const FEATURE_PORT_RESET: u16 = 4;
const FEATURE_PORT_POWER: u16 = 8;
const FEATURE_C_PORT_CONNECTION: u16 = 16;
const FEATURE_C_PORT_RESET: u16 = 20;

const STD_GET_DESCRIPTOR: u8 = 0x06;
const STD_SET_ADDRESS: u8 = 0x05;
const STD_SET_CONFIGURATION: u8 = 0x09;

fn setup_packet(bm_request_type: u8, b_request: u8, w_value: u16, w_index: u16, w_length: u16) -> [u8; 8] {
    let mut p = [0u8; 8];
    p[0] = bm_request_type;
    p[1] = b_request;
    p[2..4].copy_from_slice(&w_value.to_le_bytes());
    p[4..6].copy_from_slice(&w_index.to_le_bytes());
    p[6..8].copy_from_slice(&w_length.to_le_bytes());
    p
}

/// Which object a port's class requests are addressed to: a root-hub
/// port is read through the HCD's own shim (glossary: "status is read
/// through an HCD-specific shim rather than an IN transfer"); a
/// downstream hub's port is addressed through the standard control
/// pipe on the hub device itself.
#[derive(Debug, Clone, Copy)]
enum PortOwner {
    RootHub(u8),
    Hub(DeviceId),
}

struct PortState {
    owner: PortOwner,
    port: u8,
    phase: Phase,
    enum_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Debouncing,
    Resetting,
    Addressing,
    Configuring,
    Active,
    Failed,
}

enum HubEvent {
    RootHub(u8),
    Hub(DeviceId),
}

pub struct HubManager {
    tree: Arc<DeviceTree>,
    registry: Arc<DriverRegistry>,
    engine: Arc<TransferEngine>,
    hcds: Arc<HcdSet>,
    pool: Arc<BufferPool>,
    config: CoreConfig,
    addresses: Mutex<HashMap<u8, AddressBitmap>>,
    ports: Mutex<HashMap<DeviceId, Vec<PortState>>>,
    events: Mutex<VecDeque<HubEvent>>,
    cond: Condvar,
}

impl HubManager {
    pub fn new(
        tree: Arc<DeviceTree>,
        registry: Arc<DriverRegistry>,
        engine: Arc<TransferEngine>,
        hcds: Arc<HcdSet>,
        pool: Arc<BufferPool>,
        config: CoreConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tree,
            registry,
            engine,
            hcds,
            pool,
            config,
            addresses: Mutex::new(HashMap::new()),
            ports: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        })
    }

    /// Installs the synthetic root hub for a newly registered HCD and
    /// seeds its port table; `port_count` comes from the HCD itself.
    pub fn install_root_hub(&self, hcd_ordinal: u8, port_count: u8) -> DeviceId {
        let location = LocationId::root(hcd_ordinal);
        let device = Device {
            speed: Speed::High,
            address: 0,
            location,
            parent: None,
            kind: DeviceKind::Hub,
            device_descriptor: blank_device_descriptor(),
            config_descriptor_raw: Vec::new(),
            interfaces: Vec::new(),
            control_pipe: PipeDescriptor::control(64),
            children: vec![None; port_count as usize],
            status_transfer: None,
            hcd_ordinal,
            manufacturer: "root hub".into(),
            product: "root hub".into(),
            serial_number: String::new(),
            language_id: 0x0409,
        };
        let id = self.tree.set_root(hcd_ordinal, device);
        self.addresses.lock().unwrap().insert(hcd_ordinal, AddressBitmap::new());
        let mut ports = Vec::with_capacity(port_count as usize);
        for port in 1..=port_count {
            ports.push(PortState {
                owner: PortOwner::RootHub(hcd_ordinal),
                port,
                phase: Phase::Disconnected,
                enum_attempts: 0,
            });
        }
        self.ports.lock().unwrap().insert(id, ports);
        id
    }

    pub fn notify_root_hub(&self, hcd_ordinal: u8) {
        self.events.lock().unwrap().push_back(HubEvent::RootHub(hcd_ordinal));
        self.cond.notify_all();
    }

    pub fn notify_hub(&self, hub: DeviceId) {
        self.events.lock().unwrap().push_back(HubEvent::Hub(hub));
        self.cond.notify_all();
    }

    /// Runs forever, pulling one hub event at a time and scanning it.
    /// Spawn this as "the" hub thread; everything else posts events.
    pub fn run(self: &Arc<Self>) {
        loop {
            let event = {
                let mut events = self.events.lock().unwrap();
                while events.is_empty() {
                    events = self.cond.wait(events).unwrap();
                }
                events.pop_front().unwrap()
            };
            match event {
                HubEvent::RootHub(hcd_ordinal) => self.scan_root_hub(hcd_ordinal),
                HubEvent::Hub(hub) => self.scan_downstream_hub(hub),
            }
        }
    }

    fn scan_root_hub(&self, hcd_ordinal: u8) {
        let Some(hcd) = self.hcds.get(hcd_ordinal) else { return };
        let Some(root) = self.tree.root_of(hcd_ordinal) else { return };
        let change_bits = hcd.get_roothub_status();
        if change_bits == 0 {
            return;
        }
        let port_count = {
            let ports = self.ports.lock().unwrap();
            ports.get(&root).map(|p| p.len()).unwrap_or(0)
        };
        for idx in 0..port_count {
            let port = (idx + 1) as u8;
            if change_bits & (1 << (port - 1)) != 0 {
                self.drive_port(root, idx);
            }
        }
    }

    fn scan_downstream_hub(&self, hub: DeviceId) {
        let port_count = {
            let ports = self.ports.lock().unwrap();
            ports.get(&hub).map(|p| p.len()).unwrap_or(0)
        };
        for idx in 0..port_count {
            let status = self.get_status_for(hub, idx);
            if let Ok(status) = status {
                if status.intersects(
                    PortStatus::C_CONNECTION | PortStatus::C_ENABLE | PortStatus::C_RESET,
                ) {
                    self.drive_port(hub, idx);
                }
            }
        }
    }

    fn owner_for(&self, hub: DeviceId, idx: usize) -> Option<PortOwner> {
        self.ports.lock().unwrap().get(&hub).and_then(|p| p.get(idx)).map(|p| p.owner)
    }

    fn get_status_for(&self, hub: DeviceId, idx: usize) -> Result<PortStatus, CoreError> {
        let owner = self.owner_for(hub, idx).ok_or(CoreError::NoDevice)?;
        match owner {
            PortOwner::RootHub(hcd_ordinal) => {
                let hcd = self.hcds.get(hcd_ordinal).ok_or(CoreError::NoDevice)?;
                let port = self.ports.lock().unwrap()[&hub][idx].port;
                Ok(hcd.port_status(port))
            }
            PortOwner::Hub(hub_device) => {
                let port = self.ports.lock().unwrap()[&hub_device][idx].port;
                let data = self.hub_control_in(hub_device, HUB_CLASS_GET_STATUS, 0, port as u16, 4)?;
                let status = u16::from_le_bytes([data[0], data[1]]);
                let change = u16::from_le_bytes([data[2], data[3]]);
                Ok(parse_port_status(status, change))
            }
        }
    }

    fn set_feature(&self, hub: DeviceId, idx: usize, feature: u16) -> Result<(), CoreError> {
        let owner = self.owner_for(hub, idx).ok_or(CoreError::NoDevice)?;
        let port = self.ports.lock().unwrap()[&hub][idx].port;
        match owner {
            PortOwner::RootHub(hcd_ordinal) => {
                self.root_hub_class_request(hcd_ordinal, HUB_CLASS_SET_FEATURE, feature, port as u16)
            }
            PortOwner::Hub(hub_device) => {
                self.hub_control_out(hub_device, HUB_CLASS_SET_FEATURE, feature, port as u16, &[])
            }
        }
    }

    fn clear_feature(&self, hub: DeviceId, idx: usize, feature: u16) -> Result<(), CoreError> {
        let owner = self.owner_for(hub, idx).ok_or(CoreError::NoDevice)?;
        let port = self.ports.lock().unwrap()[&hub][idx].port;
        match owner {
            PortOwner::RootHub(hcd_ordinal) => {
                self.root_hub_class_request(hcd_ordinal, HUB_CLASS_CLEAR_FEATURE, feature, port as u16)
            }
            PortOwner::Hub(hub_device) => {
                self.hub_control_out(hub_device, HUB_CLASS_CLEAR_FEATURE, feature, port as u16, &[])
            }
        }
    }

    fn root_hub_class_request(&self, hcd_ordinal: u8, request: u8, value: u16, index: u16) -> Result<(), CoreError> {
        let hcd = self.hcds.get(hcd_ordinal).ok_or(CoreError::NoDevice)?;
        let urb = Urb {
            id: 0,
            pipe: 0,
            driver: ENUMERATION_DRIVER,
            device: 0,
            hcd_ordinal,
            transfer_type: TransferType::Control,
            direction: EndpointDirection::Out,
            setup: Some(setup_packet(0x23, request, value, index, 0)),
            buffer: 0,
            length: 0,
            transferred: 0,
            error: None,
            state: UrbState::Idle,
            synchronous: true,
            timeout_ms: 0,
            elapsed_ms: 0,
            hcd_private: 0,
            recipient: Recipient::Driver(ENUMERATION_DRIVER),
            is_root_hub: true,
            aborted: false,
            hub_status_endpoint_of: None,
        };
        hcd.roothub_transfer(&urb)?;
        Ok(())
    }

    fn hub_control_out(&self, hub: DeviceId, request: u8, value: u16, index: u16, data: &[u8]) -> Result<(), CoreError> {
        self.control_transfer(hub, 0x23, request, value, index, data.len() as u16, EndpointDirection::Out, data)
            .map(|_| ())
    }

    fn hub_control_in(&self, hub: DeviceId, request: u8, value: u16, index: u16, length: u16) -> Result<Vec<u8>, CoreError> {
        self.control_transfer(hub, 0xA3, request, value, index, length, EndpointDirection::In, &[])
    }

    /// One blocking control transfer through the normal submit path —
    /// enumeration never talks to the HCD directly, only through (4),
    /// so the hub thread never holds a lock across an HCD call (spec
    /// §5, §9).
    #[allow(clippy::too_many_arguments)]
    fn control_transfer(
        &self,
        device_id: DeviceId,
        bm_request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        direction: EndpointDirection,
        out_data: &[u8],
    ) -> Result<Vec<u8>, CoreError> {
        let device = self.tree.get(device_id).ok_or(CoreError::NoDevice)?;
        let addr = self.pool.obtain(length as usize).map_err(CoreError::from)?;
        if direction == EndpointDirection::Out && !out_data.is_empty() {
            unsafe {
                std::ptr::copy_nonoverlapping(out_data.as_ptr(), addr as *mut u8, out_data.len());
            }
        }
        let setup = Some(setup_packet(
            bm_request_type,
            request,
            value,
            index,
            length,
        ));
        let urb = Urb {
            id: 0,
            pipe: 0,
            driver: ENUMERATION_DRIVER,
            device: device_id,
            hcd_ordinal: device.hcd_ordinal,
            transfer_type: TransferType::Control,
            direction,
            setup,
            buffer: addr,
            length: length as usize,
            transferred: 0,
            error: None,
            state: UrbState::Idle,
            synchronous: true,
            timeout_ms: 5000,
            elapsed_ms: 0,
            hcd_private: device.control_pipe.hcd_private,
            recipient: Recipient::Driver(ENUMERATION_DRIVER),
            is_root_hub: false,
            aborted: false,
            hub_status_endpoint_of: None,
        };
        let id = self.engine.submit(&self.hcds, urb, true)?;
        let (transferred, error) = self.engine.result(id).unwrap_or((0, Some(CoreError::Io)));
        if let Some(e) = error {
            self.pool.free(addr, length as usize);
            return Err(e);
        }
        let mut out = vec![0u8; transferred];
        if direction == EndpointDirection::In {
            unsafe {
                std::ptr::copy_nonoverlapping(addr as *const u8, out.as_mut_ptr(), transferred);
            }
        }
        self.pool.free(addr, length as usize);
        Ok(out)
    }

    /// The full per-port state machine for one change event (spec
    /// §4.7's transition table), run synchronously on the hub thread.
    fn drive_port(&self, hub: DeviceId, idx: usize) {
        loop {
            let phase = self.ports.lock().unwrap()[&hub][idx].phase;
            match phase {
                Phase::Disconnected => {
                    if !self.debounce(hub, idx) {
                        return;
                    }
                    self.set_phase(hub, idx, Phase::Resetting);
                }
                Phase::Resetting => {
                    if self.reset_port(hub, idx) {
                        self.set_phase(hub, idx, Phase::Addressing);
                    } else {
                        self.set_phase(hub, idx, Phase::Failed);
                        return;
                    }
                }
                Phase::Addressing | Phase::Configuring => {
                    match self.enumerate_port(hub, idx) {
                        Ok(()) => {
                            self.set_phase(hub, idx, Phase::Active);
                            return;
                        }
                        Err(_retry) => {
                            let attempts = {
                                let mut ports = self.ports.lock().unwrap();
                                let p = &mut ports.get_mut(&hub).unwrap()[idx];
                                p.enum_attempts += 1;
                                p.enum_attempts
                            };
                            if attempts >= self.config.enumeration_attempts {
                                self.set_phase(hub, idx, Phase::Failed);
                                return;
                            }
                            self.set_phase(hub, idx, Phase::Disconnected);
                        }
                    }
                }
                Phase::Active | Phase::Failed => {
                    let status = self.get_status_for(hub, idx).unwrap_or(PortStatus::empty());
                    if status.contains(PortStatus::C_CONNECTION) && !status.contains(PortStatus::CONNECTION) {
                        self.disconnect_port(hub, idx);
                        self.set_phase(hub, idx, Phase::Disconnected);
                    } else {
                        return;
                    }
                }
                Phase::Debouncing => return,
            }
        }
    }

    fn set_phase(&self, hub: DeviceId, idx: usize, phase: Phase) {
        if let Some(ports) = self.ports.lock().unwrap().get_mut(&hub) {
            ports[idx].phase = phase;
        }
    }

    /// Samples the connection bit every `debounce_sample_interval`
    /// until it has held steady for `debounce_stable_window`, clearing
    /// `C_CONNECTION` after each sample (spec §4.7). Returns whether
    /// the port ended up connected.
    fn debounce(&self, hub: DeviceId, idx: usize) -> bool {
        self.set_phase(hub, idx, Phase::Debouncing);
        let started = Instant::now();
        let mut stable_since = Instant::now();
        let mut last: Option<bool> = None;
        loop {
            if started.elapsed() > self.config.debounce_timeout {
                self.set_phase(hub, idx, Phase::Disconnected);
                return false;
            }
            let status = match self.get_status_for(hub, idx) {
                Ok(s) => s,
                Err(_) => return false,
            };
            let _ = self.clear_feature(hub, idx, FEATURE_C_PORT_CONNECTION);
            let connected = status.contains(PortStatus::CONNECTION);
            match last {
                Some(prev) if prev == connected => {
                    if stable_since.elapsed() >= self.config.debounce_stable_window {
                        return connected;
                    }
                }
                _ => {
                    stable_since = Instant::now();
                }
            }
            last = Some(connected);
            thread::sleep(self.config.debounce_sample_interval);
        }
    }

    /// SET_FEATURE(RESET) then poll for C_RESET, spec §4.7.
    fn reset_port(&self, hub: DeviceId, idx: usize) -> bool {
        if self.set_feature(hub, idx, FEATURE_PORT_RESET).is_err() {
            return false;
        }
        for _ in 0..self.config.reset_poll_attempts {
            thread::sleep(self.config.reset_poll_interval);
            if let Ok(status) = self.get_status_for(hub, idx) {
                if status.contains(PortStatus::C_RESET) {
                    let _ = self.clear_feature(hub, idx, FEATURE_C_PORT_RESET);
                    return true;
                }
            }
        }
        false
    }

    fn port_speed(&self, hub: DeviceId, idx: usize) -> Speed {
        match self.get_status_for(hub, idx) {
            Ok(status) if status.contains(PortStatus::LOW_SPEED) => Speed::Low,
            Ok(status) if status.contains(PortStatus::HIGH_SPEED) => Speed::High,
            _ => Speed::Full,
        }
    }

    /// Addressing + configuring sequence (spec §4.7): descriptor at
    /// address 0, SET_ADDRESS, descriptor again, configuration walk,
    /// strings, then either hub setup or driver binding.
    fn enumerate_port(&self, hub: DeviceId, idx: usize) -> Result<(), CoreError> {
        let (parent_location, hcd_ordinal, port) = {
            let ports = self.ports.lock().unwrap();
            let owner = ports[&hub][idx].owner;
            let port = ports[&hub][idx].port;
            let hcd_ordinal = match owner {
                PortOwner::RootHub(h) => h,
                PortOwner::Hub(_) => self.tree.get(hub).map(|d| d.hcd_ordinal).ok_or(CoreError::NoDevice)?,
            };
            let loc = self.tree.get(hub).map(|d| d.location).ok_or(CoreError::NoDevice)?;
            (loc, hcd_ordinal, port)
        };
        let speed = self.port_speed(hub, idx);
        let location = parent_location.child((parent_location.depth()), port).ok_or(CoreError::Protocol)?;

        let placeholder = Device {
            speed,
            address: 0,
            location,
            parent: Some((hub, port)),
            kind: DeviceKind::Function,
            device_descriptor: blank_device_descriptor(),
            config_descriptor_raw: Vec::new(),
            interfaces: Vec::new(),
            control_pipe: PipeDescriptor::control(8),
            children: Vec::new(),
            status_transfer: None,
            hcd_ordinal,
            manufacturer: String::new(),
            product: String::new(),
            serial_number: String::new(),
            language_id: 0,
        };
        let device_id = self.tree.attach(hub, port, placeholder)?;

        let result = self.run_addressing(device_id, hcd_ordinal);
        if result.is_err() {
            self.tree.remove(device_id);
        }
        result
    }

    fn run_addressing(&self, device_id: DeviceId, hcd_ordinal: u8) -> Result<(), CoreError> {
        let first = self.control_transfer(
            device_id,
            0x80,
            STD_GET_DESCRIPTOR,
            (1u16) << 8,
            0,
            8,
            EndpointDirection::In,
            &[],
        )?;
        if first.len() < 8 {
            return Err(CoreError::Protocol);
        }
        let max_packet_0 = first[7];

        let address = {
            let mut table = self.addresses.lock().unwrap();
            table.entry(hcd_ordinal).or_insert_with(AddressBitmap::new).alloc()?
        };

        self.control_transfer(device_id, 0x00, STD_SET_ADDRESS, address as u16, 0, 0, EndpointDirection::Out, &[])?;

        let _ = self.tree.with_mut(device_id, |d| {
            d.address = address;
            d.control_pipe = PipeDescriptor::control(max_packet_0 as u16);
        });

        let full = self.control_transfer(
            device_id,
            0x80,
            STD_GET_DESCRIPTOR,
            (1u16) << 8,
            0,
            DEVICE_DESCRIPTOR_LEN as u16,
            EndpointDirection::In,
            &[],
        )?;
        let device_descriptor = UsbDeviceDescriptor::parse(&full)?;

        let header_bytes = self.control_transfer(
            device_id,
            0x80,
            STD_GET_DESCRIPTOR,
            (2u16) << 8,
            0,
            9,
            EndpointDirection::In,
            &[],
        )?;
        let header = descriptor::UsbConfigurationHeader::parse(&header_bytes)?;
        let full_config = self.control_transfer(
            device_id,
            0x80,
            STD_GET_DESCRIPTOR,
            (2u16) << 8,
            0,
            header.w_total_length,
            EndpointDirection::In,
            &[],
        )?;
        let walked = descriptor::walk_configuration(&full_config)?;

        let (effective_class, effective_subclass, effective_protocol) = walked
            .iad_class_override
            .unwrap_or((device_descriptor.b_device_class, device_descriptor.b_device_subclass, device_descriptor.b_device_protocol));

        let langids = self.control_transfer(device_id, 0x80, STD_GET_DESCRIPTOR, 3u16 << 8, 0, 255, EndpointDirection::In, &[]).unwrap_or_default();
        let language_id = descriptor::parse_langid_list(&langids).first().copied().unwrap_or(0x0409);

        let manufacturer = self.fetch_string(device_id, device_descriptor.i_manufacturer, language_id, "Generic");
        let product = self.fetch_string(device_id, device_descriptor.i_product, language_id, class_fallback_name(effective_class));
        let serial_number = self.fetch_string(device_id, device_descriptor.i_serial_number, language_id, "");

        let _ = self.tree.with_mut(device_id, |d| {
            d.device_descriptor = device_descriptor;
            d.config_descriptor_raw = full_config.clone();
            d.manufacturer = manufacturer;
            d.product = product;
            d.serial_number = serial_number;
            d.language_id = language_id;
        });

        let is_hub = effective_class == 0x09;
        if is_hub {
            self.configure_as_hub(device_id)?;
        } else {
            self.control_transfer(device_id, 0x00, STD_SET_CONFIGURATION, header.b_configuration_value as u16, 0, 0, EndpointDirection::Out, &[])?;
            self.install_interfaces(device_id, &walked.interfaces, effective_class, effective_subclass, effective_protocol);
            self.bind_interfaces(device_id);
        }
        Ok(())
    }

    fn fetch_string(&self, device_id: DeviceId, index: u8, language_id: u16, fallback: &str) -> String {
        if index == 0 {
            return fallback.to_string();
        }
        match self.control_transfer(device_id, 0x80, STD_GET_DESCRIPTOR, (3u16 << 8) | index as u16, language_id, 255, EndpointDirection::In, &[]) {
            Ok(bytes) if bytes.len() > 2 => descriptor::parse_string_descriptor(&bytes),
            _ => fallback.to_string(),
        }
    }

    fn install_interfaces(
        &self,
        device_id: DeviceId,
        walked: &[descriptor::InterfaceRecord],
        class: u8,
        subclass: u8,
        protocol: u8,
    ) {
        let interfaces: Vec<Interface> = walked
            .iter()
            .map(|rec| Interface {
                descriptor: rec.descriptor.unwrap_or(descriptor::UsbInterfaceDescriptor {
                    b_interface_number: 0,
                    b_alternate_setting: 0,
                    b_num_endpoints: rec.endpoints.len() as u8,
                    b_interface_class: class,
                    b_interface_subclass: subclass,
                    b_interface_protocol: protocol,
                    i_interface: 0,
                }),
                endpoints: rec.endpoints.clone(),
                class_specific: rec.class_specific.clone(),
                string: None,
                binding: InterfaceBinding::Orphaned,
            })
            .collect();
        let _ = self.tree.with_mut(device_id, |d| d.interfaces = interfaces);
    }

    /// Matches every installed interface against the registry; bound
    /// interfaces get an insertion event, unmatched ones stay orphaned
    /// (and are recorded so a later `register` can still claim them).
    fn bind_interfaces(&self, device_id: DeviceId) {
        let Some(device) = self.tree.get(device_id) else { return };
        for (idx, iface) in device.interfaces.iter().enumerate() {
            let ctx = MatchContext {
                vendor: device.device_descriptor.id_vendor,
                product: device.device_descriptor.id_product,
                device_class: device.device_descriptor.b_device_class,
                device_subclass: device.device_descriptor.b_device_subclass,
                device_protocol: device.device_descriptor.b_device_protocol,
                interface_class: Some((
                    iface.descriptor.b_interface_class,
                    iface.descriptor.b_interface_subclass,
                    iface.descriptor.b_interface_protocol,
                )),
            };
            match self.registry.best_match(&ctx) {
                Some(driver) => {
                    let _ = self.tree.with_mut(device_id, |d| d.interfaces[idx].binding = InterfaceBinding::Bound(driver));
                    self.registry.notify_insertion(driver, device_id, device.device_descriptor, device.location);
                    let path = symlink_path(device.device_descriptor.id_vendor, device.device_descriptor.id_product, idx);
                    self.registry.bind_symlink(path, device_id);
                }
                None => {
                    self.registry.add_orphan(OrphanInterface {
                        device: device_id,
                        interface_index: idx,
                        context: MatchContextOwned {
                            vendor: ctx.vendor,
                            product: ctx.product,
                            device_class: ctx.device_class,
                            device_subclass: ctx.device_subclass,
                            device_protocol: ctx.device_protocol,
                            interface_class: ctx.interface_class.unwrap_or((0, 0, 0)),
                        },
                    });
                }
            }
        }
    }

    /// Hub-specific configuring path (spec §4.7): configuration 1,
    /// hub descriptor for port count, power every port, prime the
    /// status endpoint.
    fn configure_as_hub(&self, device_id: DeviceId) -> Result<(), CoreError> {
        self.control_transfer(device_id, 0x00, STD_SET_CONFIGURATION, 1, 0, 0, EndpointDirection::Out, &[])?;
        let hub_desc = self.control_transfer(device_id, 0xA0, STD_GET_DESCRIPTOR, 0x29u16 << 8, 0, 9, EndpointDirection::In, &[])?;
        let port_count = hub_desc.get(2).copied().unwrap_or(0).min(self.config.max_hub_ports);

        let _ = self.tree.with_mut(device_id, |d| {
            d.kind = DeviceKind::Hub;
            d.children = vec![None; port_count as usize];
        });

        let mut ports = Vec::with_capacity(port_count as usize);
        for port in 1..=port_count {
            let _ = self.control_transfer(device_id, 0x23, HUB_CLASS_SET_FEATURE, FEATURE_PORT_POWER, port as u16, 0, EndpointDirection::Out, &[]);
            ports.push(PortState {
                owner: PortOwner::Hub(device_id),
                port,
                phase: Phase::Disconnected,
                enum_attempts: 0,
            });
        }
        self.ports.lock().unwrap().insert(device_id, ports);

        let length = (port_count as usize).div_ceil(8) + 1;
        let addr = self.pool.obtain(length).map_err(CoreError::from)?;
        let device = self.tree.get(device_id).ok_or(CoreError::NoDevice)?;
        let urb = Urb {
            id: 0,
            pipe: 0,
            driver: ENUMERATION_DRIVER,
            device: device_id,
            hcd_ordinal: device.hcd_ordinal,
            transfer_type: TransferType::Interrupt,
            direction: EndpointDirection::In,
            setup: None,
            buffer: addr,
            length,
            transferred: 0,
            error: None,
            state: UrbState::Idle,
            synchronous: false,
            timeout_ms: 0,
            elapsed_ms: 0,
            hcd_private: 0,
            recipient: Recipient::Driver(ENUMERATION_DRIVER),
            is_root_hub: false,
            aborted: false,
            hub_status_endpoint_of: Some(device_id),
        };
        let urb_id = self.engine.submit(&self.hcds, urb, false)?;
        let _ = self.tree.with_mut(device_id, |d| d.status_transfer = Some(urb_id as u64));
        Ok(())
    }

    /// Depth-first disconnect walk (spec §4.7, S6): grandchildren are
    /// torn down before their parents so a driver never outlives the
    /// device beneath it.
    fn disconnect_port(&self, hub: DeviceId, idx: usize) {
        let Some(child) = self.tree.with(hub, |d| d.children.get(idx).copied().flatten()).flatten() else {
            return;
        };
        self.teardown_subtree(child);
        self.ports.lock().unwrap().remove(&child);
    }

    /// Tears down `root` and every descendant, grandchildren first:
    /// notify the bound driver, close its pipes, free its address,
    /// then drop the node. Reused verbatim when an HCD is torn down
    /// (every root-hub child is torn down this same way).
    pub fn teardown_subtree(&self, root: DeviceId) {
        let mut order = self.tree.subtree(root);
        order.reverse();
        for device_id in order {
            let Some(device) = self.tree.get(device_id) else { continue };
            for iface in &device.interfaces {
                if let InterfaceBinding::Bound(driver) = iface.binding {
                    self.registry.notify_deletion(driver, device_id);
                }
            }
            self.registry.remove_symlinks_for(device_id);
            if let Some(urb_id) = device.status_transfer {
                self.engine.cancel(&self.hcds, urb_id as usize);
            }
            if device.address != 0 {
                if let Some(table) = self.addresses.lock().unwrap().get_mut(&device.hcd_ordinal) {
                    table.free(device.address);
                }
            }
            self.tree.remove(device_id);
        }
    }
}

fn blank_device_descriptor() -> UsbDeviceDescriptor {
    UsbDeviceDescriptor {
        b_length: DEVICE_DESCRIPTOR_LEN as u8,
        b_descriptor_type: descriptor::DESC_TYPE_DEVICE,
        bcd_usb: 0,
        b_device_class: 0,
        b_device_subclass: 0,
        b_device_protocol: 0,
        b_max_packet_size_0: 8,
        id_vendor: 0,
        id_product: 0,
        bcd_device: 0,
        i_manufacturer: 0,
        i_product: 0,
        i_serial_number: 0,
        b_num_configurations: 0,
    }
}

fn parse_port_status(status: u16, change: u16) -> PortStatus {
    let mut bits = PortStatus::from_bits_truncate(status as u32);
    bits |= PortStatus::from_bits_truncate((change as u32) << 16);
    bits
}

fn class_fallback_name(class: u8) -> &'static str {
    match class {
        0x09 => "USB Hub",
        0x03 => "USB HID",
        0x08 => "USB Mass Storage",
        _ => "Generic",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hcd::test_support::FakeHcd;

    #[test]
    fn install_root_hub_seeds_one_port_state_per_port() {
        let tree = Arc::new(DeviceTree::new());
        let registry = Arc::new(DriverRegistry::new());
        let engine = Arc::new(TransferEngine::new());
        let hcds = Arc::new(HcdSet::new());
        hcds.insert(1, Arc::new(FakeHcd::new())).unwrap();
        let pool = Arc::new(BufferPool::new(4096, 32));
        let manager = HubManager::new(tree.clone(), registry, engine, hcds, pool, CoreConfig::default());

        let root = manager.install_root_hub(1, 4);
        assert_eq!(manager.ports.lock().unwrap()[&root].len(), 4);
        assert_eq!(tree.get(root).unwrap().children.len(), 4);
    }

    #[test]
    fn s1_no_connected_devices_means_no_scan_activity() {
        let tree = Arc::new(DeviceTree::new());
        let registry = Arc::new(DriverRegistry::new());
        let engine = Arc::new(TransferEngine::new());
        let hcds = Arc::new(HcdSet::new());
        let hcd = Arc::new(FakeHcd::new());
        hcds.insert(1, hcd.clone()).unwrap();
        let pool = Arc::new(BufferPool::new(4096, 32));
        let manager = HubManager::new(tree, registry, engine, hcds, pool, CoreConfig::default());
        manager.install_root_hub(1, 4);

        assert_eq!(hcd.get_roothub_status(), 0);
        manager.scan_root_hub(1);
        assert!(hcd.enqueued.lock().unwrap().is_empty());
    }
}
