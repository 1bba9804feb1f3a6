//! The in-memory device tree (spec §3, §4.3). One synthetic root hub
//! per HCD; nodes are devices; a single global lock (mirroring the
//! teacher's single `RwLock`-guarded scheduler process list) protects
//! parent/child links and the location-ID index. Devices are stored in
//! a `slab::Slab` the way the teacher's `ProcessList` stores processes
//! by `Pid`, rather than as an `Arc`/`Weak` graph — it sidesteps cycle
//! bookkeeping entirely for a structure that is always mutated under
//! one lock anyway.

use std::collections::HashMap;
use std::sync::Mutex;

use slab::Slab;

use crate::descriptor::{UsbDeviceDescriptor, UsbEndpointDescriptor, UsbInterfaceDescriptor};
use crate::error::CoreError;
use crate::location::LocationId;
use crate::pipe::PipeDescriptor;
use crate::registry::DriverId;

pub type DeviceId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Low,
    Full,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Function,
    Hub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceBinding {
    Orphaned,
    Bound(DriverId),
}

#[derive(Debug, Clone)]
pub struct Interface {
    pub descriptor: UsbInterfaceDescriptor,
    pub endpoints: Vec<UsbEndpointDescriptor>,
    pub class_specific: Vec<u8>,
    pub string: Option<String>,
    pub binding: InterfaceBinding,
}

#[derive(Debug, Clone)]
pub struct Device {
    pub speed: Speed,
    /// 0 while the device is mid-enumeration, 1..127 once addressed.
    pub address: u8,
    pub location: LocationId,
    pub parent: Option<(DeviceId, u8)>,
    pub kind: DeviceKind,
    pub device_descriptor: UsbDeviceDescriptor,
    pub config_descriptor_raw: Vec<u8>,
    pub interfaces: Vec<Interface>,
    pub control_pipe: PipeDescriptor,
    /// Sized to the hub's port count; `None` entries are empty ports.
    /// Empty for non-hub devices.
    pub children: Vec<Option<DeviceId>>,
    /// Outstanding status-change URB on this hub's interrupt-IN
    /// endpoint; `None` for non-hub devices or before it is primed.
    pub status_transfer: Option<u64>,
    pub hcd_ordinal: u8,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    pub language_id: u16,
}

impl Device {
    pub fn is_hub(&self) -> bool {
        matches!(self.kind, DeviceKind::Hub)
    }
}

struct Inner {
    devices: Slab<Device>,
    /// One synthetic root hub per HCD, keyed by HCD ordinal.
    roots: HashMap<u8, DeviceId>,
    by_location: HashMap<LocationId, DeviceId>,
}

/// The process-wide device tree. Every operation that walks
/// parent/child pointers or the location index takes this lock;
/// nothing here ever calls into an HCD while holding it (spec §5).
pub struct DeviceTree {
    inner: Mutex<Inner>,
}

impl DeviceTree {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                devices: Slab::new(),
                roots: HashMap::new(),
                by_location: HashMap::new(),
            }),
        }
    }

    /// Installs `device` as the synthetic root hub for `hcd_ordinal`.
    /// Replaces a prior root for the same HCD, if any (teardown).
    pub fn set_root(&self, hcd_ordinal: u8, device: Device) -> DeviceId {
        let mut inner = self.inner.lock().unwrap();
        let location = device.location;
        let id = inner.devices.insert(device);
        inner.roots.insert(hcd_ordinal, id);
        inner.by_location.insert(location, id);
        id
    }

    pub fn root_of(&self, hcd_ordinal: u8) -> Option<DeviceId> {
        self.inner.lock().unwrap().roots.get(&hcd_ordinal).copied()
    }

    /// Links a freshly constructed device as a child of `parent` on
    /// `port`, and back-links the parent's child slot (spec §3
    /// invariant: "the parent's child array at that index points back
    /// at the child").
    pub fn attach(&self, parent: DeviceId, port: u8, device: Device) -> Result<DeviceId, CoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.devices.contains(parent) {
            return Err(CoreError::NoDevice);
        }
        let location = device.location;
        let id = inner.devices.insert(device);
        let parent_dev = &mut inner.devices[parent];
        let slot = port as usize;
        if slot >= parent_dev.children.len() {
            return Err(CoreError::Protocol);
        }
        parent_dev.children[slot] = Some(id);
        inner.by_location.insert(location, id);
        Ok(id)
    }

    pub fn get(&self, id: DeviceId) -> Option<Device> {
        self.inner.lock().unwrap().devices.get(id).cloned()
    }

    pub fn with<R>(&self, id: DeviceId, f: impl FnOnce(&Device) -> R) -> Option<R> {
        self.inner.lock().unwrap().devices.get(id).map(f)
    }

    pub fn with_mut<R>(&self, id: DeviceId, f: impl FnOnce(&mut Device) -> R) -> Option<R> {
        self.inner.lock().unwrap().devices.get_mut(id).map(f)
    }

    /// Looks up a device by its location ID, optionally scoped to
    /// only the subtree rooted at `start` (depth-first search).
    pub fn find_by_location(&self, location: LocationId) -> Option<DeviceId> {
        self.inner.lock().unwrap().by_location.get(&location).copied()
    }

    /// Depth-first list of a subtree, the node itself first, children
    /// after — used by enumeration "find" visibility and by the
    /// disconnect walk (spec §4.7, S6 wants grandchildren freed
    /// first, so callers reverse this list when tearing down).
    pub fn subtree(&self, root: DeviceId) -> Vec<DeviceId> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(dev) = inner.devices.get(id) {
                stack.extend(dev.children.iter().flatten().copied());
            }
        }
        out
    }

    /// Every device id currently in the tree, in no particular order —
    /// used by driver teardown to find bound interfaces regardless of
    /// which HCD root they hang off.
    pub fn all_ids(&self) -> Vec<DeviceId> {
        self.inner.lock().unwrap().devices.iter().map(|(id, _)| id).collect()
    }

    /// Removes a single node (not its children) from the tree and
    /// index, and clears the parent's back-pointer if still intact.
    pub fn remove(&self, id: DeviceId) -> Option<Device> {
        let mut inner = self.inner.lock().unwrap();
        let device = inner.devices.try_remove(id)?;
        inner.by_location.remove(&device.location);
        if let Some((parent, port)) = device.parent {
            if let Some(parent_dev) = inner.devices.get_mut(parent) {
                if let Some(slot) = parent_dev.children.get_mut(port as usize) {
                    *slot = None;
                }
            }
        }
        inner.roots.retain(|_, root_id| *root_id != id);
        Some(device)
    }
}

impl Default for DeviceTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::UsbDeviceDescriptor;
    use crate::pipe::PipeDescriptor;

    fn blank_device(location: LocationId, hcd: u8, ports: usize) -> Device {
        Device {
            speed: Speed::High,
            address: 0,
            location,
            parent: None,
            kind: DeviceKind::Function,
            device_descriptor: UsbDeviceDescriptor::parse(&[0u8; 18]).unwrap_or(UsbDeviceDescriptor {
                b_length: 18,
                b_descriptor_type: 1,
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
                b_num_configurations: 1,
            }),
            config_descriptor_raw: Vec::new(),
            interfaces: Vec::new(),
            control_pipe: PipeDescriptor::control(8),
            children: vec![None; ports],
            status_transfer: None,
            hcd_ordinal: hcd,
            manufacturer: String::new(),
            product: String::new(),
            serial_number: String::new(),
            language_id: 0,
        }
    }

    #[test]
    fn attach_links_parent_child_back_pointer() {
        let tree = DeviceTree::new();
        let root_loc = LocationId::root(1);
        let root = tree.set_root(1, blank_device(root_loc, 1, 4));
        let child_loc = root_loc.child(0, 2).unwrap();
        let mut child = blank_device(child_loc, 1, 0);
        child.parent = Some((root, 2));
        let child_id = tree.attach(root, 2, child).unwrap();

        tree.with(root, |dev| {
            assert_eq!(dev.children[2], Some(child_id));
        });
    }

    #[test]
    fn subtree_is_depth_first_parent_before_children() {
        let tree = DeviceTree::new();
        let root_loc = LocationId::root(1);
        let root = tree.set_root(1, blank_device(root_loc, 1, 2));
        let child_loc = root_loc.child(0, 1).unwrap();
        let mut child = blank_device(child_loc, 1, 0);
        child.parent = Some((root, 1));
        let child_id = tree.attach(root, 1, child).unwrap();

        let ids = tree.subtree(root);
        assert_eq!(ids[0], root);
        assert!(ids.contains(&child_id));
    }

    #[test]
    fn remove_clears_parent_back_pointer() {
        let tree = DeviceTree::new();
        let root_loc = LocationId::root(1);
        let root = tree.set_root(1, blank_device(root_loc, 1, 2));
        let child_loc = root_loc.child(0, 1).unwrap();
        let mut child = blank_device(child_loc, 1, 0);
        child.parent = Some((root, 1));
        let child_id = tree.attach(root, 1, child).unwrap();

        tree.remove(child_id);
        tree.with(root, |dev| assert_eq!(dev.children[1], None));
        assert!(tree.find_by_location(child_loc).is_none());
    }
}
