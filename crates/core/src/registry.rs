//! The driver registry (spec §4.6): an ordered set of known drivers,
//! each with a filter list and either an in-process callback set or
//! an external IPC port, plus the per-driver pipe/URB tables that the
//! pipe broker and transfer engine mutate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use slab::Slab;

use crate::descriptor::UsbDeviceDescriptor;
use crate::device::{DeviceId, DeviceTree, InterfaceBinding};
use crate::error::CoreError;
use crate::hcd::HcdSet;
use crate::ipc::DriverEvent;
use crate::location::LocationId;
use crate::pipe::{Pipe, PipeId};
use crate::transfer::UrbId;

pub type DriverId = usize;

/// The sentinel driver record enumeration uses to hold pipes it opens
/// for its own control transfers, before any device is bound to a
/// real driver. Guaranteed to be the first record inserted by
/// [`DriverRegistry::new`], which always lands at slab key 0.
pub const ENUMERATION_DRIVER: DriverId = 0;

/// One filter entry; `None` in any field means "any" (wildcard).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Filter {
    pub vendor: Option<u16>,
    pub product: Option<u16>,
    pub class: Option<u8>,
    pub subclass: Option<u8>,
    pub protocol: Option<u8>,
}

bitflags::bitflags! {
    /// Which fields contributed to a successful match. `CLASS_TRIO`
    /// is only set when the match used the *device* descriptor's
    /// class/subclass/protocol fields directly; a match that fell
    /// through to an interface's class triple (spec §4.6: "zero
    /// fields fall through to the interface descriptor") never sets
    /// it, even if every field the filter named was satisfied.
    ///
    /// This makes score depend only on *which descriptor the match
    /// used*, never on whether a field happened to be wildcarded —
    /// so relaxing a field to a wildcard can only turn a non-match
    /// into a match, never lower an already-successful score (spec
    /// §8 property 7).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub struct MatchScore: u8 {
        const BASELINE = 0b0000_0001;
        const VENDOR    = 0b0000_0010;
        const PRODUCT   = 0b0000_0100;
        const CLASS_TRIO = 0b0000_1000;
    }
}

/// Device-level (and, when it falls through, interface-level)
/// identity a filter is matched against.
#[derive(Debug, Clone, Copy)]
pub struct MatchContext {
    pub vendor: u16,
    pub product: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub interface_class: Option<(u8, u8, u8)>,
}

impl Filter {
    pub fn score(&self, ctx: &MatchContext) -> Option<MatchScore> {
        if let Some(v) = self.vendor {
            if v != ctx.vendor {
                return None;
            }
        }
        if let Some(p) = self.product {
            if p != ctx.product {
                return None;
            }
        }

        let device_has_class = ctx.device_class != 0 || ctx.device_subclass != 0 || ctx.device_protocol != 0;
        let (triple, used_device_descriptor) = if device_has_class {
            ((ctx.device_class, ctx.device_subclass, ctx.device_protocol), true)
        } else {
            (ctx.interface_class.unwrap_or((0, 0, 0)), false)
        };

        if let Some(c) = self.class {
            if c != triple.0 {
                return None;
            }
        }
        if let Some(s) = self.subclass {
            if s != triple.1 {
                return None;
            }
        }
        if let Some(p) = self.protocol {
            if p != triple.2 {
                return None;
            }
        }

        let mut score = MatchScore::BASELINE;
        score |= MatchScore::VENDOR | MatchScore::PRODUCT;
        if used_device_descriptor {
            score |= MatchScore::CLASS_TRIO;
        }
        Some(score)
    }
}

pub trait InternalHandlers: Send + Sync {
    fn on_insertion(&self, device: DeviceId, descriptor: UsbDeviceDescriptor, location: LocationId);
    fn on_deletion(&self, device: DeviceId);
    fn on_completion(&self, urb: UrbId, transferred: usize, error: Option<CoreError>);
}

/// Internal: direct function calls on the engine's threads. External:
/// events queue onto the driver's outbound IPC channel instead.
pub enum Transport {
    Internal(Arc<dyn InternalHandlers>),
    External(std::sync::mpsc::Sender<DriverEvent>),
}

pub struct DriverRecord {
    pub filters: Vec<Filter>,
    pub transport: Transport,
    pipes: Slab<Pipe>,
    urbs: Slab<(PipeId, UrbId)>,
}

impl DriverRecord {
    fn deliver(&self, event: DriverEvent) {
        match &self.transport {
            Transport::Internal(handlers) => match event {
                DriverEvent::Insertion {
                    device,
                    descriptor,
                    location,
                } => handlers.on_insertion(device, descriptor, location),
                DriverEvent::Deletion { device } => handlers.on_deletion(device),
                DriverEvent::Completion {
                    urb,
                    transferred,
                    error,
                    ..
                } => handlers.on_completion(urb, transferred, error),
            },
            Transport::External(tx) => {
                let _ = tx.send(event);
            }
        }
    }
}

struct Inner {
    drivers: Slab<DriverRecord>,
    /// Interfaces with no bound driver, kept for rescan on register.
    orphans: Vec<OrphanInterface>,
    /// Stable `/dev/usb-*` paths (spec §6.3), replaced wholesale on
    /// rebind rather than versioned.
    symlinks: HashMap<String, DeviceId>,
}

#[derive(Debug, Clone, Copy)]
pub struct OrphanInterface {
    pub device: DeviceId,
    pub interface_index: usize,
    pub context: MatchContextOwned,
}

/// Owned snapshot of [`MatchContext`] so orphans can be rescored
/// later without holding a device-tree borrow.
#[derive(Debug, Clone, Copy)]
pub struct MatchContextOwned {
    pub vendor: u16,
    pub product: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub interface_class: (u8, u8, u8),
}

impl MatchContextOwned {
    pub fn as_context(&self) -> MatchContext {
        MatchContext {
            vendor: self.vendor,
            product: self.product,
            device_class: self.device_class,
            device_subclass: self.device_subclass,
            device_protocol: self.device_protocol,
            interface_class: Some(self.interface_class),
        }
    }
}

pub struct DriverRegistry {
    inner: Mutex<Inner>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        let mut drivers = Slab::new();
        let enumeration_id = drivers.insert(DriverRecord {
            filters: Vec::new(),
            transport: Transport::External(std::sync::mpsc::channel().0),
            pipes: Slab::new(),
            urbs: Slab::new(),
        });
        debug_assert_eq!(enumeration_id, ENUMERATION_DRIVER);
        Self {
            inner: Mutex::new(Inner {
                drivers,
                orphans: Vec::new(),
                symlinks: HashMap::new(),
            }),
        }
    }

    /// Registers a new driver and immediately rescans the orphan list
    /// against it, binding whichever orphans it now matches best
    /// (spec §9: registration "must not be precluded" from doing so).
    /// Returns the new driver's id and the orphans it claimed.
    pub fn register(&self, filters: Vec<Filter>, transport: Transport) -> (DriverId, Vec<OrphanInterface>) {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.drivers.insert(DriverRecord {
            filters,
            transport,
            pipes: Slab::new(),
            urbs: Slab::new(),
        });

        let mut claimed = Vec::new();
        let mut still_orphaned = Vec::new();
        for orphan in inner.orphans.drain(..) {
            let ctx = orphan.context.as_context();
            let new_best = inner.drivers[id]
                .filters
                .iter()
                .filter_map(|f| f.score(&ctx))
                .max();
            if new_best.is_some() {
                claimed.push(orphan);
            } else {
                still_orphaned.push(orphan);
            }
        }
        inner.orphans = still_orphaned;
        (id, claimed)
    }

    /// Detaches `driver`: every pipe it still holds open has its HCD
    /// endpoint destroyed, every interface in the device tree bound to
    /// it reverts to [`InterfaceBinding::Orphaned`] and is queued for
    /// rescan on the next `register`, and its `/dev/usb-*` symlinks and
    /// record are dropped (spec §4.6: "detaches all pipes and URBs …
    /// bound interfaces become orphaned").
    pub fn unregister(&self, driver: DriverId, tree: &DeviceTree, hcds: &HcdSet) -> Vec<OrphanInterface> {
        let removed_pipes: Vec<Pipe> = {
            let mut inner = self.inner.lock().unwrap();
            let Some(record) = inner.drivers.try_remove(driver) else {
                return Vec::new();
            };
            record.pipes.into_iter().map(|(_, pipe)| pipe).collect()
        };

        for pipe in removed_pipes {
            if let Some(device) = tree.get(pipe.device) {
                if let Some(hcd) = hcds.get(device.hcd_ordinal) {
                    hcd.pipe_destroy(pipe.descriptor.hcd_private);
                }
            }
        }

        let mut orphaned = Vec::new();
        for device_id in tree.all_ids() {
            let Some(device) = tree.get(device_id) else { continue };
            for (idx, iface) in device.interfaces.iter().enumerate() {
                if iface.binding != InterfaceBinding::Bound(driver) {
                    continue;
                }
                let orphan = OrphanInterface {
                    device: device_id,
                    interface_index: idx,
                    context: MatchContextOwned {
                        vendor: device.device_descriptor.id_vendor,
                        product: device.device_descriptor.id_product,
                        device_class: device.device_descriptor.b_device_class,
                        device_subclass: device.device_descriptor.b_device_subclass,
                        device_protocol: device.device_descriptor.b_device_protocol,
                        interface_class: (
                            iface.descriptor.b_interface_class,
                            iface.descriptor.b_interface_subclass,
                            iface.descriptor.b_interface_protocol,
                        ),
                    },
                };
                let _ = tree.with_mut(device_id, |d| d.interfaces[idx].binding = InterfaceBinding::Orphaned);
                let path = symlink_path(device.device_descriptor.id_vendor, device.device_descriptor.id_product, idx);
                let mut inner = self.inner.lock().unwrap();
                if inner.symlinks.get(&path) == Some(&device_id) {
                    inner.symlinks.remove(&path);
                }
                drop(inner);
                self.add_orphan(orphan);
                orphaned.push(orphan);
            }
        }
        orphaned
    }

    pub fn add_orphan(&self, orphan: OrphanInterface) {
        self.inner.lock().unwrap().orphans.push(orphan);
    }

    /// Scores every registered driver's filter list (in class-specific
    /// before vendor-only priority per spec §9) and returns whichever
    /// scores highest; ties keep the earlier-registered driver.
    pub fn best_match(&self, ctx: &MatchContext) -> Option<DriverId> {
        let inner = self.inner.lock().unwrap();
        let mut best: Option<(DriverId, MatchScore)> = None;
        for (id, record) in inner.drivers.iter() {
            if id == ENUMERATION_DRIVER {
                continue;
            }
            if let Some(score) = record.filters.iter().filter_map(|f| f.score(ctx)).max() {
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((id, score));
                }
            }
        }
        best.map(|(id, _)| id)
    }

    pub fn notify_insertion(&self, driver: DriverId, device: DeviceId, descriptor: UsbDeviceDescriptor, location: LocationId) {
        let inner = self.inner.lock().unwrap();
        if let Some(record) = inner.drivers.get(driver) {
            record.deliver(DriverEvent::Insertion {
                device,
                descriptor,
                location,
            });
        }
    }

    pub fn notify_deletion(&self, driver: DriverId, device: DeviceId) {
        let inner = self.inner.lock().unwrap();
        if let Some(record) = inner.drivers.get(driver) {
            record.deliver(DriverEvent::Deletion { device });
        }
    }

    pub fn notify_completion(&self, driver: DriverId, pipe: PipeId, urb: UrbId, transferred: usize, error: Option<CoreError>) {
        let inner = self.inner.lock().unwrap();
        if let Some(record) = inner.drivers.get(driver) {
            record.deliver(DriverEvent::Completion {
                pipe,
                urb,
                transferred,
                error,
            });
        }
    }

    pub fn add_pipe(&self, driver: DriverId, pipe: Pipe) -> Result<PipeId, CoreError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.drivers.get_mut(driver).ok_or(CoreError::NoDevice)?;
        Ok(record.pipes.insert(pipe))
    }

    pub fn remove_pipe(&self, driver: DriverId, pipe: PipeId) -> Result<Pipe, CoreError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.drivers.get_mut(driver).ok_or(CoreError::NoDevice)?;
        record.pipes.try_remove(pipe).ok_or(CoreError::NoPipe)
    }

    pub fn get_pipe(&self, driver: DriverId, pipe: PipeId) -> Option<Pipe> {
        self.inner.lock().unwrap().drivers.get(driver)?.pipes.get(pipe).copied()
    }

    pub fn add_urb(&self, driver: DriverId, pipe: PipeId, urb: UrbId) {
        if let Some(record) = self.inner.lock().unwrap().drivers.get_mut(driver) {
            record.urbs.insert((pipe, urb));
        }
    }

    pub fn remove_urb(&self, driver: DriverId, urb: UrbId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.drivers.get_mut(driver) {
            if let Some(slot) = record.urbs.iter().find(|(_, (_, u))| *u == urb).map(|(k, _)| k) {
                record.urbs.remove(slot);
            }
        }
    }

    /// URB ids currently outstanding on `pipe` for `driver` — used to
    /// cancel them all when the pipe is closed (spec §4.5).
    pub fn urbs_for_pipe(&self, driver: DriverId, pipe: PipeId) -> Vec<UrbId> {
        let inner = self.inner.lock().unwrap();
        let Some(record) = inner.drivers.get(driver) else {
            return Vec::new();
        };
        record
            .urbs
            .iter()
            .filter(|(_, (p, _))| *p == pipe)
            .map(|(_, (_, u))| *u)
            .collect()
    }

    pub fn is_registered(&self, driver: DriverId) -> bool {
        self.inner.lock().unwrap().drivers.contains(driver)
    }

    /// Records a stable `/dev/usb-<vid>-<pid>-if<n>` path for a bound
    /// interface (spec §6.3), replacing whatever device previously
    /// held that path.
    pub fn bind_symlink(&self, path: String, device: DeviceId) {
        self.inner.lock().unwrap().symlinks.insert(path, device);
    }

    pub fn symlink_target(&self, path: &str) -> Option<DeviceId> {
        self.inner.lock().unwrap().symlinks.get(path).copied()
    }

    pub fn remove_symlinks_for(&self, device: DeviceId) {
        self.inner.lock().unwrap().symlinks.retain(|_, d| *d != device);
    }
}

/// Builds the stable `/dev/usb-<vid:04x>-<pid:04x>-if<iface:02>` path
/// spec §6.3 assigns to a bound interface.
pub fn symlink_path(vendor: u16, product: u16, interface_index: usize) -> String {
    format!("/dev/usb-{vendor:04x}-{product:04x}-if{interface_index:02}")
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
