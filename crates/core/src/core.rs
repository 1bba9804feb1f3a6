//! The process-wide handle (spec §9): one [`Core`] owns every
//! subsystem and is passed by reference into whichever of them needs
//! it, the way the teacher's kernel passes one `Scheduler` handle
//! around rather than letting each subsystem reach for its own
//! globals. Bootstrapping (discovering HCDs, opening `/dev/usb`,
//! parsing flags) is the embedder's job; this module only wires the
//! pieces together and starts their threads.

use std::sync::Arc;
use std::thread;

use log::{info, warn};

use crate::buffer_pool::BufferPool;
use crate::config::CoreConfig;
use crate::device::DeviceTree;
use crate::error::CoreError;
use crate::hcd::{Hcd, HcdSet};
use crate::hub::HubManager;
use crate::ipc::{DriverEvent, FilterWire, IpcGateway, Request, Response};
use crate::registry::{DriverId, DriverRegistry, Filter, InternalHandlers};
use crate::transfer::{HubNotify, TransferEngine};

/// Bridges a finished hub status-endpoint URB back into a
/// [`HubManager`] rescan, without giving the transfer engine a direct
/// dependency on `hub` (spec §4.4: "posts a port-status notification
/// to the hub manager of the owning device").
struct HubNotifyBridge {
    hub: Arc<HubManager>,
}

impl HubNotify for HubNotifyBridge {
    fn notify(&self, hub: crate::device::DeviceId) {
        self.hub.notify_hub(hub);
    }
}

pub struct Core {
    pub config: CoreConfig,
    pub pool: Arc<BufferPool>,
    pub tree: Arc<DeviceTree>,
    pub registry: Arc<DriverRegistry>,
    pub engine: Arc<TransferEngine>,
    pub hcds: Arc<HcdSet>,
    pub hub: Arc<HubManager>,
    pub ipc: Arc<IpcGateway>,
}

impl Core {
    pub fn new(config: CoreConfig) -> Arc<Self> {
        let pool = Arc::new(BufferPool::new(config.arena_size, config.chunk_size));
        let tree = Arc::new(DeviceTree::new());
        let registry = Arc::new(DriverRegistry::new());
        let engine = Arc::new(TransferEngine::new());
        let hcds = Arc::new(HcdSet::new());
        let hub = HubManager::new(tree.clone(), registry.clone(), engine.clone(), hcds.clone(), pool.clone(), config.clone());
        engine.set_hub_notify(Arc::new(HubNotifyBridge { hub: hub.clone() }));
        let ipc = Arc::new(IpcGateway::new(tree.clone(), registry.clone(), engine.clone(), hcds.clone(), pool.clone()));

        Arc::new(Self {
            config,
            pool,
            tree,
            registry,
            engine,
            hcds,
            hub,
            ipc,
        })
    }

    /// Spawns the single hub-manager thread. Call once, after
    /// constructing the `Core` and before adding any HCD.
    pub fn start(self: &Arc<Self>) {
        let hub = self.hub.clone();
        thread::spawn(move || hub.run());
    }

    /// Registers a discovered HCD (spec §6.1): runs `init`, installs
    /// its synthetic root hub, and starts its scheduler thread. A
    /// failed `init` is reported and otherwise ignored — the HCD
    /// never joins the active set, every other HCD is unaffected
    /// (spec §7).
    pub fn add_hcd(self: &Arc<Self>, ordinal: u8, hcd: Arc<dyn Hcd>) {
        let port_count = hcd.port_count();
        match self.hcds.insert(ordinal, hcd) {
            Ok(()) => {
                info!("hcd {ordinal} initialized with {port_count} root ports");
                self.hub.install_root_hub(ordinal, port_count);
                let (engine, registry, hcds) = (self.engine.clone(), self.registry.clone(), self.hcds.clone());
                let tick = self.config.scheduler_tick;
                thread::spawn(move || loop {
                    thread::sleep(tick);
                    engine.tick(&hcds, ordinal, tick.as_millis() as u64);
                    engine.drain_finished(&registry);
                });
                self.hub.notify_root_hub(ordinal);
            }
            Err(e) => warn!("hcd {ordinal} failed to initialize: {e}"),
        }
    }

    /// Tears down an HCD that has been physically removed: every
    /// device on its root hub is torn down depth-first before the HCD
    /// itself is dropped from the active set (spec §7).
    pub fn remove_hcd(&self, ordinal: u8) {
        if let Some(root) = self.tree.root_of(ordinal) {
            self.hub.teardown_subtree(root);
        }
        self.hcds.remove(ordinal);
    }

    /// Called whenever an HCD's interrupt/poll path observes a
    /// root-hub port-status change; wakes the hub manager to rescan.
    pub fn notify_root_hub_change(&self, ordinal: u8) {
        self.hub.notify_root_hub(ordinal);
    }

    pub fn connect_driver(&self, filters: Vec<FilterWire>, outbound: std::sync::mpsc::Sender<DriverEvent>) -> DriverId {
        self.ipc.connect(filters, outbound)
    }

    pub fn connect_internal_driver(&self, filters: Vec<Filter>, handlers: Arc<dyn InternalHandlers>) -> DriverId {
        self.ipc.connect_internal(filters, handlers)
    }

    pub fn disconnect_driver(&self, driver: DriverId) {
        self.ipc.disconnect(driver);
    }

    pub fn handle_request(&self, driver: DriverId, request: Request) -> Response {
        self.ipc.handle(driver, request)
    }

    /// Delivered by an HCD when a transfer it owns completes (spec
    /// §6.1's `onComplete` callback).
    pub fn on_transfer_complete(&self, urb: crate::transfer::UrbId, status: i64) {
        self.engine.on_complete(urb, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hcd::test_support::FakeHcd;

    #[test]
    fn add_hcd_installs_a_root_hub_with_its_port_count() {
        let core = Core::new(CoreConfig::default());
        core.add_hcd(1, Arc::new(FakeHcd::new()));
        let root = core.tree.root_of(1).expect("root hub installed");
        assert_eq!(core.tree.get(root).unwrap().children.len(), 4);
    }

    #[test]
    fn failed_hcd_init_does_not_join_the_active_set() {
        let core = Core::new(CoreConfig::default());
        let mut hcd = FakeHcd::new();
        hcd.fail_init = true;
        core.add_hcd(1, Arc::new(hcd));
        assert!(core.hcds.get(1).is_none());
        assert!(core.tree.root_of(1).is_none());
    }

    #[test]
    fn remove_hcd_tears_down_its_root_hub_subtree() {
        let core = Core::new(CoreConfig::default());
        core.add_hcd(1, Arc::new(FakeHcd::new()));
        assert!(core.tree.root_of(1).is_some());
        core.remove_hcd(1);
        assert!(core.tree.root_of(1).is_none());
    }
}
