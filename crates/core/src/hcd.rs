//! The host-controller contract (spec §6.1): the small set of
//! operations the core calls on every registered HCD, and the two
//! callbacks an HCD drives back into the core. Concrete HCDs (xHCI,
//! EHCI, ...) are out of scope here — this module only fixes the
//! boundary, the way the teacher's `xhci` driver fixes a `regs.rs`
//! boundary between register layout and the rest of the driver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::CoreError;
use crate::transfer::Urb;

bitflags::bitflags! {
    /// Port status/change bits as read from `getRoothubStatus`/a hub's
    /// interrupt-IN status endpoint (spec §4.7).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortStatus: u32 {
        const CONNECTION     = 1 << 0;
        const ENABLE         = 1 << 1;
        const SUSPEND        = 1 << 2;
        const OVER_CURRENT   = 1 << 3;
        const RESET          = 1 << 4;
        const POWER          = 1 << 8;
        const LOW_SPEED      = 1 << 9;
        const HIGH_SPEED     = 1 << 10;
        const C_CONNECTION   = 1 << 16;
        const C_ENABLE       = 1 << 17;
        const C_SUSPEND      = 1 << 18;
        const C_OVER_CURRENT = 1 << 19;
        const C_RESET        = 1 << 20;
    }
}

/// Operations the core invokes on a registered host controller (spec
/// §6.1). Implementations do their own register programming and ring
/// scheduling; none of that is this crate's concern.
pub trait Hcd: Send + Sync {
    fn init(&self) -> Result<(), CoreError>;
    fn transfer_enqueue(&self, urb: &Urb) -> Result<(), CoreError>;
    fn transfer_dequeue(&self, hcd_private: u64);
    fn pipe_destroy(&self, hcd_private: u64);
    /// Synchronous root-hub control transfer (GET_STATUS, SET_FEATURE
    /// on a root-hub port, ...); never goes through `transfer_enqueue`.
    fn roothub_transfer(&self, urb: &Urb) -> Result<usize, CoreError>;
    fn get_roothub_status(&self) -> u32;
    fn port_status(&self, port: u8) -> PortStatus;
    fn port_count(&self) -> u8;
}

/// The live set of registered HCDs, keyed by discovery-order ordinal
/// (1..N). A failed `init` drops that HCD without touching any other
/// (spec §7: "HCD init failure removes that HCD from the active set
/// without affecting others").
pub struct HcdSet {
    hcds: Mutex<HashMap<u8, Arc<dyn Hcd>>>,
}

impl HcdSet {
    pub fn new() -> Self {
        Self {
            hcds: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, ordinal: u8, hcd: Arc<dyn Hcd>) -> Result<(), CoreError> {
        hcd.init()?;
        self.hcds.lock().unwrap().insert(ordinal, hcd);
        Ok(())
    }

    pub fn remove(&self, ordinal: u8) -> Option<Arc<dyn Hcd>> {
        self.hcds.lock().unwrap().remove(&ordinal)
    }

    pub fn get(&self, ordinal: u8) -> Option<Arc<dyn Hcd>> {
        self.hcds.lock().unwrap().get(&ordinal).cloned()
    }

    pub fn ordinals(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.hcds.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for HcdSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use crate::transfer::{TransferEngine, UrbId};
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::thread;

    /// How a [`FakeHcd`] drives `on_complete` for URBs it enqueues.
    /// Always from a background thread: `TransferEngine::submit` holds
    /// its lock across `transfer_enqueue`, so a same-thread callback
    /// into `on_complete` would deadlock.
    pub enum AutoComplete {
        /// Completes as soon as it's enqueued, with `transferred = length`.
        Immediate(Arc<TransferEngine>),
        /// Stays outstanding until the engine calls `transfer_dequeue`
        /// on it (e.g. via `cancel`), then completes with a negative
        /// status — `TransferEngine::finish` turns that into `Aborted`
        /// whenever the URB was flagged aborted, regardless of the
        /// exact code.
        OnDequeue(Arc<TransferEngine>),
    }

    /// A fully in-memory HCD used by integration tests: `transfer_enqueue`
    /// just remembers the URB and waits for the test to call
    /// `complete_next` to drive `on_complete` itself — unless
    /// `auto_complete` is set, in which case completion is driven per
    /// [`AutoComplete`].
    pub struct FakeHcd {
        pub roothub_status: AtomicU32,
        pub dequeue_calls: AtomicU64,
        pub enqueued: StdMutex<Vec<u64>>,
        pub fail_init: bool,
        pub auto_complete: Option<AutoComplete>,
        pending: StdMutex<HashMap<u64, UrbId>>,
    }

    impl FakeHcd {
        pub fn new() -> Self {
            Self {
                roothub_status: AtomicU32::new(0),
                dequeue_calls: AtomicU64::new(0),
                enqueued: StdMutex::new(Vec::new()),
                fail_init: false,
                auto_complete: None,
                pending: StdMutex::new(HashMap::new()),
            }
        }

        pub fn with_auto_complete(engine: Arc<TransferEngine>) -> Self {
            Self {
                auto_complete: Some(AutoComplete::Immediate(engine)),
                ..Self::new()
            }
        }

        /// URBs enqueued on this HCD stay outstanding until cancelled;
        /// cancellation's `transfer_dequeue` call is what completes them.
        pub fn with_complete_on_dequeue(engine: Arc<TransferEngine>) -> Self {
            Self {
                auto_complete: Some(AutoComplete::OnDequeue(engine)),
                ..Self::new()
            }
        }
    }

    impl Hcd for FakeHcd {
        fn init(&self) -> Result<(), CoreError> {
            if self.fail_init {
                Err(CoreError::Io)
            } else {
                Ok(())
            }
        }

        fn transfer_enqueue(&self, urb: &Urb) -> Result<(), CoreError> {
            self.enqueued.lock().unwrap().push(urb.hcd_private);
            match &self.auto_complete {
                Some(AutoComplete::Immediate(engine)) => {
                    let engine = engine.clone();
                    let id = urb.id;
                    let length = urb.length;
                    thread::spawn(move || engine.on_complete(id, length as i64));
                }
                Some(AutoComplete::OnDequeue(_)) => {
                    self.pending.lock().unwrap().insert(urb.hcd_private, urb.id);
                }
                None => {}
            }
            Ok(())
        }

        fn transfer_dequeue(&self, hcd_private: u64) {
            self.dequeue_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(AutoComplete::OnDequeue(engine)) = &self.auto_complete {
                if let Some(id) = self.pending.lock().unwrap().remove(&hcd_private) {
                    let engine = engine.clone();
                    thread::spawn(move || engine.on_complete(id, -3));
                }
            }
        }

        fn pipe_destroy(&self, _hcd_private: u64) {}

        fn roothub_transfer(&self, _urb: &Urb) -> Result<usize, CoreError> {
            Ok(0)
        }

        fn get_roothub_status(&self) -> u32 {
            self.roothub_status.load(Ordering::SeqCst)
        }

        fn port_status(&self, _port: u8) -> PortStatus {
            PortStatus::empty()
        }

        fn port_count(&self) -> u8 {
            4
        }
    }
}
