//! URB lifecycle and the transfer engine (spec §4.4). One engine
//! instance is shared process-wide; each HCD gets its own active/
//! finished queues and its own scheduler thread, the way the teacher's
//! scheduler runs one run-queue per core but a single shared process
//! table.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use slab::Slab;

use crate::descriptor::{EndpointDirection, TransferType};
use crate::device::DeviceId;
use crate::error::CoreError;
use crate::hcd::HcdSet;
use crate::pipe::PipeId;
use crate::registry::{DriverId, DriverRegistry};

pub type UrbId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbState {
    Idle,
    Ongoing,
    Completed,
}

/// Where a finished URB's result goes (spec §3: "condition variable OR
/// reply port").
#[derive(Clone)]
pub enum Recipient {
    Blocking(Arc<(Mutex<bool>, Condvar)>),
    Driver(DriverId),
}

pub struct Urb {
    pub id: UrbId,
    pub pipe: PipeId,
    pub driver: DriverId,
    pub device: DeviceId,
    pub hcd_ordinal: u8,
    pub transfer_type: TransferType,
    pub direction: EndpointDirection,
    pub setup: Option<[u8; 8]>,
    pub buffer: usize,
    pub length: usize,
    pub transferred: usize,
    pub error: Option<CoreError>,
    pub state: UrbState,
    pub synchronous: bool,
    pub timeout_ms: u64,
    pub elapsed_ms: u64,
    pub hcd_private: u64,
    pub recipient: Recipient,
    pub is_root_hub: bool,
    pub aborted: bool,
    /// Set when this URB is the hub's primed interrupt-IN status
    /// transfer; a completion re-arms it and wakes the hub manager
    /// instead of (or in addition to) delivering to a driver.
    pub hub_status_endpoint_of: Option<DeviceId>,
}

fn error_from_status(status: i64) -> CoreError {
    match status {
        -2 => CoreError::Timeout,
        -3 => CoreError::Aborted,
        -4 => CoreError::Protocol,
        -5 => CoreError::NotSupported,
        _ => CoreError::Io,
    }
}

struct HcdQueue {
    active: Vec<UrbId>,
}

impl HcdQueue {
    fn new() -> Self {
        Self { active: Vec::new() }
    }
}

struct Inner {
    urbs: Slab<Urb>,
    queues: HashMap<u8, HcdQueue>,
    finished: VecDeque<UrbId>,
}

/// Fan-out target for completed interrupt transfers on a hub's status
/// endpoint (spec §4.4: "posts a port-status notification to the hub
/// manager of the owning device").
pub trait HubNotify: Send + Sync {
    fn notify(&self, hub: DeviceId);
}

pub struct TransferEngine {
    inner: Mutex<Inner>,
    finished_cond: Condvar,
    hub_notify: Mutex<Option<Arc<dyn HubNotify>>>,
}

impl TransferEngine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                urbs: Slab::new(),
                queues: HashMap::new(),
                finished: VecDeque::new(),
            }),
            finished_cond: Condvar::new(),
            hub_notify: Mutex::new(None),
        }
    }

    pub fn set_hub_notify(&self, notify: Arc<dyn HubNotify>) {
        *self.hub_notify.lock().unwrap() = Some(notify);
    }

    /// Attaches `urb` to its HCD's active list (or dispatches it
    /// through the root-hub shim) and, if `block`, waits for
    /// completion. Always returns the URB's id so async callers can
    /// poll it later with [`check`](Self::check).
    pub fn submit(&self, hcds: &HcdSet, mut urb: Urb, block: bool) -> Result<UrbId, CoreError> {
        let wake = if block {
            Some(Arc::new((Mutex::new(false), Condvar::new())))
        } else {
            None
        };
        if let Some(w) = &wake {
            urb.recipient = Recipient::Blocking(w.clone());
        }

        let hcd_ordinal = urb.hcd_ordinal;
        let is_root_hub = urb.is_root_hub;
        let hcd = hcds.get(hcd_ordinal).ok_or(CoreError::NoDevice)?;

        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.urbs.insert(urb);
            inner.urbs[id].id = id;
            id
        };

        if is_root_hub {
            let outcome = {
                let inner = self.inner.lock().unwrap();
                hcd.roothub_transfer(&inner.urbs[id])
            };
            match outcome {
                Ok(n) => self.finish(id, n as i64),
                Err(_) => self.finish(id, -1),
            }
        } else {
            {
                let mut inner = self.inner.lock().unwrap();
                inner.urbs[id].state = UrbState::Ongoing;
                inner.queues.entry(hcd_ordinal).or_insert_with(HcdQueue::new).active.push(id);
            }
            let enqueue_result = {
                let inner = self.inner.lock().unwrap();
                hcd.transfer_enqueue(&inner.urbs[id])
            };
            if enqueue_result.is_err() {
                self.finish(id, -1);
            }
        }

        if let Some(w) = wake {
            let (lock, cvar) = &*w;
            let mut done = lock.lock().unwrap();
            while !*done {
                done = cvar.wait(done).unwrap();
            }
        }

        Ok(id)
    }

    pub fn check(&self, id: UrbId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .urbs
            .get(id)
            .map(|u| u.state == UrbState::Completed)
            .unwrap_or(true)
    }

    pub fn result(&self, id: UrbId) -> Option<(usize, Option<CoreError>)> {
        let inner = self.inner.lock().unwrap();
        inner.urbs.get(id).map(|u| (u.transferred, u.error))
    }

    /// Called by an HCD when a transfer it owns completes or fails.
    /// `status` is byte count when `>= 0`, else a negative error code
    /// (spec §6.1).
    pub fn on_complete(&self, id: UrbId, status: i64) {
        self.finish(id, status);
    }

    fn finish(&self, id: UrbId, status: i64) {
        let (recipient, hub_endpoint) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(urb) = inner.urbs.get_mut(id) else {
                return;
            };
            if status >= 0 {
                urb.transferred = status as usize;
                urb.error = None;
            } else {
                urb.transferred = 0;
                urb.error = Some(if urb.aborted {
                    CoreError::Aborted
                } else {
                    error_from_status(status)
                });
            }
            urb.state = UrbState::Completed;
            let hcd_ordinal = urb.hcd_ordinal;
            if let Some(q) = inner.queues.get_mut(&hcd_ordinal) {
                q.active.retain(|&x| x != id);
            }
            let recipient = urb.recipient.clone();
            let hub_endpoint = if status > 0 { urb.hub_status_endpoint_of } else { None };
            inner.finished.push_back(id);
            (recipient, hub_endpoint)
        };
        self.finished_cond.notify_all();
        self.wake_recipient(&recipient);
        if let Some(hub) = hub_endpoint {
            if let Some(notify) = self.hub_notify.lock().unwrap().as_ref() {
                notify.notify(hub);
            }
        }
    }

    fn wake_recipient(&self, recipient: &Recipient) {
        if let Recipient::Blocking(pair) = recipient {
            let (lock, cvar) = &**pair;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
    }

    /// Async delivery step: pops the finished queue and, for URBs
    /// whose recipient is a driver port (not a blocking waiter already
    /// woken in [`finish`]), posts a completion message via the
    /// registry. Intended to run on a per-HCD scheduler thread,
    /// outside the transfer lock (spec §5 discipline).
    pub fn drain_finished(&self, registry: &DriverRegistry) {
        let batch: Vec<(UrbId, PipeId, DriverId, usize, Option<CoreError>, bool)> = {
            let mut inner = self.inner.lock().unwrap();
            let mut batch = Vec::new();
            while let Some(id) = inner.finished.pop_front() {
                if let Some(urb) = inner.urbs.get(id) {
                    let is_blocking = matches!(urb.recipient, Recipient::Blocking(_));
                    batch.push((id, urb.pipe, urb.driver, urb.transferred, urb.error, is_blocking));
                }
            }
            batch
        };
        for (id, pipe, driver, transferred, error, is_blocking) in batch {
            if !is_blocking {
                registry.notify_completion(driver, pipe, id, transferred, error);
            }
        }
    }

    /// Requests cancellation: flags the URB aborted and asks the HCD
    /// to dequeue it. The HCD's ensuing `on_complete` (if any) is the
    /// one that actually marks it completed with `-Aborted` (spec §5).
    pub fn cancel(&self, hcds: &HcdSet, id: UrbId) {
        let (hcd_ordinal, hcd_private, already_done) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(urb) = inner.urbs.get_mut(id) else {
                return;
            };
            urb.aborted = true;
            (urb.hcd_ordinal, urb.hcd_private, urb.state == UrbState::Completed)
        };
        if already_done {
            return;
        }
        if let Some(hcd) = hcds.get(hcd_ordinal) {
            hcd.transfer_dequeue(hcd_private);
        }
    }

    /// One timeout-accumulation + finished-drain pass for a single
    /// HCD, run on that HCD's scheduler thread every tick (spec §4.4).
    pub fn tick(&self, hcds: &HcdSet, hcd_ordinal: u8, elapsed_ms: u64) {
        let mut timed_out = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(q) = inner.queues.get(&hcd_ordinal) {
                for &id in &q.active {
                    if let Some(urb) = inner.urbs.get_mut(id) {
                        if urb.timeout_ms > 0 {
                            urb.elapsed_ms += elapsed_ms;
                            if urb.elapsed_ms > urb.timeout_ms && urb.state == UrbState::Ongoing {
                                timed_out.push((id, urb.hcd_private));
                            }
                        }
                    }
                }
            }
        }
        for (id, hcd_private) in timed_out {
            if let Some(hcd) = hcds.get(hcd_ordinal) {
                hcd.transfer_dequeue(hcd_private);
            }
            self.finish(id, -2);
        }
    }

    pub fn urb_count(&self) -> usize {
        self.inner.lock().unwrap().urbs.len()
    }
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the per-HCD scheduler thread described in spec §4.4/§5: it
/// wakes every `tick`, accumulates elapsed time, expires timed-out
/// URBs, and drains completions.
pub fn spawn_scheduler(
    engine: Arc<TransferEngine>,
    registry: Arc<DriverRegistry>,
    hcds: Arc<HcdSet>,
    hcd_ordinal: u8,
    tick: Duration,
) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        thread::sleep(tick);
        engine.tick(&hcds, hcd_ordinal, tick.as_millis() as u64);
        engine.drain_finished(&registry);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hcd::test_support::FakeHcd;
    use std::sync::Arc;

    fn blocking_urb(hcd_ordinal: u8) -> Urb {
        Urb {
            id: 0,
            pipe: 0,
            driver: 0,
            device: 0,
            hcd_ordinal,
            transfer_type: TransferType::Bulk,
            direction: EndpointDirection::In,
            setup: None,
            buffer: 0,
            length: 0,
            transferred: 0,
            error: None,
            state: UrbState::Idle,
            synchronous: true,
            timeout_ms: 0,
            elapsed_ms: 0,
            hcd_private: 1,
            recipient: Recipient::Driver(0),
            is_root_hub: false,
            aborted: false,
            hub_status_endpoint_of: None,
        }
    }

    #[test]
    fn submit_enqueues_on_the_right_hcd() {
        let hcds = HcdSet::new();
        let hcd = Arc::new(FakeHcd::new());
        hcds.insert(1, hcd.clone()).unwrap();
        let engine = TransferEngine::new();

        let id = engine.submit(&hcds, blocking_urb(1), false).unwrap();
        assert!(!engine.check(id));
        assert_eq!(hcd.enqueued.lock().unwrap().len(), 1);
    }

    #[test]
    fn on_complete_marks_completed_and_records_byte_count() {
        let hcds = HcdSet::new();
        hcds.insert(1, Arc::new(FakeHcd::new())).unwrap();
        let engine = TransferEngine::new();
        let id = engine.submit(&hcds, blocking_urb(1), false).unwrap();

        engine.on_complete(id, 42);
        assert!(engine.check(id));
        assert_eq!(engine.result(id), Some((42, None)));
    }

    #[test]
    fn negative_status_surfaces_as_io_error() {
        let hcds = HcdSet::new();
        hcds.insert(1, Arc::new(FakeHcd::new())).unwrap();
        let engine = TransferEngine::new();
        let id = engine.submit(&hcds, blocking_urb(1), false).unwrap();

        engine.on_complete(id, -1);
        let (transferred, error) = engine.result(id).unwrap();
        assert_eq!(transferred, 0);
        assert_eq!(error, Some(CoreError::Io));
    }

    #[test]
    fn timeout_completes_with_timeout_error_and_dequeues_once() {
        let hcds = HcdSet::new();
        let hcd = Arc::new(FakeHcd::new());
        hcds.insert(1, hcd.clone()).unwrap();
        let engine = TransferEngine::new();
        let mut urb = blocking_urb(1);
        urb.timeout_ms = 50;
        let id = engine.submit(&hcds, urb, false).unwrap();

        engine.tick(&hcds, 1, 30);
        assert!(!engine.check(id));
        engine.tick(&hcds, 1, 30);
        assert!(engine.check(id));
        assert_eq!(engine.result(id), Some((0, Some(CoreError::Timeout))));
        assert_eq!(hcd.dequeue_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_then_hcd_completion_surfaces_as_aborted() {
        let hcds = HcdSet::new();
        let hcd = Arc::new(FakeHcd::new());
        hcds.insert(1, hcd.clone()).unwrap();
        let engine = TransferEngine::new();
        let id = engine.submit(&hcds, blocking_urb(1), false).unwrap();

        engine.cancel(&hcds, id);
        assert_eq!(hcd.dequeue_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        engine.on_complete(id, -1);
        assert_eq!(engine.result(id).unwrap().1, Some(CoreError::Aborted));
    }
}
