//! Tunables pulled out of the literal constants `spec.md` names, so
//! tests can shrink timing windows instead of waiting on wall-clock
//! debounce/reset delays. Not a CLI surface — process bootstrap and
//! flag parsing are the embedder's job (spec §1).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// How often a port's connection bit is sampled while debouncing.
    pub debounce_sample_interval: Duration,
    /// How long the connection bit must stay identical before the
    /// port is considered actually connected.
    pub debounce_stable_window: Duration,
    /// Give up debouncing after this much elapsed time.
    pub debounce_timeout: Duration,
    /// Interval between SET_FEATURE(RESET) / C_RESET polls.
    pub reset_poll_interval: Duration,
    /// Number of reset polls before giving up.
    pub reset_poll_attempts: u32,
    /// Total address-and-configure attempts before a port is failed.
    pub enumeration_attempts: u32,
    /// Per-HCD scheduler wake tick for timeout accounting.
    pub scheduler_tick: Duration,
    /// Number of IPC worker threads servicing driver messages.
    pub ipc_worker_threads: usize,
    /// Hard cap on hub downstream port count.
    pub max_hub_ports: u8,
    /// Hard cap on location-ID nibble depth.
    pub max_location_depth: u8,
    /// Per-arena size of the buffer pool, in bytes.
    pub arena_size: usize,
    /// Allocation granularity of the buffer pool, in bytes.
    pub chunk_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            debounce_sample_interval: Duration::from_millis(25),
            debounce_stable_window: Duration::from_millis(100),
            debounce_timeout: Duration::from_millis(1500),
            reset_poll_interval: Duration::from_millis(100),
            reset_poll_attempts: 5,
            enumeration_attempts: 3,
            scheduler_tick: Duration::from_millis(100),
            ipc_worker_threads: 2,
            max_hub_ports: 15,
            max_location_depth: 7,
            arena_size: 4096,
            chunk_size: 32,
        }
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder(Self::default())
    }
}

/// Builder over [`CoreConfig`]; every field defaults to the spec's
/// literal constant and can be overridden one at a time.
#[derive(Debug, Clone)]
pub struct CoreConfigBuilder(CoreConfig);

macro_rules! setter {
    ($field:ident, $ty:ty) => {
        pub fn $field(mut self, value: $ty) -> Self {
            self.0.$field = value;
            self
        }
    };
}

impl CoreConfigBuilder {
    setter!(debounce_sample_interval, Duration);
    setter!(debounce_stable_window, Duration);
    setter!(debounce_timeout, Duration);
    setter!(reset_poll_interval, Duration);
    setter!(reset_poll_attempts, u32);
    setter!(enumeration_attempts, u32);
    setter!(scheduler_tick, Duration);
    setter!(ipc_worker_threads, usize);
    setter!(max_hub_ports, u8);
    setter!(max_location_depth, u8);
    setter!(arena_size, usize);
    setter!(chunk_size, usize);

    pub fn build(self) -> CoreConfig {
        self.0
    }
}
