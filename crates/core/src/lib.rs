//! Host-stack core: the transfer engine, enumeration/hub state
//! machine, and driver registry that sit between an HCD and the
//! external driver processes reached over IPC. See each module for
//! its slice of the design; [`core::Core`] wires them together into
//! one process-wide handle.

pub mod address;
pub mod buffer_pool;
pub mod config;
pub mod core;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod hcd;
pub mod hub;
pub mod ipc;
pub mod location;
pub mod pipe;
pub mod registry;
pub mod transfer;

pub use crate::core::Core;
pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
pub use hcd::Hcd;
