//! Pipe handles and the pipe broker (spec §3, §4.5). A [`Pipe`] is a
//! handle held by exactly one driver onto one endpoint of one device;
//! its identity is a small integer unique within the owning driver's
//! table (a `slab::Slab` key, per the same pattern the teacher uses
//! for process IDs).

use crate::descriptor::{EndpointDirection, TransferType, UsbEndpointDescriptor};
use crate::device::{Device, DeviceId, DeviceTree};
use crate::error::CoreError;
use crate::hcd::HcdSet;
use crate::registry::{DriverId, DriverRegistry};
use crate::transfer::TransferEngine;

pub use crate::registry::ENUMERATION_DRIVER;

pub type PipeId = usize;

/// The wire-format-free description of one endpoint: what the HCD
/// needs to schedule transfers against it, independent of which
/// driver (if any) currently holds a handle to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeDescriptor {
    pub endpoint_number: u8,
    pub max_packet_length: u16,
    pub interval: u8,
    pub transfer_type: TransferType,
    pub direction: EndpointDirection,
    /// Opaque handle the HCD uses to identify this endpoint
    /// internally (e.g. an xHCI endpoint context index); meaningless
    /// to the core beyond round-tripping it back to the HCD.
    pub hcd_private: u64,
}

impl PipeDescriptor {
    pub fn control(max_packet_length: u16) -> Self {
        Self {
            endpoint_number: 0,
            max_packet_length,
            interval: 0,
            transfer_type: TransferType::Control,
            direction: EndpointDirection::Out,
            hcd_private: 0,
        }
    }

    fn from_endpoint(desc: &UsbEndpointDescriptor) -> Self {
        Self {
            endpoint_number: desc.endpoint_number(),
            max_packet_length: desc.max_packet_size(),
            interval: desc.b_interval,
            transfer_type: desc.transfer_type(),
            direction: desc.direction(),
            hcd_private: 0,
        }
    }
}

/// A live pipe: one driver's handle onto one endpoint of one device.
#[derive(Debug, Clone, Copy)]
pub struct Pipe {
    pub device: DeviceId,
    pub descriptor: PipeDescriptor,
    pub owner: DriverId,
}

/// Finds the first endpoint on `interface_index` of `device` matching
/// both `transfer_type` and `direction`.
fn find_endpoint(
    device: &Device,
    interface_index: usize,
    transfer_type: TransferType,
    direction: EndpointDirection,
) -> Result<PipeDescriptor, CoreError> {
    let iface = device
        .interfaces
        .get(interface_index)
        .ok_or(CoreError::NoInterface)?;
    iface
        .endpoints
        .iter()
        .find(|ep| ep.transfer_type() == transfer_type && ep.direction() == direction)
        .map(PipeDescriptor::from_endpoint)
        .ok_or(CoreError::NoInterface)
}

/// Opens a pipe for `driver` onto one endpoint of `device`. Control
/// pipes are served by cloning the device's existing control pipe;
/// everything else is matched against the interface's endpoint list.
pub fn open(
    registry: &DriverRegistry,
    tree: &DeviceTree,
    driver: DriverId,
    device_id: DeviceId,
    interface_index: Option<usize>,
    transfer_type: TransferType,
    direction: EndpointDirection,
) -> Result<PipeId, CoreError> {
    let device = tree.get(device_id).ok_or(CoreError::NoDevice)?;

    let descriptor = if transfer_type == TransferType::Control {
        device.control_pipe
    } else {
        let idx = interface_index.ok_or(CoreError::NoInterface)?;
        find_endpoint(&device, idx, transfer_type, direction)?
    };

    registry.add_pipe(
        driver,
        Pipe {
            device: device_id,
            descriptor,
            owner: driver,
        },
    )
}

/// Cancels every outstanding URB on `pipe` (each driver gets exactly
/// one completion, `error=Aborted, transferred=0`, once its HCD's own
/// `on_complete` lands — spec §4.5/§8 scenario S4), frees the pipe
/// from the driver's table, and asks the HCD to destroy the endpoint.
pub fn close(
    registry: &DriverRegistry,
    tree: &DeviceTree,
    hcds: &HcdSet,
    engine: &TransferEngine,
    driver: DriverId,
    pipe: PipeId,
) -> Result<(), CoreError> {
    for urb in registry.urbs_for_pipe(driver, pipe) {
        engine.cancel(hcds, urb);
    }

    let removed = registry.remove_pipe(driver, pipe)?;

    if let Some(device) = tree.get(removed.device) {
        if let Some(hcd) = hcds.get(device.hcd_ordinal) {
            hcd.pipe_destroy(removed.descriptor.hcd_private);
        }
    }
    Ok(())
}
