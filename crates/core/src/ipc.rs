//! Driver IPC (spec §6.2): wire messages exchanged with driver
//! processes over `/dev/usb`, and the gateway that turns them into
//! calls on the pipe broker, driver registry, and transfer engine.
//! Messages are `bincode`-encoded the way the wider example pack uses
//! it for compact binary protocols (no JSON: URB payloads are raw
//! buffers, not text).

use std::io::{Read, Write};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer_pool::BufferPool;
use crate::descriptor::{EndpointDirection, TransferType, UsbDeviceDescriptor};
use crate::device::{DeviceId, DeviceTree};
use crate::error::CoreError;
use crate::hcd::HcdSet;
use crate::location::LocationId;
use crate::pipe::{self, PipeId};
use crate::registry::{DriverId, DriverRegistry, Filter, InternalHandlers, Transport};
use crate::transfer::{self, Recipient, TransferEngine, Urb, UrbId, UrbState};

fn error_code(e: CoreError) -> u8 {
    match e {
        CoreError::NoDevice => 1,
        CoreError::NoPipe => 2,
        CoreError::NoInterface => 3,
        CoreError::OutOfMemory => 4,
        CoreError::Io => 5,
        CoreError::Timeout => 6,
        CoreError::Aborted => 7,
        CoreError::Protocol => 8,
        CoreError::NotSupported => 9,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum UrbCommand {
    Submit,
    Cancel,
    Free,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterWire {
    pub vendor: Option<u16>,
    pub product: Option<u16>,
    pub class: Option<u8>,
    pub subclass: Option<u8>,
    pub protocol: Option<u8>,
}

impl From<FilterWire> for Filter {
    fn from(w: FilterWire) -> Self {
        Filter {
            vendor: w.vendor,
            product: w.product,
            class: w.class,
            subclass: w.subclass,
            protocol: w.protocol,
        }
    }
}

/// One `DevCtl` request payload (spec §6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Connect {
        filters: Vec<FilterWire>,
    },
    Open {
        device: DeviceId,
        interface: Option<usize>,
        transfer_type: TransferType,
        direction: EndpointDirection,
        location_id: u32,
    },
    Urb {
        pipe: PipeId,
        transfer_type: TransferType,
        direction: EndpointDirection,
        size: u32,
        sync: bool,
        setup: Option<[u8; 8]>,
        timeout_ms: u64,
        data: Vec<u8>,
    },
    Close {
        pipe: PipeId,
    },
    UrbCmd {
        urb: UrbId,
        command: UrbCommand,
    },
    Alloc {
        size: u32,
    },
    Free {
        address: u64,
        size: u32,
    },
    DevDesc {
        device: DeviceId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Connected,
    Opened { pipe: PipeId },
    UrbSync { transferred: u32, error: Option<u8>, data: Vec<u8> },
    UrbAsync { urb: UrbId },
    Closed,
    UrbCmdAck,
    Allocated { address: u64 },
    Freed,
    DeviceInfo {
        descriptor: UsbDeviceDescriptor,
        manufacturer: String,
        product: String,
        serial_number: String,
    },
    Error { code: u8 },
}

impl Response {
    fn from_result(r: Result<Response, CoreError>) -> Response {
        match r {
            Ok(resp) => resp,
            Err(e) => Response::Error { code: error_code(e) },
        }
    }
}

/// Asynchronous push from the core to a driver's control port:
/// insertion, deletion, and per-URB async completion (spec §4.6).
/// Carried in-process over an `mpsc` channel; the IPC worker that owns
/// the driver's actual socket is what encodes these for the wire
/// (converting `CoreError` to the wire's numeric code at that point).
#[derive(Debug, Clone)]
pub enum DriverEvent {
    Insertion {
        device: DeviceId,
        descriptor: UsbDeviceDescriptor,
        location: LocationId,
    },
    Deletion {
        device: DeviceId,
    },
    Completion {
        pipe: PipeId,
        urb: UrbId,
        transferred: usize,
        error: Option<CoreError>,
    },
}

/// Wire form of [`DriverEvent`]: identical shape, but with `CoreError`
/// collapsed to its numeric code the same way [`Response`] already
/// does, since the wire format carries no `CoreError` serde impl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DriverEventWire {
    Insertion {
        device: DeviceId,
        descriptor: UsbDeviceDescriptor,
        location: u32,
    },
    Deletion {
        device: DeviceId,
    },
    Completion {
        pipe: PipeId,
        urb: UrbId,
        transferred: u32,
        error: Option<u8>,
    },
}

impl From<&DriverEvent> for DriverEventWire {
    fn from(event: &DriverEvent) -> Self {
        match *event {
            DriverEvent::Insertion { device, descriptor, location } => DriverEventWire::Insertion {
                device,
                descriptor,
                location: location.0,
            },
            DriverEvent::Deletion { device } => DriverEventWire::Deletion { device },
            DriverEvent::Completion { pipe, urb, transferred, error } => DriverEventWire::Completion {
                pipe,
                urb,
                transferred: transferred as u32,
                error: error.map(error_code),
            },
        }
    }
}

/// One driver session's IPC loop (spec §6.2): reads length-prefixed
/// `bincode` requests from `reader`, dispatches each through `gateway`,
/// and writes the response back; asynchronous events queued on `events`
/// (insertion/deletion/completion) are drained and written between
/// requests rather than interleaved mid-message.
pub fn run_driver_session<R: Read, W: Write>(
    gateway: &IpcGateway,
    driver: DriverId,
    mut reader: R,
    mut writer: W,
    events: &Receiver<DriverEvent>,
) -> std::io::Result<()> {
    loop {
        for event in events.try_iter() {
            write_framed(&mut writer, &DriverEventWire::from(&event))?;
        }
        let request: Request = match read_framed(&mut reader) {
            Ok(r) => r,
            Err(_) => return Ok(()),
        };
        let response = gateway.handle(driver, request);
        write_framed(&mut writer, &response)?;
    }
}

fn read_framed<T: for<'de> Deserialize<'de>, R: Read>(reader: &mut R) -> std::io::Result<T> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    bincode::deserialize(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn write_framed<T: Serialize, W: Write>(writer: &mut W, value: &T) -> std::io::Result<()> {
    let body = bincode::serialize(value).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)
}

/// Shared capability handles the gateway needs; a thin facade over
/// (4), (5), (6) the way spec §9 describes a single Core handle
/// passed by reference, subsystems receiving only what they use.
pub struct IpcGateway {
    tree: Arc<DeviceTree>,
    registry: Arc<DriverRegistry>,
    engine: Arc<TransferEngine>,
    hcds: Arc<HcdSet>,
    pool: Arc<BufferPool>,
}

impl IpcGateway {
    pub fn new(
        tree: Arc<DeviceTree>,
        registry: Arc<DriverRegistry>,
        engine: Arc<TransferEngine>,
        hcds: Arc<HcdSet>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            tree,
            registry,
            engine,
            hcds,
            pool,
        }
    }

    /// A `Connect` request always comes first on a fresh session; it
    /// has no established `DriverId` yet, so it is handled outside
    /// `handle` and returns the id the rest of the session must pass
    /// back in on every subsequent call.
    pub fn connect(&self, filters: Vec<FilterWire>, outbound: std::sync::mpsc::Sender<DriverEvent>) -> DriverId {
        let filters = filters.into_iter().map(Filter::from).collect();
        let (id, _claimed) = self.registry.register(filters, Transport::External(outbound));
        id
    }

    pub fn connect_internal(&self, filters: Vec<Filter>, handlers: Arc<dyn InternalHandlers>) -> DriverId {
        let (id, _claimed) = self.registry.register(filters, Transport::Internal(handlers));
        id
    }

    pub fn disconnect(&self, driver: DriverId) {
        self.registry.unregister(driver, &self.tree, &self.hcds);
    }

    pub fn handle(&self, driver: DriverId, request: Request) -> Response {
        let result = match request {
            Request::Connect { .. } => Err(CoreError::Protocol),
            Request::Open {
                device,
                interface,
                transfer_type,
                direction,
                location_id: _,
            } => self.handle_open(driver, device, interface, transfer_type, direction),
            Request::Urb {
                pipe,
                transfer_type,
                direction,
                size,
                sync,
                setup,
                timeout_ms,
                data,
            } => self.handle_urb(driver, pipe, transfer_type, direction, size, sync, setup, timeout_ms, data),
            Request::Close { pipe } => self.handle_close(driver, pipe),
            Request::UrbCmd { urb, command } => self.handle_urb_cmd(urb, command),
            Request::Alloc { size } => self.handle_alloc(size),
            Request::Free { address, size } => self.handle_free(address, size),
            Request::DevDesc { device } => self.handle_devdesc(device),
        };
        Response::from_result(result)
    }

    fn handle_open(
        &self,
        driver: DriverId,
        device: DeviceId,
        interface: Option<usize>,
        transfer_type: TransferType,
        direction: EndpointDirection,
    ) -> Result<Response, CoreError> {
        let pipe_id = pipe::open(&self.registry, &self.tree, driver, device, interface, transfer_type, direction)?;
        Ok(Response::Opened { pipe: pipe_id })
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_urb(
        &self,
        driver: DriverId,
        pipe_id: PipeId,
        transfer_type: TransferType,
        direction: EndpointDirection,
        size: u32,
        sync: bool,
        setup: Option<[u8; 8]>,
        timeout_ms: u64,
        data: Vec<u8>,
    ) -> Result<Response, CoreError> {
        let pipe = self.registry.get_pipe(driver, pipe_id).ok_or(CoreError::NoPipe)?;
        let device = self.tree.get(pipe.device).ok_or(CoreError::NoDevice)?;

        let length = size as usize;
        let addr = self.pool.obtain(length).map_err(CoreError::from)?;
        if direction == EndpointDirection::Out && !data.is_empty() {
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len().min(length));
            }
        }

        let urb = Urb {
            id: 0,
            pipe: pipe_id,
            driver,
            device: pipe.device,
            hcd_ordinal: device.hcd_ordinal,
            transfer_type,
            direction,
            setup,
            buffer: addr,
            length,
            transferred: 0,
            error: None,
            state: UrbState::Idle,
            synchronous: sync,
            timeout_ms,
            elapsed_ms: 0,
            hcd_private: pipe.descriptor.hcd_private,
            recipient: Recipient::Driver(driver),
            is_root_hub: false,
            aborted: false,
            hub_status_endpoint_of: None,
        };

        let id = self.engine.submit(&self.hcds, urb, sync)?;

        if sync {
            let (transferred, error) = self.engine.result(id).unwrap_or((0, None));
            let mut out = Vec::new();
            if direction == EndpointDirection::In {
                out = vec![0u8; transferred];
                unsafe {
                    std::ptr::copy_nonoverlapping(addr as *const u8, out.as_mut_ptr(), transferred);
                }
            }
            self.pool.free(addr, length);
            self.registry.remove_urb(driver, id);
            Ok(Response::UrbSync {
                transferred: transferred as u32,
                error: error.map(error_code),
                data: out,
            })
        } else {
            self.registry.add_urb(driver, pipe_id, id);
            Ok(Response::UrbAsync { urb: id })
        }
    }

    fn handle_urb_cmd(&self, urb: UrbId, command: UrbCommand) -> Result<Response, CoreError> {
        match command {
            UrbCommand::Submit => Ok(Response::UrbCmdAck),
            UrbCommand::Cancel => {
                self.engine.cancel(&self.hcds, urb);
                Ok(Response::UrbCmdAck)
            }
            UrbCommand::Free => Ok(Response::UrbCmdAck),
        }
    }

    fn handle_close(&self, driver: DriverId, pipe_id: PipeId) -> Result<Response, CoreError> {
        pipe::close(&self.registry, &self.tree, &self.hcds, &self.engine, driver, pipe_id)?;
        Ok(Response::Closed)
    }

    fn handle_alloc(&self, size: u32) -> Result<Response, CoreError> {
        let addr = self.pool.obtain(size as usize).map_err(CoreError::from)?;
        Ok(Response::Allocated { address: addr as u64 })
    }

    fn handle_free(&self, address: u64, size: u32) -> Result<Response, CoreError> {
        self.pool.free(address as usize, size as usize);
        Ok(Response::Freed)
    }

    fn handle_devdesc(&self, device: DeviceId) -> Result<Response, CoreError> {
        let dev = self.tree.get(device).ok_or(CoreError::NoDevice)?;
        Ok(Response::DeviceInfo {
            descriptor: dev.device_descriptor,
            manufacturer: dev.manufacturer,
            product: dev.product,
            serial_number: dev.serial_number,
        })
    }
}
