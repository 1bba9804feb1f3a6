//! A scripted HCD double for end-to-end enumeration tests: it answers
//! the exact control-transfer sequence `run_addressing` issues against
//! one canned function device, and simulates root-hub port connect/
//! disconnect the way a real controller's port-status register would.
//!
//! Kept deliberately narrow (one device, one interface, no strings) —
//! `fetch_string` never issues a request when an index is `0`, so a
//! device descriptor with every string index zeroed needs no string
//! table here at all.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use usbcore::hcd::{Hcd, PortStatus};
use usbcore::error::CoreError;
use usbcore::transfer::{TransferEngine, Urb, UrbId};

pub const VENDOR: u16 = 0x1234;
pub const PRODUCT: u16 = 0x5678;
pub const DEVICE_CLASS: u8 = 0x03;
pub const INTERFACE_INDEX: usize = 0;

const HUB_CLASS_SET_FEATURE: u8 = 0x03;
const HUB_CLASS_CLEAR_FEATURE: u8 = 0x01;
const FEATURE_PORT_RESET: u16 = 4;
const FEATURE_PORT_POWER: u16 = 8;
const FEATURE_C_PORT_CONNECTION: u16 = 16;
const FEATURE_C_PORT_RESET: u16 = 20;
const STD_GET_DESCRIPTOR: u8 = 0x06;
const STD_SET_ADDRESS: u8 = 0x05;
const STD_SET_CONFIGURATION: u8 = 0x09;

fn device_descriptor() -> [u8; 18] {
    let mut d = [0u8; 18];
    d[0] = 18;
    d[1] = 1;
    d[2..4].copy_from_slice(&0x0200u16.to_le_bytes());
    d[7] = 64; // bMaxPacketSize0
    d[8..10].copy_from_slice(&VENDOR.to_le_bytes());
    d[10..12].copy_from_slice(&PRODUCT.to_le_bytes());
    d[13] = 1; // bcdDevice hi byte, arbitrary
    d[17] = 1; // bNumConfigurations
    d
}

fn config_descriptor() -> Vec<u8> {
    let endpoint = [7u8, 5, 0x81, 0x03, 64, 0, 10]; // interrupt IN, ep1, max 64
    let iface = [
        9u8,
        4,
        0, // bInterfaceNumber
        0, // bAlternateSetting
        1, // bNumEndpoints
        DEVICE_CLASS,
        0,
        0,
        0,
    ];
    let total_len = 9 + iface.len() + endpoint.len();
    let mut header = vec![9u8, 2, 0, 0, 1, 1, 0, 0, 0];
    header[2..4].copy_from_slice(&(total_len as u16).to_le_bytes());
    let mut out = header;
    out.extend_from_slice(&iface);
    out.extend_from_slice(&endpoint);
    out
}

fn config_header() -> Vec<u8> {
    config_descriptor()[..9].to_vec()
}

fn langid_descriptor() -> Vec<u8> {
    vec![4, 3, 0x09, 0x04]
}

#[derive(Default, Clone, Copy)]
struct PortSim {
    connected: bool,
    enabled: bool,
    c_connection: bool,
    c_reset: bool,
}

pub struct ScriptedHcd {
    engine: Arc<TransferEngine>,
    ports: Mutex<Vec<PortSim>>,
    pending: Mutex<HashMap<u64, UrbId>>,
    device_desc: [u8; 18],
    config_full: Vec<u8>,
    config_hdr: Vec<u8>,
    langid: Vec<u8>,
}

impl ScriptedHcd {
    pub fn new(engine: Arc<TransferEngine>, port_count: usize) -> Self {
        Self {
            engine,
            ports: Mutex::new(vec![PortSim::default(); port_count]),
            pending: Mutex::new(HashMap::new()),
            device_desc: device_descriptor(),
            config_full: config_descriptor(),
            config_hdr: config_header(),
            langid: langid_descriptor(),
        }
    }

    /// Simulates a device plugging into `port` (1-based).
    pub fn connect(&self, port: u8) {
        let mut ports = self.ports.lock().unwrap();
        let p = &mut ports[port as usize - 1];
        p.connected = true;
        p.c_connection = true;
    }

    /// Simulates unplugging whatever is in `port`.
    pub fn disconnect(&self, port: u8) {
        let mut ports = self.ports.lock().unwrap();
        let p = &mut ports[port as usize - 1];
        p.connected = false;
        p.enabled = false;
        p.c_connection = true;
    }

    fn control_response(&self, setup: [u8; 8], requested_len: usize) -> Option<Vec<u8>> {
        let b_request = setup[1];
        let w_value = u16::from_le_bytes([setup[2], setup[3]]);
        match b_request {
            STD_GET_DESCRIPTOR if w_value == 0x0100 && requested_len <= 8 => {
                Some(self.device_desc[..8].to_vec())
            }
            STD_GET_DESCRIPTOR if w_value == 0x0100 => Some(self.device_desc.to_vec()),
            STD_GET_DESCRIPTOR if w_value == 0x0200 && requested_len <= 9 => Some(self.config_hdr.clone()),
            STD_GET_DESCRIPTOR if w_value == 0x0200 => Some(self.config_full.clone()),
            STD_GET_DESCRIPTOR if (w_value >> 8) == 0x03 => Some(self.langid.clone()),
            STD_SET_ADDRESS => Some(Vec::new()),
            STD_SET_CONFIGURATION => Some(Vec::new()),
            _ => None,
        }
    }
}

impl Hcd for ScriptedHcd {
    fn init(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn transfer_enqueue(&self, urb: &Urb) -> Result<(), CoreError> {
        if let Some(setup) = urb.setup {
            let Some(response) = self.control_response(setup, urb.length) else {
                return Err(CoreError::Protocol);
            };
            let engine = self.engine.clone();
            let id = urb.id;
            let buffer = urb.buffer;
            let capacity = urb.length;
            thread::spawn(move || {
                let n = response.len().min(capacity);
                if n > 0 {
                    unsafe {
                        std::ptr::copy_nonoverlapping(response.as_ptr(), buffer as *mut u8, n);
                    }
                }
                engine.on_complete(id, n as i64);
            });
        } else {
            self.pending.lock().unwrap().insert(urb.hcd_private, urb.id);
        }
        Ok(())
    }

    fn transfer_dequeue(&self, hcd_private: u64) {
        if let Some(id) = self.pending.lock().unwrap().remove(&hcd_private) {
            let engine = self.engine.clone();
            thread::spawn(move || engine.on_complete(id, -3));
        }
    }

    fn pipe_destroy(&self, _hcd_private: u64) {}

    fn roothub_transfer(&self, urb: &Urb) -> Result<usize, CoreError> {
        let setup = urb.setup.ok_or(CoreError::Protocol)?;
        let request = setup[1];
        let value = u16::from_le_bytes([setup[2], setup[3]]);
        let index = u16::from_le_bytes([setup[4], setup[5]]);
        let port = index as usize;
        let mut ports = self.ports.lock().unwrap();
        let Some(p) = ports.get_mut(port.wrapping_sub(1)) else {
            return Ok(0);
        };
        match (request, value) {
            (HUB_CLASS_SET_FEATURE, FEATURE_PORT_RESET) => {
                p.enabled = true;
                p.c_reset = true;
            }
            (HUB_CLASS_SET_FEATURE, FEATURE_PORT_POWER) => {}
            (HUB_CLASS_CLEAR_FEATURE, FEATURE_C_PORT_CONNECTION) => p.c_connection = false,
            (HUB_CLASS_CLEAR_FEATURE, FEATURE_C_PORT_RESET) => p.c_reset = false,
            _ => {}
        }
        Ok(0)
    }

    fn get_roothub_status(&self) -> u32 {
        let ports = self.ports.lock().unwrap();
        let mut bits = 0u32;
        for (i, p) in ports.iter().enumerate() {
            if p.c_connection || p.c_reset {
                bits |= 1 << i;
            }
        }
        bits
    }

    fn port_status(&self, port: u8) -> PortStatus {
        let ports = self.ports.lock().unwrap();
        let Some(p) = ports.get(port as usize - 1) else {
            return PortStatus::empty();
        };
        let mut s = PortStatus::HIGH_SPEED;
        if p.connected {
            s |= PortStatus::CONNECTION;
        }
        if p.enabled {
            s |= PortStatus::ENABLE;
        }
        if p.c_connection {
            s |= PortStatus::C_CONNECTION;
        }
        if p.c_reset {
            s |= PortStatus::C_RESET;
        }
        s
    }

    fn port_count(&self) -> u8 {
        self.ports.lock().unwrap().len() as u8
    }
}
