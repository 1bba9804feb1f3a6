//! USB descriptor layouts and the configuration-descriptor walk
//! (spec §3, §4.3). Descriptor structs mirror the wire format exactly
//! (`repr(C)`, no padding) the same way the teacher's xhci driver
//! defines `UsbDeviceDescriptor`; this module adds the interface /
//! endpoint / IAD / class-specific variants and the walk algorithm
//! that turns a raw `wTotalLength` blob into structured records.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const DESC_TYPE_DEVICE: u8 = 0x01;
pub const DESC_TYPE_CONFIGURATION: u8 = 0x02;
pub const DESC_TYPE_STRING: u8 = 0x03;
pub const DESC_TYPE_INTERFACE: u8 = 0x04;
pub const DESC_TYPE_ENDPOINT: u8 = 0x05;
pub const DESC_TYPE_INTERFACE_ASSOCIATION: u8 = 0x0B;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct UsbDeviceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub bcd_usb: u16,
    pub b_device_class: u8,
    pub b_device_subclass: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size_0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub b_num_configurations: u8,
}

pub const DEVICE_DESCRIPTOR_LEN: usize = 18;

const _: () = assert!(core::mem::size_of::<UsbDeviceDescriptor>() == DEVICE_DESCRIPTOR_LEN);

impl UsbDeviceDescriptor {
    /// Parses the fixed 18-byte device descriptor. `bytes` must hold
    /// at least `DEVICE_DESCRIPTOR_LEN` bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < DEVICE_DESCRIPTOR_LEN || bytes[1] != DESC_TYPE_DEVICE {
            return Err(CoreError::Protocol);
        }
        Ok(Self {
            b_length: bytes[0],
            b_descriptor_type: bytes[1],
            bcd_usb: u16::from_le_bytes([bytes[2], bytes[3]]),
            b_device_class: bytes[4],
            b_device_subclass: bytes[5],
            b_device_protocol: bytes[6],
            b_max_packet_size_0: bytes[7],
            id_vendor: u16::from_le_bytes([bytes[8], bytes[9]]),
            id_product: u16::from_le_bytes([bytes[10], bytes[11]]),
            bcd_device: u16::from_le_bytes([bytes[12], bytes[13]]),
            i_manufacturer: bytes[14],
            i_product: bytes[15],
            i_serial_number: bytes[16],
            b_num_configurations: bytes[17],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbConfigurationHeader {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub w_total_length: u16,
    pub b_num_interfaces: u8,
    pub b_configuration_value: u8,
    pub i_configuration: u8,
    pub bm_attributes: u8,
    pub b_max_power: u8,
}

pub const CONFIG_HEADER_LEN: usize = 9;

impl UsbConfigurationHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < CONFIG_HEADER_LEN || bytes[1] != DESC_TYPE_CONFIGURATION {
            return Err(CoreError::Protocol);
        }
        Ok(Self {
            b_length: bytes[0],
            b_descriptor_type: bytes[1],
            w_total_length: u16::from_le_bytes([bytes[2], bytes[3]]),
            b_num_interfaces: bytes[4],
            b_configuration_value: bytes[5],
            i_configuration: bytes[6],
            bm_attributes: bytes[7],
            b_max_power: bytes[8],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbInterfaceDescriptor {
    pub b_interface_number: u8,
    pub b_alternate_setting: u8,
    pub b_num_endpoints: u8,
    pub b_interface_class: u8,
    pub b_interface_subclass: u8,
    pub b_interface_protocol: u8,
    pub i_interface: u8,
}

pub const INTERFACE_DESCRIPTOR_LEN: usize = 9;

impl UsbInterfaceDescriptor {
    fn parse(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < INTERFACE_DESCRIPTOR_LEN {
            return Err(CoreError::Protocol);
        }
        Ok(Self {
            b_interface_number: bytes[2],
            b_alternate_setting: bytes[3],
            b_num_endpoints: bytes[4],
            b_interface_class: bytes[5],
            b_interface_subclass: bytes[6],
            b_interface_protocol: bytes[7],
            i_interface: bytes[8],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbEndpointDescriptor {
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

pub const ENDPOINT_DESCRIPTOR_LEN: usize = 7;

impl UsbEndpointDescriptor {
    fn parse(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < ENDPOINT_DESCRIPTOR_LEN {
            return Err(CoreError::Protocol);
        }
        Ok(Self {
            b_endpoint_address: bytes[2],
            bm_attributes: bytes[3],
            w_max_packet_size: u16::from_le_bytes([bytes[4], bytes[5]]),
            b_interval: bytes[6],
        })
    }

    pub fn endpoint_number(&self) -> u8 {
        self.b_endpoint_address & 0x0F
    }

    pub fn direction(&self) -> EndpointDirection {
        if self.b_endpoint_address & 0x80 != 0 {
            EndpointDirection::In
        } else {
            EndpointDirection::Out
        }
    }

    pub fn transfer_type(&self) -> TransferType {
        match self.bm_attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    pub fn max_packet_size(&self) -> u16 {
        self.w_max_packet_size & 0x07FF
    }
}

/// One interface at its primary (alternate setting 0) configuration,
/// with the endpoints and class-specific blobs that followed it in
/// the raw configuration descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceRecord {
    pub descriptor: Option<UsbInterfaceDescriptor>,
    pub endpoints: Vec<UsbEndpointDescriptor>,
    pub class_specific: Vec<u8>,
    /// Alternate settings seen beyond 0; counted, not stored.
    pub alternate_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigWalkResult {
    pub header: Option<UsbConfigurationHeader>,
    pub interfaces: Vec<InterfaceRecord>,
    /// class/subclass/protocol propagated from the first Interface
    /// Association Descriptor, if one was present.
    pub iad_class_override: Option<(u8, u8, u8)>,
}

/// Walks a full configuration descriptor blob (`wTotalLength` bytes,
/// already fetched in full) and returns the structured interfaces.
/// Policy per spec §4.3: only the primary alternate (setting 0) is
/// recorded; endpoints attach to the most recently opened primary
/// interface; IADs propagate class triples; class-specific interface
/// descriptors are retained as an opaque blob; anything else unknown
/// is skipped.
pub fn walk_configuration(bytes: &[u8]) -> Result<ConfigWalkResult, CoreError> {
    let mut result = ConfigWalkResult::default();
    let mut current: Option<usize> = None;
    let mut seen_any_interface = false;

    let mut offset = 0;
    while offset + 2 <= bytes.len() {
        let b_length = bytes[offset] as usize;
        if b_length < 2 || offset + b_length > bytes.len() {
            return Err(CoreError::Protocol);
        }
        let b_type = bytes[offset + 1];
        let body = &bytes[offset..offset + b_length];

        match b_type {
            DESC_TYPE_CONFIGURATION => {
                result.header = Some(UsbConfigurationHeader::parse(body)?);
            }
            DESC_TYPE_INTERFACE_ASSOCIATION => {
                if body.len() >= 8 && result.iad_class_override.is_none() {
                    result.iad_class_override = Some((body[4], body[5], body[6]));
                }
            }
            DESC_TYPE_INTERFACE => {
                let desc = UsbInterfaceDescriptor::parse(body)?;
                seen_any_interface = true;
                if desc.b_alternate_setting == 0 {
                    result.interfaces.push(InterfaceRecord {
                        descriptor: Some(desc),
                        ..Default::default()
                    });
                    current = Some(result.interfaces.len() - 1);
                } else {
                    if let Some(primary) = result
                        .interfaces
                        .iter_mut()
                        .rev()
                        .find(|iface| {
                            iface
                                .descriptor
                                .is_some_and(|d| d.b_interface_number == desc.b_interface_number)
                        })
                    {
                        primary.alternate_count += 1;
                    }
                    current = None;
                }
            }
            DESC_TYPE_ENDPOINT => {
                if !seen_any_interface {
                    return Err(CoreError::Protocol);
                }
                let Some(idx) = current else {
                    // Endpoint belongs to a non-primary alternate; not stored.
                    offset += b_length;
                    continue;
                };
                let endpoint = UsbEndpointDescriptor::parse(body)?;
                let iface = &mut result.interfaces[idx];
                let declared = iface.descriptor.map(|d| d.b_num_endpoints).unwrap_or(0) as usize;
                if iface.endpoints.len() >= declared {
                    return Err(CoreError::Protocol);
                }
                iface.endpoints.push(endpoint);
            }
            DESC_TYPE_DEVICE | DESC_TYPE_STRING => {
                // Never legal inside a configuration blob; skip defensively.
            }
            _ => {
                // Class-specific (HID, CS_INTERFACE, CS_ENDPOINT, ...) if we
                // have a current interface to attach it to; otherwise an
                // unknown descriptor type with no owner, skipped entirely.
                if let Some(idx) = current {
                    result.interfaces[idx].class_specific.extend_from_slice(body);
                }
            }
        }

        offset += b_length;
    }

    Ok(result)
}

/// Decodes the language-ID list returned by string descriptor index 0
/// (a `bLength`/`bDescriptorType` header followed by u16 LANGIDs).
pub fn parse_langid_list(bytes: &[u8]) -> Vec<u16> {
    if bytes.len() < 2 {
        return Vec::new();
    }
    bytes[2..]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Decodes a UTF-16LE string descriptor body (after the 2-byte
/// header) into a Rust `String`, lossily substituting any code unit
/// that doesn't form valid UTF-16.
pub fn parse_string_descriptor(bytes: &[u8]) -> String {
    if bytes.len() < 2 {
        return String::new();
    }
    let units: Vec<u16> = bytes[2..]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(num: u8, alt: u8, n_ep: u8) -> Vec<u8> {
        vec![9, DESC_TYPE_INTERFACE, num, alt, n_ep, 0x03, 0x00, 0x00, 0]
    }

    fn endpoint(addr: u8) -> Vec<u8> {
        vec![7, DESC_TYPE_ENDPOINT, addr, 0x03, 0x40, 0x00, 0x0A]
    }

    fn config_header(total_len: u16, n_iface: u8) -> Vec<u8> {
        let mut v = vec![9, DESC_TYPE_CONFIGURATION, 0, 0, n_iface, 1, 0, 0x80, 50];
        v[2..4].copy_from_slice(&total_len.to_le_bytes());
        v
    }

    #[test]
    fn walk_single_interface_with_one_endpoint() {
        let mut blob = config_header(9 + 9 + 7, 1);
        blob.extend(iface(0, 0, 1));
        blob.extend(endpoint(0x81));
        let walked = walk_configuration(&blob).unwrap();
        assert_eq!(walked.interfaces.len(), 1);
        assert_eq!(walked.interfaces[0].endpoints.len(), 1);
        assert_eq!(
            walked.interfaces[0].endpoints[0].direction(),
            EndpointDirection::In
        );
    }

    #[test]
    fn alternate_settings_are_counted_not_stored() {
        let mut blob = config_header(9 + 9 + 9, 1);
        blob.extend(iface(0, 0, 0));
        blob.extend(iface(0, 1, 0));
        let walked = walk_configuration(&blob).unwrap();
        assert_eq!(walked.interfaces.len(), 1);
        assert_eq!(walked.interfaces[0].alternate_count, 1);
    }

    #[test]
    fn endpoint_overflow_fails_enumeration() {
        let mut blob = config_header(9 + 9 + 7 + 7, 1);
        blob.extend(iface(0, 0, 1));
        blob.extend(endpoint(0x81));
        blob.extend(endpoint(0x02));
        assert_eq!(walk_configuration(&blob), Err(CoreError::Protocol));
    }

    #[test]
    fn endpoint_before_any_interface_fails() {
        let mut blob = config_header(9 + 7, 0);
        blob.extend(endpoint(0x81));
        assert_eq!(walk_configuration(&blob), Err(CoreError::Protocol));
    }

    #[test]
    fn iad_class_propagates_once() {
        let mut blob = config_header(9 + 8 + 9, 2);
        blob.extend(vec![8, DESC_TYPE_INTERFACE_ASSOCIATION, 0, 2, 0xEF, 0x02, 0x01, 0]);
        blob.extend(iface(0, 0, 0));
        let walked = walk_configuration(&blob).unwrap();
        assert_eq!(walked.iad_class_override, Some((0xEF, 0x02, 0x01)));
    }

    #[test]
    fn class_specific_descriptor_is_retained_as_blob() {
        let mut blob = config_header(9 + 9 + 9, 1);
        blob.extend(iface(0, 0, 0));
        blob.extend(vec![9, 0x21, 1, 1, 1, 1, 1, 1, 1]); // HID descriptor
        let walked = walk_configuration(&blob).unwrap();
        assert_eq!(walked.interfaces[0].class_specific.len(), 9);
    }

    #[test]
    fn string_descriptor_round_trips_utf16() {
        let s = "Hub";
        let units: Vec<u16> = s.encode_utf16().collect();
        let mut bytes = vec![2 + units.len() as u8 * 2, DESC_TYPE_STRING];
        for u in units {
            bytes.extend_from_slice(&u.to_le_bytes());
        }
        assert_eq!(parse_string_descriptor(&bytes), "Hub");
    }

    #[test]
    fn langid_list_round_trips() {
        let bytes = vec![4, DESC_TYPE_STRING, 0x09, 0x04];
        assert_eq!(parse_langid_list(&bytes), vec![0x0409]);
    }

    #[test]
    fn langid_list_on_a_stalled_or_empty_descriptor_is_empty_not_a_panic() {
        assert_eq!(parse_langid_list(&[]), Vec::<u16>::new());
        assert_eq!(parse_langid_list(&[4]), Vec::<u16>::new());
    }
}
