// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! MCTP control message wire codecs.
//!
//! Requests and responses are represented as the message body following the
//! control header; [`ControlHeader`] carries the Rq/D/instance-id fields and
//! the command code. Decoders take byte slices and check lengths, encoders
//! produce `Vec<u8>` bodies.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use crate::{CommandCode, Eid, Error, Result, MCTP_TYPE_CONTROL};

/// Mask for the 5-bit control message instance ID.
pub const INSTANCE_ID_MASK: u8 = 0x1f;

/// MCTP control message header.
///
/// Three bytes on the wire: message type (with IC bit), Rq/D/instance-id,
/// command code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    /// Request bit; set on requests, clear on responses.
    pub rq: bool,
    /// Datagram bit. Datagrams are not handled by this stack.
    pub d: bool,
    /// 5-bit instance ID, matched between request and response.
    pub iid: u8,
    /// Control command code.
    pub command: CommandCode,
}

impl ControlHeader {
    /// Wire length of the header.
    pub const LEN: usize = 3;

    /// Decode a header from the start of a control message.
    ///
    /// The first byte is the MCTP message type and must be control (0x00)
    /// with the IC bit clear.
    pub fn decode(msg: &[u8]) -> Result<Self> {
        let Some(hdr) = msg.get(..Self::LEN) else {
            trace!("short control header {:?}", msg);
            return Err(Error::InvalidInput);
        };

        if hdr[0] != MCTP_TYPE_CONTROL.0 {
            trace!("not a control message, type {:#04x}", hdr[0]);
            return Err(Error::InvalidInput);
        }

        let Some(command) = CommandCode::from_u8(hdr[2]) else {
            trace!("unknown control command {:#04x}", hdr[2]);
            return Err(Error::InvalidInput);
        };

        Ok(Self {
            rq: hdr[1] & 0x80 != 0,
            d: hdr[1] & 0x40 != 0,
            iid: hdr[1] & INSTANCE_ID_MASK,
            command,
        })
    }

    /// Encode the header.
    pub fn encode(&self) -> Result<[u8; Self::LEN]> {
        if self.iid & !INSTANCE_ID_MASK != 0 {
            return Err(Error::BadArgument);
        }
        let b1 =
            (self.rq as u8) << 7 | (self.d as u8) << 6 | self.iid;
        Ok([MCTP_TYPE_CONTROL.0, b1, self.command as u8])
    }

    /// Header for a request with a given instance ID.
    pub fn request(command: CommandCode, iid: u8) -> Self {
        Self { rq: true, d: false, iid, command }
    }

    /// Header for the response to this request.
    pub fn response(&self) -> Self {
        Self { rq: false, ..*self }
    }
}

/// Builds a full control message from a header and body.
pub fn encode_message(hdr: &ControlHeader, body: &[u8]) -> Result<Vec<u8>> {
    let mut msg = Vec::with_capacity(ControlHeader::LEN + body.len());
    msg.extend_from_slice(&hdr.encode()?);
    msg.extend_from_slice(body);
    Ok(msg)
}

/// Set Endpoint ID operations (request byte 0, bits [1:0]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SetEidOp {
    /// Assign the EID.
    Set = 0b00,
    /// Force-assign even over a static EID.
    Force = 0b01,
    /// Reset to the default EID.
    Reset = 0b10,
    /// Set the Discovered flag only.
    SetDiscovered = 0b11,
}

/// Set Endpoint ID request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetEndpointIdReq {
    /// Requested operation.
    pub op: SetEidOp,
    /// EID to assign.
    pub eid: Eid,
}

impl SetEndpointIdReq {
    /// Decode from a request body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let [op, eid] = body else {
            return Err(Error::InvalidInput);
        };
        let op = match op & 0x03 {
            0b00 => SetEidOp::Set,
            0b01 => SetEidOp::Force,
            0b10 => SetEidOp::Reset,
            _ => SetEidOp::SetDiscovered,
        };
        Ok(Self { op, eid: Eid(*eid) })
    }

    /// Encode as a request body.
    pub fn encode(&self) -> Vec<u8> {
        vec![self.op as u8, self.eid.0]
    }
}

/// Set Endpoint ID response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetEndpointIdResp {
    /// Completion code.
    pub cc: u8,
    /// Assignment status byte.
    pub status: u8,
    /// EID setting after the operation.
    pub eid: Eid,
    /// EID pool size required by the endpoint (bridges).
    pub eid_pool_size: u8,
}

impl SetEndpointIdResp {
    /// Decode from a response body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let [cc, status, eid, pool] = body else {
            return Err(Error::InvalidInput);
        };
        Ok(Self {
            cc: *cc,
            status: *status,
            eid: Eid(*eid),
            eid_pool_size: *pool,
        })
    }

    /// Encode as a response body.
    pub fn encode(&self) -> Vec<u8> {
        vec![self.cc, self.status, self.eid.0, self.eid_pool_size]
    }
}

/// Get Endpoint ID response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetEndpointIdResp {
    /// Completion code.
    pub cc: u8,
    /// Current EID of the endpoint.
    pub eid: Eid,
    /// Endpoint type byte (simple/bridge, dynamic/static EID).
    pub endpoint_type: u8,
    /// Medium-specific information.
    pub medium_specific: u8,
}

impl GetEndpointIdResp {
    /// Decode from a response body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let [cc, eid, typ, medium] = body else {
            return Err(Error::InvalidInput);
        };
        Ok(Self {
            cc: *cc,
            eid: Eid(*eid),
            endpoint_type: *typ,
            medium_specific: *medium,
        })
    }

    /// Encode as a response body.
    pub fn encode(&self) -> Vec<u8> {
        vec![self.cc, self.eid.0, self.endpoint_type, self.medium_specific]
    }
}

/// Routing-table entry type field helpers.
///
/// Bits [7:6] carry the role, bit [5] flags a range entry.
pub mod entry_type {
    /// Single endpoint.
    pub const ENDPOINT: u8 = 0x00;
    /// Bridge plus the endpoints behind it.
    pub const BRIDGE_AND_ENDPOINTS: u8 = 0x01;
    /// Bridge only.
    pub const BRIDGE: u8 = 0x02;
    /// Endpoint range behind a bridge.
    pub const ENDPOINTS: u8 = 0x03;

    const SHIFT: u8 = 6;
    const MASK: u8 = 0x03;
    const RANGE_FLAG: u8 = 0x20;

    /// Extract the role bits.
    pub const fn role(field: u8) -> u8 {
        (field >> SHIFT) & MASK
    }

    /// Replace the role bits, preserving the rest of the field.
    pub const fn with_role(field: u8, role: u8) -> u8 {
        (field & !(MASK << SHIFT)) | ((role & MASK) << SHIFT)
    }

    /// Returns `true` for bridge-class roles.
    pub const fn is_bridge(field: u8) -> bool {
        matches!(role(field), BRIDGE | BRIDGE_AND_ENDPOINTS)
    }

    /// Returns `true` when the entry covers an EID range.
    pub const fn is_range(field: u8) -> bool {
        field & RANGE_FLAG != 0
    }
}

/// Get Routing Table Entries request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetRoutingTableReq {
    /// Entry handle; 0x00 starts a walk, 0xff means no further entries.
    pub entry_handle: u8,
}

impl GetRoutingTableReq {
    /// Decode from a request body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let [handle] = body else {
            return Err(Error::InvalidInput);
        };
        Ok(Self { entry_handle: *handle })
    }

    /// Encode as a request body.
    pub fn encode(&self) -> Vec<u8> {
        vec![self.entry_handle]
    }
}

/// One routing-table entry as carried in a Get Routing Table response.
///
/// The fixed header is six bytes, followed by `phys_address_size` bytes of
/// physical address. PCIe BDFs are big-endian on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRoutingEntry {
    /// Number of EIDs covered, starting at `starting_eid`.
    pub eid_range_size: u8,
    /// First EID of the entry.
    pub starting_eid: u8,
    /// Entry type field, see [`entry_type`].
    pub entry_type: u8,
    /// Physical transport binding of the entry.
    pub phys_transport_binding_id: u8,
    /// Physical medium of the entry.
    pub phys_media_type_id: u8,
    /// Raw physical address bytes.
    pub phys_address: Vec<u8>,
}

impl WireRoutingEntry {
    const FIXED_LEN: usize = 6;

    /// Decode one entry from `buf`, returning it and the number of bytes
    /// consumed.
    ///
    /// Entries for foreign transports are still decoded so that the caller
    /// can advance past their physical address bytes.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let Some(hdr) = buf.get(..Self::FIXED_LEN) else {
            return Err(Error::InvalidInput);
        };
        let addr_size = hdr[5] as usize;
        let Some(addr) = buf.get(Self::FIXED_LEN..Self::FIXED_LEN + addr_size)
        else {
            return Err(Error::InvalidInput);
        };
        Ok((
            Self {
                eid_range_size: hdr[0],
                starting_eid: hdr[1],
                entry_type: hdr[2],
                phys_transport_binding_id: hdr[3],
                phys_media_type_id: hdr[4],
                phys_address: addr.to_vec(),
            },
            Self::FIXED_LEN + addr_size,
        ))
    }

    /// Encode the entry, appending to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.eid_range_size);
        out.push(self.starting_eid);
        out.push(self.entry_type);
        out.push(self.phys_transport_binding_id);
        out.push(self.phys_media_type_id);
        out.push(self.phys_address.len() as u8);
        out.extend_from_slice(&self.phys_address);
    }

    /// The entry's PCIe BDF, when the entry is PCIe with a 2-byte address.
    pub fn pcie_bdf(&self) -> Result<u16> {
        let [hi, lo] = self.phys_address.as_slice() else {
            return Err(Error::InvalidInput);
        };
        Ok(u16::from_be_bytes([*hi, *lo]))
    }
}

/// Get Routing Table Entries response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRoutingTableResp {
    /// Completion code.
    pub cc: u8,
    /// Handle to pass in the next request; 0xff ends the walk.
    pub next_entry_handle: u8,
    /// Entries carried in this response.
    pub entries: Vec<WireRoutingEntry>,
}

impl GetRoutingTableResp {
    /// Decode from a response body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let [cc, next, count, rest @ ..] = body else {
            return Err(Error::InvalidInput);
        };

        let mut entries = Vec::with_capacity(*count as usize);
        let mut offset = 0;
        for _ in 0..*count {
            let (entry, used) = WireRoutingEntry::decode(&rest[offset..])?;
            offset += used;
            entries.push(entry);
        }

        Ok(Self { cc: *cc, next_entry_handle: *next, entries })
    }

    /// Encode as a response body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            vec![self.cc, self.next_entry_handle, self.entries.len() as u8];
        for e in &self.entries {
            e.encode_into(&mut out);
        }
        out
    }
}

/// Get Message Type Support response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetMsgTypeSupportResp {
    /// Completion code.
    pub cc: u8,
    /// Supported MCTP message types.
    pub types: Vec<u8>,
}

impl GetMsgTypeSupportResp {
    /// Decode from a response body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let [cc, count, rest @ ..] = body else {
            return Err(Error::InvalidInput);
        };
        if rest.len() < *count as usize {
            return Err(Error::InvalidInput);
        }
        Ok(Self { cc: *cc, types: rest[..*count as usize].to_vec() })
    }

    /// Encode as a response body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.cc, self.types.len() as u8];
        out.extend_from_slice(&self.types);
        out
    }
}

/// Get MCTP Version Support request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetVersionSupportReq {
    /// Message type to report versions for; 0xff queries the base protocol.
    pub msg_type_number: u8,
}

impl GetVersionSupportReq {
    /// Decode from a request body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let [typ] = body else {
            return Err(Error::InvalidInput);
        };
        Ok(Self { msg_type_number: *typ })
    }

    /// Encode as a request body.
    pub fn encode(&self) -> Vec<u8> {
        vec![self.msg_type_number]
    }
}

/// Get MCTP Version Support response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetVersionSupportResp {
    /// Completion code.
    pub cc: u8,
    /// Version entries, each a packed major/minor/update/alpha word.
    pub versions: Vec<u32>,
}

impl GetVersionSupportResp {
    /// Decode from a response body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let [cc, count, rest @ ..] = body else {
            return Err(Error::InvalidInput);
        };
        if rest.len() < *count as usize * 4 {
            return Err(Error::InvalidInput);
        }
        let versions = rest
            .chunks_exact(4)
            .take(*count as usize)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { cc: *cc, versions })
    }

    /// Encode as a response body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.cc, self.versions.len() as u8];
        for v in &self.versions {
            out.extend_from_slice(&v.to_be_bytes());
        }
        out
    }
}

/// Selector value meaning "no further vendor ID sets".
pub const VENDOR_ID_NO_MORE_SETS: u8 = 0xff;

/// Vendor ID format: PCI vendor ID.
pub const VENDOR_ID_FORMAT_PCI: u8 = 0x00;

/// Get Vendor Defined Message Support request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetVdmSupportReq {
    /// Index of the vendor ID set being queried.
    pub vendor_id_set_selector: u8,
}

impl GetVdmSupportReq {
    /// Decode from a request body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let [sel] = body else {
            return Err(Error::InvalidInput);
        };
        Ok(Self { vendor_id_set_selector: *sel })
    }

    /// Encode as a request body.
    pub fn encode(&self) -> Vec<u8> {
        vec![self.vendor_id_set_selector]
    }
}

/// Get Vendor Defined Message Support response body (PCI vendor format).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetVdmSupportResp {
    /// Completion code.
    pub cc: u8,
    /// Selector for the next set, or [`VENDOR_ID_NO_MORE_SETS`].
    pub vendor_id_set_selector: u8,
    /// Vendor ID format; this codec carries the PCI format.
    pub vendor_id_format: u8,
    /// PCI vendor ID.
    pub vendor_id: u16,
    /// Vendor-defined command set type.
    pub command_set_type: u16,
}

impl GetVdmSupportResp {
    /// Decode from a response body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let [cc, sel, format, v0, v1, c0, c1] = body else {
            return Err(Error::InvalidInput);
        };
        Ok(Self {
            cc: *cc,
            vendor_id_set_selector: *sel,
            vendor_id_format: *format,
            vendor_id: u16::from_be_bytes([*v0, *v1]),
            command_set_type: u16::from_be_bytes([*c0, *c1]),
        })
    }

    /// Encode as a response body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.cc, self.vendor_id_set_selector, self.vendor_id_format];
        out.extend_from_slice(&self.vendor_id.to_be_bytes());
        out.extend_from_slice(&self.command_set_type.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        for iid in 0..=INSTANCE_ID_MASK {
            let hdr = ControlHeader::request(CommandCode::SetEndpointId, iid);
            let enc = hdr.encode().unwrap();
            assert_eq!(ControlHeader::decode(&enc).unwrap(), hdr);

            let resp = hdr.response();
            assert!(!resp.rq);
            assert_eq!(resp.iid, iid);
            let enc = resp.encode().unwrap();
            assert_eq!(ControlHeader::decode(&enc).unwrap(), resp);
        }
    }

    #[test]
    fn header_bad() {
        // Not a control message
        ControlHeader::decode(&[0x01, 0x80, 0x01]).unwrap_err();
        // Unknown command
        ControlHeader::decode(&[0x00, 0x80, 0x7f]).unwrap_err();
        // Short
        ControlHeader::decode(&[0x00, 0x80]).unwrap_err();
        // Oversized instance ID
        ControlHeader {
            rq: true,
            d: false,
            iid: 0x20,
            command: CommandCode::GetEndpointId,
        }
        .encode()
        .unwrap_err();
    }

    #[test]
    fn routing_resp_roundtrip() {
        let resp = GetRoutingTableResp {
            cc: 0,
            next_entry_handle: 0xff,
            entries: vec![
                WireRoutingEntry {
                    eid_range_size: 1,
                    starting_eid: 0x10,
                    entry_type: entry_type::with_role(0, entry_type::ENDPOINT),
                    phys_transport_binding_id: crate::MCTP_BINDING_PCIE,
                    phys_media_type_id: 0x0b,
                    phys_address: 0xa1b2u16.to_be_bytes().to_vec(),
                },
                WireRoutingEntry {
                    eid_range_size: 2,
                    starting_eid: 0x20,
                    entry_type: entry_type::with_role(0, entry_type::BRIDGE),
                    phys_transport_binding_id: crate::MCTP_BINDING_SMBUS,
                    phys_media_type_id: 0x01,
                    phys_address: vec![0x32],
                },
            ],
        };
        let enc = resp.encode();
        let dec = GetRoutingTableResp::decode(&enc).unwrap();
        assert_eq!(dec, resp);
        assert_eq!(dec.entries[0].pcie_bdf().unwrap(), 0xa1b2);
        dec.entries[1].pcie_bdf().unwrap_err();
    }

    #[test]
    fn routing_resp_truncated() {
        let resp = GetRoutingTableResp {
            cc: 0,
            next_entry_handle: 0xff,
            entries: vec![WireRoutingEntry {
                eid_range_size: 1,
                starting_eid: 0x10,
                entry_type: 0,
                phys_transport_binding_id: crate::MCTP_BINDING_PCIE,
                phys_media_type_id: 0x0b,
                phys_address: vec![0xa1, 0xb2],
            }],
        };
        let enc = resp.encode();
        GetRoutingTableResp::decode(&enc[..enc.len() - 1]).unwrap_err();
    }

    #[test]
    fn entry_type_fields() {
        let t = entry_type::with_role(0x20, entry_type::BRIDGE_AND_ENDPOINTS);
        assert_eq!(entry_type::role(t), entry_type::BRIDGE_AND_ENDPOINTS);
        assert!(entry_type::is_bridge(t));
        assert!(entry_type::is_range(t));

        let t = entry_type::with_role(t, entry_type::BRIDGE);
        assert_eq!(entry_type::role(t), entry_type::BRIDGE);
        assert!(entry_type::is_range(t), "range flag preserved");

        assert!(!entry_type::is_bridge(entry_type::with_role(
            0,
            entry_type::ENDPOINTS
        )));
    }

    #[test]
    fn set_eid_roundtrip() {
        let req = SetEndpointIdReq { op: SetEidOp::Set, eid: Eid(0x99) };
        assert_eq!(SetEndpointIdReq::decode(&req.encode()).unwrap(), req);

        let resp = SetEndpointIdResp {
            cc: 0,
            status: 0,
            eid: Eid(0x99),
            eid_pool_size: 0,
        };
        assert_eq!(SetEndpointIdResp::decode(&resp.encode()).unwrap(), resp);
        SetEndpointIdResp::decode(&[0x00]).unwrap_err();
    }

    #[test]
    fn vdm_roundtrip() {
        let resp = GetVdmSupportResp {
            cc: 0,
            vendor_id_set_selector: VENDOR_ID_NO_MORE_SETS,
            vendor_id_format: VENDOR_ID_FORMAT_PCI,
            vendor_id: 0x8086,
            command_set_type: 0x0102,
        };
        assert_eq!(GetVdmSupportResp::decode(&resp.encode()).unwrap(), resp);
    }
}
