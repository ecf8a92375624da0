// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Per-transport binding-private records.
//!
//! Every frame exchanged with a transport driver carries exactly one of
//! these records; they hold the physical addressing a frame needs beyond
//! the MCTP header. Both are packed little-endian in memory, matching the
//! kernel driver layouts.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use crate::{Error, Result};

/// PCIe VDM routing types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PcieRouting {
    /// Route to Root Complex.
    RouteToRc = 0,
    /// Route by ID (requester BDF).
    RouteById = 2,
    /// Broadcast from Root Complex.
    BroadcastFromRc = 3,
}

impl PcieRouting {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::RouteToRc,
            2 => Self::RouteById,
            3 => Self::BroadcastFromRc,
            _ => return Err(Error::InvalidInput),
        })
    }
}

/// Binding-private record for the PCIe VDM transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciePktPrv {
    /// VDM routing type for the frame.
    pub routing: PcieRouting,
    /// Remote requester ID: source BDF on receive, target BDF on send.
    pub remote_id: u16,
}

impl PciePktPrv {
    /// Wire length of the record.
    pub const LEN: usize = 3;

    /// Decode from the driver's packed layout.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let [routing, lo, hi] = buf else {
            return Err(Error::InvalidInput);
        };
        Ok(Self {
            routing: PcieRouting::from_u8(*routing)?,
            remote_id: u16::from_le_bytes([*lo, *hi]),
        })
    }

    /// Encode to the driver's packed layout.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let bdf = self.remote_id.to_le_bytes();
        [self.routing as u8, bdf[0], bdf[1]]
    }
}

/// Flag bit in [`SmbusPktPrv::mux_flags`]: the fd refers to a mux leaf.
pub const IS_MUX_PORT: u8 = 0x80;

/// Binding-private record for the SMBus transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmbusPktPrv {
    /// Open i2c bus fd (root bus or mux leaf) the frame travels on.
    pub fd: i32,
    /// Milliseconds a mux leaf is held connected for the transaction.
    pub mux_hold_timeout: u16,
    /// Mux flags; see [`IS_MUX_PORT`].
    pub mux_flags: u8,
    /// Remote slave address, 8-bit form (LSB is the R/W bit).
    pub slave_addr: u8,
}

impl SmbusPktPrv {
    /// Wire length of the record.
    pub const LEN: usize = 8;

    /// Decode from the driver's packed layout.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let [f0, f1, f2, f3, t0, t1, flags, addr] = buf else {
            return Err(Error::InvalidInput);
        };
        Ok(Self {
            fd: i32::from_le_bytes([*f0, *f1, *f2, *f3]),
            mux_hold_timeout: u16::from_le_bytes([*t0, *t1]),
            mux_flags: *flags,
            slave_addr: *addr,
        })
    }

    /// Encode to the driver's packed layout.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let fd = self.fd.to_le_bytes();
        let hold = self.mux_hold_timeout.to_le_bytes();
        [
            fd[0], fd[1], fd[2], fd[3], hold[0], hold[1], self.mux_flags,
            self.slave_addr,
        ]
    }

    /// Identity for device-table lookups.
    ///
    /// Mux flags and hold timeout are routing hints, not identity.
    pub fn identity(&self) -> (i32, u8) {
        (self.fd, self.slave_addr)
    }

    /// Returns `true` when the record points at a mux leaf.
    pub fn is_mux_port(&self) -> bool {
        self.mux_flags & IS_MUX_PORT != 0
    }
}

/// Binding-private record variants over the supported transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingPrv {
    /// PCIe VDM record.
    Pcie(PciePktPrv),
    /// SMBus record.
    Smbus(SmbusPktPrv),
}
