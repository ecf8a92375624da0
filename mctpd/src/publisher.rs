// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Endpoint lifecycle publication.
//!
//! Discovered endpoints are announced to the system object bus under
//! `/.../mctp/device/<eid>` with per-transport decorator attributes. The
//! object bus itself is an external collaborator; this module defines the
//! interface the daemon drives and a logging implementation. Publishers
//! receive plain attribute data only, never transport handles.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use mctp_ctrl::Eid;

/// Published mode of a remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMode {
    /// The segment's bus owner.
    BusOwner,
    /// A plain endpoint.
    Endpoint,
    /// A bridge to further endpoints.
    Bridge,
}

/// Transport decorator attributes for a published endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAttrs {
    /// PCIe device location, decoded from the BDF.
    Pcie {
        /// Bus number, BDF bits [15:8].
        bus: u8,
        /// Device number, BDF bits [7:3].
        device: u8,
        /// Function number, BDF bits [2:0].
        function: u8,
    },
    /// SMBus device location.
    Smbus {
        /// I2C bus number (root bus or mux leaf).
        bus: i32,
        /// Slave address as observed, 8-bit form.
        address: u8,
    },
}

/// Consumer of endpoint appearance/disappearance events.
pub trait EndpointPublisher {
    /// A new endpoint appeared at `eid`.
    fn endpoint_added(&self, eid: Eid, mode: EndpointMode, attrs: DeviceAttrs);

    /// The endpoint at `eid` disappeared.
    fn endpoint_removed(&self, eid: Eid);
}

/// Publisher that reports endpoints as structured log lines.
#[derive(Debug, Default)]
pub struct LogPublisher;

impl EndpointPublisher for LogPublisher {
    fn endpoint_added(&self, eid: Eid, mode: EndpointMode, attrs: DeviceAttrs) {
        match attrs {
            DeviceAttrs::Pcie { bus, device, function } => info!(
                "PCIe device {bus:02x}:{device:02x}.{function:x} registered at EID {eid}, mode {mode:?}"
            ),
            DeviceAttrs::Smbus { bus, address } => info!(
                "SMBus device at bus:{bus}, 8 bit address: {address} registered at EID {eid}, mode {mode:?}"
            ),
        }
    }

    fn endpoint_removed(&self, eid: Eid) {
        info!("Device unregistered at EID {eid}");
    }
}
