// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * MCTP control protocol common types.
 *
 * Copyright (c) 2025 Code Construct
 */

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # MCTP Control Protocol
//!
//! This crate provides common types and wire codecs for the MCTP control
//! protocol (DSP0236), as used by a bus-owner/endpoint daemon. All packed
//! wire structures are parsed through explicit length-checked byte decoders.

pub mod control;
pub mod prv;

/// MCTP endpoint ID
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Eid(pub u8);

impl Eid {
    /// Construct a new normal EID.
    ///
    /// Reserved, Null, and Broadcast EIDs are rejected.
    pub const fn new_normal(eid: u8) -> Result<Eid> {
        if eid <= 7 || eid == 0xff {
            Err(Error::BadArgument)
        } else {
            Ok(Eid(eid))
        }
    }

    /// Returns `true` for the Null EID.
    pub const fn is_null(&self) -> bool {
        self.0 == MCTP_EID_NULL.0
    }
}

impl core::fmt::Display for Eid {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        self.0.fmt(fmt)
    }
}

/// Special EID value: NULL
pub const MCTP_EID_NULL: Eid = Eid(0x00);
/// Special EID value: broadcast
pub const MCTP_EID_BROADCAST: Eid = Eid(0xff);

/// MCTP Message type field
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MsgType(pub u8);

/// MCTP Control Protocol message type
pub const MCTP_TYPE_CONTROL: MsgType = MsgType(0x00);

/// Physical transport binding identifier (DSP0239)
pub const MCTP_BINDING_SMBUS: u8 = 0x01;
/// Physical transport binding identifier (DSP0239)
pub const MCTP_BINDING_PCIE: u8 = 0x02;

/// An error type for the MCTP control plane
///
/// Covers both wire-level failures and the daemon-facing operation
/// failures (timeouts, missing routes, protocol rejections).
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failure in transmit path, typically transport-specific
    TxFailure,
    /// Failure in receive path, typically transport-specific
    RxFailure,
    /// A control request exhausted its retries
    TimedOut,
    /// Bad argument
    BadArgument,
    /// Invalid input, typically a malformed wire structure
    InvalidInput,
    /// No routing-table entry for the destination EID
    NoRoute,
    /// Inbound request was invalid for the current state
    ProtocolReject,
    /// The resource is held by another endpoint
    ResourceBusy,
    /// All EIDs in the pool are allocated
    EidExhausted,
    /// Remote endpoint returned a failure completion code
    CompletionFailed(CompletionCode),
    /// Internal error
    InternalError,
    /// IO error from a transport binding
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::Io(i) => write!(fmt, "MCTP IO Error: {}", i),
            Self::CompletionFailed(cc) => {
                write!(fmt, "MCTP completion failure: {:?}", cc)
            }
            _ => write!(fmt, "MCTP Error: {:?}", self),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(e)
    }
}

/// MCTP control result type
pub type Result<T> = core::result::Result<T, Error>;

/// MCTP control protocol command codes (DSP0236 table 12)
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum CommandCode {
    SetEndpointId = 0x01,
    GetEndpointId = 0x02,
    GetEndpointUuid = 0x03,
    GetVersionSupport = 0x04,
    GetMessageTypeSupport = 0x05,
    GetVdmSupport = 0x06,
    ResolveEndpointId = 0x07,
    AllocateEndpointIds = 0x08,
    RoutingInformationUpdate = 0x09,
    GetRoutingTableEntries = 0x0a,
    PrepareEndpointDiscovery = 0x0b,
    EndpointDiscovery = 0x0c,
    DiscoveryNotify = 0x0d,
    GetNetworkId = 0x0e,
}

impl CommandCode {
    /// Decode a command code byte. Unknown codes are rejected.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => Self::SetEndpointId,
            0x02 => Self::GetEndpointId,
            0x03 => Self::GetEndpointUuid,
            0x04 => Self::GetVersionSupport,
            0x05 => Self::GetMessageTypeSupport,
            0x06 => Self::GetVdmSupport,
            0x07 => Self::ResolveEndpointId,
            0x08 => Self::AllocateEndpointIds,
            0x09 => Self::RoutingInformationUpdate,
            0x0a => Self::GetRoutingTableEntries,
            0x0b => Self::PrepareEndpointDiscovery,
            0x0c => Self::EndpointDiscovery,
            0x0d => Self::DiscoveryNotify,
            0x0e => Self::GetNetworkId,
            _ => return None,
        })
    }
}

/// MCTP control completion codes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum CompletionCode {
    Success = 0x00,
    Error = 0x01,
    ErrorInvalidData = 0x02,
    ErrorInvalidLength = 0x03,
    ErrorNotReady = 0x04,
    ErrorUnsupportedCmd = 0x05,
}

impl CompletionCode {
    /// Decode a completion code byte.
    ///
    /// Command-specific codes (0x80..) and unknown values map to `Error`.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x00 => Self::Success,
            0x02 => Self::ErrorInvalidData,
            0x03 => Self::ErrorInvalidLength,
            0x04 => Self::ErrorNotReady,
            0x05 => Self::ErrorUnsupportedCmd,
            _ => Self::Error,
        }
    }
}

/// Returns `Ok(())` for a success completion code byte.
pub fn cc_result(cc: u8) -> Result<()> {
    match CompletionCode::from_u8(cc) {
        CompletionCode::Success => Ok(()),
        other => Err(Error::CompletionFailed(other)),
    }
}
