// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Daemon configuration.
//!
//! Configuration is a JSON file with one section per binding
//! (`"smbus"`, `"pcie"`); field names match the platform configuration
//! schema. Sections are parsed into raw serde structs and then validated
//! into the typed records the bindings consume. Validation failures are
//! fatal at startup.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::BindingRole;

/// A fatal configuration problem.
#[derive(Debug)]
pub struct ConfigError {
    /// Field or file the problem was found in.
    pub what: String,
}

impl ConfigError {
    fn new(what: impl Into<String>) -> Self {
        Self { what: what.into() }
    }
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(fmt, "invalid configuration: {}", self.what)
    }
}

impl std::error::Error for ConfigError {}

/// MCTP physical medium identifiers (DSP0239).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PhysicalMediumId {
    Smbus,
    SmbusI2c,
    I2cCompatible,
    Smbus3OrI2c400khzCompatible,
    Smbus3OrI2c1MhzCompatible,
    I2c3Mhz4Compatible,
    Pcie11,
    Pcie2,
    Pcie21,
    Pcie3,
    Pcie4,
    Pcie5,
    PciCompatible,
}

impl PhysicalMediumId {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        Ok(match s {
            "Smbus" => Self::Smbus,
            "SmbusI2c" => Self::SmbusI2c,
            "I2cCompatible" => Self::I2cCompatible,
            "Smbus3OrI2c400khzCompatible" => Self::Smbus3OrI2c400khzCompatible,
            "Smbus3OrI2c1MhzCompatible" => Self::Smbus3OrI2c1MhzCompatible,
            "I2c3Mhz4Compatible" => Self::I2c3Mhz4Compatible,
            "Pcie11" => Self::Pcie11,
            "Pcie2" => Self::Pcie2,
            "Pcie21" => Self::Pcie21,
            "Pcie3" => Self::Pcie3,
            "Pcie4" => Self::Pcie4,
            "Pcie5" => Self::Pcie5,
            "PciCompatible" => Self::PciCompatible,
            _ => {
                return Err(ConfigError::new(format!(
                    "unknown PhysicalMediumID {s:?}"
                )))
            }
        })
    }

    /// DSP0239 identifier value.
    pub fn id(&self) -> u8 {
        match self {
            Self::Smbus => 0x01,
            Self::SmbusI2c => 0x02,
            Self::I2cCompatible => 0x03,
            Self::Smbus3OrI2c400khzCompatible => 0x04,
            Self::Smbus3OrI2c1MhzCompatible => 0x05,
            Self::I2c3Mhz4Compatible => 0x06,
            Self::Pcie11 => 0x08,
            Self::Pcie2 => 0x09,
            Self::Pcie21 => 0x0a,
            Self::Pcie3 => 0x0b,
            Self::Pcie4 => 0x0c,
            Self::Pcie5 => 0x0d,
            Self::PciCompatible => 0x0f,
        }
    }
}

fn parse_role(s: &str) -> Result<BindingRole, ConfigError> {
    Ok(match s {
        "busowner" | "BusOwner" => BindingRole::BusOwner,
        "endpoint" | "Endpoint" => BindingRole::Endpoint,
        "bridge" | "Bridge" => BindingRole::Bridge,
        _ => return Err(ConfigError::new(format!("unknown Role {s:?}"))),
    })
}

#[derive(Debug, Deserialize)]
struct RawSmbus {
    #[serde(rename = "PhysicalMediumID")]
    physical_medium_id: String,
    #[serde(rename = "Role", alias = "role")]
    role: String,
    #[serde(rename = "DefaultEID", alias = "default-eid")]
    default_eid: u8,
    #[serde(rename = "Bus", alias = "bus")]
    bus: String,
    #[serde(rename = "ARPMasterSupport", alias = "ARPOwnerSupport")]
    arp_master_support: bool,
    #[serde(rename = "BMCSlaveAddress", alias = "BMCReceiverAddress")]
    bmc_slave_addr: u8,
    #[serde(rename = "ReqToRespTimeMs")]
    req_to_resp_time_ms: u64,
    #[serde(rename = "ReqRetryCount")]
    req_retry_count: u8,
    #[serde(rename = "ScanInterval")]
    scan_interval: Option<u64>,
    #[serde(rename = "GetRoutingInterval")]
    get_routing_interval: Option<u64>,
    #[serde(rename = "EIDPool", alias = "eid-pool")]
    eid_pool: Option<Vec<u8>>,
    #[serde(rename = "SupportedEndpointSlaveAddress")]
    supported_endpoint_slave_address: Option<Vec<u8>>,
    #[serde(rename = "IgnoredEndpointSlaveAddress")]
    ignored_endpoint_slave_address: Option<Vec<u8>>,
    #[serde(rename = "AllowedBuses")]
    allowed_buses: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawPcie {
    #[serde(rename = "PhysicalMediumID")]
    physical_medium_id: String,
    #[serde(rename = "Role", alias = "role")]
    role: String,
    #[serde(rename = "DefaultEID", alias = "default-eid")]
    default_eid: u8,
    #[serde(rename = "BDF", alias = "bdf")]
    bdf: u16,
    #[serde(rename = "ReqToRespTimeMs")]
    req_to_resp_time_ms: u64,
    #[serde(rename = "ReqRetryCount")]
    req_retry_count: u8,
    #[serde(rename = "GetRoutingInterval")]
    get_routing_interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    smbus: Option<RawSmbus>,
    pcie: Option<RawPcie>,
}

/// Validated SMBus binding configuration.
#[derive(Debug, Clone)]
pub struct SmbusConfig {
    /// Physical medium of the bus.
    pub medium_id: PhysicalMediumId,
    /// Role on this segment.
    pub role: BindingRole,
    /// EID used before any assignment.
    pub default_eid: u8,
    /// Root bus device path, e.g. `/dev/i2c-2`.
    pub bus: PathBuf,
    /// Whether this endpoint is an SMBus ARP master.
    pub arp_master_support: bool,
    /// Own slave address, 8-bit form.
    pub bmc_slave_addr: u8,
    /// Control request response timeout.
    pub req_to_resp_time_ms: u64,
    /// Control request retry count.
    pub req_retry_count: u8,
    /// Device scan period, seconds.
    pub scan_interval_s: u64,
    /// Routing-table refresh period, seconds (non-bus-owner).
    pub routing_interval_s: u64,
    /// Assignable EIDs (bus-owner role).
    pub eid_pool: BTreeSet<u8>,
    /// Slave addresses to probe, 7-bit, with ignored addresses removed.
    pub supported_endpoint_slave_address: BTreeSet<u8>,
    /// Bus paths higher layers may reserve bandwidth on.
    pub allowed_buses: BTreeSet<String>,
}

/// Validated PCIe binding configuration.
#[derive(Debug, Clone)]
pub struct PcieConfig {
    /// Physical medium of the link.
    pub medium_id: PhysicalMediumId,
    /// Role on this segment.
    pub role: BindingRole,
    /// EID used before any assignment.
    pub default_eid: u8,
    /// Own bus/device/function.
    pub bdf: u16,
    /// Control request response timeout.
    pub req_to_resp_time_ms: u64,
    /// Control request retry count.
    pub req_retry_count: u8,
    /// Routing-table refresh period, seconds (non-bus-owner).
    pub get_routing_interval_s: u64,
}

/// Configuration for one binding instance.
#[derive(Debug, Clone)]
pub enum BindingConfig {
    /// SMBus/I2C binding.
    Smbus(SmbusConfig),
    /// PCIe VDM binding.
    Pcie(PcieConfig),
}

const DEFAULT_SCAN_INTERVAL_S: u64 = 600;
const DEFAULT_ROUTING_INTERVAL_S: u64 = 5;
const DEFAULT_SLAVE_ADDR_START: u8 = 0x08;
const DEFAULT_SLAVE_ADDR_END: u8 = 0x78;

fn validate_smbus(raw: RawSmbus) -> Result<SmbusConfig, ConfigError> {
    let role = parse_role(&raw.role)?;

    let eid_pool: BTreeSet<u8> = match (role, raw.eid_pool) {
        (BindingRole::BusOwner, None) => {
            return Err(ConfigError::new(
                "Role is set to BusOwner but EIDPool is missing",
            ));
        }
        (BindingRole::BusOwner, Some(pool)) => {
            let pool: BTreeSet<u8> = pool.into_iter().collect();
            if let Some(bad) =
                pool.iter().find(|e| mctp_ctrl::Eid::new_normal(**e).is_err())
            {
                return Err(ConfigError::new(format!(
                    "EIDPool contains reserved EID {bad:#04x}"
                )));
            }
            pool
        }
        (_, _) => BTreeSet::new(),
    };

    let mut supported: BTreeSet<u8> = match raw.supported_endpoint_slave_address
    {
        Some(addrs) => addrs.into_iter().collect(),
        None => (DEFAULT_SLAVE_ADDR_START..DEFAULT_SLAVE_ADDR_END).collect(),
    };
    for ignored in raw.ignored_endpoint_slave_address.unwrap_or_default() {
        supported.remove(&ignored);
    }

    let scan_interval_s = match raw.scan_interval {
        Some(0) | None => DEFAULT_SCAN_INTERVAL_S,
        Some(s) => s,
    };

    let routing_interval_s = match (role, raw.get_routing_interval) {
        (BindingRole::BusOwner, _) => 0,
        (_, Some(s)) => s,
        (_, None) => DEFAULT_ROUTING_INTERVAL_S,
    };

    Ok(SmbusConfig {
        medium_id: PhysicalMediumId::parse(&raw.physical_medium_id)?,
        role,
        default_eid: raw.default_eid,
        bus: PathBuf::from(raw.bus),
        arp_master_support: raw.arp_master_support,
        bmc_slave_addr: raw.bmc_slave_addr,
        req_to_resp_time_ms: raw.req_to_resp_time_ms,
        req_retry_count: raw.req_retry_count,
        scan_interval_s,
        routing_interval_s,
        eid_pool,
        supported_endpoint_slave_address: supported,
        allowed_buses: raw
            .allowed_buses
            .unwrap_or_default()
            .into_iter()
            .collect(),
    })
}

fn validate_pcie(raw: RawPcie) -> Result<PcieConfig, ConfigError> {
    let role = parse_role(&raw.role)?;

    let get_routing_interval_s = match (role, raw.get_routing_interval) {
        (BindingRole::BusOwner, _) => 0,
        (_, Some(s)) => s,
        (_, None) => {
            return Err(ConfigError::new(
                "Role is not BusOwner but GetRoutingInterval is missing",
            ));
        }
    };

    Ok(PcieConfig {
        medium_id: PhysicalMediumId::parse(&raw.physical_medium_id)?,
        role,
        default_eid: raw.default_eid,
        bdf: raw.bdf,
        req_to_resp_time_ms: raw.req_to_resp_time_ms,
        req_retry_count: raw.req_retry_count,
        get_routing_interval_s,
    })
}

/// Load the named binding configuration from a JSON config file.
pub fn load(
    path: &Path,
    binding_name: &str,
) -> Result<BindingConfig, ConfigError> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::new(format!("cannot read {}: {e}", path.display()))
    })?;

    let raw: RawConfig = serde_json::from_str(&data).map_err(|e| {
        ConfigError::new(format!("cannot parse {}: {e}", path.display()))
    })?;

    match binding_name {
        "smbus" => {
            let sect = raw.smbus.ok_or_else(|| {
                ConfigError::new("no \"smbus\" section in configuration")
            })?;
            Ok(BindingConfig::Smbus(validate_smbus(sect)?))
        }
        "pcie" => {
            let sect = raw.pcie.ok_or_else(|| {
                ConfigError::new("no \"pcie\" section in configuration")
            })?;
            Ok(BindingConfig::Pcie(validate_pcie(sect)?))
        }
        other => {
            Err(ConfigError::new(format!("unknown binding name {other:?}")))
        }
    }
}
