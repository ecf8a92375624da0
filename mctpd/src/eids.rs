// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! EID pool and SMBus device table.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::collections::BTreeSet;

use mctp_ctrl::prv::SmbusPktPrv;
use mctp_ctrl::{Eid, Error, Result};

/// Pool of EIDs a bus owner may assign.
///
/// Allocation always picks the lowest available EID. Only EIDs that belong
/// to the configured pool can be released back.
#[derive(Debug, Clone, Default)]
pub struct EidPool {
    universe: BTreeSet<u8>,
    available: BTreeSet<u8>,
}

impl EidPool {
    /// Creates a pool over the configured candidate set.
    pub fn new(candidates: impl IntoIterator<Item = u8>) -> Self {
        let universe: BTreeSet<u8> = candidates.into_iter().collect();
        Self { available: universe.clone(), universe }
    }

    /// Allocates the lowest available EID.
    pub fn allocate(&mut self) -> Result<Eid> {
        let Some(eid) = self.available.pop_first() else {
            warn!("EID pool exhausted");
            return Err(Error::EidExhausted);
        };
        trace!("allocated EID {eid}");
        Ok(Eid(eid))
    }

    /// Removes a specific EID from the pool, for devices that already hold
    /// a valid EID from the pool range.
    pub fn claim(&mut self, eid: Eid) -> bool {
        self.available.remove(&eid.0)
    }

    /// Returns an EID to the pool.
    ///
    /// EIDs outside the configured pool are ignored.
    pub fn release(&mut self, eid: Eid) {
        if self.universe.contains(&eid.0) {
            self.available.insert(eid.0);
        }
    }

    /// Remaining assignable EIDs.
    pub fn remaining(&self) -> usize {
        self.available.len()
    }
}

/// SMBus device table: EID to binding-private mapping.
///
/// Each EID appears at most once. Identity of a device is its
/// `(fd, slave_addr)` pair; mux flags and hold timeout are not identity.
#[derive(Debug, Clone, Default)]
pub struct DeviceTable {
    entries: Vec<(Eid, SmbusPktPrv)>,
}

impl DeviceTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry.
    ///
    /// Fails with [`Error::BadArgument`] if the EID is already present;
    /// a moved device must be removed first.
    pub fn insert(&mut self, eid: Eid, prv: SmbusPktPrv) -> Result<()> {
        if self.contains_eid(eid) {
            return Err(Error::BadArgument);
        }
        self.entries.push((eid, prv));
        Ok(())
    }

    /// Looks up the binding-private record for an EID.
    pub fn prv_for(&self, eid: Eid) -> Option<&SmbusPktPrv> {
        self.entries.iter().find(|(e, _)| *e == eid).map(|(_, p)| p)
    }

    /// Looks up the EID registered for a device identity.
    ///
    /// Returns the null EID when the device is unknown.
    pub fn eid_for(&self, prv: &SmbusPktPrv) -> Eid {
        self.entries
            .iter()
            .find(|(_, p)| p.identity() == prv.identity())
            .map(|(e, _)| *e)
            .unwrap_or(mctp_ctrl::MCTP_EID_NULL)
    }

    /// Membership test by EID.
    pub fn contains_eid(&self, eid: Eid) -> bool {
        self.entries.iter().any(|(e, _)| *e == eid)
    }

    /// Removes the entry for an EID.
    pub fn remove(&mut self, eid: Eid) {
        self.entries.retain(|(e, _)| *e != eid);
    }

    /// Iterates entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = &(Eid, SmbusPktPrv)> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Order-sensitive comparison against another table.
    ///
    /// Entries compare by EID and device identity.
    pub fn differs_from(&self, other: &DeviceTable) -> bool {
        if self.entries.len() != other.entries.len() {
            return true;
        }
        self.entries.iter().zip(other.entries.iter()).any(
            |((ea, pa), (eb, pb))| ea != eb || pa.identity() != pb.identity(),
        )
    }
}
