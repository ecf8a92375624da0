// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Routing-table engine.
//!
//! The PCIe binding walks the bus owner's routing table and recurses into
//! bridges; this module holds the table representation, the merge policy
//! for successive Get Routing Table Entries responses, and the diff that
//! drives endpoint registration. The async walk drivers live with the
//! transport planes.
//!
//! Entries discovered behind a bridge are inserted immediately after the
//! bridge entry, so endpoints behind one bridge stay contiguous in source
//! order. Table equality is order-sensitive; event emission is membership
//! based.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use mctp_ctrl::control::{entry_type, WireRoutingEntry};
use mctp_ctrl::MCTP_BINDING_PCIE;

use crate::publisher::EndpointMode;

/// One routing-table entry: EID, physical address (PCIe BDF), entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingEntry {
    /// EID of the entry.
    pub eid: u8,
    /// Physical address; a BDF for the PCIe transport.
    pub phys_addr: u16,
    /// Entry type field, see [`entry_type`].
    pub entry_type: u8,
}

/// Bridges already queried during a walk, as `(eid, phys_addr)` pairs.
pub type CalledBridges = Vec<(u8, u16)>;

/// Returns `true` for bridge-class entries.
pub fn is_entry_bridge(entry: &RoutingEntry) -> bool {
    entry_type::is_bridge(entry.entry_type)
}

/// Whether a bridge entry has already been queried in this walk.
pub fn is_bridge_called(entry: &RoutingEntry, called: &CalledBridges) -> bool {
    called
        .iter()
        .any(|(eid, addr)| entry.eid == *eid && entry.phys_addr == *addr)
}

/// Whether every bridge in `rt` has been queried.
pub fn all_bridges_called(rt: &[RoutingEntry], called: &CalledBridges) -> bool {
    rt.iter()
        .all(|entry| !is_entry_bridge(entry) || is_bridge_called(entry, called))
}

/// Whether a bridge-reported entry is a live endpoint behind that bridge.
///
/// True iff the EID is not yet in the table, the entry covers exactly one
/// EID, and the entry is on the PCIe transport.
pub fn is_active_entry_behind_bridge(
    entry: &WireRoutingEntry,
    rt: &[RoutingEntry],
) -> bool {
    !rt.iter().any(|e| e.eid == entry.starting_eid)
        && entry.eid_range_size == 1
        && entry.phys_transport_binding_id == MCTP_BINDING_PCIE
}

/// Merges one Get Routing Table Entries response into the table.
///
/// `issuer_is_bus_owner` selects the top-level merge rules; for bridge
/// responses, accepted entries are inserted at `insert_index` carrying the
/// bridge's own physical address (`issuer_phys_addr`), not the entry's.
pub fn merge_response(
    rt: &mut Vec<RoutingEntry>,
    insert_index: &mut usize,
    issuer_is_bus_owner: bool,
    issuer_phys_addr: u16,
    entries: &[WireRoutingEntry],
) {
    for entry in entries {
        if entry.phys_transport_binding_id != MCTP_BINDING_PCIE {
            continue;
        }
        let Ok(entry_bdf) = entry.pcie_bdf() else {
            debug!(
                "Dropping PCIe entry for EID {} with bad address size",
                entry.starting_eid
            );
            continue;
        };

        let role = entry_type::role(entry.entry_type);
        if issuer_is_bus_owner && role == entry_type::BRIDGE_AND_ENDPOINTS {
            rt.push(RoutingEntry {
                eid: entry.starting_eid,
                phys_addr: entry_bdf,
                entry_type: entry_type::with_role(
                    entry.entry_type,
                    entry_type::BRIDGE,
                ),
            });
        } else if issuer_is_bus_owner && role != entry_type::ENDPOINTS {
            rt.push(RoutingEntry {
                eid: entry.starting_eid,
                phys_addr: entry_bdf,
                entry_type: entry.entry_type,
            });
        } else if !issuer_is_bus_owner
            && is_active_entry_behind_bridge(entry, rt)
        {
            rt.insert(
                *insert_index,
                RoutingEntry {
                    eid: entry.starting_eid,
                    phys_addr: issuer_phys_addr,
                    entry_type: entry.entry_type,
                },
            );
            *insert_index += 1;
        }
    }
}

/// Walk termination: no further handle, or the response counter saturated.
pub fn is_end_of_walk(entry_handle: u8, response_count: u8) -> bool {
    entry_handle == 0xff || response_count == 0xff
}

/// The registration mode a routing entry publishes with.
pub fn entry_mode(entry: &RoutingEntry, bus_owner_bdf: u16) -> EndpointMode {
    if entry.phys_addr == bus_owner_bdf {
        EndpointMode::BusOwner
    } else if is_entry_bridge(entry) {
        EndpointMode::Bridge
    } else {
        EndpointMode::Endpoint
    }
}

/// Changes between two routing tables.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TableDiff {
    /// Entries of the old table absent from the new one.
    pub removed: Vec<RoutingEntry>,
    /// Entries of the new table absent from the old one.
    pub added: Vec<RoutingEntry>,
}

/// Computes membership-based changes between two tables.
///
/// Entries compare as whole `(eid, phys_addr, entry_type)` tuples.
pub fn table_diff(old: &[RoutingEntry], new: &[RoutingEntry]) -> TableDiff {
    TableDiff {
        removed: old
            .iter()
            .filter(|e| !new.contains(e))
            .copied()
            .collect(),
        added: new.iter().filter(|e| !old.contains(e)).copied().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mctp_ctrl::MCTP_BINDING_SMBUS;

    fn wire(
        eid: u8,
        bdf: u16,
        role: u8,
        range: u8,
        binding: u8,
    ) -> WireRoutingEntry {
        WireRoutingEntry {
            eid_range_size: range,
            starting_eid: eid,
            entry_type: entry_type::with_role(0, role),
            phys_transport_binding_id: binding,
            phys_media_type_id: 0x0b,
            phys_address: if binding == MCTP_BINDING_PCIE {
                bdf.to_be_bytes().to_vec()
            } else {
                vec![bdf as u8]
            },
        }
    }

    fn entry(eid: u8, bdf: u16, role: u8) -> RoutingEntry {
        RoutingEntry {
            eid,
            phys_addr: bdf,
            entry_type: entry_type::with_role(0, role),
        }
    }

    #[test]
    fn bus_owner_merge_rules() {
        let mut rt = Vec::new();
        let mut idx = 0;
        merge_response(
            &mut rt,
            &mut idx,
            true,
            0xbeef,
            &[
                wire(0x10, 0xa1b2, entry_type::ENDPOINT, 1, MCTP_BINDING_PCIE),
                // Rewritten to a plain bridge role
                wire(
                    0x20,
                    0xb000,
                    entry_type::BRIDGE_AND_ENDPOINTS,
                    4,
                    MCTP_BINDING_PCIE,
                ),
                // Range entries from the bus owner are dropped
                wire(0x21, 0xb001, entry_type::ENDPOINTS, 3, MCTP_BINDING_PCIE),
                // Foreign transport is skipped entirely
                wire(0x30, 0x32, entry_type::ENDPOINT, 1, MCTP_BINDING_SMBUS),
            ],
        );

        assert_eq!(
            rt,
            vec![
                entry(0x10, 0xa1b2, entry_type::ENDPOINT),
                entry(0x20, 0xb000, entry_type::BRIDGE),
            ]
        );
    }

    #[test]
    fn bridge_entries_insert_after_bridge() {
        // Table from the bus owner: endpoint, bridge, endpoint
        let mut rt = vec![
            entry(0x10, 0xa1b2, entry_type::ENDPOINT),
            entry(0x20, 0xb000, entry_type::BRIDGE),
            entry(0x11, 0xa1b3, entry_type::ENDPOINT),
        ];
        // Bridge at index 1 reports two endpoints behind it
        let mut idx = 2;
        merge_response(
            &mut rt,
            &mut idx,
            false,
            0xb000,
            &[
                wire(0x21, 0xb001, entry_type::ENDPOINT, 1, MCTP_BINDING_PCIE),
                wire(0x22, 0xb002, entry_type::ENDPOINT, 1, MCTP_BINDING_PCIE),
                // Already known EID is not duplicated
                wire(0x10, 0xb003, entry_type::ENDPOINT, 1, MCTP_BINDING_PCIE),
                // Ranges behind a bridge are not expanded
                wire(0x40, 0xb004, entry_type::ENDPOINT, 2, MCTP_BINDING_PCIE),
            ],
        );

        // Inserted contiguously after the bridge, carrying the bridge BDF
        assert_eq!(
            rt,
            vec![
                entry(0x10, 0xa1b2, entry_type::ENDPOINT),
                entry(0x20, 0xb000, entry_type::BRIDGE),
                entry(0x21, 0xb000, entry_type::ENDPOINT),
                entry(0x22, 0xb000, entry_type::ENDPOINT),
                entry(0x11, 0xa1b3, entry_type::ENDPOINT),
            ]
        );
        assert_eq!(idx, 4);
    }

    #[test]
    fn bridge_bookkeeping() {
        let rt = vec![
            entry(0x10, 0xa1b2, entry_type::ENDPOINT),
            entry(0x20, 0xb000, entry_type::BRIDGE),
        ];
        let mut called = CalledBridges::new();
        assert!(!all_bridges_called(&rt, &called));
        called.push((0x20, 0xb000));
        assert!(all_bridges_called(&rt, &called));
    }

    #[test]
    fn walk_termination() {
        assert!(is_end_of_walk(0xff, 0));
        assert!(is_end_of_walk(0x10, 0xff));
        assert!(!is_end_of_walk(0x10, 0xfe));
    }

    #[test]
    fn modes() {
        assert_eq!(
            entry_mode(&entry(0x20, 0xbeef, entry_type::BRIDGE), 0xbeef),
            EndpointMode::BusOwner
        );
        assert_eq!(
            entry_mode(&entry(0x20, 0xb000, entry_type::BRIDGE), 0xbeef),
            EndpointMode::Bridge
        );
        assert_eq!(
            entry_mode(&entry(0x10, 0xa1b2, entry_type::ENDPOINT), 0xbeef),
            EndpointMode::Endpoint
        );
    }

    #[test]
    fn diff_membership() {
        let old = vec![
            entry(0x10, 0xa1b2, entry_type::ENDPOINT),
            entry(0x20, 0xb000, entry_type::BRIDGE),
        ];
        let new = vec![
            entry(0x20, 0xb000, entry_type::BRIDGE),
            entry(0x21, 0xb000, entry_type::ENDPOINT),
        ];
        let d = table_diff(&old, &new);
        assert_eq!(d.removed, vec![entry(0x10, 0xa1b2, entry_type::ENDPOINT)]);
        assert_eq!(d.added, vec![entry(0x21, 0xb000, entry_type::ENDPOINT)]);
    }

    #[test]
    fn diff_of_permutation_is_empty() {
        // Order-sensitive equality triggers a diff pass for permutations,
        // but membership-based diffing then emits no events.
        let old = vec![
            entry(0x10, 0xa1b2, entry_type::ENDPOINT),
            entry(0x20, 0xb000, entry_type::BRIDGE),
            entry(0x21, 0xb000, entry_type::ENDPOINT),
        ];
        let mut new = old.clone();
        new.rotate_left(1);
        assert_ne!(old, new);
        assert_eq!(table_diff(&old, &new), TableDiff::default());
    }

    // Tiny deterministic generator for the live-set property below.
    struct XorShift(u32);
    impl XorShift {
        fn next(&mut self) -> u32 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.0 = x;
            x
        }
    }

    #[test]
    fn live_set_follows_diffs() {
        // Applying removed/added events from successive diffs keeps the
        // live EID set equal to the current table's EID set.
        let mut rng = XorShift(0x2c1b_3c6d);
        let mut live: Vec<u8> = Vec::new();
        let mut table: Vec<RoutingEntry> = Vec::new();

        for _ in 0..100 {
            let mut next = Vec::new();
            for _ in 0..(rng.next() % 8) {
                let eid = 0x10 + (rng.next() % 8) as u8;
                if next.iter().any(|e: &RoutingEntry| e.eid == eid) {
                    continue;
                }
                let role = if rng.next() % 4 == 0 {
                    entry_type::BRIDGE
                } else {
                    entry_type::ENDPOINT
                };
                next.push(entry(eid, 0xa000 + eid as u16, role));
            }

            let d = table_diff(&table, &next);
            for e in &d.removed {
                live.retain(|eid| *eid != e.eid);
            }
            for e in &d.added {
                live.push(e.eid);
            }
            table = next;

            let mut want: Vec<u8> = table.iter().map(|e| e.eid).collect();
            want.sort_unstable();
            live.sort_unstable();
            assert_eq!(live, want);
        }
    }
}
