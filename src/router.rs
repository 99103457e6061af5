//! Routing engine.
//!
//! The routing table maps a frame id to the set of interfaces a frame is
//! forwarded to. It is built once at startup and never changes while the
//! gateway runs. Lookup is a linear scan; the first entry matching the
//! frame id wins.

use log::{debug, warn};
use thiserror::Error;

use crate::device::{DeviceEntry, DeviceId, MAX_DEVICES};
use crate::frame::Frame;
use crate::stack::Stats;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Routing entry {can_id:#x} references interface {interface} outside the device pool.")]
    BadInterface { can_id: u32, interface: DeviceId },
}

/// One routing rule: frames with `can_id` go to every listed interface,
/// in list order.
#[derive(Debug, Clone)]
pub struct RoutingEntry {
    can_id: u32,
    interfaces: Vec<DeviceId>,
}

impl RoutingEntry {
    pub fn new(can_id: u32, interfaces: &[DeviceId]) -> RoutingEntry {
        RoutingEntry {
            can_id,
            interfaces: interfaces.to_vec(),
        }
    }

    pub fn can_id(&self) -> u32 {
        self.can_id
    }

    pub fn interfaces(&self) -> &[DeviceId] {
        &self.interfaces
    }
}

/// Ordered, immutable routing table.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    entries: Vec<RoutingEntry>,
}

impl RoutingTable {
    /// Validate and freeze a table.
    ///
    /// Every referenced interface must fit the device pool. A repeated
    /// `can_id` is legal but only the first entry will ever match, so it
    /// is logged as a likely configuration mistake.
    pub fn new(entries: Vec<RoutingEntry>) -> Result<RoutingTable, RouteError> {
        for entry in &entries {
            for &interface in entry.interfaces() {
                if interface as usize >= MAX_DEVICES {
                    return Err(RouteError::BadInterface {
                        can_id: entry.can_id,
                        interface,
                    });
                }
            }
        }

        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.can_id == entry.can_id) {
                warn!(
                    "routing table repeats id {:#x}; only the first entry matches",
                    entry.can_id
                );
            }
        }

        Ok(RoutingTable { entries })
    }

    /// Empty table: every frame is unrouted.
    pub fn empty() -> RoutingTable {
        RoutingTable {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry matching `id`, if any.
    pub fn lookup(&self, id: u32) -> Option<&RoutingEntry> {
        self.entries.iter().find(|entry| entry.can_id == id)
    }
}

/// Fan an accepted frame out to its destinations.
///
/// Each reachable destination gets a shallow copy on its egress queue. A
/// destination that is unregistered or reports its link down is skipped;
/// a full egress queue drops that copy. Either way the remaining
/// destinations still get theirs. The ingress frame itself is consumed
/// here.
pub(crate) fn dispatch(
    table: &RoutingTable,
    devices: &mut [Option<DeviceEntry>],
    stats: &mut Stats,
    frame: Frame,
) {
    let entry = match table.lookup(frame.id()) {
        Some(entry) => entry,
        None => {
            stats.unrouted += 1;
            debug!("no route for frame {:X}", frame);
            return;
        }
    };

    for &dest in entry.interfaces() {
        let dev = match devices.get_mut(dest as usize).and_then(|d| d.as_mut()) {
            Some(dev) => dev,
            None => {
                stats.dest_down += 1;
                debug!("route {:#x}: no device at id {}", frame.id(), dest);
                continue;
            }
        };

        if !dev.driver.link_state() {
            stats.dest_down += 1;
            debug!("route {:#x}: link down on {}", frame.id(), dev.name);
            continue;
        }

        if dev.q_out.enqueue(frame.clone()).is_err() {
            stats.egress_overrun += 1;
            warn!(
                "dev {} ({}): egress overrun, frame {:#x} dropped",
                dest, dev.name, frame.id()
            );
        }
    }
}
