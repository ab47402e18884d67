//! Host port allocation for published nginx ports.

use std::collections::HashSet;
use std::ops::Range;

use crate::record::ContainerRecord;

/// Hands out the lowest free port of a range.
///
/// A port is in use while any non-deleted record holds it. Callers serialize
/// `pick` with the insert of the record that takes the port.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: Range<u16>,
}

impl PortAllocator {
    pub fn new(range: Range<u16>) -> Self {
        Self { range }
    }

    pub fn pick(&self, records: &[ContainerRecord]) -> Option<u16> {
        let used: HashSet<u16> = records
            .iter()
            .filter(|r| !r.is_deleted())
            .map(|r| r.host_port)
            .collect();
        self.range.clone().find(|port| !used.contains(port))
    }
}
