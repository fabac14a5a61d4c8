//! Candidate aggregation for JOIN and MOVE elections on the PAN.
//!
//! A joining or moving device is typically overheard by several coordinators
//! at once; each relays the request annotated with the signal strength it
//! measured. The PAN collects these into a candidate table and deliberately
//! does not answer until an election window has passed, so that late
//! candidates with a better link still get considered. The candidate with
//! the strongest RSSI becomes the device's parent.

use crate::link::addr::Edid;
use crate::time::TickWindow;

/// Candidate slots kept for concurrent JOIN elections.
pub const JOIN_CANDIDATES: usize = 5;

/// Candidate slots kept for concurrent MOVE elections.
pub const MOVE_CANDIDATES: usize = 7;

/// One relayed request: a prospective parent for a joining or moving device.
#[derive(Copy, Clone, Debug)]
pub struct Candidate {
    /// The joining or moving device.
    pub edid: Edid,
    /// The coordinator that overheard it (prospective parent).
    pub parent_cid: u8,
    /// Signal strength the prospective parent measured.
    pub rssi: u8,
    /// Device type byte from the request.
    pub device_type: u8,
    /// Election window opened on arrival of this candidate.
    pub window: TickWindow,
    /// Host asked to commit this device without waiting for the window.
    pub accepted: bool,
}

/// A bounded candidate table; one per election kind.
#[derive(Debug)]
pub struct CandidateTable {
    slots: [Option<Candidate>; MOVE_CANDIDATES],
    cap: usize,
}

impl CandidateTable {
    pub fn new(cap: usize) -> Self {
        assert!(cap <= MOVE_CANDIDATES);
        CandidateTable {
            slots: [None; MOVE_CANDIDATES],
            cap,
        }
    }

    /// Records a candidate. A full table drops the newcomer (the strongest
    /// of the stored candidates will still win).
    pub fn insert(&mut self, candidate: Candidate) -> bool {
        match self.slots[..self.cap].iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(candidate);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, edid: Edid) -> bool {
        self.iter().any(|c| c.edid == edid)
    }

    /// Flags every candidate of `edid` for immediate election. Returns
    /// whether any candidate matched.
    pub fn accept(&mut self, edid: Edid) -> bool {
        let mut found = false;
        for slot in self.slots[..self.cap].iter_mut() {
            if let Some(c) = slot {
                if c.edid == edid {
                    c.accepted = true;
                    found = true;
                }
            }
        }
        found
    }

    /// Returns the EDID of a device whose election is due at tick `now`,
    /// either because its window elapsed or the host accepted it.
    pub fn due(&self, now: u8) -> Option<Edid> {
        self.iter()
            .find(|c| c.accepted || c.window.has_elapsed(now))
            .map(|c| c.edid)
    }

    /// Elects the strongest-RSSI candidate for `edid` and invalidates every
    /// candidate entry for that device.
    pub fn elect(&mut self, edid: Edid) -> Option<Candidate> {
        let mut winner: Option<Candidate> = None;
        for slot in self.slots[..self.cap].iter_mut() {
            if slot.as_ref().map_or(false, |c| c.edid == edid) {
                let candidate = slot.take().unwrap();
                match &winner {
                    Some(best) if best.rssi >= candidate.rssi => {}
                    _ => winner = Some(candidate),
                }
            }
        }
        winner
    }

    /// Drops every candidate for `edid` without electing.
    pub fn invalidate(&mut self, edid: Edid) {
        for slot in self.slots[..self.cap].iter_mut() {
            if slot.as_ref().map_or(false, |c| c.edid == edid) {
                *slot = None;
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.slots[..self.cap].iter().filter_map(|s| s.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(edid: u32, parent: u8, rssi: u8, now: u8, window: u8) -> Candidate {
        Candidate {
            edid: Edid::from_u32(edid),
            parent_cid: parent,
            rssi,
            device_type: 0,
            window: TickWindow::after(now, window),
            accepted: false,
        }
    }

    #[test]
    fn strongest_rssi_wins() {
        let mut table = CandidateTable::new(JOIN_CANDIDATES);
        // parents A=1, B=2, C=3 with RSSI 10, 50, 30
        table.insert(candidate(0xee, 1, 10, 0, 30));
        table.insert(candidate(0xee, 2, 50, 1, 30));
        table.insert(candidate(0xee, 3, 30, 2, 30));

        assert!(table.due(10).is_none());
        assert_eq!(table.due(31), Some(Edid::from_u32(0xee)));

        let winner = table.elect(Edid::from_u32(0xee)).unwrap();
        assert_eq!(winner.parent_cid, 2);
        // the table no longer holds candidates for that device
        assert!(!table.contains(Edid::from_u32(0xee)));
        assert!(table.due(200).is_none());
    }

    #[test]
    fn capacity_bounds_candidates() {
        let mut table = CandidateTable::new(JOIN_CANDIDATES);
        for i in 0..JOIN_CANDIDATES {
            assert!(table.insert(candidate(1, i as u8, i as u8, 0, 10)));
        }
        assert!(!table.insert(candidate(1, 9, 99, 0, 10)));
    }

    #[test]
    fn accept_bypasses_window() {
        let mut table = CandidateTable::new(JOIN_CANDIDATES);
        table.insert(candidate(7, 1, 20, 0, 200));
        assert!(table.due(5).is_none());
        assert!(table.accept(Edid::from_u32(7)));
        assert_eq!(table.due(5), Some(Edid::from_u32(7)));
        assert!(!table.accept(Edid::from_u32(8)));
    }

    #[test]
    fn window_spans_counter_wrap() {
        let mut table = CandidateTable::new(MOVE_CANDIDATES);
        table.insert(candidate(3, 2, 40, 250, 30));
        // not due before the wrap, nor right after it
        assert!(table.due(255).is_none());
        assert!(table.due(10).is_none());
        // due once the wrapped expiry tick is reached
        assert_eq!(table.due(24), Some(Edid::from_u32(3)));
    }

    #[test]
    fn elections_are_per_device() {
        let mut table = CandidateTable::new(MOVE_CANDIDATES);
        table.insert(candidate(1, 2, 40, 0, 10));
        table.insert(candidate(2, 3, 55, 0, 10));
        let winner = table.elect(Edid::from_u32(1)).unwrap();
        assert_eq!(winner.parent_cid, 2);
        assert!(table.contains(Edid::from_u32(2)));
    }
}
