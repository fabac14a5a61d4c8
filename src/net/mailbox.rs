//! Deferred delivery for sleepy end devices.
//!
//! A sleepy end device never receives unsolicited traffic. Frames addressed
//! to one are parked here on the PAN and handed out when the device asks for
//! them with a data request. At most one entry exists per EDID; a newer send
//! replaces the older payload.

use crate::link::addr::Edid;
use crate::net::frame::MAX_NET_PAYLOAD_SIZE;
use heapless::{consts::*, Vec};

/// Capacity of the mailbox.
pub const MAILBOX_SIZE: usize = 10;

/// A parked payload for one sleepy device.
pub type MailboxPayload = Vec<u8, U43>;

#[derive(Clone, Debug)]
struct Entry {
    edid: Edid,
    payload: MailboxPayload,
}

/// The PAN-side mailbox.
#[derive(Debug, Default)]
pub struct SleepyMailbox {
    entries: std::vec::Vec<Entry>,
}

impl SleepyMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks `payload` for `edid`, replacing any previous entry for the same
    /// device. Returns `false` when the mailbox is full of other devices'
    /// entries or the payload exceeds the network MTU.
    pub fn push(&mut self, edid: Edid, payload: &[u8]) -> bool {
        if payload.len() > MAX_NET_PAYLOAD_SIZE {
            return false;
        }
        let mut stored = MailboxPayload::new();
        stored.extend_from_slice(payload).unwrap();

        if let Some(entry) = self.entries.iter_mut().find(|e| e.edid == edid) {
            entry.payload = stored;
            return true;
        }
        if self.entries.len() >= MAILBOX_SIZE {
            return false;
        }
        self.entries.push(Entry { edid, payload: stored });
        true
    }

    /// Removes and returns the entry for `edid`, if any.
    pub fn take(&mut self, edid: Edid) -> Option<MailboxPayload> {
        let index = self.entries.iter().position(|e| e.edid == edid)?;
        Some(self.entries.remove(index).payload)
    }

    /// Whether an entry is pending for `edid`.
    pub fn contains(&self, edid: Edid) -> bool {
        self.entries.iter().any(|e| e.edid == edid)
    }

    /// Drops the entry for `edid` (device unpaired).
    pub fn invalidate(&mut self, edid: Edid) {
        self.entries.retain(|e| e.edid != edid);
    }
}
