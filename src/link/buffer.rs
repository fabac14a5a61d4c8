//! Per-peer transmit and receive slots backing the four-way handshake.
//!
//! A coordinator keeps up to 4 slots in each direction; an end device keeps
//! one. A TX slot owns an in-flight payload until the peer confirms the
//! handshake (or retries are exhausted), a RX slot parks a received payload
//! between DATA and COMMIT.

use crate::link::addr::Addr;
use crate::link::frame::{TransferType, MAX_LINK_PAYLOAD_SIZE};
use heapless::{consts::*, Vec};

/// Number of handshake slots on a coordinator, per direction.
pub const COORD_SLOT_COUNT: usize = 4;

/// Number of handshake slots on an end device, per direction.
pub const ED_SLOT_COUNT: usize = 1;

/// A link payload: the network frame carried by a single link frame.
pub type LinkPayload = Vec<u8, U53>;

/// Copies `bytes` into an owned [`LinkPayload`], truncating at the link MTU.
pub fn payload_from(bytes: &[u8]) -> LinkPayload {
    let take = bytes.len().min(MAX_LINK_PAYLOAD_SIZE);
    let mut payload = LinkPayload::new();
    payload.extend_from_slice(&bytes[..take]).unwrap();
    payload
}

/// Sender-side handshake state of one TX slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxState {
    /// DATA emitted, waiting for the peer's ACK.
    DataSent,

    /// ACK received and COMMIT emitted, waiting for COMMIT_ACK.
    CommitSent,
}

/// One in-flight outbound transfer.
#[derive(Clone, Debug)]
pub struct TxSlot {
    pub payload: LinkPayload,
    pub dest: Addr,
    pub state: TxState,
    pub transfer: TransferType,
    /// Tick at which the pending leg is retried (exact match against the
    /// link timer).
    pub expires_at: u8,
    /// Remaining retransmissions before the transfer is declared failed.
    pub retries_left: u8,
}

/// One parked inbound transfer, held between DATA and COMMIT.
#[derive(Clone, Debug)]
pub struct RxSlot {
    pub payload: LinkPayload,
    pub sender: Addr,
    pub transfer: TransferType,
    /// The transfer addressed this device as an end device.
    pub local: bool,
}

/// A fixed pool of slots with a role-dependent capacity.
///
/// The pool always reserves storage for the coordinator maximum; end devices
/// simply cap the usable count at one.
#[derive(Debug)]
pub struct SlotPool<T> {
    slots: [Option<T>; COORD_SLOT_COUNT],
    cap: usize,
}

impl<T> SlotPool<T> {
    pub fn new(cap: usize) -> Self {
        assert!(cap >= ED_SLOT_COUNT && cap <= COORD_SLOT_COUNT);
        SlotPool {
            slots: [None, None, None, None],
            cap,
        }
    }

    /// Stores `value` in a free slot, or returns it back when the pool is
    /// exhausted.
    pub fn insert(&mut self, value: T) -> Result<(), T> {
        match self.slots[..self.cap].iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(value);
                Ok(())
            }
            None => Err(value),
        }
    }

    pub fn is_full(&self) -> bool {
        self.slots[..self.cap].iter().all(|s| s.is_some())
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots[..self.cap].iter().filter_map(|s| s.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots[..self.cap].iter_mut().filter_map(|s| s.as_mut())
    }

    /// Finds the first occupied slot matching `pred`.
    pub fn find<F: Fn(&T) -> bool>(&mut self, pred: F) -> Option<&mut T> {
        self.iter_mut().find(|t| pred(t))
    }

    /// Removes and returns the first occupied slot matching `pred`.
    pub fn take<F: Fn(&T) -> bool>(&mut self, pred: F) -> Option<T> {
        for slot in self.slots[..self.cap].iter_mut() {
            if slot.as_ref().map_or(false, |t| pred(t)) {
                return slot.take();
            }
        }
        None
    }

    /// Removes every occupied slot matching `pred`, returning how many were
    /// dropped.
    pub fn purge<F: Fn(&T) -> bool>(&mut self, pred: F) -> usize {
        let mut dropped = 0;
        for slot in self.slots[..self.cap].iter_mut() {
            if slot.as_ref().map_or(false, |t| pred(t)) {
                *slot = None;
                dropped += 1;
            }
        }
        dropped
    }

    /// Applies `f` to every occupied slot, removing those for which `f`
    /// returns `false`.
    pub fn retain_mut<F: FnMut(&mut T) -> bool>(&mut self, mut f: F) {
        for slot in self.slots[..self.cap].iter_mut() {
            if let Some(value) = slot.as_mut() {
                if !f(value) {
                    *slot = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_capacity() {
        let mut pool: SlotPool<u8> = SlotPool::new(ED_SLOT_COUNT);
        pool.insert(1).unwrap();
        assert!(pool.is_full());
        assert_eq!(pool.insert(2), Err(2));
    }

    #[test]
    fn pool_take_and_purge() {
        let mut pool: SlotPool<u8> = SlotPool::new(COORD_SLOT_COUNT);
        for v in [10, 20, 21, 30].iter() {
            pool.insert(*v).unwrap();
        }
        assert_eq!(pool.take(|v| *v == 20), Some(20));
        assert!(!pool.is_full());
        assert_eq!(pool.purge(|v| *v > 15), 2);
        assert_eq!(pool.iter().copied().collect::<std::vec::Vec<_>>(), [10]);
    }

    #[test]
    fn payload_truncates_at_mtu() {
        let big = [0xab; 80];
        let p = payload_from(&big);
        assert_eq!(p.len(), MAX_LINK_PAYLOAD_SIZE);
    }
}
