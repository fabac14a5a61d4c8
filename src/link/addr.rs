//! Fabric addressing: network, coordinator and end-device identifiers.

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::Error;
use byteorder::{BigEndian, ByteOrder};
use core::fmt;

/// CID of the PAN coordinator, the root of the tree.
pub const CID_PAN: u8 = 0x00;

/// Broadcast CID, addressing every coordinator in the fabric.
pub const CID_BROADCAST: u8 = 0x3f;

/// Marker for an unoccupied or unknown CID.
pub const CID_INVALID: u8 = 0xff;

/// Number of addressable coordinators (6-bit CID space).
pub const MAX_COORDINATORS: usize = 64;

/// Extracts the 6-bit coordinator identifier from a raw address byte.
///
/// The upper two bits of CID-carrying bytes are reused by the network header
/// and must be ignored at the link layer.
pub fn cid_mask(raw: u8) -> u8 {
    raw & 0x3f
}

/// A 4-byte globally unique device identifier.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Edid([u8; 4]);

impl Edid {
    /// The broadcast address, matching every end device.
    pub const BROADCAST: Edid = Edid([0xff; 4]);

    /// The all-zero address used when a frame targets a coordinator directly.
    pub const ZERO: Edid = Edid([0; 4]);

    pub fn new(raw: [u8; 4]) -> Self {
        Edid(raw)
    }

    pub fn from_u32(value: u32) -> Self {
        let mut raw = [0; 4];
        BigEndian::write_u32(&mut raw, value);
        Edid(raw)
    }

    pub fn raw(&self) -> &[u8; 4] {
        &self.0
    }

    /// Returns the identifier as an integer, for host-facing tables.
    pub fn to_u64(&self) -> u64 {
        u64::from(BigEndian::read_u32(&self.0))
    }

    /// Whether this is the all-zero placeholder address.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 4]
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 4]
    }
}

impl fmt::Debug for Edid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl<'a> FromBytes<'a> for Edid {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(Edid(bytes.read_array()?))
    }
}

impl ToBytes for Edid {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.0)
    }
}

/// A 4-byte fabric (network) identifier.
///
/// Every non-join frame carries the NID and is filtered against it on
/// receive. An all-zero NID means "not enrolled".
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct Nid([u8; 4]);

impl Nid {
    pub const UNSET: Nid = Nid([0; 4]);

    pub fn new(raw: [u8; 4]) -> Self {
        Nid(raw)
    }

    /// Builds a NID from an integer, least significant byte first, matching
    /// the byte order the host configuration uses.
    pub fn from_u32_le(value: u32) -> Self {
        Nid(value.to_le_bytes())
    }

    pub fn raw(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn is_unset(&self) -> bool {
        self.0 == [0; 4]
    }
}

impl fmt::Debug for Nid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nid:{:02x}{:02x}{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl<'a> FromBytes<'a> for Nid {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(Nid(bytes.read_array()?))
    }
}

impl ToBytes for Nid {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.0)
    }
}

/// A link-layer peer address: either a coordinator or an end device.
///
/// Frames between coordinators carry 1-byte CIDs on both sides; frames from
/// or to an end device carry its 4-byte EDID on that side. End devices never
/// address each other.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Addr {
    Coord(u8),
    EndDevice(Edid),
}

impl Addr {
    /// Whether `self` and `other` name the same peer.
    ///
    /// Coordinator comparisons mask to the 6-bit CID, since raw address bytes
    /// may carry network-layer bits on top.
    pub fn same_peer(&self, other: &Addr) -> bool {
        match (self, other) {
            (Addr::Coord(a), Addr::Coord(b)) => cid_mask(*a) == cid_mask(*b),
            (Addr::EndDevice(a), Addr::EndDevice(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edid_conversions() {
        let edid = Edid::new([0x01, 0x02, 0x03, 0x04]);
        assert_eq!(edid.to_u64(), 0x0102_0304);
        assert_eq!(Edid::from_u32(0x0102_0304), edid);
        assert!(!edid.is_zero());
        assert!(Edid::ZERO.is_zero());
        assert!(Edid::BROADCAST.is_broadcast());
    }

    #[test]
    fn nid_byte_order() {
        // the host-facing setter takes the least significant byte first
        let nid = Nid::from_u32_le(0x0300_00a1);
        assert_eq!(nid.raw(), &[0xa1, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn addr_matching() {
        let c = Addr::Coord(0x05);
        // upper bits beyond the 6-bit CID are ignored
        assert!(c.same_peer(&Addr::Coord(0xc5)));
        assert!(!c.same_peer(&Addr::Coord(0x06)));
        assert!(!c.same_peer(&Addr::EndDevice(Edid::ZERO)));
    }
}
