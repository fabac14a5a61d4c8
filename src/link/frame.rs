//! Link-layer framing.
//!
//! Every link frame starts with a fixed 10-byte header followed by the
//! payload handed down from the network layer:
//!
//! ```notrust
//! +----------+-----------+----------------+----------------+-------------+
//! |   ctrl   |    NID    |      dst       |      src       |   payload   |
//! | (1 byte) | (4 bytes) | (1 or 4 bytes) | (4 or 1 bytes) |             |
//! +----------+-----------+----------------+----------------+-------------+
//! ```
//!
//! The `ctrl` byte packs four fields:
//!
//! ```notrust
//! MSB                                                   LSB
//! +---------------+---------+---------+-----------------+
//! |  packet type  |  to_ed  |  as_ed  |  transfer type  |
//! |   (2 bits)    | (1 bit) | (1 bit) |    (4 bits)     |
//! +---------------+---------+---------+-----------------+
//! ```
//!
//! When `to_ed` is set, `dst` is a 4-byte EDID and `src` a 1-byte CID. When
//! `as_ed` is set, `dst` is a 1-byte CID and `src` a 4-byte EDID. Between
//! coordinators both are 1-byte CIDs, and the remaining 3 header bytes are
//! padding. `to_ed` and `as_ed` must never be set together: end devices do
//! not talk to each other.

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::link::addr::{Addr, Edid, Nid};
use crate::Error;
use core::fmt;

/// Size of the link-layer header, in bytes.
pub const LINK_HEADER_SIZE: usize = 10;

/// Maximum link payload: PHY frame minus the link header.
pub const MAX_LINK_PAYLOAD_SIZE: usize = crate::phy::MAX_PHY_PAYLOAD_SIZE - LINK_HEADER_SIZE;

/// Values of the 2-bit packet type field in [`Ctrl`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketType {
    /// Payload-carrying frame, first leg of the handshake.
    Data = 0b00,

    /// Second leg: the sender confirms the receiver may act on the data.
    Commit = 0b01,

    /// Acknowledges a `Data` frame (or signals congestion, see
    /// [`TransferType::Busy`]).
    Ack = 0b10,

    /// Acknowledges a `Commit` frame and completes the handshake.
    CommitAck = 0b11,
}

/// Values of the 4-bit transfer type field in [`Ctrl`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferType {
    /// Reliable four-way handshake (DATA, ACK, COMMIT, COMMIT_ACK).
    Handshake = 0x0,

    /// Fire-and-forget unicast.
    NoAck = 0x1,

    /// Fire-and-forget to every listener in the fabric.
    Broadcast = 0x2,

    /// Enrollment request, exempt from the NID filter.
    JoinRequest = 0x3,

    /// Enrollment response carrying the fabric parameters.
    JoinResponse = 0x4,

    /// Immediate acknowledgement of a `JoinRequest` by a listening
    /// coordinator.
    JoinAck = 0x5,

    /// Congestion marker on an ACK: the receiver's buffers are full.
    Busy = 0x8,
}

impl TransferType {
    pub fn from_bits(bits: u8) -> Result<Self, Error> {
        Ok(match bits {
            0x0 => TransferType::Handshake,
            0x1 => TransferType::NoAck,
            0x2 => TransferType::Broadcast,
            0x3 => TransferType::JoinRequest,
            0x4 => TransferType::JoinResponse,
            0x5 => TransferType::JoinAck,
            0x8 => TransferType::Busy,
            _ => return Err(Error::InvalidValue),
        })
    }
}

/// The packed control byte at the start of every link frame.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Ctrl(u8);

impl Ctrl {
    pub fn new(packet_type: PacketType, to_ed: bool, as_ed: bool, transfer: TransferType) -> Self {
        Ctrl(
            (packet_type as u8) << 6
                | u8::from(to_ed) << 5
                | u8::from(as_ed) << 4
                | (transfer as u8 & 0x0f),
        )
    }

    pub fn from_raw(raw: u8) -> Self {
        Ctrl(raw)
    }

    pub fn raw(&self) -> u8 {
        self.0
    }

    pub fn packet_type(&self) -> PacketType {
        match self.0 >> 6 {
            0b00 => PacketType::Data,
            0b01 => PacketType::Commit,
            0b10 => PacketType::Ack,
            0b11 => PacketType::CommitAck,
            _ => unreachable!(),
        }
    }

    /// Destination is an end device.
    pub fn to_ed(&self) -> bool {
        self.0 & 0b0010_0000 != 0
    }

    /// Sender is an end device.
    pub fn as_ed(&self) -> bool {
        self.0 & 0b0001_0000 != 0
    }

    pub fn transfer_type(&self) -> Result<TransferType, Error> {
        TransferType::from_bits(self.0 & 0x0f)
    }
}

impl fmt::Debug for Ctrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctrl")
            .field("type", &self.packet_type())
            .field("to_ed", &self.to_ed())
            .field("as_ed", &self.as_ed())
            .field("transfer", &(self.0 & 0x0f))
            .finish()
    }
}

/// A decoded link-frame header.
#[derive(Copy, Clone, Debug)]
pub struct FrameHeader {
    pub packet_type: PacketType,
    pub transfer: TransferType,
    pub nid: Nid,
    pub dst: Addr,
    pub src: Addr,
}

impl FrameHeader {
    /// Builds a header. Fails when both sides are end devices.
    pub fn new(
        packet_type: PacketType,
        transfer: TransferType,
        nid: Nid,
        dst: Addr,
        src: Addr,
    ) -> Result<Self, Error> {
        if let (Addr::EndDevice(_), Addr::EndDevice(_)) = (&dst, &src) {
            return Err(Error::InvalidAddress);
        }
        Ok(FrameHeader {
            packet_type,
            transfer,
            nid,
            dst,
            src,
        })
    }

    pub fn ctrl(&self) -> Ctrl {
        let to_ed = matches!(self.dst, Addr::EndDevice(_));
        let as_ed = matches!(self.src, Addr::EndDevice(_));
        Ctrl::new(self.packet_type, to_ed, as_ed, self.transfer)
    }
}

impl<'a> FromBytes<'a> for FrameHeader {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        if bytes.bytes_left() < LINK_HEADER_SIZE {
            return Err(Error::InvalidLength);
        }
        let ctrl = Ctrl::from_raw(bytes.read_u8()?);
        let nid = Nid::from_bytes(bytes)?;
        let (dst, src);
        if ctrl.to_ed() {
            if ctrl.as_ed() {
                return Err(Error::InvalidAddress);
            }
            dst = Addr::EndDevice(Edid::from_bytes(bytes)?);
            src = Addr::Coord(bytes.read_u8()?);
        } else if ctrl.as_ed() {
            dst = Addr::Coord(bytes.read_u8()?);
            src = Addr::EndDevice(Edid::from_bytes(bytes)?);
        } else {
            dst = Addr::Coord(bytes.read_u8()?);
            src = Addr::Coord(bytes.read_u8()?);
            bytes.skip(3)?;
        }
        Ok(FrameHeader {
            packet_type: ctrl.packet_type(),
            transfer: ctrl.transfer_type()?,
            nid,
            dst,
            src,
        })
    }
}

impl ToBytes for FrameHeader {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.ctrl().raw())?;
        self.nid.to_bytes(writer)?;
        match (&self.dst, &self.src) {
            (Addr::EndDevice(edid), Addr::Coord(cid)) => {
                edid.to_bytes(writer)?;
                writer.write_u8(*cid)?;
            }
            (Addr::Coord(cid), Addr::EndDevice(edid)) => {
                writer.write_u8(*cid)?;
                edid.to_bytes(writer)?;
            }
            (Addr::Coord(dst), Addr::Coord(src)) => {
                writer.write_u8(*dst)?;
                writer.write_u8(*src)?;
                // header is always 10 bytes; pad the unused address bytes
                writer.write_slice(&[0; 3])?;
            }
            (Addr::EndDevice(_), Addr::EndDevice(_)) => return Err(Error::InvalidAddress),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(header: FrameHeader) -> FrameHeader {
        let mut buf = [0; LINK_HEADER_SIZE];
        header.to_bytes(&mut ByteWriter::new(&mut buf)).unwrap();
        FrameHeader::from_bytes(&mut ByteReader::new(&buf)).unwrap()
    }

    #[test]
    fn ctrl_bits() {
        let ctrl = Ctrl::new(PacketType::Ack, true, false, TransferType::JoinAck);
        assert_eq!(ctrl.raw(), 0b10_1_0_0101);
        assert_eq!(ctrl.packet_type(), PacketType::Ack);
        assert!(ctrl.to_ed());
        assert!(!ctrl.as_ed());
        assert_eq!(ctrl.transfer_type().unwrap(), TransferType::JoinAck);
    }

    #[test]
    fn busy_ack_ctrl() {
        let ctrl = Ctrl::new(PacketType::Ack, false, false, TransferType::Busy);
        assert_eq!(ctrl.raw() & 0x0f, 0x08);
        assert_eq!(ctrl.transfer_type().unwrap(), TransferType::Busy);
    }

    #[test]
    fn header_ed_to_coord() {
        let nid = Nid::new([0xa1, 0, 0, 0x03]);
        let edid = Edid::new([1, 2, 3, 4]);
        let header = FrameHeader::new(
            PacketType::Data,
            TransferType::Handshake,
            nid,
            Addr::Coord(0),
            Addr::EndDevice(edid),
        )
        .unwrap();

        let mut buf = [0xee; LINK_HEADER_SIZE];
        header.to_bytes(&mut ByteWriter::new(&mut buf)).unwrap();
        assert_eq!(buf, [0x10, 0xa1, 0, 0, 0x03, 0x00, 1, 2, 3, 4]);

        let parsed = roundtrip(header);
        assert_eq!(parsed.src, Addr::EndDevice(edid));
        assert_eq!(parsed.dst, Addr::Coord(0));
    }

    #[test]
    fn header_coord_to_ed() {
        let header = FrameHeader::new(
            PacketType::Commit,
            TransferType::Handshake,
            Nid::new([9, 9, 9, 9]),
            Addr::EndDevice(Edid::new([0xaa, 0xbb, 0xcc, 0xdd])),
            Addr::Coord(5),
        )
        .unwrap();
        let parsed = roundtrip(header);
        assert_eq!(parsed.packet_type, PacketType::Commit);
        assert_eq!(parsed.dst, Addr::EndDevice(Edid::new([0xaa, 0xbb, 0xcc, 0xdd])));
        assert_eq!(parsed.src, Addr::Coord(5));
    }

    #[test]
    fn header_coord_to_coord_pads() {
        let header = FrameHeader::new(
            PacketType::Data,
            TransferType::NoAck,
            Nid::new([1, 1, 1, 1]),
            Addr::Coord(7),
            Addr::Coord(5),
        )
        .unwrap();
        let mut buf = [0xee; LINK_HEADER_SIZE];
        header.to_bytes(&mut ByteWriter::new(&mut buf)).unwrap();
        // padding must be written so stale buffer contents never leak
        assert_eq!(&buf[5..], &[7, 5, 0, 0, 0]);
    }

    #[test]
    fn ed_to_ed_rejected() {
        let err = FrameHeader::new(
            PacketType::Data,
            TransferType::Handshake,
            Nid::UNSET,
            Addr::EndDevice(Edid::ZERO),
            Addr::EndDevice(Edid::ZERO),
        )
        .unwrap_err();
        assert_eq!(err, Error::InvalidAddress);
    }

    #[test]
    fn short_header_rejected() {
        let err = FrameHeader::from_bytes(&mut ByteReader::new(&[0; 9])).unwrap_err();
        assert_eq!(err, Error::InvalidLength);
    }
}
