//! Network-layer framing.
//!
//! Every network frame carries a fixed 10-byte header (11 with the extension
//! byte) in front of the application or control payload:
//!
//! ```notrust
//! +---------------+----------------+-----------+-----------+-------+---------+
//! | type | dst hi | dst lo  | src  | dst EDID  | src EDID  | [ext] | payload |
//! | (4b) |  (4b)  |  (2b)   | (6b) | (4 bytes) | (4 bytes) | (1 B) |         |
//! +---------------+----------------+-----------+-----------+-------+---------+
//! ```
//!
//! The 6-bit destination CID is split across the first two bytes: its high 4
//! bits sit in the low nibble of byte 0, its low 2 bits in the top of byte 1.
//! The source CID occupies the low 6 bits of byte 1. Message types that do
//! not fit the 4-bit type field are sent as [`MsgType::Extended`] with the
//! real type in byte 10.

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::link::addr::Edid;
use crate::link::frame::MAX_LINK_PAYLOAD_SIZE;
use crate::Error;

/// Size of the network header without the extension byte.
pub const NET_HEADER_SIZE: usize = 10;

/// Maximum network payload: link payload minus the network header.
pub const MAX_NET_PAYLOAD_SIZE: usize = MAX_LINK_PAYLOAD_SIZE - NET_HEADER_SIZE;

/// Device type wire values used in JOIN requests and the host queue.
pub const DEVICE_TYPE_COORD: u8 = 0xcc;
pub const DEVICE_TYPE_SLEEPY_ED: u8 = 0xff;
pub const DEVICE_TYPE_READY_ED: u8 = 0x00;

/// Values of the 4-bit network message type field.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MsgType {
    /// Application data.
    Data = 0x0,

    /// Data request from a sleepy end device.
    DataDr = 0x1,

    /// Enrollment request (also carried out-of-band at the link layer).
    JoinRequest = 0x3,

    /// Mailbox data is pending for the requesting sleepy device.
    AckDrWait = 0x5,

    /// No mailbox data; the requesting sleepy device may sleep.
    AckDrSleep = 0x6,

    /// Enrollment response, sent directly to the joiner by its new parent.
    JoinResponse = 0x7,

    /// Eviction notice from the PAN.
    Unjoin = 0x8,

    /// Enrollment request relayed toward the PAN, annotated with RSSI.
    JoinRequestRoute = 0x9,

    /// Enrollment response routed to the elected parent for conversion.
    JoinResponseRoute = 0xc,

    /// A fragment of a routing table.
    RoutingData = 0xd,

    /// Real message type is in the extension byte.
    Extended = 0xf,
}

impl MsgType {
    pub fn from_nibble(nibble: u8) -> Result<Self, Error> {
        Ok(match nibble {
            0x0 => MsgType::Data,
            0x1 => MsgType::DataDr,
            0x3 => MsgType::JoinRequest,
            0x5 => MsgType::AckDrWait,
            0x6 => MsgType::AckDrSleep,
            0x7 => MsgType::JoinResponse,
            0x8 => MsgType::Unjoin,
            0x9 => MsgType::JoinRequestRoute,
            0xc => MsgType::JoinResponseRoute,
            0xd => MsgType::RoutingData,
            0xf => MsgType::Extended,
            _ => return Err(Error::InvalidValue),
        })
    }
}

/// Message types carried in the extension byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExtType {
    /// The PAN announces pair mode, with the timeout in the first payload
    /// byte.
    PairModeEnabled = 0x10,

    /// A device lost its parent and solicits new ones (broadcast).
    MoveRequest = 0x30,

    /// The PAN's (possibly relayed) answer carrying the new parent in the
    /// destination CID field.
    MoveResponse = 0x40,

    /// A neighbour's relay of a MoveRequest toward the PAN, annotated with
    /// RSSI.
    MoveRequestRoute = 0x50,

    /// MoveResponse routed to the elected parent for conversion.
    MoveResponseRoute = 0x60,
}

impl ExtType {
    pub fn from_raw(raw: u8) -> Result<Self, Error> {
        Ok(match raw {
            0x10 => ExtType::PairModeEnabled,
            0x30 => ExtType::MoveRequest,
            0x40 => ExtType::MoveResponse,
            0x50 => ExtType::MoveRequestRoute,
            0x60 => ExtType::MoveResponseRoute,
            _ => return Err(Error::InvalidValue),
        })
    }
}

/// Payload tag bytes carried by the MOVE message family.
pub const MOVE_REQUEST_TAG: u8 = 0x00;
pub const MOVE_RESPONSE_TAG: u8 = 0x01;
pub const MOVE_RESPONSE_ROUTE_TAG: u8 = 0x02;

/// A decoded network-frame header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NetHeader {
    pub msg_type: MsgType,
    pub dst_cid: u8,
    pub src_cid: u8,
    pub dst_edid: Edid,
    pub src_edid: Edid,
    /// Present exactly when `msg_type` is [`MsgType::Extended`].
    pub ext: Option<ExtType>,
}

impl NetHeader {
    pub fn new(msg_type: MsgType, dst_cid: u8, src_cid: u8, dst_edid: Edid, src_edid: Edid) -> Self {
        NetHeader {
            msg_type,
            dst_cid,
            src_cid,
            dst_edid,
            src_edid,
            ext: None,
        }
    }

    pub fn extended(dst_cid: u8, src_cid: u8, dst_edid: Edid, src_edid: Edid, ext: ExtType) -> Self {
        NetHeader {
            msg_type: MsgType::Extended,
            dst_cid,
            src_cid,
            dst_edid,
            src_edid,
            ext: Some(ext),
        }
    }

    /// Size of this header on the wire.
    pub fn wire_size(&self) -> usize {
        NET_HEADER_SIZE + usize::from(self.ext.is_some())
    }

    /// The effective message type, resolving the extension byte.
    pub fn resolved(&self) -> ResolvedType {
        match self.ext {
            Some(ext) => ResolvedType::Ext(ext),
            None => ResolvedType::Plain(self.msg_type),
        }
    }
}

/// A network message type with the extension byte folded in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResolvedType {
    Plain(MsgType),
    Ext(ExtType),
}

impl<'a> FromBytes<'a> for NetHeader {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        if bytes.bytes_left() < NET_HEADER_SIZE {
            return Err(Error::InvalidLength);
        }
        let b0 = bytes.read_u8()?;
        let b1 = bytes.read_u8()?;
        let msg_type = MsgType::from_nibble(b0 >> 4)?;
        let dst_cid = ((b0 << 2) & 0x3c) | ((b1 >> 6) & 0x03);
        let src_cid = b1 & 0x3f;
        let dst_edid = Edid::from_bytes(bytes)?;
        let src_edid = Edid::from_bytes(bytes)?;
        let ext = if msg_type == MsgType::Extended {
            Some(ExtType::from_raw(bytes.read_u8()?)?)
        } else {
            None
        };
        Ok(NetHeader {
            msg_type,
            dst_cid,
            src_cid,
            dst_edid,
            src_edid,
            ext,
        })
    }
}

impl ToBytes for NetHeader {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8((self.msg_type as u8) << 4 | ((self.dst_cid >> 2) & 0x0f))?;
        writer.write_u8(((self.dst_cid << 6) & 0xc0) | (self.src_cid & 0x3f))?;
        self.dst_edid.to_bytes(writer)?;
        self.src_edid.to_bytes(writer)?;
        if let Some(ext) = self.ext {
            writer.write_u8(ext as u8)?;
        }
        Ok(())
    }
}

/// Peeks whether a raw network frame is an extended MoveResponse.
///
/// Devices in the moving state drop everything else, so this check runs
/// before full header parsing.
pub fn is_move_response(raw: &[u8]) -> bool {
    raw.len() > NET_HEADER_SIZE
        && raw[0] >> 4 == MsgType::Extended as u8
        && raw[NET_HEADER_SIZE] == ExtType::MoveResponse as u8
}

/// Peeks whether a raw network frame carries routing data.
///
/// Routing fragments bypass the link layer's neighbour check, since a
/// coordinator's tree is not populated until the first fragment set arrives.
pub fn is_routing_data(raw: &[u8]) -> bool {
    !raw.is_empty() && raw[0] >> 4 == MsgType::RoutingData as u8
}
