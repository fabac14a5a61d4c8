//! Link layer.
//!
//! The link layer turns the radio's unreliable frame service into a reliable
//! hop-by-hop transfer: it owns the per-peer TX/RX slots, drives the
//! four-way handshake (DATA, ACK, COMMIT, COMMIT_ACK), retries expired legs
//! on the 50 ms timer, answers congestion with BUSY, and filters inbound
//! frames by fabric, address and tree neighbourhood before anything reaches
//! the network layer.
//!
//! Enrollment frames are special: a joining device does not know the fabric
//! NID yet, so the JOIN family bypasses the NID filter and is handled here,
//! including the channel-sweeping join request and the ACK_JOIN bookkeeping
//! that later validates the join response's origin.
//!
//! The layer is a plain state machine: frames enter through
//! [`LinkLayer::process_frame`], time enters through [`LinkLayer::on_tick`],
//! and everything the network layer must react to comes back as
//! [`LinkEvent`]s.

pub mod addr;
pub mod buffer;
pub mod frame;

use self::addr::{cid_mask, Addr, Edid, CID_BROADCAST, CID_INVALID, MAX_COORDINATORS};
use self::buffer::{payload_from, LinkPayload, RxSlot, SlotPool, TxSlot, TxState};
use self::buffer::{COORD_SLOT_COUNT, ED_SLOT_COUNT};
use self::frame::{FrameHeader, PacketType, TransferType, LINK_HEADER_SIZE};
use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::config::{DeviceKind, Identity, LinkConfig};
use crate::net::routing::RoutingTree;
use crate::phy::{Radio, MAX_PHY_PAYLOAD_SIZE};
use crate::time::TickCounter;
use crate::Error;
use log::{debug, trace, warn};

/// Highest channel index swept during enrollment.
pub const MAX_CHANNEL: u8 = 31;

/// Ticks until an unanswered handshake leg is retried.
const RETRY_TICKS: u8 = 2;

/// Ticks granted to a peer that answered BUSY.
const BUSY_BACKOFF_TICKS: u8 = 3;

/// What the network layer must react to after a frame or tick was processed.
#[derive(Debug)]
pub enum LinkEvent {
    /// A payload finished its inbound leg and is ready for the network
    /// layer. `local` is set when the frame addressed this device as an end
    /// device (or was a broadcast), clear when it arrived on the
    /// coordinator-to-coordinator routing path.
    Deliver {
        payload: LinkPayload,
        transfer: TransferType,
        local: bool,
    },

    /// A handshake this device initiated completed.
    SendDone,

    /// A handshake exhausted its retries; the peer is considered lost. All
    /// other slots toward the same peer have been purged.
    TxFailed { dest: Addr, payload: LinkPayload },

    /// A join request was overheard while pair mode is active (the ACK_JOIN
    /// was already answered). Carries the join payload for relaying.
    JoinRequest {
        edid: Edid,
        rssi: u8,
        payload: LinkPayload,
    },

    /// A join response addressed to this joining device arrived from a
    /// coordinator we previously heard an ACK_JOIN from.
    JoinResponse { payload: LinkPayload },
}

/// Network-layer state the link layer consults while filtering frames.
pub struct NetFilter<'a> {
    /// Pair mode: join requests are answered only while set.
    pub pair_mode: bool,
    /// This device is waiting for the outcome of its own join.
    pub waiting_join_response: bool,
    /// Four-way handshakes are refused while routing is disabled.
    pub routing_enabled: bool,
    /// The replicated routing tree, for the neighbourhood check.
    pub tree: &'a RoutingTree,
}

/// The link-layer state machine.
pub struct LinkLayer {
    tx_max_retries: u8,
    timer: TickCounter,
    tx: SlotPool<TxSlot>,
    rx: SlotPool<RxSlot>,
    /// CIDs that answered our join request with ACK_JOIN, indexed by CID.
    /// Only a coordinator recorded here may deliver the join response.
    ack_join: [u8; MAX_COORDINATORS],
    ack_join_received: bool,
}

impl LinkLayer {
    pub fn new(kind: DeviceKind, config: &LinkConfig) -> Self {
        let slots = match kind {
            DeviceKind::EndDevice => ED_SLOT_COUNT,
            DeviceKind::Pan | DeviceKind::Coordinator => COORD_SLOT_COUNT,
        };
        LinkLayer {
            tx_max_retries: config.tx_max_retries,
            timer: TickCounter::new(),
            tx: SlotPool::new(slots),
            rx: SlotPool::new(slots),
            ack_join: [CID_INVALID; MAX_COORDINATORS],
            ack_join_received: false,
        }
    }

    /// The current link tick.
    pub fn now(&self) -> u8 {
        self.timer.now()
    }

    /// Sends `payload` to `dest` using the given transfer type.
    ///
    /// Handshake transfers occupy a TX slot until completion or failure;
    /// `NoAck` and `Broadcast` leave no state behind.
    pub fn send<R: Radio>(
        &mut self,
        radio: &mut R,
        ident: &Identity,
        dest: Addr,
        payload: &[u8],
        transfer: TransferType,
    ) -> Result<(), Error> {
        match transfer {
            TransferType::Handshake => {
                let slot = TxSlot {
                    payload: payload_from(payload),
                    dest,
                    state: TxState::DataSent,
                    transfer,
                    expires_at: self.timer.deadline(RETRY_TICKS),
                    retries_left: self.tx_max_retries,
                };
                self.tx.insert(slot).map_err(|_| Error::BufferFull)?;
                self.emit_data(radio, ident, dest, payload, transfer);
                Ok(())
            }
            TransferType::NoAck => {
                self.emit_data(radio, ident, dest, payload, transfer);
                Ok(())
            }
            TransferType::Broadcast => {
                self.send_broadcast(radio, ident, payload);
                Ok(())
            }
            _ => Err(Error::InvalidValue),
        }
    }

    /// Broadcasts `payload` to every listener. Broadcasts are always sent
    /// with the 4-byte EDID as source so that any device class can originate
    /// them.
    pub fn send_broadcast<R: Radio>(&mut self, radio: &mut R, ident: &Identity, payload: &[u8]) {
        let header = FrameHeader {
            packet_type: PacketType::Data,
            transfer: TransferType::Broadcast,
            nid: ident.nid,
            dst: Addr::Coord(CID_BROADCAST),
            src: Addr::EndDevice(ident.edid),
        };
        self.emit(radio, &header, payload);
    }

    /// Emits one join request frame on the current channel.
    ///
    /// The desired parent CID rides in the destination field; the joiner
    /// identifies itself by EDID since it holds no CID yet.
    pub fn send_join_request<R: Radio>(&mut self, radio: &mut R, ident: &Identity, payload: &[u8]) {
        let header = FrameHeader {
            packet_type: PacketType::Data,
            transfer: TransferType::JoinRequest,
            nid: ident.nid,
            dst: Addr::Coord(ident.parent_cid),
            src: Addr::EndDevice(ident.edid),
        };
        self.emit(radio, &header, payload);
    }

    /// Sends a join response directly to the joining device.
    pub fn send_join_response<R: Radio>(
        &mut self,
        radio: &mut R,
        ident: &Identity,
        edid: Edid,
        payload: &[u8],
    ) {
        let header = FrameHeader {
            packet_type: PacketType::Data,
            transfer: TransferType::JoinResponse,
            nid: ident.nid,
            dst: Addr::EndDevice(edid),
            src: Addr::Coord(ident.cid),
        };
        self.emit(radio, &header, payload);
    }

    /// Resets the ACK_JOIN bookkeeping ahead of a join attempt.
    pub fn begin_join(&mut self) {
        self.ack_join = [CID_INVALID; MAX_COORDINATORS];
        self.ack_join_received = false;
    }

    /// Whether at least one coordinator acknowledged our join request.
    pub fn ack_join_seen(&self) -> bool {
        self.ack_join_received
    }

    /// Processes one frame delivered by the radio.
    pub fn process_frame<R: Radio>(
        &mut self,
        radio: &mut R,
        ident: &Identity,
        filter: &NetFilter<'_>,
        raw: &[u8],
    ) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        if raw.len() < LINK_HEADER_SIZE {
            return events;
        }
        let header = match FrameHeader::from_bytes(&mut ByteReader::new(raw)) {
            Ok(header) => header,
            Err(_) => return events,
        };
        let payload = &raw[LINK_HEADER_SIZE..];
        trace!("link rx: {:?} ({} payload bytes)", header, payload.len());

        // the JOIN family is processed ahead of the NID filter: a joining
        // device has no NID yet
        match (header.packet_type, header.transfer) {
            (PacketType::Data, TransferType::JoinRequest) => {
                self.on_join_request(radio, ident, filter, &header, payload, &mut events);
                return events;
            }
            (PacketType::Ack, TransferType::JoinAck) => {
                self.on_join_ack(filter, &header);
                return events;
            }
            (PacketType::Data, TransferType::JoinResponse) => {
                self.on_join_response(filter, &header, payload, &mut events);
                return events;
            }
            _ => {}
        }

        if header.nid != ident.nid {
            trace!("link rx: foreign fabric, dropped");
            return events;
        }

        if header.transfer == TransferType::Broadcast {
            events.push(LinkEvent::Deliver {
                payload: payload_from(payload),
                transfer: TransferType::Broadcast,
                local: true,
            });
            return events;
        }

        match header.dst {
            Addr::EndDevice(edid) => {
                self.process_local_frame(radio, ident, &header, edid, payload, &mut events)
            }
            Addr::Coord(dst_cid) => {
                self.process_coord_frame(radio, ident, filter, &header, dst_cid, payload, &mut events)
            }
        }
        events
    }

    /// Advances the link timer and walks the TX slots: expired legs are
    /// retransmitted, exhausted ones reported as failures.
    pub fn on_tick<R: Radio>(&mut self, radio: &mut R, ident: &Identity) -> Vec<LinkEvent> {
        self.timer.advance();
        let now = self.timer.now();
        let mut events = Vec::new();

        loop {
            // handle at most one expired slot per pass; failure handling
            // purges an unknown set of other slots
            let expired = self.tx.take(|slot| slot.expires_at == now);
            let mut slot = match expired {
                Some(slot) => slot,
                None => break,
            };
            if slot.retries_left == 0 {
                let purged = self.tx.purge(|other| other.dest.same_peer(&slot.dest));
                debug!(
                    "link: transfer to {:?} failed, {} queued transfers dropped",
                    slot.dest, purged
                );
                events.push(LinkEvent::TxFailed {
                    dest: slot.dest,
                    payload: slot.payload,
                });
                continue;
            }
            slot.retries_left -= 1;
            match slot.state {
                TxState::DataSent => {
                    trace!("link: retrying DATA to {:?}", slot.dest);
                    self.emit_data(radio, ident, slot.dest, &slot.payload, slot.transfer);
                }
                TxState::CommitSent => {
                    trace!("link: retrying COMMIT to {:?}", slot.dest);
                    self.emit_control(radio, ident, PacketType::Commit, slot.dest, slot.transfer);
                }
            }
            slot.expires_at = self.timer.deadline(RETRY_TICKS);
            // reinsertion cannot fail: we just removed the slot
            self.tx.insert(slot).ok().unwrap();
        }
        events
    }

    /// Frames addressed to our EDID: responses, direct parent traffic, and
    /// the coordinator's own child-side exchanges.
    fn process_local_frame<R: Radio>(
        &mut self,
        radio: &mut R,
        ident: &Identity,
        header: &FrameHeader,
        dst_edid: Edid,
        payload: &[u8],
        events: &mut Vec<LinkEvent>,
    ) {
        // the PAN is only ever addressed as a coordinator
        if ident.is_pan() || dst_edid != ident.edid {
            return;
        }
        // payload-carrying frames must come from the parent, with one
        // exception: a move response announcing the replacement parent.
        // payload-less handshake legs pass, or the new parent could never
        // complete an exchange after a move.
        if !header.src.same_peer(&Addr::Coord(ident.parent_cid))
            && payload.len() > crate::net::frame::NET_HEADER_SIZE
            && !crate::net::frame::is_move_response(payload)
        {
            trace!("link rx: not from parent, dropped");
            return;
        }
        if header.transfer == TransferType::NoAck {
            events.push(LinkEvent::Deliver {
                payload: payload_from(payload),
                transfer: TransferType::NoAck,
                local: true,
            });
            return;
        }
        self.handshake(radio, ident, header, payload, true, events);
    }

    /// Frames addressed to our CID: the routing fabric.
    fn process_coord_frame<R: Radio>(
        &mut self,
        radio: &mut R,
        ident: &Identity,
        filter: &NetFilter<'_>,
        header: &FrameHeader,
        dst_cid: u8,
        payload: &[u8],
        events: &mut Vec<LinkEvent>,
    ) {
        if ident.is_end_device() {
            return;
        }
        if cid_mask(dst_cid) != ident.cid {
            trace!("link rx: for coordinator {}, dropped", cid_mask(dst_cid));
            return;
        }
        if !filter.routing_enabled
            && header.transfer == TransferType::Handshake
            && header.packet_type != PacketType::CommitAck
        {
            debug!("link rx: routing disabled, dropped");
            return;
        }
        if let Addr::Coord(src) = header.src {
            // coordinator traffic must come from a tree neighbour; routing
            // fragments are exempt since they are what populates the tree
            let sender = cid_mask(src);
            let is_neighbour = match ident.kind {
                DeviceKind::Pan => filter.tree.parent_of(sender) == Some(ident.cid),
                _ => {
                    filter.tree.parent_of(ident.cid) == Some(sender)
                        || filter.tree.parent_of(sender) == Some(ident.cid)
                        || ident.parent_cid == sender
                }
            };
            if !is_neighbour && !crate::net::frame::is_routing_data(payload) {
                trace!("link rx: coordinator {} is not a neighbour, dropped", sender);
                return;
            }
        }
        if header.transfer == TransferType::NoAck {
            events.push(LinkEvent::Deliver {
                payload: payload_from(payload),
                transfer: TransferType::NoAck,
                local: false,
            });
            return;
        }
        self.handshake(radio, ident, header, payload, false, events);
    }

    /// The four-way handshake engine, shared by every device role.
    fn handshake<R: Radio>(
        &mut self,
        radio: &mut R,
        ident: &Identity,
        header: &FrameHeader,
        payload: &[u8],
        local: bool,
        events: &mut Vec<LinkEvent>,
    ) {
        let sender = header.src;
        match header.packet_type {
            PacketType::Data => {
                if header.transfer != TransferType::Handshake {
                    return;
                }
                if let Some(slot) = self.rx.find(|slot| slot.sender.same_peer(&sender)) {
                    // the peer missed our ACK; answer again but keep the
                    // stored payload
                    let transfer = slot.transfer;
                    trace!("link rx: duplicate DATA from {:?}", sender);
                    self.emit_reply(radio, ident, PacketType::Ack, sender, transfer, local);
                    return;
                }
                let slot = RxSlot {
                    payload: payload_from(payload),
                    sender,
                    transfer: header.transfer,
                    local,
                };
                if self.rx.insert(slot).is_err() {
                    debug!("link rx: buffers full, answering BUSY to {:?}", sender);
                    self.emit_reply(radio, ident, PacketType::Ack, sender, TransferType::Busy, local);
                    return;
                }
                self.emit_reply(radio, ident, PacketType::Ack, sender, header.transfer, local);
            }
            PacketType::Ack => {
                let busy = header.transfer == TransferType::Busy;
                let retries = self.tx_max_retries;
                let deadline = self.timer.deadline(if busy {
                    BUSY_BACKOFF_TICKS
                } else {
                    RETRY_TICKS
                });
                let mut commit_to = None;
                if let Some(slot) = self.tx.find(|slot| {
                    slot.dest.same_peer(&sender) && slot.state == TxState::DataSent
                }) {
                    slot.retries_left = retries;
                    slot.expires_at = deadline;
                    if busy {
                        debug!("link: {:?} is busy, backing off", sender);
                    } else {
                        slot.state = TxState::CommitSent;
                        commit_to = Some((slot.dest, slot.transfer));
                    }
                }
                if let Some((dest, transfer)) = commit_to {
                    self.emit_control(radio, ident, PacketType::Commit, dest, transfer);
                }
            }
            PacketType::Commit => {
                match self.rx.take(|slot| slot.sender.same_peer(&sender)) {
                    Some(slot) => {
                        self.emit_reply(
                            radio,
                            ident,
                            PacketType::CommitAck,
                            sender,
                            TransferType::Handshake,
                            slot.local,
                        );
                        events.push(LinkEvent::Deliver {
                            payload: slot.payload,
                            transfer: slot.transfer,
                            local: slot.local,
                        });
                    }
                    None => {
                        // the peer missed our COMMIT_ACK; answer again, but
                        // the payload was already delivered exactly once
                        trace!("link rx: duplicate COMMIT from {:?}", sender);
                        self.emit_reply(
                            radio,
                            ident,
                            PacketType::CommitAck,
                            sender,
                            TransferType::Handshake,
                            local,
                        );
                    }
                }
            }
            PacketType::CommitAck => {
                if self
                    .tx
                    .take(|slot| slot.dest.same_peer(&sender))
                    .is_some()
                {
                    events.push(LinkEvent::SendDone);
                }
            }
        }
    }

    fn on_join_request<R: Radio>(
        &mut self,
        radio: &mut R,
        ident: &Identity,
        filter: &NetFilter<'_>,
        header: &FrameHeader,
        payload: &[u8],
        events: &mut Vec<LinkEvent>,
    ) {
        if ident.is_end_device() || ident.cid == CID_INVALID {
            return;
        }
        if !filter.pair_mode {
            debug!("link rx: join request outside pair mode, dropped");
            return;
        }
        let joiner = match header.src {
            Addr::EndDevice(edid) => edid,
            Addr::Coord(_) => return,
        };
        let ack = FrameHeader {
            packet_type: PacketType::Ack,
            transfer: TransferType::JoinAck,
            nid: ident.nid,
            dst: Addr::EndDevice(joiner),
            src: Addr::Coord(ident.cid),
        };
        self.emit(radio, &ack, &[]);
        events.push(LinkEvent::JoinRequest {
            edid: joiner,
            rssi: radio.measured_rssi(),
            payload: payload_from(payload),
        });
    }

    fn on_join_ack(&mut self, filter: &NetFilter<'_>, header: &FrameHeader) {
        if !filter.waiting_join_response {
            return;
        }
        if let Addr::Coord(cid) = header.src {
            let cid = cid_mask(cid);
            debug!("link rx: ACK_JOIN from coordinator {}", cid);
            self.ack_join[cid as usize] = cid;
            self.ack_join_received = true;
        }
    }

    fn on_join_response(
        &mut self,
        filter: &NetFilter<'_>,
        header: &FrameHeader,
        payload: &[u8],
        events: &mut Vec<LinkEvent>,
    ) {
        if !filter.waiting_join_response || !self.ack_join_received {
            return;
        }
        let src_cid = match header.src {
            Addr::Coord(cid) => cid_mask(cid),
            Addr::EndDevice(_) => return,
        };
        // the response must come from a coordinator we heard an ACK_JOIN
        // from, or an imposter could enroll us into a different fabric
        if self.ack_join[src_cid as usize] != src_cid {
            warn!("link rx: join response from unacknowledged coordinator {}", src_cid);
            return;
        }
        self.ack_join = [CID_INVALID; MAX_COORDINATORS];
        self.ack_join_received = false;
        events.push(LinkEvent::JoinResponse {
            payload: payload_from(payload),
        });
    }

    /// Emits a DATA frame carrying `payload`.
    fn emit_data<R: Radio>(
        &mut self,
        radio: &mut R,
        ident: &Identity,
        dest: Addr,
        payload: &[u8],
        transfer: TransferType,
    ) {
        let header = FrameHeader {
            packet_type: PacketType::Data,
            transfer,
            nid: ident.nid,
            dst: dest,
            src: source_for(ident),
        };
        self.emit(radio, &header, payload);
    }

    /// Emits a payload-less handshake frame (ACK, COMMIT) as the initiating
    /// side of a transfer.
    fn emit_control<R: Radio>(
        &mut self,
        radio: &mut R,
        ident: &Identity,
        packet_type: PacketType,
        dest: Addr,
        transfer: TransferType,
    ) {
        let header = FrameHeader {
            packet_type,
            transfer,
            nid: ident.nid,
            dst: dest,
            src: source_for(ident),
        };
        self.emit(radio, &header, &[]);
    }

    /// Emits a payload-less handshake reply (ACK, COMMIT_ACK), answering
    /// with the identity the peer addressed: frames that reached us as an
    /// end device are acknowledged as one.
    fn emit_reply<R: Radio>(
        &mut self,
        radio: &mut R,
        ident: &Identity,
        packet_type: PacketType,
        dest: Addr,
        transfer: TransferType,
        local: bool,
    ) {
        let src = if local && !ident.is_pan() {
            Addr::EndDevice(ident.edid)
        } else {
            source_for(ident)
        };
        let header = FrameHeader {
            packet_type,
            transfer,
            nid: ident.nid,
            dst: dest,
            src,
        };
        self.emit(radio, &header, &[]);
    }

    fn emit<R: Radio>(&mut self, radio: &mut R, header: &FrameHeader, payload: &[u8]) {
        let mut buf = [0; MAX_PHY_PAYLOAD_SIZE];
        let mut writer = ByteWriter::new(&mut buf);
        if header.to_bytes(&mut writer).is_err() {
            return;
        }
        let written = writer.write_slice_truncate(payload);
        let total = LINK_HEADER_SIZE + written;
        trace!("link tx: {:?} ({} bytes)", header, total);
        radio.send(&buf[..total]);
    }
}

/// The source address this device uses when initiating a transfer.
///
/// End devices always identify by EDID; coordinators identify by CID, also
/// toward end devices (whose inbound frames carry the 1-byte CID on the
/// source side).
fn source_for(ident: &Identity) -> Addr {
    if ident.is_end_device() {
        Addr::EndDevice(ident.edid)
    } else {
        Addr::Coord(ident.cid)
    }
}
