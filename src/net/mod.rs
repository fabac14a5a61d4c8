//! Network layer.
//!
//! Tree-based source routing plus the orchestration that keeps the tree
//! alive: device enrollment (JOIN), parent reacquisition (MOVE), routing
//! table dissemination, and the deferred-delivery mailbox for sleepy end
//! devices. The PAN coordinator is the only authoritative writer of routing
//! state; coordinators replicate the subtree they are responsible for, and
//! end devices only ever talk to their parent.
//!
//! The layer is driven from the outside: link events enter through
//! [`NetLayer::handle_event`], the 50 ms timer through [`NetLayer::on_tick`],
//! and host requests through the send/join/pair entry points. Anything
//! destined for the application is staged in an internal queue the stack
//! runtime drains.

pub mod device_table;
pub mod election;
pub mod frame;
pub mod mailbox;
pub mod routing;

use self::device_table::{DeviceRecord, DeviceTable, DeviceType};
use self::election::{Candidate, CandidateTable, JOIN_CANDIDATES, MOVE_CANDIDATES};
use self::frame::{
    ExtType, MsgType, NetHeader, ResolvedType, DEVICE_TYPE_COORD, DEVICE_TYPE_SLEEPY_ED,
    MAX_NET_PAYLOAD_SIZE, MOVE_RESPONSE_ROUTE_TAG, MOVE_RESPONSE_TAG, NET_HEADER_SIZE,
};
use self::mailbox::SleepyMailbox;
use self::routing::{fragment_pairs, RoutingFragment, RoutingTree, TreePair};
use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::config::{DeviceKind, Identity, StackConfig};
use crate::link::addr::{cid_mask, Addr, Edid, CID_BROADCAST, CID_INVALID, CID_PAN};
use crate::link::frame::{TransferType, MAX_LINK_PAYLOAD_SIZE};
use crate::link::{LinkEvent, LinkLayer, NetFilter};
use crate::phy::Radio;
use crate::time::{secs_to_ticks, TickCounter, TickWindow};
use log::{debug, info, trace, warn};
use std::collections::BTreeMap;

/// Ticks a moving device waits for a move response before broadcasting its
/// request again (~2 s).
pub const MOVE_RETRY_TICKS: u8 = 40;

/// Ticks the PAN aggregates move candidates before electing (~3 s).
pub const MOVE_ELECTION_TICKS: u8 = 60;

/// Ticks between the mailbox WAIT acknowledgement and the deferred data
/// frame toward a sleepy device.
const DR_DATA_GAP_TICKS: u8 = 1;

/// Milliseconds a sleepy sender waits for the data-request acknowledgement.
pub const MAX_DR_ACK_DELAY_MS: u64 = 200;

/// Milliseconds a sleepy sender waits for the deferred data after a WAIT
/// acknowledgement.
pub const MAX_DR_DATA_DELAY_MS: u64 = 1000;

/// Sleepy sender state during a data-request exchange.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DrState {
    Idle,
    /// Request sent, waiting for ACK_DR_WAIT or ACK_DR_SLEEP.
    AckWaiting,
    /// WAIT received, deferred data is on its way.
    DataWaiting,
    /// SLEEP received; nothing pending.
    GoSleep,
    /// Deferred data arrived.
    DataReceived,
}

/// One message staged for the application receive queue, shaped
/// `[msg_type, device_type, src_edid(4), payload...]` on the host side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub kind: MsgType,
    pub device_type: u8,
    pub src_edid: Edid,
    pub payload: Vec<u8>,
}

impl ReceivedMessage {
    /// Serializes the message into the host wire shape.
    pub fn to_host_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.payload.len());
        out.push(self.kind as u8);
        out.push(self.device_type);
        out.extend_from_slice(self.src_edid.raw());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// PAN-only state: the authoritative tables.
struct PanState {
    devices: DeviceTable,
    mailbox: SleepyMailbox,
    join_candidates: CandidateTable,
    move_candidates: CandidateTable,
    /// Election window for join candidates, one pair-mode window capped at
    /// the 8-bit tick horizon.
    join_window: u8,
    /// Deferred mailbox deliveries: `(destination, due tick)`.
    pending_dr: Vec<(Edid, u8)>,
}

enum RoleState {
    Pan(Box<PanState>),
    Coordinator,
    EndDevice,
}

/// The network-layer state machine.
pub struct NetLayer {
    timer: TickCounter,
    tree: RoutingTree,
    role: RoleState,

    pair_mode: bool,
    pair_ticks_left: u32,

    routing_enabled: bool,
    waiting_join_response: bool,

    waiting_move_response: bool,
    move_ticks_left: u8,

    dr_state: DrState,

    /// Routing fragments staged until the set is complete.
    staged_fragments: Vec<TreePair>,
    staged_total: u8,
    staged_seen: u8,

    /// Messages awaiting the application, drained by the stack runtime.
    pending_rx: Vec<ReceivedMessage>,
}

impl NetLayer {
    pub fn new(config: &StackConfig) -> Self {
        let (role, tree) = match config.kind {
            DeviceKind::Pan => {
                let devices = DeviceTable::load(config.device_table_path.clone());
                let tree = devices.build_tree();
                let state = PanState {
                    devices,
                    mailbox: SleepyMailbox::new(),
                    join_candidates: CandidateTable::new(JOIN_CANDIDATES),
                    move_candidates: CandidateTable::new(MOVE_CANDIDATES),
                    join_window: MOVE_ELECTION_TICKS,
                    pending_dr: Vec::new(),
                };
                (RoleState::Pan(Box::new(state)), tree)
            }
            DeviceKind::Coordinator => (RoleState::Coordinator, RoutingTree::new()),
            DeviceKind::EndDevice => (RoleState::EndDevice, RoutingTree::new()),
        };
        NetLayer {
            timer: TickCounter::new(),
            tree,
            role,
            pair_mode: false,
            pair_ticks_left: 0,
            routing_enabled: true,
            waiting_join_response: false,
            waiting_move_response: false,
            move_ticks_left: 0,
            dr_state: DrState::Idle,
            staged_fragments: Vec::new(),
            staged_total: 0,
            staged_seen: 0,
            pending_rx: Vec::new(),
        }
    }

    /// The filter view the link layer consults on every inbound frame.
    pub fn filter(&self) -> NetFilter<'_> {
        NetFilter {
            pair_mode: self.pair_mode,
            waiting_join_response: self.waiting_join_response,
            routing_enabled: self.routing_enabled,
            tree: &self.tree,
        }
    }

    /// Drains the messages staged for the application queue.
    pub fn drain_received(&mut self) -> Vec<ReceivedMessage> {
        std::mem::replace(&mut self.pending_rx, Vec::new())
    }

    pub fn waiting_join_response(&self) -> bool {
        self.waiting_join_response
    }

    pub fn set_waiting_join_response(&mut self, waiting: bool) {
        self.waiting_join_response = waiting;
    }

    pub fn dr_state(&self) -> DrState {
        self.dr_state
    }

    /// Returns the data-request machine to idle once the host call that
    /// drove it completes.
    pub fn reset_dr_state(&mut self) {
        self.dr_state = DrState::Idle;
    }

    pub fn is_rebuilding(&self) -> bool {
        self.waiting_move_response
    }

    pub fn pair_mode(&self) -> bool {
        self.pair_mode
    }

    /// The local view of the routing tree.
    pub fn tree(&self) -> &RoutingTree {
        &self.tree
    }

    /// Reacts to one link-layer event.
    pub fn handle_event<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &mut Identity,
        event: LinkEvent,
    ) {
        match event {
            LinkEvent::Deliver {
                payload,
                transfer,
                local,
            } => self.deliver(link, radio, ident, &payload, transfer, local),
            LinkEvent::SendDone => {
                trace!("net: handshake completed");
            }
            LinkEvent::TxFailed { dest, payload } => {
                self.on_tx_failed(link, radio, ident, dest, &payload)
            }
            LinkEvent::JoinRequest {
                edid,
                rssi,
                payload,
            } => self.on_join_request(link, radio, ident, edid, rssi, &payload),
            LinkEvent::JoinResponse { payload } => self.on_join_response(ident, &payload),
        }
    }

    /// Advances the network timer: pair-mode countdown, move retries, and on
    /// the PAN the election windows and deferred mailbox deliveries.
    pub fn on_tick<R: Radio>(&mut self, link: &mut LinkLayer, radio: &mut R, ident: &mut Identity) {
        self.timer.advance();
        let now = self.timer.now();

        if self.pair_mode && self.pair_ticks_left > 0 {
            self.pair_ticks_left -= 1;
            if self.pair_ticks_left == 0 {
                info!("net: pair mode window elapsed");
                self.pair_mode = false;
            }
        }

        if self.waiting_move_response {
            self.move_ticks_left = self.move_ticks_left.saturating_sub(1);
            if self.move_ticks_left == 0 {
                warn!("net: no move response, soliciting parents again");
                self.broadcast_move_request(link, radio, ident);
            }
        }

        if let RoleState::Pan(_) = self.role {
            self.run_elections(link, radio, ident, now);
            self.run_pending_dr(link, radio, ident, now);
        }
    }

    // ------------------------------------------------------------------
    // Host-facing operations
    // ------------------------------------------------------------------

    /// Routes or parks one application payload (the `send` API).
    pub fn send_data<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        to_cid: u8,
        to_edid: Edid,
        payload: &[u8],
    ) -> bool {
        if payload.len() > MAX_NET_PAYLOAD_SIZE {
            return false;
        }
        if to_cid == CID_BROADCAST {
            let header = NetHeader::new(
                MsgType::Data,
                CID_BROADCAST,
                self.source_cid(ident),
                Edid::BROADCAST,
                ident.edid,
            );
            return self.send_frame(link, radio, ident, &header, payload, TransferType::Broadcast);
        }
        // no traffic during reinitialization, and no traffic to ourselves
        if self.waiting_move_response || to_edid == ident.edid {
            return false;
        }
        if !ident.is_end_device() && to_cid == ident.cid {
            return false;
        }
        if !ident.is_pan() && ident.nid.is_unset() {
            return false;
        }

        // a sleepy destination never receives unsolicited traffic; park the
        // payload in the mailbox instead of transmitting
        if let RoleState::Pan(pan) = &mut self.role {
            if !to_edid.is_zero() {
                if let Some(record) = pan.devices.find(to_edid) {
                    if record.sleepy {
                        debug!("net: mailbox entry for sleepy {:?}", to_edid);
                        return pan.mailbox.push(to_edid, payload);
                    }
                }
            }
        }

        let msg_type = if ident.is_end_device() && ident.sleepy {
            self.dr_state = DrState::AckWaiting;
            MsgType::DataDr
        } else {
            MsgType::Data
        };
        let header = NetHeader::new(msg_type, to_cid, self.source_cid(ident), to_edid, ident.edid);
        self.send_frame(link, radio, ident, &header, payload, TransferType::Handshake)
    }

    /// Builds the join request payload: a bare network header shape with the
    /// device type in place of the CID fields.
    pub fn build_join_request(&self, ident: &Identity) -> [u8; NET_HEADER_SIZE] {
        let mut out = [0; NET_HEADER_SIZE];
        out[0] = (MsgType::JoinRequest as u8) << 4;
        out[1] = ident.device_type_byte();
        out[6..10].copy_from_slice(ident.edid.raw());
        out
    }

    /// PAN only: opens the pair-mode window and announces it to the fabric.
    pub fn joining_enable<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        timeout_secs: u8,
    ) {
        self.enable_pair_mode(timeout_secs);
        if let RoleState::Pan(pan) = &mut self.role {
            // the election waits one pair-mode window, bounded by the 8-bit
            // tick horizon
            pan.join_window = secs_to_ticks(u16::from(timeout_secs)).min(255) as u8;
            let header = NetHeader::extended(
                CID_BROADCAST,
                CID_PAN,
                Edid::BROADCAST,
                ident.edid,
                ExtType::PairModeEnabled,
            );
            let payload = [timeout_secs];
            self.send_frame(link, radio, ident, &header, &payload, TransferType::Broadcast);
        }
    }

    pub fn joining_disable(&mut self) {
        self.pair_mode = false;
        self.pair_ticks_left = 0;
    }

    /// PAN only: commits a pending join candidate without waiting for its
    /// election window.
    pub fn accepted_device(&mut self, edid: Edid) -> bool {
        match &mut self.role {
            RoleState::Pan(pan) => pan.join_candidates.accept(edid),
            _ => false,
        }
    }

    /// PAN only: evicts a device, persists the table and rebuilds routing.
    pub fn unpair<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        edid: Edid,
    ) -> bool {
        let parent = match &self.role {
            RoleState::Pan(pan) => match pan.devices.parent_of(edid) {
                Some(parent) => parent,
                None => return false,
            },
            _ => return false,
        };
        info!("net: unpairing {:?}", edid);
        // the eviction notice must leave while the route still exists
        let header = NetHeader::new(MsgType::Unjoin, parent, CID_PAN, edid, ident.edid);
        self.send_frame(link, radio, ident, &header, &[], TransferType::NoAck);

        if let RoleState::Pan(pan) = &mut self.role {
            pan.devices.remove(edid);
            pan.mailbox.invalidate(edid);
            pan.devices.save();
        }
        self.rebuild_and_distribute(link, radio, ident);
        true
    }

    /// PAN only: the host-facing device listing.
    pub fn device_list(&self) -> BTreeMap<u64, DeviceType> {
        let mut list = BTreeMap::new();
        if let RoleState::Pan(pan) = &self.role {
            for record in pan.devices.iter() {
                let device_type = if record.coordinator {
                    DeviceType::Coordinator
                } else {
                    DeviceType::EndDevice
                };
                list.insert(record.edid.to_u64(), device_type);
            }
        }
        list
    }

    /// Test and tooling access to the device table.
    pub fn devices(&self) -> Option<&DeviceTable> {
        match &self.role {
            RoleState::Pan(pan) => Some(&pan.devices),
            _ => None,
        }
    }

    pub fn devices_mut(&mut self) -> Option<&mut DeviceTable> {
        match &mut self.role {
            RoleState::Pan(pan) => Some(&mut pan.devices),
            _ => None,
        }
    }

    /// PAN only: registers a device directly (used by provisioning tools)
    /// and redistributes routing state.
    pub fn add_device<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        record: DeviceRecord,
    ) -> bool {
        let added = match &mut self.role {
            RoleState::Pan(pan) => {
                let added = pan.devices.add(record);
                if added {
                    pan.devices.save();
                }
                added
            }
            _ => false,
        };
        if added {
            self.rebuild_and_distribute(link, radio, ident);
        }
        added
    }

    pub fn set_device_table_path(&mut self, path: std::path::PathBuf) {
        if let RoleState::Pan(pan) = &mut self.role {
            pan.devices.set_path(path);
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    fn deliver<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &mut Identity,
        payload: &[u8],
        transfer: TransferType,
        local: bool,
    ) {
        if payload.len() < NET_HEADER_SIZE {
            trace!("net rx: short frame dropped");
            return;
        }
        // a moving device must not commit state against a stale parent
        if self.waiting_move_response && !frame::is_move_response(payload) {
            trace!("net rx: moving, non-move-response dropped");
            return;
        }
        let mut reader = ByteReader::new(payload);
        let header = match NetHeader::from_bytes(&mut reader) {
            Ok(header) => header,
            Err(_) => return,
        };
        let body = reader.into_rest();
        trace!(
            "net rx: {:?} dcid={} scid={} local={}",
            header.resolved(),
            header.dst_cid,
            header.src_cid,
            local
        );

        match &self.role {
            RoleState::EndDevice => self.process_local(link, radio, ident, &header, body),
            RoleState::Coordinator | RoleState::Pan(_) => {
                if local {
                    self.process_local(link, radio, ident, &header, body)
                } else {
                    self.route(link, radio, ident, &header, payload, body, transfer)
                }
            }
        }
    }

    /// Handles a frame addressed to this device (or broadcast to it).
    fn process_local<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &mut Identity,
        header: &NetHeader,
        body: &[u8],
    ) {
        match header.resolved() {
            ResolvedType::Plain(MsgType::Data) => {
                if ident.is_end_device() && ident.sleepy && self.dr_state == DrState::DataWaiting {
                    self.dr_state = DrState::DataReceived;
                }
                self.queue_data(MsgType::Data, header.src_edid, body);
            }
            ResolvedType::Plain(MsgType::AckDrWait) => {
                if self.dr_state == DrState::AckWaiting {
                    self.dr_state = DrState::DataWaiting;
                }
            }
            ResolvedType::Plain(MsgType::AckDrSleep) => {
                if self.dr_state == DrState::AckWaiting {
                    self.dr_state = DrState::GoSleep;
                }
            }
            ResolvedType::Plain(MsgType::Unjoin) => {
                if header.dst_edid == ident.edid && !ident.is_pan() {
                    info!("net: unpaired by the fabric, clearing enrollment");
                    ident.nid = crate::link::addr::Nid::UNSET;
                    ident.parent_cid = CID_INVALID;
                    if !ident.is_end_device() {
                        ident.cid = CID_INVALID;
                        self.tree.clear();
                    }
                }
            }
            ResolvedType::Ext(ExtType::MoveResponse) => {
                let parent = cid_mask(header.dst_cid);
                info!("net: moved to parent {}", parent);
                ident.parent_cid = parent;
                if !ident.is_end_device() {
                    self.tree.set(ident.cid, parent);
                }
                self.waiting_move_response = false;
            }
            ResolvedType::Ext(ExtType::MoveRequest) => match ident.kind {
                DeviceKind::Pan => {
                    // the PAN itself is a move candidate parent
                    let rssi = radio.measured_rssi();
                    self.insert_move_candidate(header.src_edid, CID_PAN, rssi);
                }
                DeviceKind::Coordinator => {
                    self.relay_move_request(link, radio, ident, header);
                }
                DeviceKind::EndDevice => {}
            },
            ResolvedType::Ext(ExtType::PairModeEnabled) => {
                if ident.kind == DeviceKind::Coordinator {
                    let timeout = body.first().copied().unwrap_or(0);
                    debug!("net: pair mode enabled for {} s by the fabric", timeout);
                    self.enable_pair_mode(timeout);
                }
            }
            other => {
                trace!("net rx: ignoring {:?} addressed to this device", other);
            }
        }
    }

    /// Handles a frame that arrived on the routing path (`LINK` handed it up
    /// from the coordinator side).
    fn route<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &mut Identity,
        header: &NetHeader,
        raw: &[u8],
        body: &[u8],
        transfer: TransferType,
    ) {
        let dcid = cid_mask(header.dst_cid);
        if dcid != ident.cid {
            // not ours: forward along the tree
            let hop = self.tree.next_hop(ident.cid, ident.parent_cid, dcid);
            if hop == CID_INVALID {
                debug!("net: no route toward {}", dcid);
                return;
            }
            let _ = link.send(radio, ident, Addr::Coord(hop), raw, transfer);
            return;
        }

        if self.is_for_descendant(ident, header.dst_edid) {
            match header.resolved() {
                ResolvedType::Ext(ExtType::MoveResponseRoute) => {
                    self.convert_move_response(link, radio, ident, header)
                }
                ResolvedType::Plain(MsgType::JoinResponseRoute) => {
                    self.convert_join_response(link, radio, ident, header, body)
                }
                _ => {
                    // the last hop: hand the frame to the end device child
                    let _ = link.send(
                        radio,
                        ident,
                        Addr::EndDevice(header.dst_edid),
                        raw,
                        transfer,
                    );
                }
            }
            return;
        }

        // addressed to this coordinator itself
        match header.resolved() {
            ResolvedType::Plain(MsgType::Data) => {
                self.queue_data(MsgType::Data, header.src_edid, body)
            }
            ResolvedType::Plain(MsgType::DataDr) => {
                self.serve_data_request(link, radio, ident, header.src_edid, body)
            }
            ResolvedType::Plain(MsgType::RoutingData) => {
                self.merge_routing_fragment(link, radio, ident, body)
            }
            ResolvedType::Plain(MsgType::JoinRequestRoute) => {
                let device_type = body.first().copied().unwrap_or(0);
                let rssi = body.get(1).copied().unwrap_or(0);
                self.insert_join_candidate(
                    header.src_edid,
                    cid_mask(header.src_cid),
                    rssi,
                    device_type,
                );
            }
            ResolvedType::Ext(ExtType::MoveRequestRoute) => {
                let rssi = body.first().copied().unwrap_or(0);
                self.insert_move_candidate(header.src_edid, cid_mask(header.src_cid), rssi);
            }
            ResolvedType::Plain(MsgType::Unjoin) => {
                if header.dst_edid == ident.edid && !ident.is_pan() {
                    ident.nid = crate::link::addr::Nid::UNSET;
                    ident.parent_cid = CID_INVALID;
                    ident.cid = CID_INVALID;
                    self.tree.clear();
                }
            }
            other => {
                trace!("net rx: ignoring routed {:?}", other);
            }
        }
    }

    // ------------------------------------------------------------------
    // JOIN
    // ------------------------------------------------------------------

    /// A join request was overheard directly (pair mode active).
    fn on_join_request<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        edid: Edid,
        rssi: u8,
        payload: &[u8],
    ) {
        let device_type = payload.get(1).copied().unwrap_or(0);
        match ident.kind {
            DeviceKind::Pan => {
                // the PAN is itself the candidate parent; no relaying needed
                self.insert_join_candidate(edid, CID_PAN, rssi, device_type);
            }
            DeviceKind::Coordinator => {
                let header = NetHeader::new(
                    MsgType::JoinRequestRoute,
                    CID_PAN,
                    ident.cid,
                    Edid::ZERO,
                    edid,
                );
                let body = [device_type, rssi];
                self.send_frame(link, radio, ident, &header, &body, TransferType::NoAck);
            }
            DeviceKind::EndDevice => {}
        }
    }

    /// The validated join response arrived at a joining device.
    fn on_join_response(&mut self, ident: &mut Identity, payload: &[u8]) {
        // header (10) + NID (4) + assigned CID (1)
        if payload.len() < 15 {
            return;
        }
        let header = match NetHeader::from_bytes(&mut ByteReader::new(payload)) {
            Ok(header) => header,
            Err(_) => return,
        };
        if header.dst_edid != ident.edid {
            return;
        }
        let mut nid = [0; 4];
        nid.copy_from_slice(&payload[NET_HEADER_SIZE..NET_HEADER_SIZE + 4]);
        ident.nid = crate::link::addr::Nid::new(nid);
        ident.parent_cid = cid_mask(header.dst_cid);
        if !ident.is_end_device() {
            // the assigned CID rides behind the NID
            ident.cid = cid_mask(payload[NET_HEADER_SIZE + 4]);
            self.tree.set(ident.cid, ident.parent_cid);
        }
        info!(
            "net: joined fabric {:?} (parent {}, cid {})",
            ident.nid, ident.parent_cid, ident.cid
        );
        self.waiting_join_response = false;
    }

    fn insert_join_candidate(&mut self, edid: Edid, parent_cid: u8, rssi: u8, device_type: u8) {
        let now = self.timer.now();
        if let RoleState::Pan(pan) = &mut self.role {
            debug!(
                "net: join candidate {:?} via parent {} (rssi {})",
                edid, parent_cid, rssi
            );
            let first_candidate = !pan.join_candidates.contains(edid);
            pan.join_candidates.insert(Candidate {
                edid,
                parent_cid,
                rssi,
                device_type,
                window: TickWindow::after(now, pan.join_window),
                accepted: false,
            });
            if first_candidate {
                // surface the join attempt to the host exactly once
                self.pending_rx.push(ReceivedMessage {
                    kind: MsgType::JoinRequest,
                    device_type,
                    src_edid: edid,
                    payload: Vec::new(),
                });
            }
        }
    }

    fn insert_move_candidate(&mut self, edid: Edid, parent_cid: u8, rssi: u8) {
        let now = self.timer.now();
        if let RoleState::Pan(pan) = &mut self.role {
            // the moving device must be enrolled; strangers don't get moved
            let device_type = match pan.devices.find(edid) {
                Some(record) if record.coordinator => DEVICE_TYPE_COORD,
                Some(record) if record.sleepy => DEVICE_TYPE_SLEEPY_ED,
                Some(_) => 0,
                None => {
                    debug!("net: move candidate for unknown {:?}, dropped", edid);
                    return;
                }
            };
            debug!(
                "net: move candidate {:?} via parent {} (rssi {})",
                edid, parent_cid, rssi
            );
            pan.move_candidates.insert(Candidate {
                edid,
                parent_cid,
                rssi,
                device_type,
                window: TickWindow::after(now, MOVE_ELECTION_TICKS),
                accepted: false,
            });
        }
    }

    /// Runs due JOIN and MOVE elections.
    fn run_elections<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        now: u8,
    ) {
        loop {
            let winner = match &mut self.role {
                RoleState::Pan(pan) => match pan.join_candidates.due(now) {
                    Some(edid) => pan.join_candidates.elect(edid),
                    None => None,
                },
                _ => return,
            };
            match winner {
                Some(candidate) => self.complete_join(link, radio, ident, candidate),
                None => break,
            }
        }
        loop {
            let winner = match &mut self.role {
                RoleState::Pan(pan) => match pan.move_candidates.due(now) {
                    Some(edid) => pan.move_candidates.elect(edid),
                    None => None,
                },
                _ => return,
            };
            match winner {
                Some(candidate) => self.complete_move(link, radio, ident, candidate),
                None => break,
            }
        }
    }

    /// Elected: enroll the device and answer it through its new parent.
    fn complete_join<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        candidate: Candidate,
    ) {
        let is_coord = candidate.device_type == DEVICE_TYPE_COORD;
        let (cid, record_ok) = match &mut self.role {
            RoleState::Pan(pan) => {
                let cid = if is_coord {
                    match pan.devices.alloc_cid() {
                        Some(cid) => cid,
                        None => {
                            warn!("net: coordinator address space exhausted");
                            return;
                        }
                    }
                } else {
                    0
                };
                let record = DeviceRecord {
                    edid: candidate.edid,
                    cid,
                    parent_cid: candidate.parent_cid,
                    sleepy: candidate.device_type == DEVICE_TYPE_SLEEPY_ED,
                    coordinator: is_coord,
                };
                let ok = pan.devices.add(record);
                if ok {
                    pan.devices.save();
                }
                (cid, ok)
            }
            _ => return,
        };
        if !record_ok {
            warn!("net: device table rejected join of {:?}", candidate.edid);
            return;
        }
        info!(
            "net: {:?} joined as cid {} under parent {} (rssi {})",
            candidate.edid, cid, candidate.parent_cid, candidate.rssi
        );

        let mut body = [0; 5];
        body[..4].copy_from_slice(ident.nid.raw());
        body[4] = cid;

        if candidate.parent_cid == CID_PAN {
            // we are the parent: answer the joiner directly
            let header = NetHeader::new(
                MsgType::JoinResponse,
                CID_PAN,
                CID_PAN,
                candidate.edid,
                ident.edid,
            );
            let frame = build_frame(&header, &body);
            link.send_join_response(radio, ident, candidate.edid, &frame);
        } else {
            let header = NetHeader::new(
                MsgType::JoinResponseRoute,
                candidate.parent_cid,
                CID_PAN,
                candidate.edid,
                ident.edid,
            );
            self.send_frame(link, radio, ident, &header, &body, TransferType::Handshake);
        }
        self.rebuild_and_distribute(link, radio, ident);
    }

    /// A coordinator turns a routed join response into the direct link-layer
    /// response its new child is waiting for.
    fn convert_join_response<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        header: &NetHeader,
        body: &[u8],
    ) {
        debug!("net: answering join of {:?} as elected parent", header.dst_edid);
        let direct = NetHeader {
            msg_type: MsgType::JoinResponse,
            ..*header
        };
        let frame = build_frame(&direct, body);
        link.send_join_response(radio, ident, header.dst_edid, &frame);
    }

    // ------------------------------------------------------------------
    // MOVE
    // ------------------------------------------------------------------

    /// A handshake toward `dest` died. Losing the upward hop means the
    /// parent is gone: solicit a new one.
    fn on_tx_failed<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        dest: Addr,
        payload: &[u8],
    ) {
        if ident.is_pan() {
            // the root has no parent to reacquire
            return;
        }
        if let Addr::Coord(_) = dest {
            // failures on a downward hop are not a parent loss; the
            // destination CID of the dead frame tells the direction
            let dcid = match NetHeader::from_bytes(&mut ByteReader::new(payload)) {
                Ok(header) => header.dst_cid,
                Err(_) => return,
            };
            if self.tree.next_hop(ident.cid, ident.parent_cid, dcid) != ident.parent_cid {
                debug!("net: downward delivery toward {} failed, dropped", dcid);
                return;
            }
        }
        // failures toward an end-device descendant fall through: losing a
        // child also re-validates our own position in the tree
        if !self.waiting_move_response {
            warn!("net: parent unreachable, soliciting a new one");
            self.broadcast_move_request(link, radio, ident);
        }
    }

    fn broadcast_move_request<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
    ) {
        self.waiting_move_response = true;
        self.move_ticks_left = MOVE_RETRY_TICKS;
        let header = NetHeader::extended(
            CID_BROADCAST,
            self.source_cid(ident),
            Edid::BROADCAST,
            ident.edid,
            ExtType::MoveRequest,
        );
        let frame = build_frame(&header, &[frame::MOVE_REQUEST_TAG]);
        link.send_broadcast(radio, ident, &frame);
    }

    /// A neighbour coordinator relays an overheard move request toward the
    /// PAN, annotated with the signal strength it measured.
    fn relay_move_request<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        original: &NetHeader,
    ) {
        if ident.cid == CID_INVALID {
            return;
        }
        let rssi = radio.measured_rssi();
        debug!(
            "net: relaying move request of {:?} (rssi {})",
            original.src_edid, rssi
        );
        let header = NetHeader::extended(
            CID_PAN,
            ident.cid,
            original.dst_edid,
            original.src_edid,
            ExtType::MoveRequestRoute,
        );
        let body = [rssi];
        self.send_frame(link, radio, ident, &header, &body, TransferType::Handshake);
    }

    /// Elected: record the new parent and answer the mover through it.
    fn complete_move<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        candidate: Candidate,
    ) {
        match &mut self.role {
            RoleState::Pan(pan) => {
                if !pan.devices.set_parent(candidate.edid, candidate.parent_cid) {
                    return;
                }
                pan.devices.save();
            }
            _ => return,
        }
        info!(
            "net: {:?} moves under parent {} (rssi {})",
            candidate.edid, candidate.parent_cid, candidate.rssi
        );
        if candidate.parent_cid == CID_PAN {
            let header = NetHeader::extended(
                CID_PAN,
                CID_PAN,
                candidate.edid,
                ident.edid,
                ExtType::MoveResponse,
            );
            let body = [MOVE_RESPONSE_TAG];
            self.send_frame(link, radio, ident, &header, &body, TransferType::NoAck);
        } else {
            let header = NetHeader::extended(
                candidate.parent_cid,
                CID_PAN,
                candidate.edid,
                ident.edid,
                ExtType::MoveResponseRoute,
            );
            let body = [MOVE_RESPONSE_ROUTE_TAG];
            self.send_frame(link, radio, ident, &header, &body, TransferType::Handshake);
        }
        self.rebuild_and_distribute(link, radio, ident);
    }

    /// The elected parent converts the routed move response into the direct
    /// frame the waiting mover will accept.
    fn convert_move_response<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        header: &NetHeader,
    ) {
        debug!("net: adopting mover {:?}", header.dst_edid);
        // the destination CID field deliberately keeps this coordinator's
        // CID: the mover reads its new parent out of it
        let direct = NetHeader {
            ext: Some(ExtType::MoveResponse),
            ..*header
        };
        let frame = build_frame(&direct, &[MOVE_RESPONSE_TAG]);
        let _ = link.send(
            radio,
            ident,
            Addr::EndDevice(header.dst_edid),
            &frame,
            TransferType::NoAck,
        );
    }

    // ------------------------------------------------------------------
    // Sleepy mailbox
    // ------------------------------------------------------------------

    /// PAN: a sleepy device woke up and asks for pending traffic.
    fn serve_data_request<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        edid: Edid,
        body: &[u8],
    ) {
        let now = self.timer.now();
        let (has_mail, device_type, parent) = match &mut self.role {
            RoleState::Pan(pan) => {
                let has_mail = pan.mailbox.contains(edid);
                if has_mail {
                    pan.pending_dr.push((edid, now.wrapping_add(DR_DATA_GAP_TICKS)));
                }
                (
                    has_mail,
                    pan.devices.device_type_byte(edid),
                    pan.devices.parent_of(edid).unwrap_or(CID_PAN),
                )
            }
            _ => return,
        };
        debug!(
            "net: data request from {:?}, mailbox {}",
            edid,
            if has_mail { "pending" } else { "empty" }
        );
        // the request itself may carry data for the application
        self.pending_rx.push(ReceivedMessage {
            kind: MsgType::DataDr,
            device_type,
            src_edid: edid,
            payload: body.to_vec(),
        });
        let msg_type = if has_mail {
            MsgType::AckDrWait
        } else {
            MsgType::AckDrSleep
        };
        let header = NetHeader::new(msg_type, parent, CID_PAN, edid, ident.edid);
        self.send_frame(link, radio, ident, &header, &[], TransferType::NoAck);
    }

    /// Deferred mailbox deliveries whose gap elapsed.
    fn run_pending_dr<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        now: u8,
    ) {
        loop {
            let (edid, payload) = match &mut self.role {
                RoleState::Pan(pan) => {
                    let index = pan.pending_dr.iter().position(|(_, due)| *due == now);
                    match index {
                        Some(index) => {
                            let (edid, _) = pan.pending_dr.remove(index);
                            match pan.mailbox.take(edid) {
                                Some(payload) => (edid, payload),
                                None => continue,
                            }
                        }
                        None => break,
                    }
                }
                _ => return,
            };
            debug!("net: delivering mailbox entry to {:?}", edid);
            let parent = self.parent_of_device(edid).unwrap_or(CID_PAN);
            let header = NetHeader::new(MsgType::Data, parent, CID_PAN, edid, ident.edid);
            self.send_frame(link, radio, ident, &header, &payload, TransferType::Handshake);
        }
    }

    // ------------------------------------------------------------------
    // Routing dissemination
    // ------------------------------------------------------------------

    /// Rebuilds the authoritative tree from the device table and pushes the
    /// subtree tables down to every direct child coordinator.
    fn rebuild_and_distribute<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
    ) {
        if let RoleState::Pan(pan) = &self.role {
            self.tree = pan.devices.build_tree();
        } else {
            return;
        }
        self.distribute_subtrees(link, radio, ident, CID_PAN);
    }

    /// Sends each direct child of `from` the fragments of its own subtree.
    fn distribute_subtrees<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        from: u8,
    ) {
        let pairs = self.tree.pairs();
        let children: Vec<u8> = self.tree.children_of(from).collect();
        for child in children {
            let subtree: Vec<TreePair> = pairs
                .iter()
                .copied()
                .filter(|(cid, _)| self.tree.is_in_subtree(*cid, child))
                .collect();
            if subtree.is_empty() {
                continue;
            }
            debug!(
                "net: sending {} routing pairs toward coordinator {}",
                subtree.len(),
                child
            );
            for fragment in fragment_pairs(&subtree) {
                let header = NetHeader::new(
                    MsgType::RoutingData,
                    child,
                    ident.cid,
                    Edid::ZERO,
                    ident.edid,
                );
                self.send_frame(link, radio, ident, &header, &fragment, TransferType::NoAck);
            }
        }
    }

    /// A coordinator merges one routing fragment; a complete set updates the
    /// local tree and cascades to the children.
    fn merge_routing_fragment<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        body: &[u8],
    ) {
        let fragment = match RoutingFragment::parse(body) {
            Ok(fragment) => fragment,
            Err(_) => return,
        };
        if fragment.index == 1 {
            self.staged_fragments.clear();
            self.staged_total = fragment.total;
            self.staged_seen = 0;
        } else if fragment.total != self.staged_total || fragment.index != self.staged_seen + 1 {
            // a hole in the sequence; wait for the next full set
            debug!(
                "net: routing fragment {}/{} out of sequence, discarding set",
                fragment.index, fragment.total
            );
            self.staged_fragments.clear();
            self.staged_total = 0;
            self.staged_seen = 0;
            return;
        }
        self.staged_seen = fragment.index;
        self.staged_fragments.extend_from_slice(&fragment.pairs);
        if !fragment.is_last() {
            return;
        }

        // the set is complete: only now is the tree allowed to change
        let pairs = std::mem::replace(&mut self.staged_fragments, Vec::new());
        self.staged_total = 0;
        self.staged_seen = 0;
        self.tree.merge(&pairs);
        debug!("net: routing tree updated ({} pairs)", pairs.len());
        self.distribute_subtrees(link, radio, ident, ident.cid);
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn enable_pair_mode(&mut self, timeout_secs: u8) {
        self.pair_mode = true;
        self.pair_ticks_left = secs_to_ticks(u16::from(timeout_secs));
    }

    /// The CID this device writes into the source field: end devices borrow
    /// their parent's CID since they hold none.
    fn source_cid(&self, ident: &Identity) -> u8 {
        if ident.is_end_device() {
            ident.parent_cid
        } else {
            ident.cid
        }
    }

    fn parent_of_device(&self, edid: Edid) -> Option<u8> {
        match &self.role {
            RoleState::Pan(pan) => pan.devices.parent_of(edid),
            _ => None,
        }
    }

    /// Whether a frame for `edid` terminates at one of our direct end-device
    /// children rather than at this coordinator itself.
    fn is_for_descendant(&self, ident: &Identity, edid: Edid) -> bool {
        if edid.is_zero() || edid.is_broadcast() || edid == ident.edid {
            return false;
        }
        match &self.role {
            // the PAN checks its table: only its own children are delivered
            // directly, everything else keeps routing
            RoleState::Pan(pan) => pan.devices.parent_of(edid) == Some(CID_PAN),
            _ => true,
        }
    }

    fn queue_data(&mut self, kind: MsgType, src_edid: Edid, body: &[u8]) {
        let device_type = match &self.role {
            RoleState::Pan(pan) => pan.devices.device_type_byte(src_edid),
            _ => 0,
        };
        self.pending_rx.push(ReceivedMessage {
            kind,
            device_type,
            src_edid,
            payload: body.to_vec(),
        });
    }

    /// Serializes and transmits one network frame, choosing the link
    /// destination from the routing rules.
    fn send_frame<R: Radio>(
        &mut self,
        link: &mut LinkLayer,
        radio: &mut R,
        ident: &Identity,
        header: &NetHeader,
        body: &[u8],
        transfer: TransferType,
    ) -> bool {
        let frame = build_frame(header, body);
        if frame.len() > MAX_LINK_PAYLOAD_SIZE {
            return false;
        }

        if transfer == TransferType::Broadcast
            || header.ext == Some(ExtType::MoveRequest)
            || header.ext == Some(ExtType::PairModeEnabled)
        {
            link.send_broadcast(radio, ident, &frame);
            return true;
        }

        if ident.is_end_device() {
            // an end device's only hop is its parent
            return link
                .send(radio, ident, Addr::Coord(ident.parent_cid), &frame, transfer)
                .is_ok();
        }

        // frames for one of our own end-device children skip the tree walk,
        // except the *_ROUTE responses which must reach the parent first
        let route_conversion = header.msg_type == MsgType::JoinResponseRoute
            || header.ext == Some(ExtType::MoveResponseRoute);
        if !route_conversion && self.is_for_descendant(ident, header.dst_edid) {
            return link
                .send(
                    radio,
                    ident,
                    Addr::EndDevice(header.dst_edid),
                    &frame,
                    transfer,
                )
                .is_ok();
        }

        let hop = self
            .tree
            .next_hop(ident.cid, ident.parent_cid, cid_mask(header.dst_cid));
        if hop == CID_INVALID {
            debug!("net: no route toward {}", cid_mask(header.dst_cid));
            return false;
        }
        link.send(radio, ident, Addr::Coord(hop), &frame, transfer)
            .is_ok()
    }
}

/// Serializes a network header plus body into one link payload.
fn build_frame(header: &NetHeader, body: &[u8]) -> Vec<u8> {
    let mut buf = vec![0; header.wire_size() + body.len()];
    let mut writer = ByteWriter::new(&mut buf);
    header.to_bytes(&mut writer).unwrap();
    writer.write_slice(body).unwrap();
    buf
}
