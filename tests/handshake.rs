//! End-to-end data transfers over the shared medium.

mod common;

use common::{coordinator_node, end_device_node, pan_node, Air};
use fitp::link::addr::{Edid, CID_BROADCAST};
use fitp::net::frame::MsgType;

const NID: [u8; 4] = [0xa1, 0x00, 0x00, 0x03];
const PAN: usize = 0;

#[test]
fn end_device_data_reaches_the_pan() {
    let pan = pan_node("data", NID, [0xed, 0, 0, 1]);
    let ed = end_device_node(NID, [1, 2, 3, 4], 0, false);
    let mut air = Air::new(vec![pan, ed]);

    assert!(air.nodes[1].stack.send(0, Edid::ZERO, b"hi"));
    air.pump();

    // exactly one application upcall at the receiver
    assert_eq!(air.nodes[PAN].messages.len(), 1);
    let message = &air.nodes[PAN].messages[0];
    assert_eq!(message.kind, MsgType::Data);
    assert_eq!(message.src_edid, Edid::new([1, 2, 3, 4]));
    assert_eq!(message.payload, b"hi");

    // the handshake completed: the single end-device slot is free again
    assert!(air.nodes[1].stack.send(0, Edid::ZERO, b"again"));
    air.pump();
    assert_eq!(air.nodes[PAN].messages.len(), 2);
}

#[test]
fn self_addressed_traffic_is_refused() {
    let pan = pan_node("selfsend", NID, [0xed, 0, 0, 1]);
    let ed = end_device_node(NID, [1, 2, 3, 4], 0, false);
    let mut air = Air::new(vec![pan, ed]);

    assert!(!air.nodes[1].stack.send(0, Edid::new([1, 2, 3, 4]), b"me"));
    assert!(air.nodes[1].radio.sent_is_empty());
}

#[test]
fn broadcast_reaches_every_coordinator_once() {
    let pan = pan_node("bcast", NID, [0xed, 0, 0, 1]);
    let c1 = coordinator_node(NID, [0xc0, 0, 0, 1], 1, 0);
    let c2 = coordinator_node(NID, [0xc0, 0, 0, 2], 2, 0);
    let mut air = Air::new(vec![pan, c1, c2]);

    assert!(air.nodes[PAN]
        .stack
        .send(CID_BROADCAST, Edid::BROADCAST, b"all"));
    air.pump();

    for coordinator in &air.nodes[1..] {
        let data: Vec<_> = coordinator
            .messages
            .iter()
            .filter(|m| m.kind == MsgType::Data)
            .collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].payload, b"all");
    }
}

#[test]
fn foreign_fabric_broadcast_is_ignored() {
    let pan = pan_node("foreign", NID, [0xed, 0, 0, 1]);
    let stranger = pan_node("foreign2", [0x77, 0x77, 0x77, 0x77], [0xee, 0, 0, 9]);
    let mut air = Air::new(vec![pan, stranger]);

    assert!(air.nodes[1]
        .stack
        .send(CID_BROADCAST, Edid::BROADCAST, b"psst"));
    air.pump();
    assert!(air.nodes[PAN].messages.is_empty());
}
