//! Routing table dissemination and next-hop resolution across a chain.

mod common;

use common::{coordinator_node, pan_node, Air};
use fitp::link::addr::Edid;
use fitp::net::device_table::DeviceRecord;

const NID: [u8; 4] = [0xa1, 0x00, 0x00, 0x03];
const PAN: usize = 0;
const C1: usize = 1;
const C5: usize = 2;
const C7: usize = 3;

fn coordinator_record(edid: [u8; 4], cid: u8, parent: u8) -> DeviceRecord {
    DeviceRecord {
        edid: Edid::new(edid),
        cid,
        parent_cid: parent,
        sleepy: false,
        coordinator: true,
    }
}

/// PAN -> 1 -> 5 -> 7, enrolled through the provisioning path.
fn chain() -> Air {
    let pan = pan_node("routing", NID, [0xed, 0, 0, 1]);
    let c1 = coordinator_node(NID, [0xc0, 0, 0, 1], 1, 0);
    let c5 = coordinator_node(NID, [0xc0, 0, 0, 5], 5, 1);
    let c7 = coordinator_node(NID, [0xc0, 0, 0, 7], 7, 5);
    let mut air = Air::new(vec![pan, c1, c5, c7]);

    assert!(air.nodes[PAN]
        .stack
        .add_device(coordinator_record([0xc0, 0, 0, 1], 1, 0)));
    air.pump();
    assert!(air.nodes[PAN]
        .stack
        .add_device(coordinator_record([0xc0, 0, 0, 5], 5, 1)));
    air.pump();
    assert!(air.nodes[PAN]
        .stack
        .add_device(coordinator_record([0xc0, 0, 0, 7], 7, 5)));
    air.pump();
    air
}

#[test]
fn subtrees_cascade_down_the_chain() {
    let air = chain();

    // every coordinator learned the entries below it
    let c1_tree = air.nodes[C1].stack.net().tree();
    assert_eq!(c1_tree.parent_of(5), Some(1));
    assert_eq!(c1_tree.parent_of(7), Some(5));

    let c5_tree = air.nodes[C5].stack.net().tree();
    assert_eq!(c5_tree.parent_of(7), Some(5));

    let c7_tree = air.nodes[C7].stack.net().tree();
    assert_eq!(c7_tree.parent_of(7), Some(5));
}

#[test]
fn next_hop_follows_the_tree() {
    let air = chain();

    let pan_tree = air.nodes[PAN].stack.net().tree();
    assert_eq!(pan_tree.next_hop(0, 0, 7), 1);

    let c1_tree = air.nodes[C1].stack.net().tree();
    assert_eq!(c1_tree.next_hop(1, 0, 7), 5);

    let c5_tree = air.nodes[C5].stack.net().tree();
    assert_eq!(c5_tree.next_hop(5, 1, 7), 7);
}

#[test]
fn multihop_data_descends_the_chain() {
    let mut air = chain();

    // PAN -> coordinator 7 crosses both intermediate hops
    assert!(air.nodes[PAN].stack.send(7, Edid::ZERO, b"deep"));
    air.pump();

    let received: Vec<_> = air.nodes[C7]
        .messages
        .iter()
        .filter(|m| m.payload == b"deep")
        .collect();
    assert_eq!(received.len(), 1);

    // and back up again
    assert!(air.nodes[C7].stack.send(0, Edid::ZERO, b"rsvp"));
    air.pump();
    assert!(air.nodes[PAN]
        .messages
        .iter()
        .any(|m| m.payload == b"rsvp"));
}
