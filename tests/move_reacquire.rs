//! Parent reacquisition after link failure.
//!
//! A coordinator whose handshakes toward its parent die broadcasts a move
//! request; neighbours relay it to the PAN with the signal strength they
//! measured, and the strongest one is elected as the new parent.

mod common;

use common::{coordinator_node, pan_node, Air};
use fitp::link::addr::Edid;
use fitp::net::device_table::DeviceRecord;

const NID: [u8; 4] = [0xa1, 0x00, 0x00, 0x03];
const PAN: usize = 0;
const C1: usize = 1;
const C2: usize = 2;
const C3: usize = 3;
const C5: usize = 4;

fn coordinator_record(edid: [u8; 4], cid: u8, parent: u8) -> DeviceRecord {
    DeviceRecord {
        edid: Edid::new(edid),
        cid,
        parent_cid: parent,
        sleepy: false,
        coordinator: true,
    }
}

fn fabric() -> Air {
    let pan = pan_node("move", NID, [0xed, 0, 0, 1]);
    let c1 = coordinator_node(NID, [0xc0, 0, 0, 1], 1, 0);
    let c2 = coordinator_node(NID, [0xc0, 0, 0, 2], 2, 0);
    let c3 = coordinator_node(NID, [0xc0, 0, 0, 3], 3, 0);
    let c5 = coordinator_node(NID, [0xc0, 0, 0, 5], 5, 1);
    let mut air = Air::new(vec![pan, c1, c2, c3, c5]);

    for record in [
        coordinator_record([0xc0, 0, 0, 1], 1, 0),
        coordinator_record([0xc0, 0, 0, 2], 2, 0),
        coordinator_record([0xc0, 0, 0, 3], 3, 0),
        coordinator_record([0xc0, 0, 0, 5], 5, 1),
    ]
    .iter()
    {
        assert!(air.nodes[PAN].stack.add_device(*record));
        air.pump();
    }
    air
}

#[test]
fn strongest_neighbour_becomes_the_new_parent() {
    let mut air = fabric();

    // rssi as measured by each potential parent when the request arrives
    air.nodes[PAN].radio.set_rssi(10);
    air.nodes[C2].radio.set_rssi(40);
    air.nodes[C3].radio.set_rssi(55);

    // the old parent disappears
    air.nodes[C1].radio.detach();

    // an upward send now exhausts its retries
    assert!(air.nodes[C5].stack.send(0, Edid::ZERO, b"up"));
    air.ticks(C5, 9);
    assert!(air.nodes[C5].stack.net().is_rebuilding());

    // the PAN holds its answer until the move election window passes
    air.ticks(PAN, 5);
    assert!(air.nodes[C5].stack.net().is_rebuilding());
    air.ticks(PAN, 60);

    let ident = air.nodes[C5].stack.identity();
    assert_eq!(ident.parent_cid, 3);
    assert!(!air.nodes[C5].stack.net().is_rebuilding());
    assert_eq!(air.nodes[C5].stack.net().tree().parent_of(5), Some(3));

    // the device table follows the move
    let devices = air.nodes[PAN].stack.net().devices().unwrap();
    assert_eq!(
        devices.find(Edid::new([0xc0, 0, 0, 5])).unwrap().parent_cid,
        3
    );
}

#[test]
fn unanswered_move_request_is_rebroadcast() {
    let mut air = fabric();
    // nobody is listening at all
    for index in [PAN, C1, C2, C3].iter() {
        air.nodes[*index].radio.detach();
    }

    assert!(air.nodes[C5].stack.send(0, Edid::ZERO, b"up"));
    air.ticks(C5, 9);
    assert!(air.nodes[C5].stack.net().is_rebuilding());

    // the retry fires after the move timeout elapses
    let quiet = air.nodes[C5].radio.take_sent();
    assert!(quiet.is_empty());
    air.nodes[C5].ticks(40);
    let frames = air.nodes[C5].radio.take_sent();
    assert!(
        frames
            .iter()
            .any(|f| f[0] & 0x0f == 0x02 && f.len() > 20 && f[20] == 0x30),
        "expected a re-broadcast move request"
    );
}

#[test]
fn moving_device_refuses_new_traffic() {
    let mut air = fabric();
    air.nodes[C1].radio.detach();

    assert!(air.nodes[C5].stack.send(0, Edid::ZERO, b"up"));
    air.ticks(C5, 9);
    assert!(air.nodes[C5].stack.net().is_rebuilding());

    // nothing may be committed against a stale parent
    assert!(!air.nodes[C5].stack.send(0, Edid::ZERO, b"more"));
}
