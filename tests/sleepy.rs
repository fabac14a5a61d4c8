//! Deferred delivery to sleepy end devices.

mod common;

use common::{end_device_node, pan_node, Air};
use fitp::link::addr::Edid;
use fitp::net::frame::MsgType;
use fitp::net::device_table::DeviceRecord;
use fitp::net::DrState;

const NID: [u8; 4] = [0xa1, 0x00, 0x00, 0x03];
const PAN: usize = 0;
const ED: usize = 1;
const SLEEPY_EDID: [u8; 4] = [0xaa, 0xbb, 0xcc, 0xdd];

fn fabric() -> Air {
    let pan = pan_node("sleepy", NID, [0xed, 0, 0, 1]);
    let ed = end_device_node(NID, SLEEPY_EDID, 0, true);
    let mut air = Air::new(vec![pan, ed]);
    assert!(air.nodes[PAN].stack.add_device(DeviceRecord {
        edid: Edid::new(SLEEPY_EDID),
        cid: 0,
        parent_cid: 0,
        sleepy: true,
        coordinator: false,
    }));
    air.pump();
    air
}

#[test]
fn send_to_sleepy_parks_in_the_mailbox() {
    let mut air = fabric();

    // parking the payload involves no radio traffic at all
    assert!(air.nodes[PAN]
        .stack
        .send(0, Edid::new(SLEEPY_EDID), &[10, 20, 30]));
    assert!(air.nodes[PAN].radio.sent_is_empty());
}

#[test]
fn data_request_fetches_the_parked_payload() {
    let mut air = fabric();
    assert!(air.nodes[PAN]
        .stack
        .send(0, Edid::new(SLEEPY_EDID), &[10, 20, 30]));

    // the device wakes and asks; the WAIT acknowledgement arrives at once
    assert!(air.nodes[ED].stack.send(0, Edid::ZERO, b"awake"));
    air.pump();
    assert_eq!(air.nodes[ED].stack.dr_state(), DrState::DataWaiting);

    // the deferred data follows on the next tick
    air.ticks(PAN, 2);
    assert_eq!(air.nodes[ED].stack.dr_state(), DrState::DataReceived);
    let data: Vec<_> = air.nodes[ED]
        .messages
        .iter()
        .filter(|m| m.kind == MsgType::Data)
        .collect();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].payload, [10, 20, 30]);

    // the request itself surfaced on the PAN's host queue
    assert!(air.nodes[PAN]
        .messages
        .iter()
        .any(|m| m.kind == MsgType::DataDr && m.payload == b"awake"));

    // the mailbox entry is gone: the next request is answered with SLEEP
    assert!(air.nodes[ED].stack.send(0, Edid::ZERO, b"again"));
    air.pump();
    assert_eq!(air.nodes[ED].stack.dr_state(), DrState::GoSleep);
}

#[test]
fn newer_mailbox_entry_wins() {
    let mut air = fabric();
    assert!(air.nodes[PAN]
        .stack
        .send(0, Edid::new(SLEEPY_EDID), &[1, 1, 1]));
    assert!(air.nodes[PAN]
        .stack
        .send(0, Edid::new(SLEEPY_EDID), &[9, 9]));

    assert!(air.nodes[ED].stack.send(0, Edid::ZERO, b"dr"));
    air.pump();
    air.ticks(PAN, 2);

    let data: Vec<_> = air.nodes[ED]
        .messages
        .iter()
        .filter(|m| m.kind == MsgType::Data)
        .collect();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].payload, [9, 9]);
}

#[test]
fn empty_mailbox_sends_the_device_back_to_sleep() {
    let mut air = fabric();

    assert!(air.nodes[ED].stack.send(0, Edid::ZERO, b"dr"));
    air.pump();
    assert_eq!(air.nodes[ED].stack.dr_state(), DrState::GoSleep);
}
