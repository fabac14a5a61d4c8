//! Enrollment: the channel sweep, the PAN election, and eviction.

mod common;

use common::{joiner_node, pan_node, Air};
use fitp::link::addr::Edid;
use fitp::net::device_table::DeviceType;
use fitp::net::frame::MsgType;
use fitp::phy::Radio;

const NID: [u8; 4] = [0xa1, 0x00, 0x00, 0x03];
const PAN: usize = 0;
const ED: usize = 1;

fn fabric_with_joiner() -> Air {
    let mut pan = pan_node("join", NID, [0xed, 0, 0, 1]);
    pan.stack.radio_mut().set_channel(5).unwrap();
    let joiner = joiner_node([0x01, 0x02, 0x03, 0x04], false);
    Air::new(vec![pan, joiner])
}

/// Drives the joiner's channel sweep synchronously: emit, listen, move on.
fn sweep(air: &mut Air) -> bool {
    air.nodes[ED].stack.begin_join();
    for channel in 0..=31 {
        air.nodes[ED]
            .stack
            .radio_mut()
            .set_channel(channel)
            .unwrap();
        air.nodes[ED].stack.emit_join_request();
        air.pump();
        if air.nodes[ED].stack.ack_join_seen() {
            return true;
        }
    }
    false
}

#[test]
fn join_request_wire_shape() {
    let mut air = fabric_with_joiner();
    air.nodes[ED].stack.begin_join();
    air.nodes[ED].stack.emit_join_request();
    let frames = air.nodes[ED].radio.take_sent();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    // DATA with the join-request transfer type, sent as an end device
    assert_eq!(frame[0], 0b00_0_1_0011);
    // network part: type, device type READY_ED, zero filler, the EDID
    assert_eq!(
        &frame[10..],
        &[0x30, 0x00, 0, 0, 0, 0, 0x01, 0x02, 0x03, 0x04]
    );
}

#[test]
fn end_device_joins_the_pan() {
    let mut air = fabric_with_joiner();
    air.nodes[PAN].stack.joining_enable(2);
    air.pump();

    // the sweep stops on the PAN's channel once ACK_JOIN arrives
    assert!(sweep(&mut air));
    assert_eq!(air.nodes[ED].stack.radio_mut().channel(), 5);

    // the join surfaced on the host queue
    assert!(air.nodes[PAN]
        .messages
        .iter()
        .any(|m| m.kind == MsgType::JoinRequest && m.src_edid == Edid::new([1, 2, 3, 4])));

    // the PAN answers only after the election window
    air.ticks(PAN, 10);
    assert!(!air.nodes[ED].stack.joined());
    air.ticks(PAN, 35);

    let ident = air.nodes[ED].stack.identity();
    assert_eq!(ident.nid.raw(), &NID);
    assert_eq!(ident.parent_cid, 0);
    assert_eq!(ident.cid, 0);
    assert!(air.nodes[ED].stack.joined());

    let list = air.nodes[PAN].stack.device_list();
    assert_eq!(
        list.get(&0x0102_0304),
        Some(&DeviceType::EndDevice)
    );
}

#[test]
fn join_outside_pair_mode_is_ignored() {
    let mut air = fabric_with_joiner();
    assert!(!sweep(&mut air));
    assert!(!air.nodes[ED].stack.joined());
    assert!(air.nodes[PAN].stack.device_list().is_empty());
}

#[test]
fn accepted_device_commits_without_waiting() {
    let mut air = fabric_with_joiner();
    // a long window would normally hold the answer back
    air.nodes[PAN].stack.joining_enable(10);
    air.pump();
    assert!(sweep(&mut air));

    air.nodes[PAN]
        .stack
        .accepted_device(Edid::new([1, 2, 3, 4]));
    air.ticks(PAN, 1);
    assert!(air.nodes[ED].stack.joined());
}

#[test]
fn unpair_evicts_and_notifies() {
    let mut air = fabric_with_joiner();
    air.nodes[PAN].stack.joining_enable(2);
    air.pump();
    assert!(sweep(&mut air));
    air.ticks(PAN, 45);
    assert!(air.nodes[ED].stack.joined());

    assert!(air.nodes[PAN].stack.unpair(Edid::new([1, 2, 3, 4])));
    air.pump();

    assert!(air.nodes[PAN].stack.device_list().is_empty());
    // the eviction notice cleared the device's enrollment
    assert!(!air.nodes[ED].stack.joined());
    assert!(!air.nodes[PAN].stack.unpair(Edid::new([1, 2, 3, 4])));
}
