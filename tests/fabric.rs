//! The threaded runtime: frame ingress, the blocking receive queue, and
//! shutdown.

mod common;

use common::{end_device_node, TestRadio};
use fitp::config::{DeviceKind, LinkConfig, StackConfig};
use fitp::link::addr::{Edid, Nid, CID_BROADCAST};
use fitp::phy::PhyConfig;
use fitp::stack::Fabric;

const NID: [u8; 4] = [0xa1, 0x00, 0x00, 0x03];

fn pan_fabric(tag: &str) -> Fabric<TestRadio> {
    let mut config = StackConfig::new(DeviceKind::Pan, Edid::new([0xed, 0, 0, 1]));
    config.nid = Nid::new(NID);
    config.device_table_path = std::env::temp_dir().join(format!(
        "fitp-fabric-{}-{}.devices",
        tag,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&config.device_table_path);
    Fabric::init(
        TestRadio::new(),
        PhyConfig::default(),
        config,
        LinkConfig::default(),
    )
}

#[test]
fn received_data_surfaces_ingress() {
    let fabric = pan_fabric("rx");

    // a broadcast from an enrolled end device, captured off its radio
    let mut ed = end_device_node(NID, [1, 2, 3, 4], 0, false);
    assert!(ed.stack.send(CID_BROADCAST, Edid::BROADCAST, b"ping"));
    for frame in ed.radio.take_sent() {
        fabric.on_frame(&frame);
    }

    let mut out = Vec::new();
    assert!(fabric.received_data(&mut out));
    // [msg_type, device_type, src_edid(4), payload...]
    assert_eq!(out[0], 0x00);
    assert_eq!(&out[2..6], &[1, 2, 3, 4]);
    assert_eq!(&out[6..], b"ping");

    fabric.stop();
}

#[test]
fn empty_queue_times_out() {
    let fabric = pan_fabric("timeout");
    let mut out = Vec::new();
    // nothing arrives; the five second wait elapses and nothing is written
    assert!(!fabric.received_data(&mut out));
    assert!(out.is_empty());
    fabric.stop();
}
