//! Shared test harness: a scripted radio and a broadcast "air" that shuttles
//! frames between stacks on matching channels.

use fitp::config::{DeviceKind, LinkConfig, StackConfig};
use fitp::link::addr::{Edid, Nid};
use fitp::net::ReceivedMessage;
use fitp::phy::{Band, Bitrate, PhyConfig, Radio, TxPower};
use fitp::stack::Stack;
use fitp::Error;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct RadioState {
    pub sent: Vec<Vec<u8>>,
    pub channel: u8,
    pub rssi: u8,
}

/// A radio that records every transmitted frame for the harness to shuttle.
#[derive(Clone)]
pub struct TestRadio(pub Arc<Mutex<RadioState>>);

impl TestRadio {
    pub fn new() -> Self {
        TestRadio(Arc::new(Mutex::new(RadioState::default())))
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.0.lock().unwrap().sent)
    }

    pub fn sent_is_empty(&self) -> bool {
        self.0.lock().unwrap().sent.is_empty()
    }

    pub fn set_rssi(&self, rssi: u8) {
        self.0.lock().unwrap().rssi = rssi;
    }

    /// Moves the radio out of every other node's earshot.
    pub fn detach(&self) {
        self.0.lock().unwrap().channel = 0xfe;
    }
}

impl Radio for TestRadio {
    fn send(&mut self, buf: &[u8]) {
        self.0.lock().unwrap().sent.push(buf.to_vec());
    }

    fn set_channel(&mut self, channel: u8) -> Result<(), Error> {
        if channel > 31 {
            return Err(Error::InvalidValue);
        }
        self.0.lock().unwrap().channel = channel;
        Ok(())
    }

    fn channel(&self) -> u8 {
        self.0.lock().unwrap().channel
    }

    fn set_band(&mut self, _: Band) -> Result<(), Error> {
        Ok(())
    }

    fn set_bitrate(&mut self, _: Bitrate) -> Result<(), Error> {
        Ok(())
    }

    fn set_power(&mut self, _: TxPower) -> Result<(), Error> {
        Ok(())
    }

    fn measured_rssi(&self) -> u8 {
        self.0.lock().unwrap().rssi
    }
}

/// One device under test.
pub struct Node {
    pub stack: Stack<TestRadio>,
    pub radio: TestRadio,
    pub messages: Vec<ReceivedMessage>,
}

impl Node {
    pub fn tick(&mut self) {
        let messages = self.stack.on_tick();
        self.messages.extend(messages);
    }

    pub fn ticks(&mut self, count: u32) {
        for _ in 0..count {
            self.tick();
        }
    }
}

fn temp_table(tag: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "fitp-test-{}-{}.devices",
        tag,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    path
}

pub fn pan_node(tag: &str, nid: [u8; 4], edid: [u8; 4]) -> Node {
    let mut config = StackConfig::new(DeviceKind::Pan, Edid::new(edid));
    config.nid = Nid::new(nid);
    config.device_table_path = temp_table(tag);
    node(config)
}

pub fn coordinator_node(nid: [u8; 4], edid: [u8; 4], cid: u8, parent: u8) -> Node {
    let mut config = StackConfig::new(DeviceKind::Coordinator, Edid::new(edid));
    config.nid = Nid::new(nid);
    config.cid = Some(cid);
    config.parent_cid = Some(parent);
    node(config)
}

pub fn end_device_node(nid: [u8; 4], edid: [u8; 4], parent: u8, sleepy: bool) -> Node {
    let mut config = StackConfig::new(DeviceKind::EndDevice, Edid::new(edid));
    config.nid = Nid::new(nid);
    config.parent_cid = Some(parent);
    config.sleepy = sleepy;
    node(config)
}

pub fn joiner_node(edid: [u8; 4], sleepy: bool) -> Node {
    let mut config = StackConfig::new(DeviceKind::EndDevice, Edid::new(edid));
    config.sleepy = sleepy;
    node(config)
}

fn node(config: StackConfig) -> Node {
    let radio = TestRadio::new();
    let stack = Stack::new(
        radio.clone(),
        &PhyConfig::default(),
        &config,
        &LinkConfig { tx_max_retries: 3 },
    );
    Node {
        stack,
        radio,
        messages: Vec::new(),
    }
}

/// A perfect shared medium: every transmitted frame reaches every other node
/// listening on the same channel.
pub struct Air {
    pub nodes: Vec<Node>,
}

impl Air {
    pub fn new(nodes: Vec<Node>) -> Self {
        Air { nodes }
    }

    /// Shuttles frames until the medium is quiet.
    pub fn pump(&mut self) {
        loop {
            let mut carried = false;
            for i in 0..self.nodes.len() {
                let channel = self.nodes[i].radio.0.lock().unwrap().channel;
                let frames = self.nodes[i].radio.take_sent();
                if frames.is_empty() {
                    continue;
                }
                carried = true;
                for frame in frames {
                    for j in 0..self.nodes.len() {
                        if i == j {
                            continue;
                        }
                        if self.nodes[j].radio.0.lock().unwrap().channel != channel {
                            continue;
                        }
                        let messages = self.nodes[j].stack.on_frame(&frame);
                        self.nodes[j].messages.extend(messages);
                    }
                }
            }
            if !carried {
                return;
            }
        }
    }

    /// Ticks one node and shuttles whatever the tick transmitted.
    pub fn tick(&mut self, index: usize) {
        self.nodes[index].tick();
        self.pump();
    }

    pub fn ticks(&mut self, index: usize, count: u32) {
        for _ in 0..count {
            self.tick(index);
        }
    }
}
