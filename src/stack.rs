//! Stack composition and the threaded host runtime.
//!
//! [`Stack`] wires the three layers together without any concurrency: frames
//! go in through [`Stack::on_frame`], ticks through [`Stack::on_tick`], and
//! application messages come back out. It is directly usable (and tested)
//! as a deterministic state machine.
//!
//! [`Fabric`] wraps a stack for real deployments: a timer thread drives the
//! 50 ms tick, the radio's receive path calls [`Fabric::on_frame`], and the
//! host-facing calls ([`Fabric::send`], [`Fabric::join`],
//! [`Fabric::received_data`], ...) block the calling thread where the
//! protocol requires waiting. A single stack-wide mutex serializes the
//! frame, timer and host paths; the received-message queue has its own lock
//! and condition variable so consumers never contend with the radio.

use crate::config::{Identity, LinkConfig, StackConfig};
use crate::link::addr::{Edid, CID_BROADCAST, CID_PAN};
use crate::link::{LinkLayer, MAX_CHANNEL};
use crate::net::device_table::{DeviceRecord, DeviceType};
use crate::net::{DrState, NetLayer, ReceivedMessage};
use crate::net::{MAX_DR_ACK_DELAY_MS, MAX_DR_DATA_DELAY_MS};
use crate::phy::{PhyConfig, Radio};
use crate::time::TICK_MILLIS;
use log::{debug, info};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// Polling granule for the blocking join wait.
const JOIN_POLL_MS: u64 = 50;

/// Join response wait, in 50 ms granules (~2 s).
const MAX_JOIN_DELAY: u32 = 40;

/// Dwell time per channel during the join sweep.
const JOIN_SWEEP_DWELL_MS: u64 = 25;

/// Polling granule for the sleepy data-request wait.
const DR_POLL_MS: u64 = 10;

/// Timeout of one blocking [`Fabric::received_data`] call.
const RECEIVE_WAIT: Duration = Duration::from_secs(5);

/// The three protocol layers composed into one deterministic state machine.
pub struct Stack<R: Radio> {
    radio: R,
    ident: Identity,
    link: LinkLayer,
    net: NetLayer,
}

impl<R: Radio> Stack<R> {
    pub fn new(
        mut radio: R,
        phy_config: &PhyConfig,
        config: &StackConfig,
        link_config: &LinkConfig,
    ) -> Self {
        let _ = radio.set_band(phy_config.band);
        let _ = radio.set_bitrate(phy_config.bitrate);
        let _ = radio.set_power(phy_config.power);
        let _ = radio.set_channel(phy_config.channel);
        let ident = Identity::from_config(config);
        info!(
            "stack: starting as {:?} ({:?}, {:?})",
            ident.kind, ident.edid, ident.nid
        );
        Stack {
            radio,
            ident,
            link: LinkLayer::new(config.kind, link_config),
            net: NetLayer::new(config),
        }
    }

    /// Feeds one received frame through the link and network layers.
    /// Returns the application messages this frame produced.
    pub fn on_frame(&mut self, raw: &[u8]) -> Vec<ReceivedMessage> {
        let events = self
            .link
            .process_frame(&mut self.radio, &self.ident, &self.net.filter(), raw);
        for event in events {
            self.net
                .handle_event(&mut self.link, &mut self.radio, &mut self.ident, event);
        }
        self.net.drain_received()
    }

    /// Advances both layer timers by one 50 ms tick.
    pub fn on_tick(&mut self) -> Vec<ReceivedMessage> {
        let events = self.link.on_tick(&mut self.radio, &self.ident);
        for event in events {
            self.net
                .handle_event(&mut self.link, &mut self.radio, &mut self.ident, event);
        }
        self.net
            .on_tick(&mut self.link, &mut self.radio, &mut self.ident);
        self.net.drain_received()
    }

    /// Routes or parks one application payload.
    pub fn send(&mut self, to_cid: u8, to_edid: Edid, data: &[u8]) -> bool {
        // addressing a coordinator leaves the end-device field unused
        let to_edid = if to_cid != CID_PAN && to_cid != CID_BROADCAST {
            Edid::ZERO
        } else {
            to_edid
        };
        self.net.send_data(
            &mut self.link,
            &mut self.radio,
            &self.ident,
            to_cid,
            to_edid,
            data,
        )
    }

    pub fn joined(&self) -> bool {
        !self.net.waiting_join_response() && !self.ident.nid.is_unset()
    }

    pub fn identity(&self) -> &Identity {
        &self.ident
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn net(&self) -> &NetLayer {
        &self.net
    }

    pub fn dr_state(&self) -> DrState {
        self.net.dr_state()
    }

    /// Marks the start of a join attempt and emits the join request on the
    /// currently selected channel.
    pub fn emit_join_request(&mut self) {
        let payload = self.net.build_join_request(&self.ident);
        self.link
            .send_join_request(&mut self.radio, &self.ident, &payload);
    }

    pub fn begin_join(&mut self) {
        self.link.begin_join();
        self.net.set_waiting_join_response(true);
    }

    pub fn abort_join(&mut self) {
        self.net.set_waiting_join_response(false);
    }

    pub fn waiting_join_response(&self) -> bool {
        self.net.waiting_join_response()
    }

    pub fn ack_join_seen(&self) -> bool {
        self.link.ack_join_seen()
    }

    pub fn joining_enable(&mut self, timeout_secs: u8) {
        let ident = self.ident.clone();
        self.net
            .joining_enable(&mut self.link, &mut self.radio, &ident, timeout_secs);
    }

    pub fn joining_disable(&mut self) {
        self.net.joining_disable();
    }

    pub fn unpair(&mut self, edid: Edid) -> bool {
        let ident = self.ident.clone();
        self.net
            .unpair(&mut self.link, &mut self.radio, &ident, edid)
    }

    pub fn accepted_device(&mut self, edid: Edid) -> bool {
        self.net.accepted_device(edid)
    }

    pub fn device_list(&self) -> BTreeMap<u64, DeviceType> {
        self.net.device_list()
    }

    /// PAN provisioning: enrolls a device without the join exchange.
    pub fn add_device(&mut self, record: DeviceRecord) -> bool {
        let ident = self.ident.clone();
        self.net
            .add_device(&mut self.link, &mut self.radio, &ident, record)
    }

    pub fn set_nid(&mut self, nid: u32) {
        self.ident.nid = crate::link::addr::Nid::from_u32_le(nid);
    }

    pub fn set_config_path(&mut self, path: PathBuf) {
        self.net.set_device_table_path(path);
    }

    pub fn measured_noise(&self) -> u8 {
        self.radio.measured_rssi()
    }

    fn reset_dr_state(&mut self) {
        self.net.reset_dr_state();
    }
}

struct RxQueue {
    messages: Mutex<VecDeque<ReceivedMessage>>,
    available: Condvar,
}

impl RxQueue {
    fn push_all(&self, messages: Vec<ReceivedMessage>) {
        if messages.is_empty() {
            return;
        }
        let mut queue = self.messages.lock().unwrap();
        queue.extend(messages);
        self.available.notify_all();
    }
}

/// A running stack: the threaded, host-facing runtime.
pub struct Fabric<R: Radio + Send + 'static> {
    stack: Arc<Mutex<Stack<R>>>,
    queue: Arc<RxQueue>,
    terminate: Arc<AtomicBool>,
    timer: Option<thread::JoinHandle<()>>,
}

impl<R: Radio + Send + 'static> Fabric<R> {
    /// Initializes the stack and starts the timer thread.
    pub fn init(
        radio: R,
        phy_config: PhyConfig,
        config: StackConfig,
        link_config: LinkConfig,
    ) -> Self {
        let stack = Arc::new(Mutex::new(Stack::new(
            radio,
            &phy_config,
            &config,
            &link_config,
        )));
        let queue = Arc::new(RxQueue {
            messages: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        });
        let terminate = Arc::new(AtomicBool::new(false));

        let timer = {
            let stack = Arc::clone(&stack);
            let queue = Arc::clone(&queue);
            let terminate = Arc::clone(&terminate);
            thread::Builder::new()
                .name("fitp-timer".into())
                .spawn(move || {
                    while !terminate.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(TICK_MILLIS));
                        if terminate.load(Ordering::Relaxed) {
                            break;
                        }
                        let messages = stack.lock().unwrap().on_tick();
                        queue.push_all(messages);
                    }
                })
                .expect("failed to spawn timer thread")
        };

        Fabric {
            stack,
            queue,
            terminate,
            timer: Some(timer),
        }
    }

    /// Entry point for the radio's receive path.
    pub fn on_frame(&self, raw: &[u8]) {
        let messages = self.stack.lock().unwrap().on_frame(raw);
        self.queue.push_all(messages);
    }

    /// Routes or parks one application payload. For a sleepy sender this
    /// blocks through the data-request exchange; everywhere else it returns
    /// as soon as the frame is accepted for transmission.
    pub fn send(&self, to_cid: u8, to_edid: Edid, data: &[u8]) -> bool {
        let dr_started = {
            let mut stack = self.stack.lock().unwrap();
            let accepted = stack.send(to_cid, to_edid, data);
            if !accepted {
                return false;
            }
            // a sleepy sender's unicast turned into a data request
            stack.dr_state() == DrState::AckWaiting
        };
        if !dr_started {
            return true;
        }

        // a sleepy sender walks the data-request state machine:
        // ACK_WAITING -> {DATA_WAITING | GO_SLEEP | DATA_RECEIVED}
        let mut waited = 0;
        while waited < MAX_DR_ACK_DELAY_MS {
            if self.stack.lock().unwrap().dr_state() != DrState::AckWaiting {
                break;
            }
            thread::sleep(Duration::from_millis(DR_POLL_MS));
            waited += DR_POLL_MS;
        }
        let state = self.stack.lock().unwrap().dr_state();
        match state {
            DrState::AckWaiting => {
                debug!("fabric: data request unanswered");
                self.stack.lock().unwrap().reset_dr_state();
                return false;
            }
            DrState::GoSleep | DrState::DataReceived => {
                self.stack.lock().unwrap().reset_dr_state();
                return true;
            }
            DrState::DataWaiting | DrState::Idle => {}
        }

        let mut waited = 0;
        while waited < MAX_DR_DATA_DELAY_MS {
            if self.stack.lock().unwrap().dr_state() == DrState::DataReceived {
                self.stack.lock().unwrap().reset_dr_state();
                return true;
            }
            thread::sleep(Duration::from_millis(DR_POLL_MS));
            waited += DR_POLL_MS;
        }
        debug!("fabric: deferred data never arrived");
        self.stack.lock().unwrap().reset_dr_state();
        false
    }

    /// Joins a fabric: sweeps all channels with join requests, then waits
    /// for the PAN's (relayed) response. Returns whether enrollment
    /// succeeded; on success the radio stays on the fabric's channel.
    pub fn join(&self) -> bool {
        let original_channel = {
            let mut stack = self.stack.lock().unwrap();
            if stack.waiting_join_response() {
                return false;
            }
            stack.begin_join();
            stack.radio_mut().channel()
        };

        let mut acknowledged = false;
        for channel in 0..=MAX_CHANNEL {
            {
                let mut stack = self.stack.lock().unwrap();
                if stack.radio_mut().set_channel(channel).is_err() {
                    break;
                }
                stack.emit_join_request();
            }
            thread::sleep(Duration::from_millis(JOIN_SWEEP_DWELL_MS));
            if self.stack.lock().unwrap().ack_join_seen() {
                acknowledged = true;
                break;
            }
        }

        if !acknowledged {
            let mut stack = self.stack.lock().unwrap();
            let _ = stack.radio_mut().set_channel(original_channel);
            stack.abort_join();
            debug!("fabric: no coordinator acknowledged the join request");
            return false;
        }

        for _ in 0..MAX_JOIN_DELAY {
            thread::sleep(Duration::from_millis(JOIN_POLL_MS));
            if !self.stack.lock().unwrap().waiting_join_response() {
                return true;
            }
        }
        self.stack.lock().unwrap().abort_join();
        debug!("fabric: join response never arrived");
        false
    }

    pub fn joined(&self) -> bool {
        self.stack.lock().unwrap().joined()
    }

    /// PAN only: opens pair mode for `timeout_secs` seconds.
    pub fn joining_enable(&self, timeout_secs: u8) {
        self.stack.lock().unwrap().joining_enable(timeout_secs);
    }

    pub fn joining_disable(&self) {
        self.stack.lock().unwrap().joining_disable();
    }

    /// Host alias for [`Fabric::joining_enable`].
    pub fn listen(&self, timeout_secs: u8) {
        self.joining_enable(timeout_secs);
    }

    /// PAN only: evicts a device and rebuilds the routing state.
    pub fn unpair(&self, edid: u32) -> bool {
        self.stack.lock().unwrap().unpair(Edid::from_u32(edid))
    }

    /// PAN only: commits a pending join candidate immediately.
    pub fn accepted_device(&self, edid: Edid) {
        self.stack.lock().unwrap().accepted_device(edid);
    }

    /// Blocks up to five seconds for one upward-delivered message and
    /// appends its host encoding (`[msg_type, device_type, src_edid(4),
    /// payload...]`) to `out`.
    pub fn received_data(&self, out: &mut Vec<u8>) -> bool {
        let mut queue = self.queue.messages.lock().unwrap();
        if queue.is_empty() {
            let (guard, _) = self
                .queue
                .available
                .wait_timeout(queue, RECEIVE_WAIT)
                .unwrap();
            queue = guard;
        }
        match queue.pop_front() {
            Some(message) => {
                out.extend_from_slice(&message.to_host_bytes());
                true
            }
            None => false,
        }
    }

    /// PAN only: the enrolled devices keyed by numeric EDID.
    pub fn device_list(&self) -> BTreeMap<u64, DeviceType> {
        self.stack.lock().unwrap().device_list()
    }

    /// PAN provisioning: enrolls a device without the join exchange.
    pub fn add_device(&self, record: DeviceRecord) -> bool {
        self.stack.lock().unwrap().add_device(record)
    }

    pub fn set_nid(&self, nid: u32) {
        self.stack.lock().unwrap().set_nid(nid);
    }

    pub fn set_config_path(&self, path: PathBuf) {
        self.stack.lock().unwrap().set_config_path(path);
    }

    /// Signal strength of the most recent received frame.
    pub fn measured_noise(&self) -> f64 {
        f64::from(self.stack.lock().unwrap().measured_noise())
    }

    /// Stops the timer thread and shuts the radio down.
    pub fn stop(mut self) {
        self.terminate.store(true, Ordering::Relaxed);
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        self.stack.lock().unwrap().radio_mut().stop();
    }
}

impl<R: Radio + Send + 'static> Drop for Fabric<R> {
    fn drop(&mut self) {
        self.terminate.store(true, Ordering::Relaxed);
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }
}
