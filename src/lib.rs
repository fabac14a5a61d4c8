//! A tree-routed low-power wireless mesh networking stack.
//!
//! The fabric is a personal area network with a single **PAN coordinator**
//! at the root of a routing tree, intermediate **coordinators** that forward
//! traffic, and **end devices** at the leaves (always-on or sleepy). The
//! crate implements the two protocol layers above the radio:
//!
//! * The [`link`] layer provides reliable hop-by-hop delivery through a
//!   four-way handshake (DATA, ACK, COMMIT, COMMIT_ACK) with per-peer
//!   buffering, retry, and congestion signalling, plus the out-of-band
//!   channel-sweeping enrollment exchange.
//! * The [`net`] layer routes frames along the tree, orchestrates device
//!   enrollment (JOIN) and parent reacquisition (MOVE) on the PAN,
//!   disseminates routing tables in fragments, and defers delivery to
//!   sleepy end devices through a mailbox.
//!
//! The physical layer is an external collaborator behind the
//! [`phy::Radio`] trait: it sends frames with clear-channel assessment on
//! the current channel and hands received frames (and a 50 ms timer tick)
//! upward.
//!
//! # Using the stack
//!
//! Implement [`phy::Radio`] for your transceiver, then start a
//! [`stack::Fabric`]:
//!
//! ```no_run
//! use fitp::config::{DeviceKind, LinkConfig, StackConfig};
//! use fitp::link::addr::Edid;
//! use fitp::phy::PhyConfig;
//! use fitp::stack::Fabric;
//! # struct MyRadio;
//! # impl fitp::phy::Radio for MyRadio {
//! #     fn send(&mut self, _: &[u8]) {}
//! #     fn set_channel(&mut self, _: u8) -> Result<(), fitp::Error> { Ok(()) }
//! #     fn channel(&self) -> u8 { 0 }
//! #     fn set_band(&mut self, _: fitp::phy::Band) -> Result<(), fitp::Error> { Ok(()) }
//! #     fn set_bitrate(&mut self, _: fitp::phy::Bitrate) -> Result<(), fitp::Error> { Ok(()) }
//! #     fn set_power(&mut self, _: fitp::phy::TxPower) -> Result<(), fitp::Error> { Ok(()) }
//! #     fn measured_rssi(&self) -> u8 { 0 }
//! # }
//!
//! let config = StackConfig::new(DeviceKind::EndDevice, Edid::new([1, 2, 3, 4]));
//! let fabric = Fabric::init(MyRadio, PhyConfig::default(), config, LinkConfig::default());
//! if fabric.join() {
//!     fabric.send(0, Edid::ZERO, b"hi");
//! }
//! ```
//!
//! Frames received by the radio are handed to [`stack::Fabric::on_frame`];
//! the application drains upward traffic with
//! [`stack::Fabric::received_data`].

pub mod bytes;
pub mod config;
mod error;
pub mod link;
pub mod net;
pub mod phy;
pub mod stack;
pub mod time;

pub use self::error::Error;
