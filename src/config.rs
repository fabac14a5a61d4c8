//! Stack configuration and device identity.

use crate::link::addr::{Edid, Nid, CID_INVALID, CID_PAN};
use std::path::PathBuf;

/// Default location of the PAN coordinator's persisted device table.
pub const DEFAULT_DEVICE_TABLE_PATH: &str = "/tmp/fitprotocold.devices";

/// Link-layer parameters supplied at stack initialization.
#[derive(Copy, Clone, Debug)]
pub struct LinkConfig {
    /// Maximum number of retransmissions per handshake leg before the
    /// transfer is declared failed.
    pub tx_max_retries: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig { tx_max_retries: 3 }
    }
}

/// The role a device plays in the fabric.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    /// The unique root of the tree; owns the device table and all routing
    /// authority.
    Pan,

    /// A routing node that may accept children.
    Coordinator,

    /// A leaf. Sleepy end devices additionally only receive data in response
    /// to their own data requests.
    EndDevice,
}

/// Per-device parameters supplied at stack initialization.
#[derive(Clone, Debug)]
pub struct StackConfig {
    pub kind: DeviceKind,

    /// The device's globally unique identifier.
    pub edid: Edid,

    /// Fabric identifier. Mandatory on the PAN (it defines the fabric);
    /// joiners acquire it through enrollment.
    pub nid: Nid,

    /// Whether this end device is sleepy (ignored for coordinators).
    pub sleepy: bool,

    /// A previously assigned coordinator CID to restore, so enrollment
    /// survives restarts without re-joining.
    pub cid: Option<u8>,

    /// A previously learned parent CID to restore.
    pub parent_cid: Option<u8>,

    /// Where the PAN persists its device table.
    pub device_table_path: PathBuf,
}

impl StackConfig {
    pub fn new(kind: DeviceKind, edid: Edid) -> Self {
        StackConfig {
            kind,
            edid,
            nid: Nid::UNSET,
            sleepy: false,
            cid: None,
            parent_cid: None,
            device_table_path: PathBuf::from(DEFAULT_DEVICE_TABLE_PATH),
        }
    }
}

/// The mutable identity of a running stack.
///
/// Joining and moving rewrite parts of this: a successful JOIN adopts the
/// fabric NID, the parent CID and (for coordinators) the assigned CID; a
/// successful MOVE adopts a new parent CID.
#[derive(Clone, Debug)]
pub struct Identity {
    pub kind: DeviceKind,
    pub edid: Edid,
    pub nid: Nid,
    pub cid: u8,
    pub parent_cid: u8,
    pub sleepy: bool,
}

impl Identity {
    pub fn from_config(config: &StackConfig) -> Self {
        let (cid, parent_cid) = match config.kind {
            // the PAN is self-parented at the tree root
            DeviceKind::Pan => (CID_PAN, CID_PAN),
            DeviceKind::Coordinator => (
                config.cid.unwrap_or(CID_INVALID),
                config.parent_cid.unwrap_or(CID_PAN),
            ),
            DeviceKind::EndDevice => (CID_PAN, config.parent_cid.unwrap_or(CID_PAN)),
        };
        Identity {
            kind: config.kind,
            edid: config.edid,
            nid: config.nid,
            cid,
            parent_cid,
            sleepy: config.kind == DeviceKind::EndDevice && config.sleepy,
        }
    }

    pub fn is_pan(&self) -> bool {
        self.kind == DeviceKind::Pan
    }

    pub fn is_end_device(&self) -> bool {
        self.kind == DeviceKind::EndDevice
    }

    /// The wire value describing this device in a JOIN request.
    pub fn device_type_byte(&self) -> u8 {
        use crate::net::frame::{DEVICE_TYPE_COORD, DEVICE_TYPE_READY_ED, DEVICE_TYPE_SLEEPY_ED};
        match self.kind {
            DeviceKind::Pan | DeviceKind::Coordinator => DEVICE_TYPE_COORD,
            DeviceKind::EndDevice if self.sleepy => DEVICE_TYPE_SLEEPY_ED,
            DeviceKind::EndDevice => DEVICE_TYPE_READY_ED,
        }
    }
}
