//! The routing tree and its fragmented dissemination.
//!
//! Routing state is a single mapping from CID to parent CID, authoritative
//! on the PAN (derived from the device table) and replicated subtree-wise to
//! every coordinator. A coordinator therefore knows its own subtree (for
//! downward routing) and relies on its parent for everything else.

use crate::link::addr::{cid_mask, CID_INVALID, CID_PAN, MAX_COORDINATORS};
use crate::Error;
use heapless::{consts::*, Vec};

/// Maximum routing payload bytes per ROUTING_DATA fragment; larger tables
/// are segmented.
pub const MAX_ROUTING_DATA: usize = 40;

/// A `{CID, parent CID}` pair as disseminated on the wire.
pub type TreePair = (u8, u8);

/// The CID -> parent CID mapping.
#[derive(Clone, PartialEq, Eq)]
pub struct RoutingTree {
    parents: [u8; MAX_COORDINATORS],
}

impl RoutingTree {
    /// Creates an empty tree; every slot starts unoccupied.
    pub fn new() -> Self {
        RoutingTree {
            parents: [CID_INVALID; MAX_COORDINATORS],
        }
    }

    /// Creates a tree holding only the self-parented PAN root.
    pub fn with_root() -> Self {
        let mut tree = Self::new();
        tree.parents[CID_PAN as usize] = CID_PAN;
        tree
    }

    pub fn clear(&mut self) {
        self.parents = [CID_INVALID; MAX_COORDINATORS];
    }

    pub fn set(&mut self, cid: u8, parent: u8) {
        self.parents[cid_mask(cid) as usize] = parent;
    }

    pub fn remove(&mut self, cid: u8) {
        self.parents[cid_mask(cid) as usize] = CID_INVALID;
    }

    /// Returns the parent of `cid`, or `None` for unoccupied entries.
    pub fn parent_of(&self, cid: u8) -> Option<u8> {
        match self.parents[cid_mask(cid) as usize] {
            CID_INVALID => None,
            parent => Some(parent),
        }
    }

    pub fn contains(&self, cid: u8) -> bool {
        self.parent_of(cid).is_some()
    }

    /// Computes the next hop toward coordinator `dst`, as seen from the
    /// coordinator `my_cid` whose parent is `my_parent`.
    ///
    /// The tree is walked upward from the destination; if the walk passes
    /// through us, the hop is the child we came through. A destination
    /// outside the known subtree resolves to the parent. Destination 0
    /// always resolves to the parent directly.
    pub fn next_hop(&self, my_cid: u8, my_parent: u8, dst: u8) -> u8 {
        let dst = cid_mask(dst);
        if dst == CID_PAN {
            return my_parent;
        }
        let mut hop = dst;
        let mut previous = dst;
        for _ in 0..MAX_COORDINATORS {
            if hop == my_cid {
                return previous;
            }
            previous = hop;
            hop = match self.parent_of(hop) {
                Some(parent) => parent,
                None => return my_parent,
            };
        }
        my_parent
    }

    /// Whether `cid`'s ancestor chain (including itself) passes through
    /// `ancestor`.
    pub fn is_in_subtree(&self, cid: u8, ancestor: u8) -> bool {
        let mut current = cid;
        for _ in 0..MAX_COORDINATORS {
            if current == ancestor {
                return true;
            }
            current = match self.parent_of(current) {
                Some(parent) if parent != current => parent,
                _ => return false,
            };
        }
        false
    }

    /// Iterates over the direct children of `cid`, excluding the root's
    /// self-parent entry.
    pub fn children_of<'a>(&'a self, cid: u8) -> impl Iterator<Item = u8> + 'a {
        self.parents
            .iter()
            .enumerate()
            .filter(move |(child, parent)| {
                **parent == cid && *child as u8 != cid && **parent != CID_INVALID
            })
            .map(|(child, _)| child as u8)
    }

    /// All occupied `{CID, parent}` pairs except the PAN root itself.
    pub fn pairs(&self) -> std::vec::Vec<TreePair> {
        self.parents
            .iter()
            .enumerate()
            .filter(|(cid, parent)| **parent != CID_INVALID && *cid != CID_PAN as usize)
            .map(|(cid, parent)| (cid as u8, *parent))
            .collect()
    }

    /// Merges disseminated pairs into the local tree.
    pub fn merge(&mut self, pairs: &[TreePair]) {
        for (cid, parent) in pairs {
            self.set(*cid, *parent);
        }
    }
}

impl Default for RoutingTree {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for RoutingTree {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map()
            .entries(
                self.parents
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| **p != CID_INVALID),
            )
            .finish()
    }
}

/// One ROUTING_DATA payload: a fragment counter byte followed by pairs.
pub type FragmentPayload = Vec<u8, U41>;

/// Splits `pairs` into ROUTING_DATA payloads of at most [`MAX_ROUTING_DATA`]
/// pair bytes each.
///
/// The leading byte of every payload packs `total_fragments << 4 |
/// fragment_index`, with indices counting from 1. Fragments must be sent in
/// ascending index order so receivers can detect completion.
pub fn fragment_pairs(pairs: &[TreePair]) -> std::vec::Vec<FragmentPayload> {
    let pairs_per_fragment = MAX_ROUTING_DATA / 2;
    let total = (pairs.len() + pairs_per_fragment - 1) / pairs_per_fragment;
    let total = total.max(1);

    pairs
        .chunks(pairs_per_fragment)
        .chain(if pairs.is_empty() { Some(&[][..]) } else { None })
        .enumerate()
        .map(|(i, chunk)| {
            let mut payload = FragmentPayload::new();
            payload.push((total as u8) << 4 | (i as u8 + 1)).unwrap();
            for (cid, parent) in chunk {
                payload.push(*cid).unwrap();
                payload.push(*parent).unwrap();
            }
            payload
        })
        .collect()
}

/// A parsed ROUTING_DATA payload.
#[derive(Debug, PartialEq, Eq)]
pub struct RoutingFragment {
    pub total: u8,
    pub index: u8,
    pub pairs: std::vec::Vec<TreePair>,
}

impl RoutingFragment {
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let (&counter, rest) = payload.split_first().ok_or(Error::InvalidLength)?;
        let total = counter >> 4;
        let index = counter & 0x0f;
        if index == 0 || index > total {
            return Err(Error::InvalidValue);
        }
        let pairs = rest.chunks_exact(2).map(|c| (c[0], c[1])).collect();
        Ok(RoutingFragment { total, index, pairs })
    }

    /// Whether this is the final fragment of its set.
    pub fn is_last(&self) -> bool {
        self.index == self.total
    }
}
