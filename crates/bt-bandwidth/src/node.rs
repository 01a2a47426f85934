use std::sync::{Arc, Weak};

use rand::seq::SliceRandom;
use tracing::trace;

use crate::band::{Band, Direction, Priority};
use crate::peer_io::PeerIo;

/// Bytes handed to a peer per round in [`BandwidthTree::phase_one`]. Chosen so a full-size
/// µTP frame goes out right away while leaving enough buffered data for the next one.
const PHASE_ONE_INCREMENT: usize = 3000;

/// Handle to a node inside a [`BandwidthTree`]. Stable for the node's lifetime; reused
/// only after the node is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    peer: Option<Weak<dyn PeerIo>>,
    priority: Priority,
    band: [Band; 2],
}

impl Node {
    fn new() -> Self {
        Self {
            parent: None,
            children: Vec::new(),
            peer: None,
            priority: Priority::default(),
            band: [Band::new(), Band::new()],
        }
    }

    fn band(&self, dir: Direction) -> &Band {
        &self.band[dir as usize]
    }

    fn band_mut(&mut self, dir: Direction) -> &mut Band {
        &mut self.band[dir as usize]
    }
}

/// A tree of rate-limited channels. Nodes never own their parent or children: the tree
/// is a slab of slots addressed by [`NodeId`], which sidesteps the back-pointer cycles
/// an owned-pointer tree would otherwise require `Rc`/`RefCell` or `unsafe` to express.
#[derive(Default)]
pub struct BandwidthTree {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
}

impl BandwidthTree {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn set_bytes_left_for_test(&mut self, id: NodeId, dir: Direction, bytes: u64) {
        self.node_mut(id).band_mut(dir).bytes_left = bytes;
    }

    #[cfg(test)]
    pub fn children_for_test(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id).children.clone()
    }

    /// Insert a new, parentless node.
    pub fn insert(&mut self) -> NodeId {
        let node = Node::new();
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(node);
            NodeId(idx)
        } else {
            self.slots.push(Some(node));
            NodeId(self.slots.len() - 1)
        }
    }

    /// Remove a node from the tree. The caller must reparent its children first;
    /// orphaned children left pointing at a removed node are a programming error.
    pub fn remove(&mut self, id: NodeId) {
        self.set_parent(id, None);
        self.slots[id.0] = None;
        self.free.push(id.0);
    }

    fn node(&self, id: NodeId) -> &Node {
        self.slots[id.0].as_ref().expect("dangling NodeId")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.slots[id.0].as_mut().expect("dangling NodeId")
    }

    fn is_ancestor(&self, candidate: NodeId, of: NodeId) -> bool {
        let mut cur = Some(of);
        while let Some(id) = cur {
            if id == candidate {
                return true;
            }
            cur = self.node(id).parent;
        }
        false
    }

    /// Reparent `id` under `new_parent`. Removes `id` from its current parent's
    /// children (unordered remove by swap-with-last) before appending it to the new
    /// one. Calling this twice with the same parent is idempotent.
    pub fn set_parent(&mut self, id: NodeId, new_parent: Option<NodeId>) {
        assert_ne!(Some(id), new_parent, "a node cannot be its own parent");
        if let Some(p) = new_parent {
            assert!(
                !self.is_ancestor(id, p),
                "set_parent would create a cycle"
            );
        }

        if let Some(old_parent) = self.node(id).parent {
            let siblings = &mut self.node_mut(old_parent).children;
            if let Some(pos) = siblings.iter().position(|c| *c == id) {
                siblings.swap_remove(pos);
            }
        }

        self.node_mut(id).parent = None;

        if let Some(p) = new_parent {
            self.node_mut(p).children.push(id);
            self.node_mut(id).parent = Some(p);
        }
    }

    pub fn set_peer(&mut self, id: NodeId, peer: Weak<dyn PeerIo>) {
        self.node_mut(id).peer = Some(peer);
    }

    pub fn set_priority(&mut self, id: NodeId, priority: Priority) {
        self.node_mut(id).priority = priority;
    }

    pub fn set_limited(&mut self, id: NodeId, dir: Direction, limited: bool) {
        self.node_mut(id).band_mut(dir).is_limited = limited;
    }

    pub fn set_desired_bps(&mut self, id: NodeId, dir: Direction, bps: u64) {
        self.node_mut(id).band_mut(dir).desired_bps = bps;
    }

    pub fn set_honor_parent_limits(&mut self, id: NodeId, dir: Direction, honor: bool) {
        self.node_mut(id).band_mut(dir).honor_parent_limits = honor;
    }

    /// Bytes/sec over the trailing second, from the raw (not piece-only) history.
    pub fn raw_rate(&mut self, id: NodeId, now_ms: u64, dir: Direction) -> u64 {
        self.node_mut(id).band_mut(dir).raw.rate(now_ms, 1000)
    }

    /// How many of `requested` bytes `id` (and, if it honors parent limits, its
    /// ancestors) currently allow through in `dir`.
    ///
    /// Preserves an upstream quirk: the soft-cap ratio is always computed from the
    /// node's *down* rate, even when clamping the *up* direction.
    pub fn clamp(&mut self, id: NodeId, now_ms: u64, dir: Direction, requested: usize) -> usize {
        let mut bytes = requested;

        if self.node(id).band(dir).is_limited {
            bytes = bytes.min(self.node(id).band(dir).bytes_left as usize);

            if bytes > 0 {
                let current = self.raw_rate(id, now_ms, Direction::Down);
                let desired = self.node(id).band(Direction::Down).desired_bps;
                let r = if desired >= 1 {
                    current as f64 / desired as f64
                } else {
                    0.0
                };

                if r > 1.0 {
                    bytes = 0;
                } else if r > 0.9 {
                    bytes -= bytes / 5;
                } else if r > 0.8 {
                    bytes -= bytes / 10;
                }
            }
        }

        let parent = self.node(id).parent;
        let honor = self.node(id).band(dir).honor_parent_limits;
        if let Some(parent) = parent {
            if honor && bytes > 0 {
                bytes = self.clamp(parent, now_ms, dir, bytes);
            }
        }

        bytes
    }

    /// Record `byte_count` consumed by `id` in `dir`, propagating to every ancestor.
    pub fn notify_consumed(
        &mut self,
        id: NodeId,
        dir: Direction,
        byte_count: usize,
        is_piece_data: bool,
        now_ms: u64,
    ) {
        let byte_count = byte_count as u64;
        {
            let band = self.node_mut(id).band_mut(dir);
            if band.is_limited && is_piece_data {
                band.bytes_left -= band.bytes_left.min(byte_count);
            }
            band.raw.record(now_ms, byte_count);
            if is_piece_data {
                band.piece.record(now_ms, byte_count);
            }
        }

        if let Some(parent) = self.node(id).parent {
            self.notify_consumed(parent, dir, byte_count as usize, is_piece_data, now_ms);
        }
    }

    fn allocate_bandwidth(
        &mut self,
        id: NodeId,
        parent_priority: Priority,
        period_ms: u64,
        refs: &mut Vec<Arc<dyn PeerIo>>,
    ) {
        let priority = parent_priority.max(self.node(id).priority);

        for dir in Direction::ALL {
            let band = self.node_mut(id).band_mut(dir);
            if band.is_limited {
                band.bytes_left = band.desired_bps * period_ms / 1000;
            }
        }

        if let Some(peer) = self.node(id).peer.as_ref().and_then(Weak::upgrade) {
            peer.set_priority(priority);
            refs.push(peer);
        }

        let children = self.node(id).children.clone();
        for child in children {
            self.allocate_bandwidth(child, priority, period_ms, refs);
        }
    }

    fn phase_one(peers: &mut [Arc<dyn PeerIo>], dir: Direction) {
        trace!(n = peers.len(), ?dir, "phase one round-robin");
        peers.shuffle(&mut rand::rng());

        let mut n_unfinished = peers.len();
        while n_unfinished > 0 {
            let mut i = 0;
            while i < n_unfinished {
                let used = peers[i].flush(dir, PHASE_ONE_INCREMENT);
                if used != PHASE_ONE_INCREMENT {
                    peers.swap(i, n_unfinished - 1);
                    n_unfinished -= 1;
                } else {
                    i += 1;
                }
            }
        }
    }

    /// Refill budgets down the tree rooted at `root`, gather the live peer working set,
    /// then drain it: a fair round-robin pass followed by an opportunistic burst.
    pub fn allocate(&mut self, root: NodeId, period_ms: u64) {
        let mut refs: Vec<Arc<dyn PeerIo>> = Vec::new();
        self.allocate_bandwidth(root, Priority::Low, period_ms, &mut refs);

        for io in &refs {
            io.flush_outgoing_protocol_msgs();
        }

        let mut high = Vec::new();
        let mut normal = Vec::new();
        let mut low = Vec::new();
        for io in &refs {
            match io.priority() {
                Priority::High => {
                    high.push(io.clone());
                    normal.push(io.clone());
                    low.push(io.clone());
                }
                Priority::Normal => {
                    normal.push(io.clone());
                    low.push(io.clone());
                }
                Priority::Low => {
                    low.push(io.clone());
                }
            }
        }

        for bucket in [&mut high, &mut normal, &mut low] {
            Self::phase_one(bucket, Direction::Up);
            Self::phase_one(bucket, Direction::Down);
        }

        for io in &refs {
            io.set_enabled(Direction::Up, io.has_bandwidth_left(Direction::Up));
            io.set_enabled(Direction::Down, io.has_bandwidth_left(Direction::Down));
        }
    }
}
