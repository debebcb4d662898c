//! Node pool and open list for graph searches
//!
//! Nodes live in a fixed array and are addressed by index; the open list
//! stores indices, never references, so the pool can be mutated while a
//! node is queued.

use super::PolyRef;

/// Node index type
pub type NodeIndex = u16;

/// Null node index
pub const NULL_IDX: NodeIndex = NodeIndex::MAX;

/// Largest pool a `NodeIndex` can address
pub const MAX_NODE_POOL_SIZE: usize = NULL_IDX as usize - 1;

bitflags::bitflags! {
    /// Search state of a node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        const OPEN = 0x01;
        const CLOSED = 0x02;
        /// Parent is not adjacent; found via a raycast shortcut
        const PARENT_DETACHED = 0x04;
    }
}

/// Search node for one polygon
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Node {
    /// Portal point the search entered the polygon through
    pub pos: [f32; 3],
    /// Cost from the start to this node
    pub cost: f32,
    /// Cost plus heuristic
    pub total: f32,
    pub parent: NodeIndex,
    /// Extra state, lets one polygon own several nodes
    pub state: u8,
    pub flags: NodeFlags,
    pub id: PolyRef,
    /// Discovery order, breaks ties in the open list
    pub seq: u32,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            pos: [0.0; 3],
            cost: 0.0,
            total: 0.0,
            parent: NULL_IDX,
            state: 0,
            flags: NodeFlags::empty(),
            id: PolyRef::NULL,
            seq: 0,
        }
    }
}

/// Fixed-capacity node storage with a hash lookup by polygon ref
#[derive(Debug, Clone)]
pub struct NodePool {
    nodes: Vec<Node>,
    first: Vec<NodeIndex>,
    next: Vec<NodeIndex>,
    hash_mask: usize,
    node_count: usize,
    next_seq: u32,
}

#[inline]
fn hash_ref(id: PolyRef) -> u32 {
    let mut a = id.id();
    a = a.wrapping_add(!(a << 15));
    a ^= a >> 10;
    a = a.wrapping_add(a << 3);
    a ^= a >> 6;
    a = a.wrapping_add(!(a << 11));
    a ^= a >> 16;
    a
}

impl NodePool {
    /// `hash_size` is rounded up to a power of two.
    pub fn new(max_nodes: usize, hash_size: usize) -> Self {
        let max_nodes = max_nodes.clamp(1, MAX_NODE_POOL_SIZE);
        let hash_size = hash_size.max(1).next_power_of_two();
        Self {
            nodes: vec![Node::default(); max_nodes],
            first: vec![NULL_IDX; hash_size],
            next: vec![NULL_IDX; max_nodes],
            hash_mask: hash_size - 1,
            node_count: 0,
            next_seq: 0,
        }
    }

    pub fn clear(&mut self) {
        self.first.fill(NULL_IDX);
        self.node_count = 0;
        self.next_seq = 0;
    }

    #[inline]
    fn bucket(&self, id: PolyRef) -> usize {
        hash_ref(id) as usize & self.hash_mask
    }

    /// Index of the node for `(id, state)`, allocating it when missing.
    /// None when the pool is exhausted.
    pub fn get_node(&mut self, id: PolyRef, state: u8) -> Option<NodeIndex> {
        if let Some(idx) = self.find_node(id, state) {
            return Some(idx);
        }
        if self.node_count >= self.nodes.len() {
            return None;
        }

        let idx = self.node_count;
        self.node_count += 1;
        self.nodes[idx] = Node {
            id,
            state,
            seq: self.next_seq,
            ..Default::default()
        };
        self.next_seq = self.next_seq.wrapping_add(1);

        let bucket = self.bucket(id);
        self.next[idx] = self.first[bucket];
        self.first[bucket] = idx as NodeIndex;
        Some(idx as NodeIndex)
    }

    pub fn find_node(&self, id: PolyRef, state: u8) -> Option<NodeIndex> {
        let mut i = self.first[self.bucket(id)];
        while i != NULL_IDX {
            let node = &self.nodes[i as usize];
            if node.id == id && node.state == state {
                return Some(i);
            }
            i = self.next[i as usize];
        }
        None
    }

    /// Writes the indices of every node of `id` (any state); returns the count.
    pub fn find_nodes(&self, id: PolyRef, out: &mut [NodeIndex]) -> usize {
        let mut n = 0;
        let mut i = self.first[self.bucket(id)];
        while i != NULL_IDX && n < out.len() {
            if self.nodes[i as usize].id == id {
                out[n] = i;
                n += 1;
            }
            i = self.next[i as usize];
        }
        n
    }

    #[inline]
    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.nodes[idx as usize]
    }

    #[inline]
    pub fn node_mut(&mut self, idx: NodeIndex) -> &mut Node {
        &mut self.nodes[idx as usize]
    }

    /// Parent index, None at the root
    #[inline]
    pub fn parent(&self, idx: NodeIndex) -> Option<NodeIndex> {
        let parent = self.nodes[idx as usize].parent;
        (parent != NULL_IDX).then_some(parent)
    }

    pub fn max_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }
}

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    total: f32,
    seq: u32,
    idx: NodeIndex,
}

impl QueueEntry {
    /// Lower total first; equal totals pop in discovery order.
    #[inline]
    fn before(&self, other: &QueueEntry) -> bool {
        self.total < other.total || (self.total == other.total && self.seq < other.seq)
    }
}

/// Binary min-heap of node indices keyed on `Node::total`
#[derive(Debug, Clone)]
pub struct NodeQueue {
    heap: Vec<QueueEntry>,
    capacity: usize,
}

impl NodeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn top(&self) -> Option<NodeIndex> {
        self.heap.first().map(|e| e.idx)
    }

    pub fn pop(&mut self) -> Option<NodeIndex> {
        let top = self.heap.first()?.idx;
        let last = self.heap.pop()?;
        if !self.heap.is_empty() {
            self.trickle_down(0, last);
        }
        Some(top)
    }

    /// Queues a node. Ignored when the heap is at capacity.
    pub fn push(&mut self, pool: &NodePool, idx: NodeIndex) {
        if self.heap.len() >= self.capacity {
            return;
        }
        let node = pool.node(idx);
        let entry = QueueEntry {
            total: node.total,
            seq: node.seq,
            idx,
        };
        self.heap.push(entry);
        self.bubble_up(self.heap.len() - 1, entry);
    }

    /// Re-sorts a queued node after its total decreased.
    pub fn modify(&mut self, pool: &NodePool, idx: NodeIndex) {
        if let Some(i) = self.heap.iter().position(|e| e.idx == idx) {
            let node = pool.node(idx);
            let entry = QueueEntry {
                total: node.total,
                seq: node.seq,
                idx,
            };
            self.bubble_up(i, entry);
        }
    }

    fn bubble_up(&mut self, mut i: usize, entry: QueueEntry) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !entry.before(&self.heap[parent]) {
                break;
            }
            self.heap[i] = self.heap[parent];
            i = parent;
        }
        self.heap[i] = entry;
    }

    fn trickle_down(&mut self, mut i: usize, entry: QueueEntry) {
        let len = self.heap.len();
        loop {
            let mut child = i * 2 + 1;
            if child >= len {
                break;
            }
            if child + 1 < len && self.heap[child + 1].before(&self.heap[child]) {
                child += 1;
            }
            if !self.heap[child].before(&entry) {
                break;
            }
            self.heap[i] = self.heap[child];
            i = child;
        }
        self.heap[i] = entry;
    }
}
