//! Recording doubles for the tree and transport seams.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use glam::Vec3;

use crate::assembler::PacketAssembler;
use crate::bag::{NodeRef, PendingNode};
use crate::transport::{ClientId, Transport};
use crate::tree::{EncodeOutcome, EncodeParams, StopReason, StreamTree};

// ---------------------------------------------------------------------------
// RecordingTransport
// ---------------------------------------------------------------------------

/// Keeps every datagram instead of sending it.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    dropping: AtomicBool,
    special: Mutex<HashMap<ClientId, VecDeque<Vec<u8>>>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(bytes, _)| bytes.clone())
            .collect()
    }

    /// Drop every datagram from now on, as a full socket would.
    pub fn set_dropping(&self, dropping: bool) {
        self.dropping.store(dropping, Ordering::Relaxed);
    }

    pub fn queue_special(&self, client: ClientId, bytes: Vec<u8>) {
        self.special
            .lock()
            .unwrap()
            .entry(client)
            .or_default()
            .push_back(bytes);
    }
}

impl Transport for RecordingTransport {
    fn send(&self, bytes: &[u8], client: SocketAddr) -> usize {
        if self.dropping.load(Ordering::Relaxed) {
            return 0;
        }
        self.sent.lock().unwrap().push((bytes.to_vec(), client));
        bytes.len()
    }

    fn has_special_packet_pending(&self, client: ClientId) -> bool {
        self.special
            .lock()
            .unwrap()
            .get(&client)
            .is_some_and(|q| !q.is_empty())
    }

    fn take_special_packet(&self, client: ClientId) -> Option<Vec<u8>> {
        self.special.lock().unwrap().get_mut(&client)?.pop_front()
    }
}

// ---------------------------------------------------------------------------
// MockTree
// ---------------------------------------------------------------------------

/// A tree node: encodes to `size` copies of its id byte, then hands back its
/// children.
#[derive(Debug, Clone)]
pub struct MockNode {
    pub size: usize,
    pub children: Vec<NodeRef>,
}

/// What the distributor passed to one encode call.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeCall {
    pub node: NodeRef,
    pub delta_baseline: Option<Vec3>,
    pub boundary_level_adjust: i32,
    pub is_full_scene: bool,
    pub with_coverage: bool,
}

pub const ROOT: NodeRef = NodeRef(1);

/// Scriptable tree. Re-queues a node that does not fit at raised priority so
/// it is retried first.
pub struct MockTree {
    nodes: Mutex<HashMap<NodeRef, MockNode>>,
    root_version: AtomicU64,
    loaded: AtomicBool,
    encode_calls: AtomicUsize,
    calls: Mutex<Vec<EncodeCall>>,
}

impl MockTree {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            root_version: AtomicU64::new(1),
            loaded: AtomicBool::new(true),
            encode_calls: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A root of `size` bytes with no children.
    pub fn single(size: usize) -> Self {
        let tree = Self::new();
        tree.set_node(ROOT, size, Vec::new());
        tree
    }

    pub fn set_node(&self, node: NodeRef, size: usize, children: Vec<NodeRef>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(node, MockNode { size, children });
    }

    pub fn remove_node(&self, node: NodeRef) {
        self.nodes.lock().unwrap().remove(&node);
    }

    pub fn touch_root(&self) {
        self.root_version.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::Relaxed);
    }

    pub fn encode_calls(&self) -> usize {
        self.encode_calls.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> Vec<EncodeCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl StreamTree for MockTree {
    fn is_initial_load_complete(&self) -> bool {
        self.loaded.load(Ordering::Relaxed)
    }

    fn root(&self) -> NodeRef {
        ROOT
    }

    fn root_last_changed(&self) -> u64 {
        self.root_version.load(Ordering::Relaxed)
    }

    fn contains(&self, node: NodeRef) -> bool {
        self.nodes.lock().unwrap().contains_key(&node)
    }

    fn encode(
        &self,
        node: NodeRef,
        assembler: &mut PacketAssembler,
        params: &mut EncodeParams<'_>,
    ) -> EncodeOutcome {
        self.encode_calls.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().unwrap().push(EncodeCall {
            node,
            delta_baseline: params.delta_baseline.map(|f| f.position()),
            boundary_level_adjust: params.boundary_level_adjust,
            is_full_scene: params.is_full_scene,
            with_coverage: params.coverage.is_some(),
        });

        let Some(entry) = self.nodes.lock().unwrap().get(&node).cloned() else {
            return EncodeOutcome {
                bytes_written: 0,
                stop_reason: StopReason::NullNode,
                residual: Vec::new(),
                max_level_reached: 0,
            };
        };
        params.stats.node_traversed();

        let bytes = vec![node.0 as u8; entry.size];
        if !assembler.try_append(&bytes) {
            return EncodeOutcome::didnt_fit(vec![PendingNode::new(node, 2.0)]);
        }
        EncodeOutcome {
            bytes_written: entry.size,
            stop_reason: StopReason::Finished,
            residual: entry
                .children
                .iter()
                .map(|&child| PendingNode::new(child, 1.0))
                .collect(),
            max_level_reached: 1,
        }
    }
}
