//! The visit bag: a deduplicated, priority-ordered set of tree nodes a client
//! still needs.
//!
//! Entries are weak references into the shared tree. They are revalidated
//! against the live tree when dequeued, never pinned.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Opaque reference to a tree element (for example an octal code or arena
/// index). The tree decides what it means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(pub u64);

/// A node waiting to be visited, with its traversal priority (higher first).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingNode {
    pub node: NodeRef,
    pub priority: f32,
}

impl PendingNode {
    pub fn new(node: NodeRef, priority: f32) -> Self {
        Self { node, priority }
    }
}

#[derive(Debug)]
struct BagEntry {
    node: NodeRef,
    priority: f32,
    /// Insertion order, used to break ties first-in-first-out and to spot
    /// entries superseded by a later re-insert.
    generation: u64,
}

impl PartialEq for BagEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BagEntry {}

impl Ord for BagEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .partial_cmp(&other.priority)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for BagEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending work for one client.
#[derive(Debug, Default)]
pub struct VisitBag {
    heap: BinaryHeap<BagEntry>,
    /// Live generation and priority of every member.
    members: HashMap<NodeRef, (u64, f32)>,
    next_generation: u64,
}

impl VisitBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. A node already in the bag keeps a single entry; its
    /// priority is raised if the new one is higher.
    pub fn insert(&mut self, node: NodeRef, priority: f32) {
        if let Some(&(_, existing)) = self.members.get(&node)
            && existing >= priority
        {
            return;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        self.members.insert(node, (generation, priority));
        self.heap.push(BagEntry {
            node,
            priority,
            generation,
        });
    }

    /// Add every pending node.
    pub fn extend(&mut self, pending: impl IntoIterator<Item = PendingNode>) {
        for p in pending {
            self.insert(p.node, p.priority);
        }
    }

    /// Remove and return the highest-priority node.
    pub fn extract(&mut self) -> Option<NodeRef> {
        while let Some(entry) = self.heap.pop() {
            match self.members.get(&entry.node) {
                Some(&(generation, _)) if generation == entry.generation => {
                    self.members.remove(&entry.node);
                    return Some(entry.node);
                }
                // Superseded by a later insert of the same node.
                _ => continue,
            }
        }
        None
    }

    /// Whether the node is currently queued.
    pub fn contains(&self, node: NodeRef) -> bool {
        self.members.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.members.clear();
    }
}
