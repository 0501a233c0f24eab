//! Per-client octree view streaming: sessions, visit bags, packet packing,
//! duplicate suppression, and the paced worker that ties them together.

pub mod assembler;
pub mod bag;
pub mod coverage;
pub mod distributor;
pub mod frustum;
pub mod metrics;
pub mod packet;
pub mod query;
pub mod sender;
pub mod session;
pub mod stats;
pub mod suppressor;
pub mod transport;
pub mod tree;
pub mod worker;

#[cfg(test)]
mod testing;

pub use assembler::PacketAssembler;
pub use bag::{NodeRef, PendingNode, VisitBag};
pub use coverage::{CoverageMap, ScreenRect};
pub use distributor::{CycleReport, Distributor, ReseedPolicy, StreamConfig};
pub use frustum::{Aabb, Location, ViewFrustum};
pub use metrics::{CountersSnapshot, NoopMetrics, Phase, StreamCounters, StreamMetrics};
pub use packet::{
    DEFAULT_MTU, OutboundPacket, PacketDecodeError, PacketFlags, PacketHeader, parse_packet,
    read_sections,
};
pub use query::ClientQuery;
pub use sender::{PacketSender, SendTally};
pub use session::{ClientStreamSession, SessionHandle};
pub use stats::{SceneStats, StatsSummary};
pub use suppressor::DuplicateSuppressor;
pub use transport::{ClientId, DataKind, StreamProfile, Transport};
pub use tree::{
    EncodeOutcome, EncodeParams, Jurisdiction, SharedTree, StopReason, StreamTree, read_tree,
};
pub use worker::{StreamWorker, WorkerHandle, WorkerState};
