//! Wire messages exchanged between the worker and server tiers.
//!
//! One enum per direction. Bootstrap traffic ([`WorkerPayload::Parameter`],
//! [`WorkerPayload::EndOfModel`], [`ServerPayload::EndOfModelMarker`]) shares
//! the same frames as regular pull/push traffic so a single channel per
//! partition carries everything in arrival order.

/// Opaque key of a logical parameter. Its home server partition is derived
/// from the id and never changes within a job.
pub type ParamId = i32;

/// Index of a worker or server partition, in `[0, W)` resp. `[0, S)`.
pub type PartitionIndex = u32;

/// Payload of a worker-to-server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerPayload<PullP, PushP> {
    /// Request the current value of a parameter.
    Pull(ParamId),
    /// Fold a delta into a parameter.
    Push(ParamId, PushP),
    /// Install a preloaded parameter value (model load only).
    Parameter(ParamId, PullP),
    /// This worker partition has forwarded its entire model shard.
    EndOfModel,
}

/// A frame travelling from a worker partition to a server partition,
/// stamped with the issuing worker so answers can find their way back.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerToServer<PullP, PushP> {
    pub source: PartitionIndex,
    pub payload: WorkerPayload<PullP, PushP>,
}

impl<PullP, PushP> WorkerToServer<PullP, PushP> {
    /// The parameter this frame is keyed by, if any. `EndOfModel` is
    /// broadcast and carries no key.
    pub fn param_id(&self) -> Option<ParamId> {
        match &self.payload {
            WorkerPayload::Pull(id)
            | WorkerPayload::Push(id, _)
            | WorkerPayload::Parameter(id, _) => Some(*id),
            WorkerPayload::EndOfModel => None,
        }
    }
}

/// Payload of a server-to-worker frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPayload<PullP> {
    /// Answer to a previously issued pull.
    PullAnswer(ParamId, PullP),
    /// Synthetic keepalive emitted while a model load is in flight; carries
    /// no user-visible value and never reaches user logic.
    EndOfModelMarker,
}

/// A frame travelling from a server partition back to the worker partition
/// named by `target`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerToWorker<PullP> {
    pub target: PartitionIndex,
    pub payload: ServerPayload<PullP>,
}

/// One record of the initial-model stream.
///
/// The single-side load uses only `Server` records; the double-sided load
/// mixes both so workers can hold a read-mostly replica.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelRecord<PullP> {
    /// A parameter copy destined for its home server partition.
    Server(ParamId, PullP),
    /// A parameter copy applied directly to the receiving worker partition.
    Worker(ParamId, PullP),
}

/// A record of the merged job output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput<WOut, SOut> {
    Worker(WOut),
    Server(SOut),
}

impl<WOut, SOut> JobOutput<WOut, SOut> {
    pub fn worker(self) -> Option<WOut> {
        match self {
            JobOutput::Worker(out) => Some(out),
            JobOutput::Server(_) => None,
        }
    }

    pub fn server(self) -> Option<SOut> {
        match self {
            JobOutput::Server(out) => Some(out),
            JobOutput::Worker(_) => None,
        }
    }
}
