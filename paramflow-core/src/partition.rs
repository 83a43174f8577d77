//! Partitioning of the two message directions.
//!
//! Worker-to-server traffic is spread by parameter id so every parameter has
//! exactly one home server partition for the lifetime of the job.
//! Server-to-worker traffic is not really partitioned at all: the answer
//! must land on the worker that issued the pull, so the default partitioner
//! is the identity on the embedded partition tag and the fabric treats any
//! disagreement as a broken codec.

use std::sync::Arc;

use crate::message::{ParamId, PartitionIndex, ServerToWorker, WorkerToServer};

/// Maps a worker-to-server frame to the server partition that owns it.
pub trait WorkerToServerPartitioner<PullP, PushP>: Send + Sync {
    fn partition(
        &self,
        msg: &WorkerToServer<PullP, PushP>,
        servers: u32,
    ) -> PartitionIndex;
}

/// Maps a server-to-worker frame to its target worker partition.
pub trait ServerToWorkerPartitioner<PullP>: Send + Sync {
    fn partition(&self, msg: &ServerToWorker<PullP>, workers: u32) -> PartitionIndex;
}

/// Home server partition of a parameter: `|hash(id)| mod partitions`, where
/// the hash of an integer id is the id value itself. Callers wrapping richer
/// key types into a [`ParamId`] inherit this numeric behavior.
pub fn param_home(id: ParamId, partitions: u32) -> PartitionIndex {
    ((id as i64).abs() % partitions as i64) as PartitionIndex
}

/// Default worker-to-server partitioner: routes by [`param_home`] of the
/// frame's parameter id.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashPartitioner;

impl<PullP, PushP> WorkerToServerPartitioner<PullP, PushP> for HashPartitioner {
    fn partition(
        &self,
        msg: &WorkerToServer<PullP, PushP>,
        servers: u32,
    ) -> PartitionIndex {
        match msg.param_id() {
            Some(id) => param_home(id, servers),
            // Keyless frames are broadcast by the operator and never routed
            // through the partitioner; fall back to the source tag.
            None => msg.source % servers,
        }
    }
}

/// Default server-to-worker partitioner: the embedded target tag IS the
/// partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnswerTagPartitioner;

impl<PullP> ServerToWorkerPartitioner<PullP> for AnswerTagPartitioner {
    fn partition(&self, msg: &ServerToWorker<PullP>, _workers: u32) -> PartitionIndex {
        msg.target
    }
}

pub(crate) type SharedW2S<PullP, PushP> = Arc<dyn WorkerToServerPartitioner<PullP, PushP>>;
pub(crate) type SharedS2W<PullP> = Arc<dyn ServerToWorkerPartitioner<PullP>>;
