//! Thread-per-partition execution of the cyclic worker/server dataflow.
//!
//! Every worker partition and every server partition is one named OS thread
//! running its own monoio runtime, consuming a single unbounded event queue.
//! Single-queue consumption is what gives the shared-nothing, sequential
//! handler model: within a partition nothing ever runs concurrently, and
//! the only links between the tiers are the fan-out handles that route
//! frames into peer queues.
//!
//! # Key Components
//!
//! - [`WorkerOperator`](worker::WorkerOperator) / [`ServerOperator`](server::ServerOperator):
//!   the per-partition event loops.
//! - [`ServerFanout`] / [`WorkerFanout`]: partitioned routing into the
//!   opposite tier, with routing-invariant enforcement.
//! - [`LoopActivity`]: the in-flight/idle tracker behind iteration-idle
//!   termination.
//! - [`JobHandle`]: join point of a launched job.

use std::sync::Arc;

use futures_channel::mpsc::UnboundedSender;
use tracing::debug;

use crate::error::{AnyResult, FabricError};
use crate::message::{
    ModelRecord, PartitionIndex, ServerToWorker, WorkerPayload, WorkerToServer,
};
use crate::partition::{SharedS2W, SharedW2S};

mod activity;
mod pipeline;
mod server;
mod worker;

pub use pipeline::JobHandle;
pub(crate) use activity::LoopActivity;
pub(crate) use pipeline::{launch, JobSpec};

/// One queued event of a worker partition.
pub(crate) enum WorkerEvent<T, PullP> {
    /// A training record.
    Record(T),
    /// One record of this partition's model shard.
    Model(ModelRecord<PullP>),
    /// The model shard is complete.
    ModelEos,
    /// A frame from the server tier.
    Feedback(ServerToWorker<PullP>),
    /// Leave the event loop and close.
    Shutdown,
}

/// One queued event of a server partition.
pub(crate) enum ServerEvent<PullP, PushP> {
    /// A frame from the worker tier.
    Message(WorkerToServer<PullP, PushP>),
    /// Leave the event loop and close.
    Shutdown,
}

/// Routes worker-to-server frames into the server partition queues.
pub(crate) struct ServerFanout<PullP, PushP> {
    channels: Vec<UnboundedSender<ServerEvent<PullP, PushP>>>,
    partitioner: SharedW2S<PullP, PushP>,
    activity: Arc<LoopActivity>,
}

impl<PullP, PushP> ServerFanout<PullP, PushP> {
    pub(crate) fn new(
        channels: Vec<UnboundedSender<ServerEvent<PullP, PushP>>>,
        partitioner: SharedW2S<PullP, PushP>,
        activity: Arc<LoopActivity>,
    ) -> Self {
        Self {
            channels,
            partitioner,
            activity,
        }
    }

    pub(crate) fn route(&self, msg: WorkerToServer<PullP, PushP>) -> AnyResult<()> {
        let servers = self.channels.len() as u32;
        let partition = self.partitioner.partition(&msg, servers);
        let Some(tx) = self.channels.get(partition as usize) else {
            return Err(FabricError::ServerRouteOutOfRange { partition, servers }.into());
        };
        self.activity.sent();
        if tx.unbounded_send(ServerEvent::Message(msg)).is_err() {
            self.activity.done();
            debug!(partition, "server partition is gone, dropping frame");
        }
        Ok(())
    }

    /// End-of-model goes to every server partition; it is the barrier that
    /// releases deferred pulls once every worker has reported done.
    pub(crate) fn broadcast_end_of_model(&self, source: PartitionIndex) {
        for (partition, tx) in self.channels.iter().enumerate() {
            self.activity.sent();
            let frame = WorkerToServer {
                source,
                payload: WorkerPayload::EndOfModel,
            };
            if tx.unbounded_send(ServerEvent::Message(frame)).is_err() {
                self.activity.done();
                debug!(partition, "server partition is gone, dropping end-of-model");
            }
        }
    }
}

/// Routes server-to-worker frames back into the worker partition queues.
///
/// The embedded target tag must agree with the partitioner and lie in
/// range; anything else means a broken sender codec and fails the job.
pub(crate) struct WorkerFanout<T, PullP> {
    channels: Vec<UnboundedSender<WorkerEvent<T, PullP>>>,
    partitioner: SharedS2W<PullP>,
    activity: Arc<LoopActivity>,
}

impl<T, PullP> WorkerFanout<T, PullP> {
    pub(crate) fn new(
        channels: Vec<UnboundedSender<WorkerEvent<T, PullP>>>,
        partitioner: SharedS2W<PullP>,
        activity: Arc<LoopActivity>,
    ) -> Self {
        Self {
            channels,
            partitioner,
            activity,
        }
    }

    pub(crate) fn workers(&self) -> u32 {
        self.channels.len() as u32
    }

    pub(crate) fn route(&self, msg: ServerToWorker<PullP>) -> AnyResult<()> {
        let workers = self.workers();
        let partition = self.partitioner.partition(&msg, workers);
        if partition >= workers || partition != msg.target {
            return Err(FabricError::MisroutedAnswer.into());
        }
        self.activity.sent();
        if self.channels[partition as usize]
            .unbounded_send(WorkerEvent::Feedback(msg))
            .is_err()
        {
            self.activity.done();
            debug!(partition, "worker partition is gone, dropping answer");
        }
        Ok(())
    }
}
