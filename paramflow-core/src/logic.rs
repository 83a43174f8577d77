//! User-supplied logic contracts and the facades they program against.
//!
//! A job is defined by one [`WorkerLogic`] per worker partition and one
//! [`ParameterServerLogic`] per server partition. Handlers run sequentially
//! within a partition and to completion; the facade handed to a handler is
//! only valid for that invocation and must not be retained.
//!
//! Symmetric jobs simply instantiate `Pull = Push`; there is no separate
//! loose flavor.

use crate::error::AnyResult;
use crate::message::{ParamId, PartitionIndex};

/// Where a logic instance runs: its own partition index and the parallelism
/// of both tiers. Handed to `open` on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionContext {
    /// Index of this partition within its tier.
    pub index: PartitionIndex,
    /// Parallelism of this tier.
    pub parallelism: u32,
    /// Parallelism of the opposite tier.
    pub peer_parallelism: u32,
}

/// Worker-side facade: the only way worker logic talks to the servers and
/// the output stream.
pub trait ParameterServerClient {
    type Push;
    type Output;

    /// Request the current value of `id`; the answer arrives later through
    /// [`WorkerLogic::on_pull_recv`].
    fn pull(&mut self, id: ParamId);

    /// Send an update delta for `id` to its home server partition.
    fn push(&mut self, id: ParamId, delta: Self::Push);

    /// Emit a worker output record.
    fn output(&mut self, out: Self::Output);
}

/// Server-side facade: answering pulls and emitting server output records.
pub trait ParameterServer {
    type Pull;
    type Output;

    /// Answer a pull with `value`, addressed at the worker partition that
    /// issued it.
    fn answer_pull(&mut self, id: ParamId, value: Self::Pull, target: PartitionIndex);

    /// Emit a server output record.
    fn output(&mut self, out: Self::Output);
}

/// Logic of one worker partition.
pub trait WorkerLogic {
    /// Training record type.
    type Record;
    /// Parameter type received from the servers.
    type Pull;
    /// Delta type sent to the servers.
    type Push;
    /// Worker output record type.
    type Output;

    fn open(&mut self, _ctx: &PartitionContext) -> AnyResult<()> {
        Ok(())
    }

    /// Called once per training record. May issue any number of pulls,
    /// pushes and outputs through the client.
    fn on_recv(
        &mut self,
        record: Self::Record,
        client: &mut dyn ParameterServerClient<Push = Self::Push, Output = Self::Output>,
    ) -> AnyResult<()>;

    /// Called when a pull answer arrives.
    fn on_pull_recv(
        &mut self,
        id: ParamId,
        value: Self::Pull,
        client: &mut dyn ParameterServerClient<Push = Self::Push, Output = Self::Output>,
    ) -> AnyResult<()>;

    /// Called for each worker-side model copy during a double-sided model
    /// load. Logic that wants a local replica overrides this.
    fn update_model(&mut self, _id: ParamId, _value: Self::Pull) -> AnyResult<()> {
        Err(crate::error::FabricError::WorkerModelUnsupported.into())
    }

    fn close(&mut self) -> AnyResult<()> {
        Ok(())
    }
}

/// Logic of one server partition.
pub trait ParameterServerLogic {
    /// Parameter type sent to the workers.
    type Pull;
    /// Delta type received from the workers.
    type Push;
    /// Server output record type.
    type Output;

    fn open(&mut self, _ctx: &PartitionContext) -> AnyResult<()> {
        Ok(())
    }

    /// Serve a pull from worker partition `source`; typically terminates
    /// with `ps.answer_pull(id, value, source)`.
    fn on_pull_recv(
        &mut self,
        id: ParamId,
        source: PartitionIndex,
        ps: &mut dyn ParameterServer<Pull = Self::Pull, Output = Self::Output>,
    ) -> AnyResult<()>;

    /// Fold a delta into the stored parameter state.
    fn on_push_recv(
        &mut self,
        id: ParamId,
        delta: Self::Push,
        ps: &mut dyn ParameterServer<Pull = Self::Pull, Output = Self::Output>,
    ) -> AnyResult<()>;

    /// Install a preloaded parameter value during model load. Logic used
    /// with `transform_with_model_load` must override this.
    fn on_parameter_recv(
        &mut self,
        _id: ParamId,
        _value: Self::Pull,
        _ps: &mut dyn ParameterServer<Pull = Self::Pull, Output = Self::Output>,
    ) -> AnyResult<()> {
        Err(crate::error::FabricError::ParameterPreloadUnsupported.into())
    }

    /// Drain. The only point at which snapshot-style output may be emitted.
    fn close(
        &mut self,
        ps: &mut dyn ParameterServer<Pull = Self::Pull, Output = Self::Output>,
    ) -> AnyResult<()>;
}
