//! The worker partition operator.
//!
//! Consumes training records and server feedback from one queue, drives the
//! user [`WorkerLogic`], and routes outgoing pull/push frames through the
//! sender codec into the server fan-out. During a model load the operator
//! buffers training records until its shard of the model stream has been
//! forwarded and the end-of-model fan-out is on the wire.

use std::mem;
use std::sync::Arc;

use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use tracing::{debug, info};

use super::{LoopActivity, ServerFanout, WorkerEvent};
use crate::codec::{WorkerReceiver, WorkerSender};
use crate::error::{AnyError, AnyResult, FabricError};
use crate::logic::{ParameterServerClient, PartitionContext, WorkerLogic};
use crate::message::{
    JobOutput, ModelRecord, ParamId, PartitionIndex, ServerPayload, ServerToWorker, WorkerPayload,
    WorkerToServer,
};

/// Bootstrap progress of one worker partition.
pub(crate) enum LoadState<T> {
    /// The job has no model stream.
    Inactive,
    /// Model records are still arriving; training records are buffered.
    Loading {
        buffered: Vec<T>,
        records_seen: usize,
    },
    /// The shard was forwarded and buffered records replayed.
    Done,
}

pub(crate) struct WorkerOperator<WL: WorkerLogic, WS, WR, SOut> {
    pub(crate) partition: PartitionIndex,
    pub(crate) logic: WL,
    pub(crate) sender: WS,
    pub(crate) receiver: WR,
    pub(crate) fanout: ServerFanout<WL::Pull, WL::Push>,
    pub(crate) outputs: UnboundedSender<JobOutput<WL::Output, SOut>>,
    pub(crate) activity: Arc<LoopActivity>,
    pub(crate) load: LoadState<WL::Record>,
    pub(crate) defect: Option<AnyError>,
}

impl<WL, WS, WR, SOut> WorkerOperator<WL, WS, WR, SOut>
where
    WL: WorkerLogic,
    WS: WorkerSender<WL::Pull, WL::Push>,
    WR: WorkerReceiver<WL::Pull>,
{
    pub(crate) async fn run(
        mut self,
        mut rx: UnboundedReceiver<WorkerEvent<WL::Record, WL::Pull>>,
        ctx: PartitionContext,
    ) -> AnyResult<()> {
        if let Err(e) = self.logic.open(&ctx) {
            self.activity.abort();
            return Err(e);
        }
        let mut failure = None;
        while let Some(event) = rx.next().await {
            if matches!(event, WorkerEvent::Shutdown) {
                break;
            }
            let handled = self.handle(event);
            self.activity.done();
            if let Err(e) = handled {
                self.activity.abort();
                failure = Some(e);
                break;
            }
        }
        rx.close();
        let closed = self.logic.close();
        info!(partition = self.partition, "worker partition closed");
        match failure {
            Some(e) => Err(e),
            None => closed,
        }
    }

    fn handle(&mut self, event: WorkerEvent<WL::Record, WL::Pull>) -> AnyResult<()> {
        match event {
            WorkerEvent::Record(record) => match &mut self.load {
                LoadState::Loading { buffered, .. } => {
                    buffered.push(record);
                    Ok(())
                }
                _ => self.dispatch_record(record),
            },
            WorkerEvent::Model(record) => self.absorb_model(record),
            WorkerEvent::ModelEos => self.finish_model(),
            WorkerEvent::Feedback(msg) => self.absorb_feedback(msg),
            WorkerEvent::Shutdown => Ok(()),
        }
    }

    fn dispatch_record(&mut self, record: WL::Record) -> AnyResult<()> {
        let Self {
            partition,
            logic,
            sender,
            fanout,
            outputs,
            defect,
            ..
        } = self;
        let mut client = WorkerClient {
            partition: *partition,
            sender,
            fanout,
            outputs,
            defect,
        };
        logic.on_recv(record, &mut client)?;
        self.take_defect()
    }

    fn absorb_model(&mut self, record: ModelRecord<WL::Pull>) -> AnyResult<()> {
        let LoadState::Loading { records_seen, .. } = &mut self.load else {
            return Err(FabricError::ModelAfterEos.into());
        };
        *records_seen += 1;
        match record {
            ModelRecord::Server(id, value) => self.fanout.route(WorkerToServer {
                source: self.partition,
                payload: WorkerPayload::Parameter(id, value),
            }),
            ModelRecord::Worker(id, value) => self.logic.update_model(id, value),
        }
    }

    fn finish_model(&mut self) -> AnyResult<()> {
        let LoadState::Loading {
            buffered,
            records_seen,
        } = mem::replace(&mut self.load, LoadState::Done)
        else {
            return Err(FabricError::ModelAfterEos.into());
        };
        if records_seen == 0 {
            return Err(FabricError::EmptyModelPartition.into());
        }
        self.fanout.broadcast_end_of_model(self.partition);
        info!(
            partition = self.partition,
            records = records_seen,
            buffered = buffered.len(),
            "model shard forwarded, leaving loading mode"
        );
        for record in buffered {
            self.dispatch_record(record)?;
        }
        Ok(())
    }

    fn absorb_feedback(&mut self, msg: ServerToWorker<WL::Pull>) -> AnyResult<()> {
        if matches!(msg.payload, ServerPayload::EndOfModelMarker) {
            // Keepalive traffic of an in-flight model load; semantically
            // empty for the worker.
            if self.model_load_job() {
                debug!(partition = self.partition, "load keepalive marker ignored");
                return Ok(());
            }
            return Err(FabricError::UnexpectedEomMarker.into());
        }
        let Self {
            partition,
            logic,
            sender,
            receiver,
            fanout,
            outputs,
            defect,
            ..
        } = self;
        receiver.on_answer_msg(msg, &mut |id, value| {
            let mut client = WorkerClient {
                partition: *partition,
                sender: &mut *sender,
                fanout: &*fanout,
                outputs: &*outputs,
                defect: &mut *defect,
            };
            logic.on_pull_recv(id, value, &mut client)
        })?;
        self.take_defect()
    }

    fn model_load_job(&self) -> bool {
        !matches!(self.load, LoadState::Inactive)
    }

    fn take_defect(&mut self) -> AnyResult<()> {
        match self.defect.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Per-invocation client facade handed to worker handlers.
struct WorkerClient<'a, WS, PullP, PushP, WOut, SOut> {
    partition: PartitionIndex,
    sender: &'a mut WS,
    fanout: &'a ServerFanout<PullP, PushP>,
    outputs: &'a UnboundedSender<JobOutput<WOut, SOut>>,
    defect: &'a mut Option<AnyError>,
}

impl<'a, WS, PullP, PushP, WOut, SOut> ParameterServerClient
    for WorkerClient<'a, WS, PullP, PushP, WOut, SOut>
where
    WS: WorkerSender<PullP, PushP>,
{
    type Push = PushP;
    type Output = WOut;

    fn pull(&mut self, id: ParamId) {
        let Self {
            partition,
            sender,
            fanout,
            defect,
            ..
        } = self;
        if defect.is_some() {
            return;
        }
        if let Err(e) = sender.on_pull(id, *partition, &mut |m| fanout.route(m)) {
            **defect = Some(e);
        }
    }

    fn push(&mut self, id: ParamId, delta: PushP) {
        let Self {
            partition,
            sender,
            fanout,
            defect,
            ..
        } = self;
        if defect.is_some() {
            return;
        }
        if let Err(e) = sender.on_push(id, delta, *partition, &mut |m| fanout.route(m)) {
            **defect = Some(e);
        }
    }

    fn output(&mut self, out: WOut) {
        if self.outputs.unbounded_send(JobOutput::Worker(out)).is_err() {
            debug!("output stream is closed, dropping worker output");
        }
    }
}
