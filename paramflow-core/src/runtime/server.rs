//! The server partition operator.
//!
//! Owns one shard of parameter state through the user
//! [`ParameterServerLogic`], services pulls, absorbs pushes, and runs the
//! end-of-model barrier: while any worker still loads its model shard,
//! every pull is deferred and replayed only once all workers have reported
//! done. Pushes and parameter preloads are applied in arrival order at all
//! times.

use std::mem;
use std::sync::Arc;

use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use tracing::{debug, info};

use super::{LoopActivity, ServerEvent, WorkerFanout};
use crate::codec::{PsReceiver, PsSender, WorkerMessageHandler};
use crate::error::{AnyError, AnyResult, FabricError};
use crate::logic::{ParameterServer, ParameterServerLogic, PartitionContext};
use crate::message::{
    JobOutput, ParamId, PartitionIndex, ServerPayload, ServerToWorker, WorkerPayload,
    WorkerToServer,
};

pub(crate) struct ServerOperator<PL: ParameterServerLogic, PR, SS, T, WOut> {
    pub(crate) partition: PartitionIndex,
    pub(crate) logic: PL,
    pub(crate) receiver: PR,
    pub(crate) sender: SS,
    pub(crate) fanout: WorkerFanout<T, PL::Pull>,
    pub(crate) outputs: UnboundedSender<JobOutput<WOut, PL::Output>>,
    pub(crate) activity: Arc<LoopActivity>,
    /// End-of-model signals still outstanding; zero outside model load.
    pub(crate) eom_remaining: u32,
    /// Emit synthetic markers while loading (double-sided load only).
    pub(crate) keepalive: bool,
    pub(crate) pending_pulls: Vec<(ParamId, PartitionIndex)>,
    pub(crate) defect: Option<AnyError>,
}

impl<PL, PR, SS, T, WOut> ServerOperator<PL, PR, SS, T, WOut>
where
    PL: ParameterServerLogic,
    PR: PsReceiver<PL::Pull, PL::Push>,
    SS: PsSender<PL::Pull>,
{
    pub(crate) async fn run(
        mut self,
        mut rx: UnboundedReceiver<ServerEvent<PL::Pull, PL::Push>>,
        ctx: PartitionContext,
    ) -> AnyResult<()> {
        if let Err(e) = self.logic.open(&ctx) {
            self.activity.abort();
            return Err(e);
        }
        let mut failure = None;
        while let Some(event) = rx.next().await {
            let msg = match event {
                ServerEvent::Shutdown => break,
                ServerEvent::Message(msg) => msg,
            };
            let handled = self.handle(msg);
            self.activity.done();
            if let Err(e) = handled {
                self.activity.abort();
                failure = Some(e);
                break;
            }
        }
        rx.close();
        let closed = self.close();
        info!(partition = self.partition, "server partition closed");
        match failure {
            Some(e) => Err(e),
            None => closed,
        }
    }

    pub(crate) fn handle(&mut self, msg: WorkerToServer<PL::Pull, PL::Push>) -> AnyResult<()> {
        match msg.payload {
            WorkerPayload::Parameter(id, value) => self.apply_parameter(id, value),
            WorkerPayload::EndOfModel => self.absorb_end_of_model(),
            payload => {
                let source = msg.source;
                self.dispatch(WorkerToServer { source, payload })
            }
        }
    }

    /// Pull/push frames go through the receiver codec.
    fn dispatch(&mut self, msg: WorkerToServer<PL::Pull, PL::Push>) -> AnyResult<()> {
        let pushed;
        {
            let Self {
                logic,
                receiver,
                sender,
                fanout,
                outputs,
                defect,
                pending_pulls,
                eom_remaining,
                ..
            } = self;
            let mut dispatch = Dispatch {
                loading: *eom_remaining > 0,
                pending: pending_pulls,
                logic,
                sender,
                fanout,
                outputs,
                defect,
                pushed_id: None,
            };
            receiver.on_worker_msg(msg, &mut dispatch)?;
            pushed = dispatch.pushed_id;
        }
        self.take_defect()?;
        match pushed {
            Some(id) => self.keepalive_tick(id),
            None => Ok(()),
        }
    }

    fn apply_parameter(&mut self, id: ParamId, value: PL::Pull) -> AnyResult<()> {
        {
            let Self {
                logic,
                sender,
                fanout,
                outputs,
                defect,
                ..
            } = self;
            let mut ps = PsHandle {
                sender,
                fanout,
                outputs,
                defect,
            };
            logic.on_parameter_recv(id, value, &mut ps)?;
        }
        self.take_defect()?;
        self.keepalive_tick(id)
    }

    fn absorb_end_of_model(&mut self) -> AnyResult<()> {
        if self.eom_remaining == 0 {
            return Err(FabricError::UnexpectedEndOfModel(self.partition).into());
        }
        self.eom_remaining -= 1;
        if self.eom_remaining == 0 {
            let pending = mem::take(&mut self.pending_pulls);
            info!(
                partition = self.partition,
                replay = pending.len(),
                "model load complete, serving deferred pulls"
            );
            for (id, source) in pending {
                self.serve_pull(id, source)?;
            }
        }
        Ok(())
    }

    fn serve_pull(&mut self, id: ParamId, source: PartitionIndex) -> AnyResult<()> {
        {
            let Self {
                logic,
                sender,
                fanout,
                outputs,
                defect,
                ..
            } = self;
            let mut ps = PsHandle {
                sender,
                fanout,
                outputs,
                defect,
            };
            logic.on_pull_recv(id, source, &mut ps)?;
        }
        self.take_defect()
    }

    /// While loading, every applied push answers back a synthetic marker to
    /// a deterministically chosen worker so the iteration loop never looks
    /// idle during a bulk load.
    fn keepalive_tick(&mut self, id: ParamId) -> AnyResult<()> {
        if !self.keepalive || self.eom_remaining == 0 {
            return Ok(());
        }
        let workers = i64::from(self.fanout.workers());
        let target = ((i64::from(id) % workers + workers) % workers) as PartitionIndex;
        self.fanout.route(ServerToWorker {
            target,
            payload: ServerPayload::EndOfModelMarker,
        })
    }

    fn close(&mut self) -> AnyResult<()> {
        {
            let Self {
                logic,
                sender,
                fanout,
                outputs,
                defect,
                ..
            } = self;
            let mut ps = PsHandle {
                sender,
                fanout,
                outputs,
                defect,
            };
            logic.close(&mut ps)?;
        }
        self.take_defect()
    }

    fn take_defect(&mut self) -> AnyResult<()> {
        match self.defect.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Codec dispatch target: defers pulls while the barrier holds, records the
/// id of an applied push for the keepalive.
struct Dispatch<'a, PL: ParameterServerLogic, SS, T, WOut> {
    loading: bool,
    pending: &'a mut Vec<(ParamId, PartitionIndex)>,
    logic: &'a mut PL,
    sender: &'a mut SS,
    fanout: &'a WorkerFanout<T, PL::Pull>,
    outputs: &'a UnboundedSender<JobOutput<WOut, PL::Output>>,
    defect: &'a mut Option<AnyError>,
    pushed_id: Option<ParamId>,
}

impl<'a, PL, SS, T, WOut> WorkerMessageHandler<PL::Push> for Dispatch<'a, PL, SS, T, WOut>
where
    PL: ParameterServerLogic,
    SS: PsSender<PL::Pull>,
{
    fn on_pull(&mut self, id: ParamId, source: PartitionIndex) -> AnyResult<()> {
        if self.loading {
            self.pending.push((id, source));
            return Ok(());
        }
        let Self {
            logic,
            sender,
            fanout,
            outputs,
            defect,
            ..
        } = self;
        let mut ps = PsHandle {
            sender: &mut **sender,
            fanout: &**fanout,
            outputs: &**outputs,
            defect: &mut **defect,
        };
        logic.on_pull_recv(id, source, &mut ps)
    }

    fn on_push(&mut self, id: ParamId, delta: PL::Push) -> AnyResult<()> {
        {
            let Self {
                logic,
                sender,
                fanout,
                outputs,
                defect,
                ..
            } = self;
            let mut ps = PsHandle {
                sender: &mut **sender,
                fanout: &**fanout,
                outputs: &**outputs,
                defect: &mut **defect,
            };
            logic.on_push_recv(id, delta, &mut ps)?;
        }
        if self.loading {
            self.pushed_id = Some(id);
        }
        Ok(())
    }
}

/// Per-invocation server facade handed to PS handlers.
struct PsHandle<'a, SS, T, PullP, WOut, SOut> {
    sender: &'a mut SS,
    fanout: &'a WorkerFanout<T, PullP>,
    outputs: &'a UnboundedSender<JobOutput<WOut, SOut>>,
    defect: &'a mut Option<AnyError>,
}

impl<'a, SS, T, PullP, WOut, SOut> ParameterServer for PsHandle<'a, SS, T, PullP, WOut, SOut>
where
    SS: PsSender<PullP>,
{
    type Pull = PullP;
    type Output = SOut;

    fn answer_pull(&mut self, id: ParamId, value: PullP, target: PartitionIndex) {
        let Self {
            sender,
            fanout,
            defect,
            ..
        } = self;
        if defect.is_some() {
            return;
        }
        if let Err(e) = sender.on_pull_answer(id, value, target, &mut |m| fanout.route(m)) {
            **defect = Some(e);
        }
    }

    fn output(&mut self, out: SOut) {
        if self.outputs.unbounded_send(JobOutput::Server(out)).is_err() {
            debug!("output stream is closed, dropping server output");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_channel::mpsc::{unbounded, UnboundedReceiver};

    use super::ServerOperator;
    use crate::codec::{SimplePsReceiver, SimplePsSender};
    use crate::message::{
        JobOutput, ParamId, ServerPayload, WorkerPayload, WorkerToServer,
    };
    use crate::partition::AnswerTagPartitioner;
    use crate::runtime::{LoopActivity, WorkerEvent, WorkerFanout};
    use crate::store::MapPs;

    type Store = MapPs<i64, fn(ParamId) -> i64, fn(&i64, i64) -> i64>;
    type Op = ServerOperator<Store, SimplePsReceiver, SimplePsSender, i32, ()>;
    type WorkerRx = UnboundedReceiver<WorkerEvent<i32, i64>>;

    fn operator(
        workers: usize,
        eom_remaining: u32,
        keepalive: bool,
    ) -> (Op, Vec<WorkerRx>, UnboundedReceiver<JobOutput<(), (ParamId, i64)>>) {
        let activity = Arc::new(LoopActivity::new());
        let (worker_txs, worker_rxs): (Vec<_>, Vec<_>) =
            (0..workers).map(|_| unbounded()).unzip();
        let (out_tx, out_rx) = unbounded();
        let op = ServerOperator {
            partition: 0,
            logic: MapPs::new((|_| 0) as fn(ParamId) -> i64, (|v, d| v + d) as fn(&i64, i64) -> i64),
            receiver: SimplePsReceiver,
            sender: SimplePsSender,
            fanout: WorkerFanout::new(
                worker_txs,
                Arc::new(AnswerTagPartitioner),
                activity.clone(),
            ),
            outputs: out_tx,
            activity,
            eom_remaining,
            keepalive,
            pending_pulls: Vec::new(),
            defect: None,
        };
        (op, worker_rxs, out_rx)
    }

    fn frame(source: u32, payload: WorkerPayload<i64, i64>) -> WorkerToServer<i64, i64> {
        WorkerToServer { source, payload }
    }

    #[test]
    fn test_pulls_defer_until_every_worker_reports_done() {
        let (mut op, mut worker_rxs, _out) = operator(2, 2, false);
        op.handle(frame(0, WorkerPayload::Parameter(5, 50))).unwrap();
        op.handle(frame(1, WorkerPayload::Pull(5))).unwrap();
        assert!(matches!(worker_rxs[1].try_next(), Err(_)), "pull answered before barrier");

        op.handle(frame(0, WorkerPayload::EndOfModel)).unwrap();
        assert!(matches!(worker_rxs[1].try_next(), Err(_)));

        op.handle(frame(1, WorkerPayload::EndOfModel)).unwrap();
        let answer = worker_rxs[1].try_next().unwrap().unwrap();
        let WorkerEvent::Feedback(msg) = answer else {
            panic!("expected a feedback frame");
        };
        assert_eq!(msg.target, 1);
        assert_eq!(msg.payload, ServerPayload::PullAnswer(5, 50));
    }

    #[test]
    fn test_loading_push_emits_keepalive_marker() {
        let (mut op, mut worker_rxs, _out) = operator(3, 1, true);
        // ((4 mod 3) + 3) mod 3 = 1
        op.handle(frame(0, WorkerPayload::Parameter(4, 100))).unwrap();
        let WorkerEvent::Feedback(msg) = worker_rxs[1].try_next().unwrap().unwrap() else {
            panic!("expected a feedback frame");
        };
        assert_eq!(msg.payload, ServerPayload::EndOfModelMarker);
        assert_eq!(msg.target, 1);

        op.handle(frame(0, WorkerPayload::Push(-2, 1))).unwrap();
        let WorkerEvent::Feedback(msg) = worker_rxs[1].try_next().unwrap().unwrap() else {
            panic!("expected a feedback frame");
        };
        assert_eq!(msg.payload, ServerPayload::EndOfModelMarker);
    }

    #[test]
    fn test_no_keepalive_once_load_completes() {
        let (mut op, mut worker_rxs, _out) = operator(2, 1, true);
        op.handle(frame(0, WorkerPayload::Parameter(1, 1))).unwrap();
        let _ = worker_rxs[1].try_next().unwrap().unwrap();
        op.handle(frame(0, WorkerPayload::EndOfModel)).unwrap();
        op.handle(frame(0, WorkerPayload::Push(1, 1))).unwrap();
        assert!(matches!(worker_rxs[1].try_next(), Err(_)));
    }

    #[test]
    fn test_surplus_end_of_model_is_rejected() {
        let (mut op, _worker_rxs, _out) = operator(1, 1, false);
        op.handle(frame(0, WorkerPayload::Parameter(1, 1))).unwrap();
        op.handle(frame(0, WorkerPayload::EndOfModel)).unwrap();
        let err = op.handle(frame(0, WorkerPayload::EndOfModel)).unwrap_err();
        assert!(err.to_string().contains("unexpected end-of-model"));
    }
}
