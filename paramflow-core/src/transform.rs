//! Public entry points: compose a training stream, per-partition logic and
//! a routing layer into a running job.
//!
//! Every variant returns a [`JobHandle`]; the job runs until the iteration
//! loop has been idle for `iteration_wait_ms` (or forever when that is
//! zero), then closes every logic instance exactly once and completes the
//! merged output stream.

use std::sync::Arc;

use crate::codec::{
    PsReceiver, PsSender, SimplePsReceiver, SimplePsSender, SimpleWorkerReceiver,
    SimpleWorkerSender, WorkerReceiver, WorkerSender,
};
use crate::config::JobConfig;
use crate::error::AnyResult;
use crate::logic::{ParameterServerLogic, WorkerLogic};
use crate::message::{ModelRecord, ParamId, PartitionIndex};
use crate::partition::{
    AnswerTagPartitioner, HashPartitioner, ServerToWorkerPartitioner, WorkerToServerPartitioner,
};
use crate::runtime::{launch, JobHandle, JobSpec};
use crate::store::MapPs;

/// The routing layer of one job: the four codecs plus both partitioners.
///
/// Codecs are cloned once per partition; partitioners are shared.
pub struct Routing<PullP, PushP, WS, WR, PR, SS> {
    pub worker_sender: WS,
    pub worker_receiver: WR,
    pub ps_receiver: PR,
    pub ps_sender: SS,
    pub worker_to_server: Arc<dyn WorkerToServerPartitioner<PullP, PushP>>,
    pub server_to_worker: Arc<dyn ServerToWorkerPartitioner<PullP>>,
}

impl<PullP, PushP, WS, WR, PR, SS> Routing<PullP, PushP, WS, WR, PR, SS> {
    pub fn new(
        worker_sender: WS,
        worker_receiver: WR,
        ps_receiver: PR,
        ps_sender: SS,
        worker_to_server: Arc<dyn WorkerToServerPartitioner<PullP, PushP>>,
        server_to_worker: Arc<dyn ServerToWorkerPartitioner<PullP>>,
    ) -> Self {
        Self {
            worker_sender,
            worker_receiver,
            ps_receiver,
            ps_sender,
            worker_to_server,
            server_to_worker,
        }
    }
}

/// Default routing: one frame per operation, hash-partitioned requests,
/// tag-addressed answers.
pub type SimpleRouting<PullP, PushP> = Routing<
    PullP,
    PushP,
    SimpleWorkerSender,
    SimpleWorkerReceiver,
    SimplePsReceiver,
    SimplePsSender,
>;

impl<PullP: 'static, PushP: 'static>
    Routing<PullP, PushP, SimpleWorkerSender, SimpleWorkerReceiver, SimplePsReceiver, SimplePsSender>
{
    pub fn simple() -> Self {
        Routing::new(
            SimpleWorkerSender,
            SimpleWorkerReceiver,
            SimplePsReceiver,
            SimplePsSender,
            Arc::new(HashPartitioner),
            Arc::new(AnswerTagPartitioner),
        )
    }
}

fn instances<L>(mut make: impl FnMut(PartitionIndex) -> L, parallelism: u32) -> Vec<L> {
    (0..parallelism).map(&mut make).collect()
}

/// Run worker logic against user parameter-server logic with default
/// routing. Symmetric and asymmetric jobs both go through here; a
/// symmetric job simply instantiates `Pull = Push`.
pub fn transform<T, WL, PL>(
    training: impl IntoIterator<Item = T>,
    make_worker: impl FnMut(PartitionIndex) -> WL,
    make_ps: impl FnMut(PartitionIndex) -> PL,
    config: &JobConfig,
) -> AnyResult<JobHandle<WL::Output, PL::Output>>
where
    T: Send + 'static,
    WL: WorkerLogic<Record = T> + Send + 'static,
    PL: ParameterServerLogic<Pull = WL::Pull, Push = WL::Push> + Send + 'static,
    WL::Pull: Send + 'static,
    WL::Push: Send + 'static,
    WL::Output: Send + 'static,
    PL::Output: Send + 'static,
{
    transform_custom(training, make_worker, make_ps, Routing::simple(), config)
}

/// Symmetric job against the default map-backed parameter server, defined
/// by an `init` and a fold.
pub fn transform_with_default_ps<T, P, WL, I, U>(
    training: impl IntoIterator<Item = T>,
    make_worker: impl FnMut(PartitionIndex) -> WL,
    init: I,
    update: U,
    config: &JobConfig,
) -> AnyResult<JobHandle<WL::Output, (ParamId, P)>>
where
    T: Send + 'static,
    P: Clone + Send + 'static,
    WL: WorkerLogic<Record = T, Pull = P, Push = P> + Send + 'static,
    WL::Output: Send + 'static,
    I: FnMut(ParamId) -> P + Clone + Send + 'static,
    U: FnMut(&P, P) -> P + Clone + Send + 'static,
{
    transform(
        training,
        make_worker,
        move |_| MapPs::new(init.clone(), update.clone()),
        config,
    )
}

/// Full custom routing: both partitioners and all four codecs.
pub fn transform_custom<T, WL, PL, WS, WR, PR, SS>(
    training: impl IntoIterator<Item = T>,
    make_worker: impl FnMut(PartitionIndex) -> WL,
    make_ps: impl FnMut(PartitionIndex) -> PL,
    routing: Routing<WL::Pull, WL::Push, WS, WR, PR, SS>,
    config: &JobConfig,
) -> AnyResult<JobHandle<WL::Output, PL::Output>>
where
    T: Send + 'static,
    WL: WorkerLogic<Record = T> + Send + 'static,
    PL: ParameterServerLogic<Pull = WL::Pull, Push = WL::Push> + Send + 'static,
    WL::Pull: Send + 'static,
    WL::Push: Send + 'static,
    WL::Output: Send + 'static,
    PL::Output: Send + 'static,
    WS: WorkerSender<WL::Pull, WL::Push> + Clone + 'static,
    WR: WorkerReceiver<WL::Pull> + Clone + 'static,
    PR: PsReceiver<WL::Pull, WL::Push> + Clone + 'static,
    SS: PsSender<WL::Pull> + Clone + 'static,
{
    config.validate()?;
    launch(JobSpec {
        training: training.into_iter().collect(),
        model: None,
        keepalive: false,
        workers: instances(make_worker, config.worker_parallelism),
        servers: instances(make_ps, config.server_parallelism),
        routing,
        config: config.clone(),
    })
}

/// Preload server-side parameters before training starts.
///
/// Training records observed while the load is in flight are buffered at
/// the workers; no pull is answered until every worker partition has
/// forwarded its model shard.
pub fn transform_with_model_load<T, WL, PL>(
    model: impl IntoIterator<Item = (ParamId, WL::Pull)>,
    training: impl IntoIterator<Item = T>,
    make_worker: impl FnMut(PartitionIndex) -> WL,
    make_ps: impl FnMut(PartitionIndex) -> PL,
    config: &JobConfig,
) -> AnyResult<JobHandle<WL::Output, PL::Output>>
where
    T: Send + 'static,
    WL: WorkerLogic<Record = T> + Send + 'static,
    PL: ParameterServerLogic<Pull = WL::Pull, Push = WL::Push> + Send + 'static,
    WL::Pull: Send + 'static,
    WL::Push: Send + 'static,
    WL::Output: Send + 'static,
    PL::Output: Send + 'static,
{
    config.validate()?;
    let model = model
        .into_iter()
        .map(|(id, value)| ModelRecord::Server(id, value))
        .collect();
    launch(JobSpec {
        training: training.into_iter().collect(),
        model: Some(model),
        keepalive: false,
        workers: instances(make_worker, config.worker_parallelism),
        servers: instances(make_ps, config.server_parallelism),
        routing: Routing::simple(),
        config: config.clone(),
    })
}

/// Preload matching parameter copies on both tiers.
///
/// `Server` records reach their home server partition as preloads; `Worker`
/// records are applied to the receiving worker through
/// [`WorkerLogic::update_model`]. While the load is in flight every applied
/// server push answers back a synthetic keepalive marker so a bulk load
/// cannot trip the iteration-idle timer.
pub fn transform_with_double_model_load<T, WL, PL>(
    model: impl IntoIterator<Item = ModelRecord<WL::Pull>>,
    training: impl IntoIterator<Item = T>,
    make_worker: impl FnMut(PartitionIndex) -> WL,
    make_ps: impl FnMut(PartitionIndex) -> PL,
    config: &JobConfig,
) -> AnyResult<JobHandle<WL::Output, PL::Output>>
where
    T: Send + 'static,
    WL: WorkerLogic<Record = T> + Send + 'static,
    PL: ParameterServerLogic<Pull = WL::Pull, Push = WL::Push> + Send + 'static,
    WL::Pull: Send + 'static,
    WL::Push: Send + 'static,
    WL::Output: Send + 'static,
    PL::Output: Send + 'static,
{
    config.validate()?;
    launch(JobSpec {
        training: training.into_iter().collect(),
        model: Some(model.into_iter().collect()),
        keepalive: true,
        workers: instances(make_worker, config.worker_parallelism),
        servers: instances(make_ps, config.server_parallelism),
        routing: Routing::simple(),
        config: config.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::AnyResult;
    use crate::logic::{ParameterServerClient, PartitionContext};
    use crate::message::{JobOutput, ServerPayload, ServerToWorker};

    fn config(workers: u32, servers: u32, wait_ms: u64) -> JobConfig {
        let mut config = JobConfig::new(workers, servers, wait_ms);
        // Partition counts in these jobs are tiny; core pinning only adds
        // noise on loaded test machines.
        config.runtime.cpu_affinity = false;
        config
    }

    fn server_outputs<WOut, SOut: Ord>(outputs: Vec<JobOutput<WOut, SOut>>) -> Vec<SOut> {
        let mut found: Vec<SOut> = outputs.into_iter().filter_map(JobOutput::server).collect();
        found.sort();
        found
    }

    fn worker_outputs<WOut: Ord, SOut>(outputs: Vec<JobOutput<WOut, SOut>>) -> Vec<WOut> {
        let mut found: Vec<WOut> = outputs.into_iter().filter_map(JobOutput::worker).collect();
        found.sort();
        found
    }

    /// Pushes `1` to the id carried by every training record.
    struct PushOnes;

    impl WorkerLogic for PushOnes {
        type Record = ParamId;
        type Pull = i64;
        type Push = i64;
        type Output = ();

        fn on_recv(
            &mut self,
            record: ParamId,
            client: &mut dyn ParameterServerClient<Push = i64, Output = ()>,
        ) -> AnyResult<()> {
            client.push(record, 1);
            Ok(())
        }

        fn on_pull_recv(
            &mut self,
            _id: ParamId,
            _value: i64,
            _client: &mut dyn ParameterServerClient<Push = i64, Output = ()>,
        ) -> AnyResult<()> {
            bail_into!("push-only worker received a pull answer")
        }
    }

    /// Pulls the id of every training record and emits the answer.
    #[derive(Default)]
    struct PullEcho;

    impl WorkerLogic for PullEcho {
        type Record = ParamId;
        type Pull = i64;
        type Push = i64;
        type Output = (ParamId, i64);

        fn on_recv(
            &mut self,
            record: ParamId,
            client: &mut dyn ParameterServerClient<Push = i64, Output = (ParamId, i64)>,
        ) -> AnyResult<()> {
            client.pull(record);
            Ok(())
        }

        fn on_pull_recv(
            &mut self,
            id: ParamId,
            value: i64,
            client: &mut dyn ParameterServerClient<Push = i64, Output = (ParamId, i64)>,
        ) -> AnyResult<()> {
            client.output((id, value));
            Ok(())
        }
    }

    #[test]
    fn test_symmetric_increment() {
        let handle = transform_with_default_ps(
            [7, 7, 7],
            |_| PushOnes,
            |_id| 0i64,
            |v: &i64, d: i64| v + d,
            &config(2, 2, 200),
        )
        .unwrap();
        let outputs = handle.wait().unwrap();
        assert_eq!(server_outputs(outputs), vec![(7, 3)]);
    }

    /// Pulls, asserts the initialized value, then pushes a `1` on top.
    struct PullThenPush;

    impl WorkerLogic for PullThenPush {
        type Record = ParamId;
        type Pull = i64;
        type Push = i64;
        type Output = (ParamId, i64);

        fn on_recv(
            &mut self,
            record: ParamId,
            client: &mut dyn ParameterServerClient<Push = i64, Output = (ParamId, i64)>,
        ) -> AnyResult<()> {
            client.pull(record);
            Ok(())
        }

        fn on_pull_recv(
            &mut self,
            id: ParamId,
            value: i64,
            client: &mut dyn ParameterServerClient<Push = i64, Output = (ParamId, i64)>,
        ) -> AnyResult<()> {
            client.output((id, value));
            client.push(id, 1);
            Ok(())
        }
    }

    #[test]
    fn test_pull_before_push_observes_initialization() {
        let handle = transform_with_default_ps(
            [4],
            |_| PullThenPush,
            |id| i64::from(id) * 10,
            |v: &i64, d: i64| v + d,
            &config(1, 1, 200),
        )
        .unwrap();
        let outputs = handle.wait().unwrap();
        let workers: Vec<_> = outputs
            .iter()
            .filter_map(|o| match o {
                JobOutput::Worker(w) => Some(*w),
                JobOutput::Server(_) => None,
            })
            .collect();
        assert_eq!(workers, vec![(4, 40)]);
        assert_eq!(server_outputs(outputs), vec![(4, 41)]);
    }

    /// Reports which partition observed which answer.
    #[derive(Default)]
    struct WhoAmI {
        index: u32,
    }

    impl WorkerLogic for WhoAmI {
        type Record = ParamId;
        type Pull = i64;
        type Push = i64;
        type Output = (u32, ParamId, i64);

        fn open(&mut self, ctx: &PartitionContext) -> AnyResult<()> {
            self.index = ctx.index;
            Ok(())
        }

        fn on_recv(
            &mut self,
            record: ParamId,
            client: &mut dyn ParameterServerClient<Push = i64, Output = (u32, ParamId, i64)>,
        ) -> AnyResult<()> {
            client.pull(record);
            Ok(())
        }

        fn on_pull_recv(
            &mut self,
            id: ParamId,
            value: i64,
            client: &mut dyn ParameterServerClient<Push = i64, Output = (u32, ParamId, i64)>,
        ) -> AnyResult<()> {
            client.output((self.index, id, value));
            Ok(())
        }
    }

    #[test]
    fn test_answers_return_to_the_issuing_partition() {
        let handle = transform_with_default_ps(
            [5, 5, 5],
            |_| WhoAmI::default(),
            |_| 9i64,
            |v: &i64, d: i64| v + d,
            &config(3, 2, 200),
        )
        .unwrap();
        let outputs = handle.wait().unwrap();
        assert_eq!(
            worker_outputs(outputs),
            vec![(0, 5, 9), (1, 5, 9), (2, 5, 9)]
        );
    }

    /// Stamps every answer with an out-of-range worker partition.
    #[derive(Clone, Copy)]
    struct BrokenPsSender;

    impl PsSender<i64> for BrokenPsSender {
        fn on_pull_answer(
            &mut self,
            id: ParamId,
            value: i64,
            target: PartitionIndex,
            emit: &mut dyn FnMut(ServerToWorker<i64>) -> AnyResult<()>,
        ) -> AnyResult<()> {
            emit(ServerToWorker {
                target: target + 100,
                payload: ServerPayload::PullAnswer(id, value),
            })
        }
    }

    #[test]
    fn test_misrouted_answer_is_fatal() {
        let routing = Routing::new(
            SimpleWorkerSender,
            SimpleWorkerReceiver,
            SimplePsReceiver,
            BrokenPsSender,
            Arc::new(HashPartitioner),
            Arc::new(AnswerTagPartitioner),
        );
        let handle = transform_custom(
            [1],
            |_| PullEcho,
            |_| MapPs::new(|_| 0i64, |v: &i64, d: i64| v + d),
            routing,
            &config(1, 1, 200),
        )
        .unwrap();
        let err = handle.wait().unwrap_err();
        assert!(err
            .to_string()
            .contains("Pull answer key should be the partition ID itself"));
    }

    #[test]
    fn test_invalid_parallelism_fails_at_setup() {
        let err = transform_with_default_ps(
            [1],
            |_| PushOnes,
            |_| 0i64,
            |v: &i64, d: i64| v + d,
            &config(0, 1, 100),
        )
        .err()
        .expect("zero worker parallelism must be rejected");
        assert!(err.to_string().contains("invalid parallelism"));
    }

    #[test]
    fn test_worker_logic_errors_propagate() {
        struct Failing;

        impl WorkerLogic for Failing {
            type Record = ParamId;
            type Pull = i64;
            type Push = i64;
            type Output = ();

            fn on_recv(
                &mut self,
                _record: ParamId,
                _client: &mut dyn ParameterServerClient<Push = i64, Output = ()>,
            ) -> AnyResult<()> {
                bail_into!("deliberate training failure")
            }

            fn on_pull_recv(
                &mut self,
                _id: ParamId,
                _value: i64,
                _client: &mut dyn ParameterServerClient<Push = i64, Output = ()>,
            ) -> AnyResult<()> {
                Ok(())
            }
        }

        let handle = transform_with_default_ps(
            [1],
            |_| Failing,
            |_| 0i64,
            |v: &i64, d: i64| v + d,
            &config(1, 1, 5_000),
        )
        .unwrap();
        let err = handle.wait().unwrap_err();
        assert!(err.to_string().contains("deliberate training failure"));
    }

    #[test]
    fn test_close_runs_once_per_partition() {
        struct CountingClose {
            closes: Arc<AtomicUsize>,
        }

        impl WorkerLogic for CountingClose {
            type Record = ParamId;
            type Pull = i64;
            type Push = i64;
            type Output = ();

            fn on_recv(
                &mut self,
                _record: ParamId,
                _client: &mut dyn ParameterServerClient<Push = i64, Output = ()>,
            ) -> AnyResult<()> {
                Ok(())
            }

            fn on_pull_recv(
                &mut self,
                _id: ParamId,
                _value: i64,
                _client: &mut dyn ParameterServerClient<Push = i64, Output = ()>,
            ) -> AnyResult<()> {
                Ok(())
            }

            fn close(&mut self) -> AnyResult<()> {
                self.closes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let closes = Arc::new(AtomicUsize::new(0));
        let handle = transform_with_default_ps(
            Vec::<ParamId>::new(),
            |_| CountingClose {
                closes: closes.clone(),
            },
            |_| 0i64,
            |v: &i64, d: i64| v + d,
            &config(3, 2, 100),
        )
        .unwrap();
        let outputs = handle.wait().unwrap();
        assert!(outputs.is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_single_side_model_load() {
        let handle = transform_with_model_load(
            [(10, 100i64), (20, 200i64)],
            [10, 20],
            |_| PullEcho,
            |_| MapPs::new(|_| 0i64, |v: &i64, d: i64| v + d),
            &config(2, 2, 300),
        )
        .unwrap();
        let outputs = handle.wait().unwrap();
        assert_eq!(worker_outputs(outputs), vec![(10, 100), (20, 200)]);
    }

    #[test]
    fn test_model_must_cover_every_worker_partition() {
        let handle = transform_with_model_load(
            [(10, 100i64)],
            [10],
            |_| PullEcho,
            |_| MapPs::new(|_| 0i64, |v: &i64, d: i64| v + d),
            &config(2, 1, 5_000),
        )
        .unwrap();
        let err = handle.wait().unwrap_err();
        assert!(err
            .to_string()
            .contains("must be a parameter per model partition when loading model"));
    }

    /// Serves lookups from a worker-side replica, falling back to a pull.
    #[derive(Default)]
    struct ReplicaReader {
        replica: HashMap<ParamId, i64>,
    }

    impl WorkerLogic for ReplicaReader {
        type Record = ParamId;
        type Pull = i64;
        type Push = i64;
        type Output = (ParamId, i64);

        fn on_recv(
            &mut self,
            record: ParamId,
            client: &mut dyn ParameterServerClient<Push = i64, Output = (ParamId, i64)>,
        ) -> AnyResult<()> {
            match self.replica.get(&record) {
                Some(value) => client.output((record, *value)),
                None => client.pull(record),
            }
            Ok(())
        }

        fn on_pull_recv(
            &mut self,
            id: ParamId,
            value: i64,
            client: &mut dyn ParameterServerClient<Push = i64, Output = (ParamId, i64)>,
        ) -> AnyResult<()> {
            client.output((id, value));
            Ok(())
        }

        fn update_model(&mut self, id: ParamId, value: i64) -> AnyResult<()> {
            self.replica.insert(id, value);
            Ok(())
        }
    }

    #[test]
    fn test_double_sided_model_load() {
        let model = vec![
            ModelRecord::Server(1, 10i64),
            ModelRecord::Worker(2, 20i64),
            ModelRecord::Server(3, 30i64),
        ];
        let handle = transform_with_double_model_load(
            model,
            [2, 1, 3],
            |_| ReplicaReader::default(),
            |_| MapPs::new(|_| 0i64, |v: &i64, d: i64| v + d),
            &config(1, 2, 300),
        )
        .unwrap();
        let outputs = handle.wait().unwrap();
        assert_eq!(worker_outputs(outputs), vec![(1, 10), (2, 20), (3, 30)]);
    }
}
