//! Job launch, supervision and teardown.
//!
//! [`launch`] spawns one named thread per partition, wires the cyclic
//! channel topology, feeds the training (and model) streams, and hands
//! supervision to a dedicated thread that watches the [`LoopActivity`]
//! tracker. Termination is either iteration-idle or a partition failure;
//! in both cases workers are shut down and joined before servers, so the
//! final server snapshot reflects every drained push.

use std::future::Future;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::anyhow;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
#[cfg(target_os = "linux")]
use monoio::IoUringDriver;
use monoio::{utils::bind_to_cpu_set, LegacyDriver, RuntimeBuilder};
use tracing::{debug, info, warn};

use super::server::ServerOperator;
use super::worker::{LoadState, WorkerOperator};
use super::{LoopActivity, ServerEvent, ServerFanout, WorkerEvent, WorkerFanout};
use crate::codec::{PsReceiver, PsSender, WorkerReceiver, WorkerSender};
#[cfg(target_os = "linux")]
use crate::config::RuntimeType;
use crate::config::{JobConfig, RuntimeConfig};
use crate::error::AnyResult;
use crate::logic::{ParameterServerLogic, PartitionContext, WorkerLogic};
use crate::message::{JobOutput, ModelRecord, PartitionIndex};
use crate::transform::Routing;

#[cfg(target_os = "linux")]
const SQPOLL_IDLE_FLOOR: u32 = 1000;

/// A launched job. Dropping the handle does not stop the job; [`wait`] is
/// the join point.
///
/// [`wait`]: JobHandle::wait
pub struct JobHandle<WOut, SOut> {
    supervisor: JoinHandle<Vec<AnyResult<()>>>,
    outputs: UnboundedReceiver<JobOutput<WOut, SOut>>,
}

impl<WOut, SOut> JobHandle<WOut, SOut> {
    /// Block until the job terminates, surface the first partition failure
    /// if any, and return the merged output stream.
    pub fn wait(mut self) -> AnyResult<Vec<JobOutput<WOut, SOut>>> {
        let results = self
            .supervisor
            .join()
            .map_err(|_| anyhow!("supervisor thread panicked"))?;
        ResultGroup::from(results).err()?;
        let mut collected = Vec::new();
        while let Ok(Some(output)) = self.outputs.try_next() {
            collected.push(output);
        }
        Ok(collected)
    }
}

/// A collection of per-partition results, reduced to the first failure.
pub(crate) struct ResultGroup<T, E>(Vec<Result<T, E>>);

impl<T, E> From<Vec<Result<T, E>>> for ResultGroup<T, E> {
    fn from(value: Vec<Result<T, E>>) -> Self {
        Self(value)
    }
}

impl<E> ResultGroup<(), E> {
    pub(crate) fn err(self) -> Result<(), E> {
        for r in self.0.into_iter() {
            r?;
        }
        Ok(())
    }
}

/// Everything needed to start one job.
pub(crate) struct JobSpec<T, WL, PL, WS, WR, PR, SS>
where
    WL: WorkerLogic<Record = T>,
    PL: ParameterServerLogic<Pull = WL::Pull, Push = WL::Push>,
{
    pub(crate) training: Vec<T>,
    pub(crate) model: Option<Vec<ModelRecord<WL::Pull>>>,
    pub(crate) keepalive: bool,
    pub(crate) workers: Vec<WL>,
    pub(crate) servers: Vec<PL>,
    pub(crate) routing: Routing<WL::Pull, WL::Push, WS, WR, PR, SS>,
    pub(crate) config: JobConfig,
}

pub(crate) fn launch<T, WL, PL, WS, WR, PR, SS>(
    spec: JobSpec<T, WL, PL, WS, WR, PR, SS>,
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
    spec.config.validate()?;
    let w = spec.config.worker_parallelism;
    let s = spec.config.server_parallelism;
    debug_assert_eq!(spec.workers.len(), w as usize);
    debug_assert_eq!(spec.servers.len(), s as usize);

    let activity = Arc::new(LoopActivity::new());
    let loading = spec.model.is_some();
    let runtime = Arc::new(spec.config.runtime.clone());
    let cores = if runtime.cpu_affinity {
        std::thread::available_parallelism().ok().map(|n| n.get())
    } else {
        None
    };

    let (out_tx, out_rx) = unbounded();
    let (worker_txs, worker_rxs): (Vec<_>, Vec<_>) = (0..w)
        .map(|_| unbounded::<WorkerEvent<T, WL::Pull>>())
        .unzip();
    let (server_txs, server_rxs): (Vec<_>, Vec<_>) = (0..s)
        .map(|_| unbounded::<ServerEvent<WL::Pull, WL::Push>>())
        .unzip();

    let mut server_handles = Vec::with_capacity(s as usize);
    for (index, (logic, rx)) in spec.servers.into_iter().zip(server_rxs).enumerate() {
        let op = ServerOperator {
            partition: index as PartitionIndex,
            logic,
            receiver: spec.routing.ps_receiver.clone(),
            sender: spec.routing.ps_sender.clone(),
            fanout: WorkerFanout::new(
                worker_txs.clone(),
                spec.routing.server_to_worker.clone(),
                activity.clone(),
            ),
            outputs: out_tx.clone(),
            activity: activity.clone(),
            eom_remaining: if loading { w } else { 0 },
            keepalive: spec.keepalive,
            pending_pulls: Vec::new(),
            defect: None,
        };
        let ctx = PartitionContext {
            index: index as PartitionIndex,
            parallelism: s,
            peer_parallelism: w,
        };
        server_handles.push(spawn_partition(
            format!("paramflow-server-{index}"),
            runtime.clone(),
            cores.map(|n| (w as usize + index) % n),
            move || op.run(rx, ctx),
        )?);
    }

    let mut worker_handles = Vec::with_capacity(w as usize);
    for (index, (logic, rx)) in spec.workers.into_iter().zip(worker_rxs).enumerate() {
        let op = WorkerOperator {
            partition: index as PartitionIndex,
            logic,
            sender: spec.routing.worker_sender.clone(),
            receiver: spec.routing.worker_receiver.clone(),
            fanout: ServerFanout::new(
                server_txs.clone(),
                spec.routing.worker_to_server.clone(),
                activity.clone(),
            ),
            outputs: out_tx.clone(),
            activity: activity.clone(),
            load: if loading {
                LoadState::Loading {
                    buffered: Vec::new(),
                    records_seen: 0,
                }
            } else {
                LoadState::Inactive
            },
            defect: None,
        };
        let ctx = PartitionContext {
            index: index as PartitionIndex,
            parallelism: w,
            peer_parallelism: s,
        };
        worker_handles.push(spawn_partition(
            format!("paramflow-worker-{index}"),
            runtime.clone(),
            cores.map(|n| index % n),
            move || op.run(rx, ctx),
        )?);
    }
    drop(out_tx);

    // Training goes in first: a loading worker buffers whatever it sees
    // before its model shard is complete.
    for (i, record) in spec.training.into_iter().enumerate() {
        feed(
            &worker_txs[i % w as usize],
            WorkerEvent::Record(record),
            &activity,
        );
    }
    if let Some(model) = spec.model {
        for (i, record) in model.into_iter().enumerate() {
            feed(
                &worker_txs[i % w as usize],
                WorkerEvent::Model(record),
                &activity,
            );
        }
        for tx in &worker_txs {
            feed(tx, WorkerEvent::ModelEos, &activity);
        }
    }

    let wait_ms = spec.config.iteration_wait_ms;
    let supervisor = std::thread::Builder::new()
        .name("paramflow-supervisor".into())
        .spawn(move || {
            supervise(
                activity,
                wait_ms,
                worker_txs,
                server_txs,
                worker_handles,
                server_handles,
            )
        })?;

    info!(
        workers = w,
        servers = s,
        wait_ms,
        model_load = loading,
        "job launched"
    );
    Ok(JobHandle {
        supervisor,
        outputs: out_rx,
    })
}

fn spawn_partition<Fut>(
    name: String,
    runtime: Arc<RuntimeConfig>,
    core: Option<usize>,
    task: impl FnOnce() -> Fut + Send + 'static,
) -> AnyResult<JoinHandle<AnyResult<()>>>
where
    Fut: Future<Output = AnyResult<()>>,
{
    let handle = std::thread::Builder::new().name(name).spawn(move || {
        // bind thread to cpu core
        if let Some(core) = core {
            if let Err(e) = bind_to_cpu_set([core]) {
                warn!("bind thread to core {core} failed: {e}");
            }
        }
        block_on_partition(runtime.as_ref(), task())
    })?;
    Ok(handle)
}

/// Drive one partition's event loop to completion on its own runtime:
/// io_uring (with optional sq polling) where configured and detected, the
/// legacy driver otherwise. Timers are always enabled.
fn block_on_partition<F: Future>(config: &RuntimeConfig, future: F) -> F::Output {
    #[cfg(target_os = "linux")]
    if config.runtime_type == RuntimeType::IoUring && monoio::utils::detect_uring() {
        let mut builder = RuntimeBuilder::<IoUringDriver>::new();
        if let Some(idle) = config.sqpoll_idle {
            let mut uring = io_uring::IoUring::builder();
            uring.setup_sqpoll(idle.max(SQPOLL_IDLE_FLOOR));
            builder = builder.uring_builder(uring);
        }
        return builder
            .enable_timer()
            .with_entries(config.entries)
            .build()
            .expect("build io_uring partition runtime")
            .block_on(future);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = config;
    RuntimeBuilder::<LegacyDriver>::new()
        .enable_timer()
        .build()
        .expect("build legacy partition runtime")
        .block_on(future)
}

fn feed<E>(tx: &UnboundedSender<E>, event: E, activity: &LoopActivity) {
    activity.sent();
    if tx.unbounded_send(event).is_err() {
        activity.done();
        debug!("partition queue closed during feed");
    }
}

fn supervise<T, PullP, PushP>(
    activity: Arc<LoopActivity>,
    wait_ms: u64,
    worker_txs: Vec<UnboundedSender<WorkerEvent<T, PullP>>>,
    server_txs: Vec<UnboundedSender<ServerEvent<PullP, PushP>>>,
    workers: Vec<JoinHandle<AnyResult<()>>>,
    servers: Vec<JoinHandle<AnyResult<()>>>,
) -> Vec<AnyResult<()>> {
    let poll = poll_interval(wait_ms);
    loop {
        std::thread::sleep(poll);
        if activity.is_aborted() {
            warn!("a partition failed, tearing the job down");
            break;
        }
        if wait_ms > 0 && activity.quiescent(Duration::from_millis(wait_ms)) {
            info!(wait_ms, "iteration loop idle, terminating the job");
            break;
        }
    }
    for tx in &worker_txs {
        let _ = tx.unbounded_send(WorkerEvent::Shutdown);
    }
    let mut results: Vec<AnyResult<()>> = workers.into_iter().map(join_partition).collect();
    for tx in &server_txs {
        let _ = tx.unbounded_send(ServerEvent::Shutdown);
    }
    results.extend(servers.into_iter().map(join_partition));
    results
}

fn poll_interval(wait_ms: u64) -> Duration {
    if wait_ms == 0 {
        Duration::from_millis(100)
    } else {
        Duration::from_millis((wait_ms / 4).clamp(5, 100))
    }
}

fn join_partition(handle: JoinHandle<AnyResult<()>>) -> AnyResult<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("partition thread panicked")),
    }
}
