//! Codecs between logical pull/push operations and wire frames.
//!
//! The four seams exist so alternative transports (batched, compressed) can
//! be slotted in without touching the operators: senders wrap a logical
//! operation into one or more frames, receivers unwrap inbound frames and
//! dispatch into the appropriate callback. The `Simple*` implementations
//! below are the one-frame-per-operation defaults.

use crate::error::{AnyResult, FabricError};
use crate::message::{
    ParamId, PartitionIndex, ServerPayload, ServerToWorker, WorkerPayload, WorkerToServer,
};

/// Wraps worker-side pull/push operations into worker-to-server frames.
pub trait WorkerSender<PullP, PushP>: Send {
    /// Frame a pull for `id`, stamped with the issuing worker partition.
    fn on_pull(
        &mut self,
        id: ParamId,
        source: PartitionIndex,
        emit: &mut dyn FnMut(WorkerToServer<PullP, PushP>) -> AnyResult<()>,
    ) -> AnyResult<()>;

    /// Frame a push of `delta` to `id`.
    fn on_push(
        &mut self,
        id: ParamId,
        delta: PushP,
        source: PartitionIndex,
        emit: &mut dyn FnMut(WorkerToServer<PullP, PushP>) -> AnyResult<()>,
    ) -> AnyResult<()>;
}

/// Callback surface a [`PsReceiver`] dispatches into.
pub trait WorkerMessageHandler<PushP> {
    fn on_pull(&mut self, id: ParamId, source: PartitionIndex) -> AnyResult<()>;
    fn on_push(&mut self, id: ParamId, delta: PushP) -> AnyResult<()>;
}

/// Unwraps inbound frames at the server and dispatches each decoded
/// operation exactly once. Bootstrap control frames are consumed by the
/// server operator before the codec ever sees them.
pub trait PsReceiver<PullP, PushP>: Send {
    fn on_worker_msg(
        &mut self,
        msg: WorkerToServer<PullP, PushP>,
        handler: &mut dyn WorkerMessageHandler<PushP>,
    ) -> AnyResult<()>;
}

/// Wraps a pull answer into a server-to-worker frame addressed at the
/// worker partition that issued the pull.
pub trait PsSender<PullP>: Send {
    fn on_pull_answer(
        &mut self,
        id: ParamId,
        value: PullP,
        target: PartitionIndex,
        emit: &mut dyn FnMut(ServerToWorker<PullP>) -> AnyResult<()>,
    ) -> AnyResult<()>;
}

/// Unwraps inbound answer frames at the worker.
pub trait WorkerReceiver<PullP>: Send {
    fn on_answer_msg(
        &mut self,
        msg: ServerToWorker<PullP>,
        on_answer: &mut dyn FnMut(ParamId, PullP) -> AnyResult<()>,
    ) -> AnyResult<()>;
}

/// Default one-frame-per-operation sender.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleWorkerSender;

impl<PullP, PushP> WorkerSender<PullP, PushP> for SimpleWorkerSender {
    fn on_pull(
        &mut self,
        id: ParamId,
        source: PartitionIndex,
        emit: &mut dyn FnMut(WorkerToServer<PullP, PushP>) -> AnyResult<()>,
    ) -> AnyResult<()> {
        emit(WorkerToServer {
            source,
            payload: WorkerPayload::Pull(id),
        })
    }

    fn on_push(
        &mut self,
        id: ParamId,
        delta: PushP,
        source: PartitionIndex,
        emit: &mut dyn FnMut(WorkerToServer<PullP, PushP>) -> AnyResult<()>,
    ) -> AnyResult<()> {
        emit(WorkerToServer {
            source,
            payload: WorkerPayload::Push(id, delta),
        })
    }
}

/// Default server-side receiver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimplePsReceiver;

impl<PullP, PushP> PsReceiver<PullP, PushP> for SimplePsReceiver {
    fn on_worker_msg(
        &mut self,
        msg: WorkerToServer<PullP, PushP>,
        handler: &mut dyn WorkerMessageHandler<PushP>,
    ) -> AnyResult<()> {
        match msg.payload {
            WorkerPayload::Pull(id) => handler.on_pull(id, msg.source),
            WorkerPayload::Push(id, delta) => handler.on_push(id, delta),
            WorkerPayload::Parameter(..) | WorkerPayload::EndOfModel => {
                bail_into!("bootstrap frame reached the server receiver codec")
            }
        }
    }
}

/// Default answer sender.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimplePsSender;

impl<PullP> PsSender<PullP> for SimplePsSender {
    fn on_pull_answer(
        &mut self,
        id: ParamId,
        value: PullP,
        target: PartitionIndex,
        emit: &mut dyn FnMut(ServerToWorker<PullP>) -> AnyResult<()>,
    ) -> AnyResult<()> {
        emit(ServerToWorker {
            target,
            payload: ServerPayload::PullAnswer(id, value),
        })
    }
}

/// Default worker-side receiver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleWorkerReceiver;

impl<PullP> WorkerReceiver<PullP> for SimpleWorkerReceiver {
    fn on_answer_msg(
        &mut self,
        msg: ServerToWorker<PullP>,
        on_answer: &mut dyn FnMut(ParamId, PullP) -> AnyResult<()>,
    ) -> AnyResult<()> {
        match msg.payload {
            ServerPayload::PullAnswer(id, value) => on_answer(id, value),
            ServerPayload::EndOfModelMarker => Err(FabricError::UnexpectedEomMarker.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_emits_one_tagged_frame_per_operation() {
        let mut frames: Vec<WorkerToServer<i64, i64>> = Vec::new();
        let mut sender = SimpleWorkerSender;
        WorkerSender::<i64, i64>::on_pull(&mut sender, 3, 1, &mut |m| {
            frames.push(m);
            Ok(())
        })
        .unwrap();
        sender
            .on_push(4, 9i64, 1, &mut |m| {
                frames.push(m);
                Ok(())
            })
            .unwrap();
        assert_eq!(
            frames,
            vec![
                WorkerToServer {
                    source: 1,
                    payload: WorkerPayload::Pull(3)
                },
                WorkerToServer {
                    source: 1,
                    payload: WorkerPayload::Push(4, 9)
                },
            ]
        );
    }

    struct Recorder {
        pulls: Vec<(ParamId, PartitionIndex)>,
        pushes: Vec<(ParamId, i64)>,
    }

    impl WorkerMessageHandler<i64> for Recorder {
        fn on_pull(&mut self, id: ParamId, source: PartitionIndex) -> AnyResult<()> {
            self.pulls.push((id, source));
            Ok(())
        }

        fn on_push(&mut self, id: ParamId, delta: i64) -> AnyResult<()> {
            self.pushes.push((id, delta));
            Ok(())
        }
    }

    #[test]
    fn test_receiver_dispatches_exactly_once() {
        let mut recorder = Recorder {
            pulls: Vec::new(),
            pushes: Vec::new(),
        };
        let mut receiver = SimplePsReceiver;
        receiver
            .on_worker_msg(
                WorkerToServer::<i64, i64> {
                    source: 2,
                    payload: WorkerPayload::Pull(5),
                },
                &mut recorder,
            )
            .unwrap();
        receiver
            .on_worker_msg(
                WorkerToServer::<i64, i64> {
                    source: 2,
                    payload: WorkerPayload::Push(6, -1),
                },
                &mut recorder,
            )
            .unwrap();
        assert_eq!(recorder.pulls, vec![(5, 2)]);
        assert_eq!(recorder.pushes, vec![(6, -1)]);
    }

    #[test]
    fn test_marker_is_rejected_by_the_answer_codec() {
        let mut receiver = SimpleWorkerReceiver;
        let err = receiver
            .on_answer_msg(
                ServerToWorker::<i64> {
                    target: 0,
                    payload: ServerPayload::EndOfModelMarker,
                },
                &mut |_, _| Ok(()),
            )
            .unwrap_err();
        assert!(err.to_string().contains("end-of-model marker"));
    }
}
