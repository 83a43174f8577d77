use crate::message::PartitionIndex;

/// A type alias for `anyhow::Error`, representing any error type.
///
/// Used throughout the crate for errors crossing the partition boundary,
/// where user logic and fabric failures mix freely.
pub type AnyError = anyhow::Error;

/// A type alias for `Result<T, E>` where `E` defaults to [`AnyError`].
pub type AnyResult<T, E = AnyError> = std::result::Result<T, E>;

#[macro_export]
macro_rules! bail_into {
    ($msg:literal $(,)?) => {
        return Err(::anyhow::anyhow!($msg).into())
    };
    ($err:expr $(,)?) => {
        return Err(::anyhow::anyhow!($err).into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err(::anyhow::anyhow!($fmt, $($arg)*).into())
    };
}

/// Fatal defects of the coordination fabric itself.
///
/// User-logic failures are not represented here; they propagate as plain
/// [`AnyError`]s out of the handler that produced them. Everything below
/// aborts the job without retry.
#[derive(thiserror::Error, Debug)]
pub enum FabricError {
    /// Worker and server parallelism must both be positive.
    #[error("invalid parallelism {0}, worker and server parallelism must be positive")]
    InvalidParallelism(u32),

    /// A server-to-worker message carries a partition tag that is out of
    /// range or disagrees with the routing decision. Indicates a broken
    /// sender codec or partitioner.
    #[error("Pull answer key should be the partition ID itself")]
    MisroutedAnswer,

    /// A worker-to-server message was routed outside `[0, S)`.
    #[error("worker-to-server message routed to partition {partition} of {servers}")]
    ServerRouteOutOfRange {
        partition: PartitionIndex,
        servers: u32,
    },

    /// A worker partition saw its model stream close without a single
    /// record. The supplied model does not cover the worker parallelism.
    #[error("must be a parameter per model partition when loading model")]
    EmptyModelPartition,

    /// A server received more end-of-model signals than there are workers.
    #[error("unexpected end-of-model at server partition {0}")]
    UnexpectedEndOfModel(PartitionIndex),

    /// An end-of-model marker reached a worker in a job without model load.
    #[error("end-of-model marker received outside of model load")]
    UnexpectedEomMarker,

    /// A model record arrived after the model stream already closed.
    #[error("model record received after end of model")]
    ModelAfterEos,

    /// The worker logic has no use for worker-side model copies but the job
    /// was started with a double-sided model load.
    #[error("worker logic does not accept worker-side model records")]
    WorkerModelUnsupported,

    /// The parameter server logic cannot install preloaded parameters but
    /// the job was started with a model load.
    #[error("parameter server logic does not accept parameter preloads")]
    ParameterPreloadUnsupported,
}
