use thiserror::Error;

/// Fatal errors that abort a benchmark run.
///
/// Degraded function responses are not represented here. They are recorded on the
/// [`StageResult`](crate::model::StageResult) instead, and the run continues.
#[derive(Debug, Error)]
pub enum Error {
    /// A remote call failed at the network level.
    #[error("remote call to {endpoint} failed: {source}")]
    Request {
        /// The endpoint that was called.
        endpoint: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// A request or result could not be encoded as JSON.
    #[error("failed to encode json: {0}")]
    Encode(#[from] serde_json::Error),

    /// A record could not be written to the run log.
    #[error("failed to write run log: {0}")]
    RunLog(#[from] std::io::Error),

    /// A spawned task panicked or was cancelled.
    #[error("task failed to complete: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The admission semaphore was closed while tasks were still being issued.
    #[error("admission semaphore closed")]
    Admission(#[from] tokio::sync::AcquireError),

    /// The Poisson arrival rate is not a positive number.
    #[error("invalid arrival rate {0}")]
    InvalidRate(f64),

    /// A result slot was written by more than one task.
    #[error("result slot {index} written more than once")]
    SlotWrittenTwice {
        /// Index of the offending slot.
        index: usize,
    },

    /// A task finished without recording its result.
    #[error("result slot {index} was never written")]
    SlotMissing {
        /// Index of the empty slot.
        index: usize,
    },
}

/// A convenience alias that defaults our [`Error`] type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
