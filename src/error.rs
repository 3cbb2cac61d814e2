//! Error taxonomy
//!
//! Each subsystem gets its own error enum so callers can tell expected,
//! handled outcomes (duplicate test queries, budget timeouts) apart from
//! faults that must stop the enclosing operation.

use thiserror::Error;

use crate::types::Arm;

/// Arm index outside the fixed five-profile set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("arm index {0} is outside the supported range 0..5")]
pub struct InvalidArm(pub i64);

/// Malformed request framing. The connection is dropped without a response.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON message: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("message is not valid UTF-8")]
    InvalidUtf8,

    #[error("message exceeds {limit} bytes without a newline")]
    LineTooLong { limit: usize },

    #[error("first message of a sequence has no `type` field")]
    MissingType,

    #[error("unknown message type `{0}`")]
    UnknownType(String),

    #[error("terminator received before any type header")]
    EmptySequence,

    #[error("malformed `{kind}` payload: {reason}")]
    MalformedPayload { kind: &'static str, reason: String },
}

/// Experience store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not add experimental query, was it already added?")]
    DuplicateQuery,

    #[error("experience {experience_id} is already linked to experimental query {experimental_id} under {arm}")]
    DuplicateExperiment {
        experience_id: i64,
        experimental_id: i64,
        arm: Arm,
    },

    #[error("experience {experience_id} or experimental query {experimental_id} does not exist")]
    UnknownReference {
        experience_id: i64,
        experimental_id: i64,
    },

    #[error("stored plan {id} could not be decoded: {source}")]
    CorruptPlan {
        id: i64,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    InvalidArm(#[from] InvalidArm),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("plan serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by a live database session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Statement cancelled, normally by `statement_timeout`
    #[error("statement canceled: {0}")]
    Canceled(String),

    /// The backend went away or the connection is unusable
    #[error("database connection failure: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),
}

/// Fatal outcomes of an experiment run
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("could not connect to the PostgreSQL database: {0}")]
    Connection(#[source] SessionError),

    #[error("database session error: {0}")]
    Session(#[from] SessionError),

    #[error("EXPLAIN output has no Bao section, is the Bao extension loaded? ({0})")]
    MissingBaoExplain(String),

    #[error("server down after experiment with {arm}")]
    BackendCrash {
        arm: Arm,
        #[source]
        source: SessionError,
    },

    #[error("reward for experiment did not appear after {attempts} attempts, is the Bao server running?")]
    RewardMissing { attempts: u32 },

    #[error("invalid experimental query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Predictor and featurizer failures
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("cannot featurize plan: {0}")]
    Featurize(String),

    #[error("cannot train a model with no experience")]
    EmptyTrainingSet,

    #[error("model has not been fitted")]
    NotFitted,

    #[error("feature width {actual} does not match model width {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("model I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("model state could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}
