//! Structured error types for the engine.
//!
//! [`Error`] is pattern-matchable instead of a generic `anyhow::Error`; the
//! variants mirror the failure modes callers can react to. Handler code on
//! the far side of the dispatcher stays on `anyhow::Result`; the dispatcher
//! catches those, stringifies them into `last_error`, and turns them into
//! abandon-or-fail decisions.
//!
//! Fencing mismatches and empty id batches are deliberately NOT errors: the
//! work-queue engine treats them as silent no-ops so that duplicate acks and
//! superseded owners cannot crash a worker.

use thiserror::Error;

use crate::id::JoinId;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Engine error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller supplied an unusable argument (zero batch size, blank
    /// message id or source, empty router key).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A keyed router lookup did not match any tenant store.
    #[error("no store registered for key '{0}'")]
    NotFound(String),

    /// The `join.wait` handler observed a join whose completed count has not
    /// reached the expected count; the dispatcher abandons with backoff.
    #[error("join {0} is not ready")]
    JoinNotReady(JoinId),

    /// A lease renew definitively failed; the handle's loss signal has fired.
    #[error("lease on '{resource}' lost")]
    LeaseLost { resource: String },

    /// Options were rejected at registration time.
    #[error("invalid options: {0}")]
    OptionsValidation(String),

    /// Payload (de)serialization failed.
    #[error("payload serialization: {0}")]
    Payload(#[from] serde_json::Error),

    /// A cron expression could not be parsed.
    #[error("invalid cron schedule '{schedule}': {message}")]
    InvalidCronSchedule { schedule: String, message: String },

    /// Transient storage failure; callers retry at the appropriate loop.
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

impl Error {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn options(msg: impl Into<String>) -> Self {
        Error::OptionsValidation(msg.into())
    }

    /// True when the underlying storage error means the target relation or
    /// function does not exist (fresh schema, deployment disabled).
    ///
    /// Cleanup and reaper loops log these at `warn` and keep running.
    pub fn is_missing_relation(&self) -> bool {
        match self {
            Error::Storage(sqlx::Error::Database(db)) => matches!(
                db.code().as_deref(),
                // undefined_table, undefined_function, invalid_schema_name
                Some("42P01") | Some("42883") | Some("3F000")
            ),
            _ => false,
        }
    }

    /// True when this error should be treated as retryable by outer loops.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}
