use std::result;
use std::sync::PoisonError;
use thiserror::Error;

/// A specialized `Result` type for metric operations.
pub type MetricResult<T> = result::Result<T, MetricError>;

/// Errors returned by the aggregation engine.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MetricError {
    /// Other errors not covered by specific cases.
    #[error("Metrics error: {0}")]
    Other(String),
    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),
    /// Invalid instrument configuration, such as a mismatched value type or an
    /// aggregation that cannot be used with the instrument kind.
    #[error("Invalid instrument configuration: {0}")]
    InvalidInstrumentConfiguration(&'static str),
    /// Two registrations collided on the same output metric identity with
    /// incompatible definitions.
    ///
    /// The previously registered stream keeps serving; the caller is expected
    /// to report the conflict.
    #[error("duplicate metric identity `{name}`: existing {existing}, requested {requested}")]
    DuplicateInstrument {
        /// The normalized (lowercased) output metric name both registrations map to.
        name: String,
        /// The identity of the stream already being served.
        existing: String,
        /// The identity of the rejected registration.
        requested: String,
    },
}

impl<T> From<PoisonError<T>> for MetricError {
    fn from(err: PoisonError<T>) -> Self {
        MetricError::Other(err.to_string())
    }
}
