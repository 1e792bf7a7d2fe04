//! Error types for the pipeline.
//!
//! Only [`ConfigurationError`] is fatal: it is raised by `start` and
//! `reconfigure` before any worker thread exists. Everything else is local
//! to one worker, one sequence or one query call.

use thiserror::Error;

/// Invalid configuration or source selection. Fatal to pipeline start.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("window length {window_length}s exceeds tmin + tmax ({span}s)")]
    WindowTooLong { window_length: f64, span: f64 },

    #[error("invalid epoch geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid baseline ({start}, {end}): must lie within [-tmin, tmax] with start < end")]
    InvalidBaseline { start: f64, end: f64 },

    #[error("epoch override for marker '{label}': {source}")]
    InvalidOverride {
        label: String,
        #[source]
        source: Box<ConfigurationError>,
    },

    #[error("no marker source available")]
    NoMarkerSource,

    #[error("ambiguous marker source: {0} candidates found, select one by name")]
    AmbiguousMarkerSource(usize),

    #[error("no data sources available")]
    NoDataSources,

    #[error("source '{0}' has an irregular sampling rate")]
    IrregularRate(String),

    #[error("channel drop for source '{source_name}' names channel {index}, but it has {channels} channels")]
    UnknownDropChannel {
        source_name: String,
        index: usize,
        channels: usize,
    },

    #[error("no frequency bands configured while psd features are enabled")]
    NoFrequencyBands,

    #[error("invalid frequency band [{0}, {1}]")]
    InvalidFrequencyBand(f64, f64),

    #[error("classification is required but no estimator is configured")]
    EstimatorRequired,

    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Failure of a single data or marker source.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AcquisitionError {
    #[error("source '{0}' disconnected")]
    Disconnected(String),

    #[error("failed to open source '{name}': {reason}")]
    Open { name: String, reason: String },

    #[error("source '{0}' does not support reconnection")]
    ReconnectUnsupported(String),
}

/// Why an epoch slice could not be produced.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IncompleteReason {
    #[error("window starts before buffered history")]
    InsufficientHistory,

    #[error("samples for the window did not arrive in time")]
    TimedOut,

    #[error("source unavailable")]
    SourceUnavailable,

    #[error("sequence not assembled before its deadline")]
    AssemblyTimeout,

    #[error("classifier queue closed")]
    ClassifierUnavailable,
}

/// One sequence dropped because a slice was incomplete.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("epoch {sequence_id} from source {source_index} incomplete: {reason}")]
pub struct EpochIncomplete {
    pub sequence_id: u64,
    pub source_index: usize,
    pub reason: IncompleteReason,
}

/// Estimator capability failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EstimatorError {
    #[error("training data contains a single class")]
    SingleClass,

    #[error("estimator has not been fit")]
    NotFitted,

    #[error("feature length mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("fit failed: {0}")]
    Fit(String),

    #[error("predict failed: {0}")]
    Predict(String),
}

/// Errors surfaced by the pipeline control surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error("query '{0}' timed out")]
    QueryTimeout(&'static str),

    #[error("pipeline is not running")]
    NotRunning,

    #[error("pipeline is already running")]
    AlreadyRunning,

    #[error("worker '{0}' panicked")]
    WorkerPanicked(String),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_error_names_label() {
        let err = ConfigurationError::InvalidOverride {
            label: "left".to_string(),
            source: Box::new(ConfigurationError::WindowTooLong {
                window_length: 2.0,
                span: 1.0,
            }),
        };
        let message = err.to_string();
        assert!(message.contains("left"));
        assert!(message.contains("exceeds"));
    }

    #[test]
    fn test_configuration_error_converts() {
        let err: PipelineError = ConfigurationError::NoMarkerSource.into();
        assert!(matches!(
            err,
            PipelineError::Configuration(ConfigurationError::NoMarkerSource)
        ));
        assert_eq!(err.to_string(), "no marker source available");
    }
}
