//! bci-pipeline - Marker-driven epoching and classification for live streams.
//!
//! This library ingests continuous multi-channel time series (EEG, EMG,
//! accelerometry...) and a discrete marker stream, cuts a labelled epoch out
//! of every data source around each marker, turns the epochs into one
//! feature vector per marker and either trains a classifier on it or asks
//! the classifier for a prediction.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Pipeline                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐  EpochRequest  ┌──────────────┐                    │
//! │  │  Marker  │───────────────▶│ SourceReader │ (one per source)   │
//! │  │  Router  │                └──────────────┘                    │
//! │  └──────────┘                       │ EpochSlice                 │
//! │       │ Expect                      ▼                            │
//! │       └────────────────────▶┌──────────────┐                     │
//! │       ▲       EpochOutcome  │   Feature    │                     │
//! │       └─────────────────────│  Assembler   │                     │
//! │                             └──────────────┘                     │
//! │                          train │       │ test                    │
//! │                                ▼       ▼                         │
//! │                          ┌────────────────────┐                  │
//! │                          │ Classifier         │                  │
//! │                          │ Coordinator        │                  │
//! │                          └────────────────────┘                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bci_pipeline::{
//!     NearestCentroid, Pipeline, PipelineConfig, SyntheticConfig, SyntheticRegistry,
//! };
//! use std::sync::Arc;
//!
//! let registry = Arc::new(SyntheticRegistry::new(SyntheticConfig::default()));
//! let mut pipeline = Pipeline::new(
//!     PipelineConfig::default(),
//!     registry,
//!     Box::new(NearestCentroid::new()),
//! );
//!
//! pipeline.start().expect("Failed to start pipeline");
//! std::thread::sleep(std::time::Duration::from_secs(20));
//! pipeline.set_test_mode();
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod pipeline;
pub mod source;
pub mod stats;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use config::{EpochOverride, EpochSettings, FeatureChoices, Limits, PipelineConfig};
pub use core::{
    ClassifierInfo, ClassifierState, EpochCounts, Estimator, FeatureExtractor, LatestGuess, Mode,
    NearestCentroid, NullEstimator,
};
pub use error::{
    AcquisitionError, ConfigurationError, EstimatorError, PipelineError, PipelineResult,
};
pub use pipeline::{ExtractorFactory, Pipeline, PipelineStatus, Reconfiguration};
pub use source::{
    MemoryRegistry, SourceInfo, SourceRegistry, SyntheticConfig, SyntheticRegistry,
};
pub use stats::{PipelineStats, StatsSnapshot};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
