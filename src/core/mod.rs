//! The concurrent core of the pipeline.
//!
//! This module contains:
//! - Per-source sample buffers and window extraction
//! - The worker threads: source readers, marker router, feature assembler
//!   and classifier coordinator
//! - Feature extraction from assembled epochs
//! - The shared mode flag and shutdown signal

pub mod assembler;
pub mod buffer;
pub mod classifier;
pub mod features;
pub mod mode;
pub mod reader;
pub mod router;
pub mod shutdown;
pub mod types;

// Re-export commonly used types
pub use assembler::{AssemblerLinks, FeatureAssembler};
pub use buffer::{ChannelBuffer, WindowStatus};
pub use classifier::{
    ClassifierCoordinator, ClassifierInfo, ClassifierState, CoordinatorLinks, Estimator,
    LatestGuess, NearestCentroid, NullEstimator,
};
pub use features::{FeatureExtractor, GeneralFeatureExtractor, Periodogram};
pub use mode::{Mode, ModeFlag, ModeSwitch};
pub use reader::{HealthSlot, ReaderLinks, SourceHealth, SourceReader};
pub use router::{EpochCounts, MarkerRouter, RouterLinks};
pub use shutdown::{shutdown_pair, Shutdown, ShutdownTrigger};
pub use types::{AssemblerMessage, EpochOutcome, EpochRequest, EpochSlice, FeatureVector};
