//! Data and marker sources.
//!
//! Discovery and transport are outside the pipeline: a [`SourceRegistry`]
//! lists streams and opens them, after which the pipeline only sees
//! [`SampleChannel`]s and one [`MarkerChannel`].

pub mod memory;
pub mod scanner;
pub mod synthetic;
pub mod types;

use crate::error::AcquisitionError;
use std::time::Duration;

pub use memory::{MarkerFeed, MemoryRegistry, SampleFeed};
pub use scanner::{select_sources, SelectedSources};
pub use synthetic::{SyntheticConfig, SyntheticRegistry};
pub use types::{MarkerEvent, SampleChunk, SourceInfo};

/// A readable stream of multi-channel samples.
pub trait SampleChannel: Send {
    fn info(&self) -> &SourceInfo;

    /// Wait up to `timeout` for the next chunk. `Ok(None)` means nothing arrived.
    fn pull_chunk(&mut self, timeout: Duration) -> Result<Option<SampleChunk>, AcquisitionError>;

    /// Try to re-establish a lost connection.
    fn reconnect(&mut self) -> Result<(), AcquisitionError> {
        Err(AcquisitionError::ReconnectUnsupported(self.info().name.clone()))
    }
}

/// A readable stream of marker events.
pub trait MarkerChannel: Send {
    fn info(&self) -> &SourceInfo;

    /// Wait up to `timeout` for the next marker. `Ok(None)` means nothing arrived.
    fn pull_marker(&mut self, timeout: Duration) -> Result<Option<MarkerEvent>, AcquisitionError>;
}

/// Stream discovery collaborator.
pub trait SourceRegistry: Send + Sync {
    /// Streams whose type is in `type_filter`; an empty filter lists everything.
    fn list_available(&self, type_filter: &[String]) -> Vec<SourceInfo>;

    fn open(&self, info: &SourceInfo) -> Result<Box<dyn SampleChannel>, AcquisitionError>;

    fn open_markers(&self, info: &SourceInfo) -> Result<Box<dyn MarkerChannel>, AcquisitionError>;
}
