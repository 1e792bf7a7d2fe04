//! Pipeline counters.
//!
//! Every worker holds a [`SharedPipelineStats`] and bumps the counters for
//! the events it handles. Nothing here is persisted; a new run starts from
//! zero with a fresh run id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Lock-free counters for one pipeline run.
#[derive(Debug)]
pub struct PipelineStats {
    run_id: Uuid,
    session_start: DateTime<Utc>,

    /// Sample chunks pulled from data sources
    chunks_received: AtomicU64,
    /// Individual readings appended to buffers
    samples_received: AtomicU64,
    /// Readings rejected for bad width or out-of-order timestamps
    samples_rejected: AtomicU64,
    /// Markers pulled from the marker source
    markers_received: AtomicU64,
    /// Markers dropped because a data source was down
    markers_dropped: AtomicU64,
    /// Times the router stalled on the outstanding-request limit
    backpressure_stalls: AtomicU64,
    /// Requests broadcast to the readers
    epochs_requested: AtomicU64,
    slices_completed: AtomicU64,
    slices_incomplete: AtomicU64,
    vectors_assembled: AtomicU64,
    sequences_abandoned: AtomicU64,
    train_vectors: AtomicU64,
    test_vectors: AtomicU64,
    predictions: AtomicU64,
    fit_attempts: AtomicU64,
    fit_failures: AtomicU64,
    source_disconnects: AtomicU64,
    source_reconnects: AtomicU64,
}

macro_rules! counters {
    ($($record:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $record(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            session_start: Utc::now(),
            chunks_received: AtomicU64::new(0),
            samples_received: AtomicU64::new(0),
            samples_rejected: AtomicU64::new(0),
            markers_received: AtomicU64::new(0),
            markers_dropped: AtomicU64::new(0),
            backpressure_stalls: AtomicU64::new(0),
            epochs_requested: AtomicU64::new(0),
            slices_completed: AtomicU64::new(0),
            slices_incomplete: AtomicU64::new(0),
            vectors_assembled: AtomicU64::new(0),
            sequences_abandoned: AtomicU64::new(0),
            train_vectors: AtomicU64::new(0),
            test_vectors: AtomicU64::new(0),
            predictions: AtomicU64::new(0),
            fit_attempts: AtomicU64::new(0),
            fit_failures: AtomicU64::new(0),
            source_disconnects: AtomicU64::new(0),
            source_reconnects: AtomicU64::new(0),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Record a chunk and the number of readings it contributed.
    pub fn record_chunk(&self, accepted: u64, rejected: u64) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
        self.samples_received.fetch_add(accepted, Ordering::Relaxed);
        self.samples_rejected.fetch_add(rejected, Ordering::Relaxed);
    }

    counters! {
        record_marker => markers_received,
        record_marker_dropped => markers_dropped,
        record_backpressure_stall => backpressure_stalls,
        record_epoch_requested => epochs_requested,
        record_slice_completed => slices_completed,
        record_slice_incomplete => slices_incomplete,
        record_vector_assembled => vectors_assembled,
        record_sequence_abandoned => sequences_abandoned,
        record_train_vector => train_vectors,
        record_test_vector => test_vectors,
        record_prediction => predictions,
        record_fit_attempt => fit_attempts,
        record_fit_failure => fit_failures,
        record_source_disconnect => source_disconnects,
        record_source_reconnect => source_reconnects,
    }

    /// Get the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            run_id: self.run_id.to_string(),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
            chunks_received: load(&self.chunks_received),
            samples_received: load(&self.samples_received),
            samples_rejected: load(&self.samples_rejected),
            markers_received: load(&self.markers_received),
            markers_dropped: load(&self.markers_dropped),
            backpressure_stalls: load(&self.backpressure_stalls),
            epochs_requested: load(&self.epochs_requested),
            slices_completed: load(&self.slices_completed),
            slices_incomplete: load(&self.slices_incomplete),
            vectors_assembled: load(&self.vectors_assembled),
            sequences_abandoned: load(&self.sequences_abandoned),
            train_vectors: load(&self.train_vectors),
            test_vectors: load(&self.test_vectors),
            predictions: load(&self.predictions),
            fit_attempts: load(&self.fit_attempts),
            fit_failures: load(&self.fit_failures),
            source_disconnects: load(&self.source_disconnects),
            source_reconnects: load(&self.source_reconnects),
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.snapshot();
        format!(
            "Run {} ({} seconds):\n\
             - Samples received: {} in {} chunks ({} rejected)\n\
             - Markers received: {} ({} dropped, {} stalls)\n\
             - Epochs requested: {}\n\
             - Feature vectors: {} ({} abandoned)\n\
             - Train/test vectors: {}/{}\n\
             - Predictions: {}\n\
             - Fits: {} ({} failed)\n\
             - Source disconnects/reconnects: {}/{}",
            stats.run_id,
            stats.session_duration_secs,
            stats.samples_received,
            stats.chunks_received,
            stats.samples_rejected,
            stats.markers_received,
            stats.markers_dropped,
            stats.backpressure_stalls,
            stats.epochs_requested,
            stats.vectors_assembled,
            stats.sequences_abandoned,
            stats.train_vectors,
            stats.test_vectors,
            stats.predictions,
            stats.fit_attempts,
            stats.fit_failures,
            stats.source_disconnects,
            stats.source_reconnects,
        )
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of pipeline statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub run_id: String,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
    pub chunks_received: u64,
    pub samples_received: u64,
    pub samples_rejected: u64,
    pub markers_received: u64,
    pub markers_dropped: u64,
    pub backpressure_stalls: u64,
    pub epochs_requested: u64,
    pub slices_completed: u64,
    pub slices_incomplete: u64,
    pub vectors_assembled: u64,
    pub sequences_abandoned: u64,
    pub train_vectors: u64,
    pub test_vectors: u64,
    pub predictions: u64,
    pub fit_attempts: u64,
    pub fit_failures: u64,
    pub source_disconnects: u64,
    pub source_reconnects: u64,
}

/// Thread-safe shared counters.
pub type SharedPipelineStats = Arc<PipelineStats>;

pub fn create_shared_stats() -> SharedPipelineStats {
    Arc::new(PipelineStats::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counting() {
        let stats = PipelineStats::new();

        stats.record_chunk(10, 2);
        stats.record_chunk(5, 0);
        stats.record_marker();
        stats.record_marker_dropped();
        stats.record_vector_assembled();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.chunks_received, 2);
        assert_eq!(snapshot.samples_received, 15);
        assert_eq!(snapshot.samples_rejected, 2);
        assert_eq!(snapshot.markers_received, 1);
        assert_eq!(snapshot.markers_dropped, 1);
        assert_eq!(snapshot.vectors_assembled, 1);
        assert_eq!(snapshot.predictions, 0);
    }

    #[test]
    fn test_run_ids_differ() {
        assert_ne!(PipelineStats::new().run_id(), PipelineStats::new().run_id());
    }

    #[test]
    fn test_summary_format() {
        let stats = PipelineStats::new();
        stats.record_fit_attempt();
        stats.record_fit_failure();
        let summary = stats.summary();

        assert!(summary.contains("Markers received"));
        assert!(summary.contains("Fits: 1 (1 failed)"));
        assert!(summary.contains(&stats.run_id().to_string()));
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = create_shared_stats();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["markers_received"], 0);
        assert!(json["run_id"].is_string());
    }
}
