//! Messages passed between pipeline workers.

use crate::config::ResolvedWindow;
use crate::core::mode::Mode;
use crate::error::IncompleteReason;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Window extraction command broadcast to every source reader.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochRequest {
    pub sequence_id: u64,
    pub label: String,
    pub marker_time: f64,
    pub window: ResolvedWindow,
}

impl EpochRequest {
    /// Source-clock start of the window.
    pub fn start(&self) -> f64 {
        self.marker_time - self.window.tmin
    }

    /// Source-clock end of the window (exclusive).
    pub fn end(&self) -> f64 {
        self.marker_time + self.window.tmax
    }
}

/// One source's samples for one sequence, `channels[c][i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSlice {
    pub sequence_id: u64,
    pub source_index: usize,
    pub channels: Vec<Vec<f32>>,
    /// Effective rate of the resampled slice
    pub sample_rate: f64,
    pub start: f64,
    pub end: f64,
}

impl EpochSlice {
    pub fn sample_count(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }
}

/// What the assembler receives.
#[derive(Debug)]
pub enum AssemblerMessage {
    /// Sent by the router before the request is broadcast.
    Expect {
        sequence_id: u64,
        label: String,
        marker_time: f64,
        deadline: Instant,
    },
    Slice(EpochSlice),
    Incomplete {
        sequence_id: u64,
        source_index: usize,
        reason: IncompleteReason,
    },
}

/// Final fate of one broadcast sequence, reported to the router.
#[derive(Debug, Clone, PartialEq)]
pub enum EpochOutcome {
    Completed {
        sequence_id: u64,
        label: String,
        mode: Mode,
    },
    Abandoned {
        sequence_id: u64,
        reason: IncompleteReason,
    },
}

/// Features of one assembled epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub sequence_id: u64,
    pub label: String,
    /// Mode read when the vector was assembled
    pub mode: Mode,
    pub marker_time: f64,
    pub values: Vec<f64>,
}
