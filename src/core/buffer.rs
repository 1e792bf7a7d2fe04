//! Per-source sample history and epoch window extraction.
//!
//! A [`ChannelBuffer`] keeps recent readings of every channel of one source
//! together with their timestamps. History is bounded by the longest epoch
//! the configuration can ask for; anything older is evicted unless a pending
//! request still needs it.

use crate::config::ResolvedWindow;
use crate::core::types::EpochRequest;
use crate::source::types::SampleChunk;
use std::collections::VecDeque;

/// Result of trying to cut a window out of the buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowStatus {
    /// Resampled samples, `channels[c][i]`
    Ready(Vec<Vec<f32>>),
    /// The end of the window has not arrived yet
    Pending,
    /// The window starts before the oldest buffered sample
    InsufficientHistory,
}

/// Rolling history of one source.
#[derive(Debug)]
pub struct ChannelBuffer {
    srate: f64,
    retention: f64,
    timestamps: VecDeque<f64>,
    channels: Vec<VecDeque<f32>>,
    rejected_readings: u64,
}

impl ChannelBuffer {
    /// Create a buffer keeping at least `retention` seconds behind the newest sample.
    pub fn new(channel_count: usize, srate: f64, retention: f64) -> Self {
        Self {
            srate,
            retention,
            timestamps: VecDeque::new(),
            channels: (0..channel_count).map(|_| VecDeque::new()).collect(),
            rejected_readings: 0,
        }
    }

    pub fn earliest(&self) -> Option<f64> {
        self.timestamps.front().copied()
    }

    pub fn latest(&self) -> Option<f64> {
        self.timestamps.back().copied()
    }

    /// Readings dropped for a wrong channel count or a timestamp going backwards.
    pub fn rejected_readings(&self) -> u64 {
        self.rejected_readings
    }

    fn interval(&self) -> f64 {
        1.0 / self.srate
    }

    /// Append a chunk, returning the number of readings accepted.
    pub fn push_chunk(&mut self, chunk: &SampleChunk) -> usize {
        let mut accepted = 0;
        for (&t, reading) in chunk.timestamps.iter().zip(&chunk.samples) {
            let in_order = self.latest().map_or(true, |last| t > last);
            if reading.len() != self.channels.len() || !in_order {
                self.rejected_readings += 1;
                continue;
            }
            self.timestamps.push_back(t);
            for (channel, &value) in self.channels.iter_mut().zip(reading) {
                channel.push_back(value);
            }
            accepted += 1;
        }
        accepted
    }

    /// Drop history older than the retention horizon, but never anything at
    /// or after `oldest_pending_start`.
    pub fn evict(&mut self, oldest_pending_start: Option<f64>) {
        let Some(latest) = self.latest() else {
            return;
        };
        let mut keep_from = latest - self.retention;
        if let Some(start) = oldest_pending_start {
            keep_from = keep_from.min(start - self.interval());
        }
        let stale = self.timestamps.partition_point(|&t| t < keep_from);
        if stale == 0 {
            return;
        }
        self.timestamps.drain(..stale);
        for channel in &mut self.channels {
            channel.drain(..stale);
        }
    }

    pub fn clear(&mut self) {
        self.timestamps.clear();
        for channel in &mut self.channels {
            channel.clear();
        }
    }

    /// Cut `[start, end)` for a request, resampled to the window's sample count.
    pub fn extract(&self, request: &EpochRequest) -> WindowStatus {
        let (Some(first), Some(last)) = (self.earliest(), self.latest()) else {
            return WindowStatus::Pending;
        };
        let dt = self.interval();
        let half = dt / 2.0;
        let start = request.start();
        let end = request.end();

        if first > start + half {
            return WindowStatus::InsufficientHistory;
        }
        // The last reading inside the window sits within one interval of `end`.
        if last + 1.5 * dt < end {
            return WindowStatus::Pending;
        }

        let lo = self.timestamps.partition_point(|&t| t < start - half);
        let hi = self.timestamps.partition_point(|&t| t < end - half);
        if hi <= lo {
            return WindowStatus::Pending;
        }

        let count = request.window.sample_count(self.srate);
        let mut channels: Vec<Vec<f32>> = self
            .channels
            .iter()
            .map(|channel| {
                let raw: Vec<f32> = channel.range(lo..hi).copied().collect();
                resample_linear(&raw, count)
            })
            .collect();

        if let Some(baseline) = request.window.baseline {
            baseline_correct(&mut channels, request, baseline);
        }
        WindowStatus::Ready(channels)
    }
}

/// History a buffer must retain for the given epoch geometry.
pub fn retention_for(max_span: f64, margin: f64) -> f64 {
    max_span + margin
}

/// Linearly resample `samples` to exactly `count` points spanning the same range.
pub fn resample_linear(samples: &[f32], count: usize) -> Vec<f32> {
    match (samples.len(), count) {
        (_, 0) => Vec::new(),
        (0, _) => vec![0.0; count],
        (len, n) if len == n => samples.to_vec(),
        (1, n) => vec![samples[0]; n],
        (_, 1) => vec![samples[0]],
        (len, n) => {
            let step = (len - 1) as f64 / (n - 1) as f64;
            (0..n)
                .map(|i| {
                    let position = i as f64 * step;
                    let left = (position.floor() as usize).min(len - 1);
                    let right = (left + 1).min(len - 1);
                    let frac = (position - left as f64) as f32;
                    samples[left] + (samples[right] - samples[left]) * frac
                })
                .collect()
        }
    }
}

/// Subtract, per channel, the mean over the baseline interval (relative to the marker).
fn baseline_correct(channels: &mut [Vec<f32>], request: &EpochRequest, baseline: (f64, f64)) {
    let window: &ResolvedWindow = &request.window;
    for channel in channels.iter_mut() {
        let n = channel.len();
        if n == 0 {
            continue;
        }
        let step = window.span() / n as f64;
        let (sum, count) = channel
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                let offset = -window.tmin + *i as f64 * step;
                offset >= baseline.0 - 1e-9 && offset <= baseline.1 + 1e-9
            })
            .fold((0.0f64, 0usize), |(sum, count), (_, &v)| {
                (sum + v as f64, count + 1)
            });
        if count == 0 {
            continue;
        }
        let mean = (sum / count as f64) as f32;
        for value in channel.iter_mut() {
            *value -= mean;
        }
    }
}
