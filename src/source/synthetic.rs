//! Real-time synthetic streams.
//!
//! Generates sine signals whose frequency and amplitude follow the label of
//! the most recent scheduled marker, plus the marker stream itself. The
//! signals are separable by band power, which makes the registry useful for
//! exercising the whole train/test loop without hardware.

use super::{MarkerChannel, SampleChannel, SourceRegistry};
use crate::error::AcquisitionError;
use crate::source::types::{MarkerEvent, SampleChunk, SourceInfo};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Shape of the generated streams.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub data_sources: usize,
    pub channels: usize,
    pub srate: f64,
    /// Labels cycled through by the marker stream
    pub labels: Vec<String>,
    /// Seconds between markers
    pub marker_interval: f64,
    /// Timestamp of the first marker
    pub first_marker: f64,
    /// Uniform noise amplitude added to every sample
    pub noise: f32,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            data_sources: 1,
            channels: 4,
            srate: 250.0,
            labels: vec!["left".to_string(), "right".to_string()],
            marker_interval: 1.5,
            first_marker: 1.0,
            noise: 0.2,
            seed: 7,
        }
    }
}

impl SyntheticConfig {
    /// Label in effect at time `t`, i.e. the label of the latest marker at or before `t`.
    pub fn label_index_at(&self, t: f64) -> Option<usize> {
        if t < self.first_marker || self.labels.is_empty() {
            return None;
        }
        let k = ((t - self.first_marker) / self.marker_interval).floor() as usize;
        Some(k % self.labels.len())
    }

    fn value(&self, t: f64, channel: usize, rng: &mut StdRng) -> f32 {
        let (freq, amplitude) = match self.label_index_at(t) {
            Some(index) => (6.0 + 8.0 * index as f64, 1.0 + index as f64),
            None => (2.0, 0.5),
        };
        let phase = channel as f64 * PI / 8.0;
        let signal = amplitude * (2.0 * PI * freq * t + phase).sin();
        let noise = (rng.gen::<f32>() * 2.0 - 1.0) * self.noise;
        signal as f32 + noise
    }
}

/// Registry serving synthetic data and marker streams on a shared clock.
pub struct SyntheticRegistry {
    config: Arc<SyntheticConfig>,
    origin: Instant,
}

impl SyntheticRegistry {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config: Arc::new(config),
            origin: Instant::now(),
        }
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    fn data_info(&self, index: usize) -> SourceInfo {
        SourceInfo::new(
            format!("synthetic-eeg-{index}"),
            "EEG",
            self.config.channels,
            self.config.srate,
        )
    }
}

impl SourceRegistry for SyntheticRegistry {
    fn list_available(&self, type_filter: &[String]) -> Vec<SourceInfo> {
        (0..self.config.data_sources)
            .map(|i| self.data_info(i))
            .chain(std::iter::once(SourceInfo::markers("synthetic-markers")))
            .filter(|info| type_filter.is_empty() || type_filter.contains(&info.source_type))
            .collect()
    }

    fn open(&self, info: &SourceInfo) -> Result<Box<dyn SampleChannel>, AcquisitionError> {
        let index = (0..self.config.data_sources)
            .find(|&i| self.data_info(i).name == info.name)
            .ok_or_else(|| AcquisitionError::Open {
                name: info.name.clone(),
                reason: "unknown synthetic source".to_string(),
            })?;
        let clock = elapsed_secs(self.origin);
        Ok(Box::new(SyntheticSampleChannel {
            info: info.clone(),
            config: Arc::clone(&self.config),
            origin: self.origin,
            next_index: (clock * self.config.srate).floor() as u64,
            rng: StdRng::seed_from_u64(self.config.seed + index as u64),
        }))
    }

    fn open_markers(&self, info: &SourceInfo) -> Result<Box<dyn MarkerChannel>, AcquisitionError> {
        if info.source_type != "Markers" {
            return Err(AcquisitionError::Open {
                name: info.name.clone(),
                reason: "not a marker stream".to_string(),
            });
        }
        let clock = elapsed_secs(self.origin);
        let next = ((clock - self.config.first_marker) / self.config.marker_interval)
            .ceil()
            .max(0.0) as u64;
        Ok(Box::new(SyntheticMarkerChannel {
            info: info.clone(),
            config: Arc::clone(&self.config),
            origin: self.origin,
            next_marker: next,
        }))
    }
}

fn elapsed_secs(origin: Instant) -> f64 {
    origin.elapsed().as_secs_f64()
}

struct SyntheticSampleChannel {
    info: SourceInfo,
    config: Arc<SyntheticConfig>,
    origin: Instant,
    next_index: u64,
    rng: StdRng,
}

impl SampleChannel for SyntheticSampleChannel {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn pull_chunk(&mut self, timeout: Duration) -> Result<Option<SampleChunk>, AcquisitionError> {
        let srate = self.config.srate;
        let mut due = (elapsed_secs(self.origin) * srate).floor() as u64;
        if due <= self.next_index {
            let wait = (self.next_index + 1) as f64 / srate - elapsed_secs(self.origin);
            thread::sleep(timeout.min(Duration::from_secs_f64(wait.max(0.0))));
            due = (elapsed_secs(self.origin) * srate).floor() as u64;
            if due <= self.next_index {
                return Ok(None);
            }
        }

        let count = (due - self.next_index) as usize;
        let start = self.next_index as f64 / srate;
        let channels = self.config.channels;
        let mut timestamps = Vec::with_capacity(count);
        let mut samples = Vec::with_capacity(count);
        for i in 0..count {
            let t = start + i as f64 / srate;
            timestamps.push(t);
            samples.push(
                (0..channels)
                    .map(|ch| self.config.value(t, ch, &mut self.rng))
                    .collect(),
            );
        }
        self.next_index = due;
        Ok(Some(SampleChunk::new(timestamps, samples)))
    }
}

struct SyntheticMarkerChannel {
    info: SourceInfo,
    config: Arc<SyntheticConfig>,
    origin: Instant,
    next_marker: u64,
}

impl MarkerChannel for SyntheticMarkerChannel {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn pull_marker(&mut self, timeout: Duration) -> Result<Option<MarkerEvent>, AcquisitionError> {
        if self.config.labels.is_empty() {
            thread::sleep(timeout);
            return Ok(None);
        }
        let at = self.config.first_marker + self.next_marker as f64 * self.config.marker_interval;
        let wait = at - elapsed_secs(self.origin);
        if wait > 0.0 {
            let wait = Duration::from_secs_f64(wait);
            if wait > timeout {
                thread::sleep(timeout);
                return Ok(None);
            }
            thread::sleep(wait);
        }
        let label = &self.config.labels[self.next_marker as usize % self.config.labels.len()];
        self.next_marker += 1;
        Ok(Some(MarkerEvent::new(label.clone(), at)))
    }
}
