//! Sample and marker types exchanged with data sources.

use serde::{Deserialize, Serialize};

/// Description of one stream offered by a [`super::SourceRegistry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Stream name, unique within a registry
    pub name: String,
    /// Content type, e.g. "EEG" or "Markers"
    pub source_type: String,
    pub source_id: String,
    /// Ordered channel names
    pub channel_names: Vec<String>,
    /// Nominal sampling rate in Hz; 0 for irregular streams such as markers
    pub nominal_srate: f64,
}

impl SourceInfo {
    pub fn new(
        name: impl Into<String>,
        source_type: impl Into<String>,
        channel_count: usize,
        nominal_srate: f64,
    ) -> Self {
        let name = name.into();
        Self {
            source_id: format!("{name}-0"),
            channel_names: (0..channel_count).map(|i| format!("ch{i}")).collect(),
            name,
            source_type: source_type.into(),
            nominal_srate,
        }
    }

    /// Marker stream description.
    pub fn markers(name: impl Into<String>) -> Self {
        Self::new(name, "Markers", 1, 0.0)
    }

    pub fn channel_count(&self) -> usize {
        self.channel_names.len()
    }
}

/// A batch of multi-channel readings with per-reading timestamps.
///
/// `samples[i]` holds reading `i` across all channels; timestamps are seconds
/// on the clock shared with the marker stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleChunk {
    pub timestamps: Vec<f64>,
    pub samples: Vec<Vec<f32>>,
}

impl SampleChunk {
    pub fn new(timestamps: Vec<f64>, samples: Vec<Vec<f32>>) -> Self {
        Self {
            timestamps,
            samples,
        }
    }

    /// Build a chunk of `count` regularly spaced readings starting at `start`,
    /// with each value produced by `value(timestamp, channel)`.
    pub fn regular<F>(start: f64, srate: f64, count: usize, channels: usize, value: F) -> Self
    where
        F: Fn(f64, usize) -> f32,
    {
        let mut timestamps = Vec::with_capacity(count);
        let mut samples = Vec::with_capacity(count);
        for i in 0..count {
            let t = start + i as f64 / srate;
            timestamps.push(t);
            samples.push((0..channels).map(|ch| value(t, ch)).collect());
        }
        Self {
            timestamps,
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Remove the given channel indices from every reading.
    pub fn drop_channels(&mut self, dropped: &[usize]) {
        if dropped.is_empty() {
            return;
        }
        for reading in &mut self.samples {
            let mut index = 0;
            reading.retain(|_| {
                let keep = !dropped.contains(&index);
                index += 1;
                keep
            });
        }
    }
}

/// A discrete labeled event on the marker stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerEvent {
    pub label: String,
    pub timestamp: f64,
}

impl MarkerEvent {
    pub fn new(label: impl Into<String>, timestamp: f64) -> Self {
        Self {
            label: label.into(),
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_chunk_timestamps() {
        let chunk = SampleChunk::regular(1.0, 100.0, 5, 2, |t, ch| (t as f32) + ch as f32);
        assert_eq!(chunk.len(), 5);
        assert!((chunk.timestamps[4] - 1.04).abs() < 1e-12);
        assert_eq!(chunk.samples[0], vec![1.0, 2.0]);
    }

    #[test]
    fn test_drop_channels() {
        let mut chunk = SampleChunk::new(vec![0.0], vec![vec![1.0, 2.0, 3.0, 4.0]]);
        chunk.drop_channels(&[1, 3]);
        assert_eq!(chunk.samples[0], vec![1.0, 3.0]);
    }

    #[test]
    fn test_source_info_channels() {
        let info = SourceInfo::new("eeg", "EEG", 8, 250.0);
        assert_eq!(info.channel_count(), 8);
        assert_eq!(info.channel_names[7], "ch7");
        assert_eq!(SourceInfo::markers("m").nominal_srate, 0.0);
    }
}
