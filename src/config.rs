//! Configuration for the pipeline.
//!
//! Everything here is plain data: a [`PipelineConfig`] is validated once by
//! `Pipeline::start` and then shared read-only with the workers. Changing
//! any of it requires a restart.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Window geometry, global and per marker label
    pub epochs: EpochSettings,

    /// Which features are computed per channel
    pub features: FeatureChoices,

    /// Which sources to read
    pub selection: SourceSelection,

    /// Channel indices dropped per source name before buffering
    pub channel_drops: HashMap<String, Vec<usize>>,

    /// Classifier behaviour
    pub classifier: ClassifierSettings,

    /// Queue bounds and timeouts
    pub limits: Limits,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            epochs: EpochSettings::default(),
            features: FeatureChoices::default(),
            selection: SourceSelection::default(),
            channel_drops: HashMap::new(),
            classifier: ClassifierSettings::default(),
            limits: Limits::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigurationError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a file, falling back to defaults if it is missing.
    pub fn load_from(path: &Path) -> Result<Self, ConfigurationError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigurationError::Io(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ConfigurationError::Parse(e.to_string()))
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigurationError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigurationError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigurationError::Io(e.to_string()))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigurationError::Io(e.to_string()))
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bci-pipeline")
            .join("config.json")
    }

    /// Check everything that can be checked without looking at sources.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.epochs.validate()?;
        self.features.validate()?;
        self.limits.validate()?;
        if self.classifier.minimum_epochs_required == 0 {
            return Err(ConfigurationError::ZeroLimit("minimum_epochs_required"));
        }
        if self.classifier.refit_interval == 0 {
            return Err(ConfigurationError::ZeroLimit("refit_interval"));
        }
        Ok(())
    }
}

/// Window geometry applied to every marker without an override.
///
/// All values are seconds relative to the marker timestamp. The epoch covers
/// `[marker - tmin, marker + tmax)` and is resampled to
/// `window_length * nominal_srate` samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlobalEpochSettings {
    pub tmin: f64,
    pub tmax: f64,
    pub window_length: f64,
    /// Baseline interval subtracted per channel, relative to the marker
    #[serde(default)]
    pub baseline: Option<(f64, f64)>,
}

impl Default for GlobalEpochSettings {
    fn default() -> Self {
        Self {
            tmin: 0.0,
            tmax: 1.0,
            window_length: 1.0,
            baseline: None,
        }
    }
}

/// Partial override of the global settings for one marker label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpochOverride {
    pub tmin: Option<f64>,
    pub tmax: Option<f64>,
    pub window_length: Option<f64>,
    pub baseline: Option<(f64, f64)>,
}

/// Fully resolved geometry for one epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedWindow {
    pub tmin: f64,
    pub tmax: f64,
    pub window_length: f64,
    pub baseline: Option<(f64, f64)>,
}

impl ResolvedWindow {
    pub fn span(&self) -> f64 {
        self.tmin + self.tmax
    }

    /// Number of samples a slice of this window has at `srate`.
    pub fn sample_count(&self, srate: f64) -> usize {
        ((self.window_length * srate).round() as usize).max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let finite = [self.tmin, self.tmax, self.window_length]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err(ConfigurationError::InvalidGeometry(
                "values must be finite".to_string(),
            ));
        }
        if self.tmin < 0.0 {
            return Err(ConfigurationError::InvalidGeometry(format!(
                "tmin {} is negative",
                self.tmin
            )));
        }
        if self.tmax <= 0.0 {
            return Err(ConfigurationError::InvalidGeometry(format!(
                "tmax {} must be positive",
                self.tmax
            )));
        }
        if self.window_length <= 0.0 {
            return Err(ConfigurationError::InvalidGeometry(format!(
                "window length {} must be positive",
                self.window_length
            )));
        }
        // Tolerate float noise in tmin + tmax.
        if self.window_length > self.span() + 1e-9 {
            return Err(ConfigurationError::WindowTooLong {
                window_length: self.window_length,
                span: self.span(),
            });
        }
        if let Some((start, end)) = self.baseline {
            if start >= end || start < -self.tmin - 1e-9 || end > self.tmax + 1e-9 {
                return Err(ConfigurationError::InvalidBaseline { start, end });
            }
        }
        Ok(())
    }
}

/// Global settings plus per-label overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpochSettings {
    pub global: GlobalEpochSettings,
    pub overrides: BTreeMap<String, EpochOverride>,
}

impl EpochSettings {
    pub fn new(global: GlobalEpochSettings) -> Self {
        Self {
            global,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, label: impl Into<String>, over: EpochOverride) -> Self {
        self.overrides.insert(label.into(), over);
        self
    }

    /// Resolve the geometry for a marker label; unknown labels use the global settings.
    pub fn resolve(&self, label: &str) -> ResolvedWindow {
        let g = &self.global;
        match self.overrides.get(label) {
            Some(o) => ResolvedWindow {
                tmin: o.tmin.unwrap_or(g.tmin),
                tmax: o.tmax.unwrap_or(g.tmax),
                window_length: o.window_length.unwrap_or(g.window_length),
                baseline: o.baseline.or(g.baseline),
            },
            None => self.global_window(),
        }
    }

    pub fn global_window(&self) -> ResolvedWindow {
        ResolvedWindow {
            tmin: self.global.tmin,
            tmax: self.global.tmax,
            window_length: self.global.window_length,
            baseline: self.global.baseline,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.global_window().validate()?;
        for label in self.overrides.keys() {
            self.resolve(label)
                .validate()
                .map_err(|e| ConfigurationError::InvalidOverride {
                    label: label.clone(),
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }

    /// Longest epoch span across the global settings and every override.
    pub fn max_span(&self) -> f64 {
        self.overrides
            .keys()
            .map(|label| self.resolve(label).span())
            .fold(self.global_window().span(), f64::max)
    }
}

/// Per-channel feature selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureChoices {
    pub psd_band: bool,
    pub mean_psd: bool,
    pub median_psd: bool,
    pub variance: bool,
    pub mean_abs: bool,
    pub rms: bool,
    pub spectral_entropy: bool,
    pub permutation_entropy: bool,
    pub waveform_length: bool,
    pub zero_crossings: bool,
    pub slope_sign_changes: bool,
    /// Frequency bands in Hz for the band power features
    pub freq_bands: Vec<[f64; 2]>,
}

impl Default for FeatureChoices {
    fn default() -> Self {
        Self {
            psd_band: true,
            mean_psd: true,
            median_psd: true,
            variance: true,
            mean_abs: true,
            rms: true,
            spectral_entropy: false,
            permutation_entropy: false,
            waveform_length: false,
            zero_crossings: false,
            slope_sign_changes: false,
            freq_bands: vec![[1.0, 4.0], [4.0, 8.0], [8.0, 12.0], [12.0, 20.0]],
        }
    }
}

impl FeatureChoices {
    pub fn uses_spectrum(&self) -> bool {
        self.psd_band || self.mean_psd || self.median_psd || self.spectral_entropy
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.uses_spectrum() && self.freq_bands.is_empty() {
            return Err(ConfigurationError::NoFrequencyBands);
        }
        for &[low, high] in &self.freq_bands {
            if !(low >= 0.0 && high > low) {
                return Err(ConfigurationError::InvalidFrequencyBand(low, high));
            }
        }
        Ok(())
    }
}

/// How data and marker sources are picked from the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSelection {
    /// Explicit data source names; `None` selects by type
    pub data_sources: Option<Vec<String>>,
    /// Explicit marker source name; `None` selects by type
    pub marker_source: Option<String>,
    pub data_types: Vec<String>,
    pub marker_types: Vec<String>,
}

impl Default for SourceSelection {
    fn default() -> Self {
        Self {
            data_sources: None,
            marker_source: None,
            data_types: ["EEG", "ECG", "EMG", "pupil_capture"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            marker_types: vec!["Markers".to_string()],
        }
    }
}

/// Classifier behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    /// Training vectors needed before the first fit
    pub minimum_epochs_required: usize,
    /// New training vectors between fit attempts
    pub refit_interval: usize,
    /// Refuse to start without a configured estimator
    pub require_estimator: bool,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            minimum_epochs_required: 10,
            refit_interval: 1,
            require_estimator: false,
        }
    }
}

/// Queue bounds and timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Epoch requests in flight before the router stalls
    pub max_outstanding: usize,
    /// Capacity of the train and test feature queues
    pub feature_queue_capacity: usize,
    /// Acquisition latency tolerated past `tmax` before a slice times out
    #[serde(with = "duration_serde")]
    pub slice_latency: Duration,
    /// Extra time the assembler waits past the slice deadline
    #[serde(with = "duration_serde")]
    pub assembly_grace: Duration,
    /// History kept beyond the longest epoch span, in seconds
    pub history_margin: f64,
    /// Poll interval for source pulls and worker loops
    #[serde(with = "duration_serde")]
    pub poll_interval: Duration,
    #[serde(with = "duration_serde")]
    pub reconnect_interval: Duration,
    #[serde(with = "duration_serde")]
    pub query_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_outstanding: 64,
            feature_queue_capacity: 256,
            slice_latency: Duration::from_millis(500),
            assembly_grace: Duration::from_millis(500),
            history_margin: 2.0,
            poll_interval: Duration::from_millis(20),
            reconnect_interval: Duration::from_secs(1),
            query_timeout: Duration::from_secs(2),
        }
    }
}

impl Limits {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_outstanding == 0 {
            return Err(ConfigurationError::ZeroLimit("max_outstanding"));
        }
        if self.feature_queue_capacity == 0 {
            return Err(ConfigurationError::ZeroLimit("feature_queue_capacity"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigurationError::ZeroLimit("poll_interval"));
        }
        if self.query_timeout.is_zero() {
            return Err(ConfigurationError::ZeroLimit("query_timeout"));
        }
        if !(self.history_margin >= 0.0) {
            return Err(ConfigurationError::InvalidGeometry(
                "history margin must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Wall-clock time a reader waits for the samples of a window.
    pub fn slice_timeout(&self, window: &ResolvedWindow) -> Duration {
        Duration::from_secs_f64(window.tmax) + self.slice_latency
    }

    /// Wall-clock time the assembler keeps a sequence open.
    pub fn assembly_timeout(&self, window: &ResolvedWindow) -> Duration {
        self.slice_timeout(window) + self.assembly_grace
    }
}

/// Serde support for Duration as fractional seconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
