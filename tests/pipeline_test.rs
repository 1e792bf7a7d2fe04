//! End-to-end pipeline tests over scripted in-memory streams.

use bci_pipeline::config::GlobalEpochSettings;
use bci_pipeline::core::EpochSlice;
use bci_pipeline::source::{MarkerFeed, SampleChunk, SampleFeed};
use bci_pipeline::{
    ClassifierState, ConfigurationError, EpochSettings, Estimator, EstimatorError,
    FeatureChoices, FeatureExtractor, Mode, NearestCentroid, NullEstimator, MemoryRegistry,
    Pipeline, PipelineConfig, PipelineError, Reconfiguration, SourceInfo,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::json;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const SRATE: f64 = 100.0;

/// A running pipeline plus the feeds that drive it.
struct Rig {
    pipeline: Pipeline,
    sources: Vec<SampleFeed>,
    markers: MarkerFeed,
}

impl Rig {
    fn new(source_count: usize, config: PipelineConfig) -> Self {
        Self::with_estimator(source_count, config, Box::new(NearestCentroid::new()))
    }

    fn with_estimator(
        source_count: usize,
        config: PipelineConfig,
        estimator: Box<dyn Estimator>,
    ) -> Self {
        let mut registry = MemoryRegistry::new();
        let sources = (0..source_count)
            .map(|i| registry.add_source(SourceInfo::new(format!("eeg-{i}"), "EEG", 2, SRATE)))
            .collect();
        let markers = registry.add_markers(SourceInfo::markers("markers"));
        let pipeline = Pipeline::new(config, Arc::new(registry), estimator);
        Self {
            pipeline,
            sources,
            markers,
        }
    }

    fn with_extractor(self, extractor: ChannelMean) -> Self {
        let pipeline = self
            .pipeline
            .with_extractor(move |_: &FeatureChoices| -> Box<dyn FeatureExtractor> {
                Box::new(extractor.clone())
            });
        Self { pipeline, ..self }
    }

    /// Push one second of data starting at `second` to every connected source.
    fn push_second(&self, second: u32, amplitude: f32) {
        let start = f64::from(second);
        for feed in self.sources.iter().filter(|feed| feed.is_connected()) {
            feed.push(SampleChunk::regular(start, SRATE, SRATE as usize, 2, |t, ch| {
                amplitude * ((2.0 * PI * 10.0 * t).sin() as f32) + ch as f32 * 0.01
            }));
        }
    }

    /// One second of data with a marker in its middle.
    fn trial(&self, second: u32, label: &str, amplitude: f32) {
        self.push_second(second, amplitude);
        self.markers.push_label(label, f64::from(second) + 0.5);
    }

    fn completed(&self) -> u64 {
        self.pipeline
            .query_marker_counts()
            .map(|counts| counts.values().sum())
            .unwrap_or(0)
    }
}

/// One feature per sequence: the mean of the first channel of the first
/// source. Records the slice length it was handed.
#[derive(Clone, Default)]
struct ChannelMean {
    sample_counts: Arc<Mutex<Vec<usize>>>,
}

impl ChannelMean {
    fn seen(&self) -> Vec<usize> {
        self.sample_counts.lock().unwrap().clone()
    }
}

impl FeatureExtractor for ChannelMean {
    fn name(&self) -> &'static str {
        "channel_mean"
    }

    fn extract(&self, slices: &[EpochSlice]) -> Vec<f64> {
        let samples = &slices[0].channels[0];
        self.sample_counts.lock().unwrap().push(samples.len());
        let sum: f64 = samples.iter().map(|&v| f64::from(v)).sum();
        vec![sum / samples.len() as f64]
    }
}

/// Blocks inside `fit` until released, to hold the classifier thread busy.
struct GatedEstimator {
    entered: Sender<()>,
    release: Receiver<()>,
}

impl Estimator for GatedEstimator {
    fn fit(&mut self, _features: &[Vec<f64>], _labels: &[String]) -> Result<(), EstimatorError> {
        let _ = self.entered.send(());
        let _ = self.release.recv_timeout(Duration::from_secs(5));
        Ok(())
    }

    fn predict(&self, _features: &[f64]) -> Result<String, EstimatorError> {
        Ok("A".to_string())
    }

    fn describe(&self) -> serde_json::Value {
        json!({ "type": "gated" })
    }
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.epochs = EpochSettings::new(GlobalEpochSettings {
        tmin: 0.2,
        tmax: 0.4,
        window_length: 0.6,
        baseline: None,
    });
    config.classifier.minimum_epochs_required = 4;
    config
}

fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_marker_produces_labelled_vector() {
    let mut rig = Rig::new(1, config());
    rig.pipeline.start().unwrap();

    for second in 0..6 {
        rig.push_second(second, 1.0);
    }
    rig.markers.push_label("A", 5.0);

    assert!(wait_until(|| rig.completed() == 1));
    let counts = rig.pipeline.query_marker_counts().unwrap();
    assert_eq!(counts.get("A"), Some(&1));
    assert_eq!(counts.len(), 1);

    let info = rig.pipeline.query_classifier_info().unwrap();
    assert_eq!(info.training_vectors, 1);
    assert_eq!(info.label_counts.get("A"), Some(&1));

    let stats = rig.pipeline.stats();
    assert_eq!(stats.markers_received, 1);
    assert_eq!(stats.vectors_assembled, 1);
    assert_eq!(stats.train_vectors, 1);
    assert_eq!(stats.sequences_abandoned, 0);

    rig.pipeline.stop().unwrap();
}

#[test]
fn test_counts_never_exceed_markers() {
    let mut rig = Rig::new(2, config());
    rig.pipeline.start().unwrap();

    let labels = ["left", "right", "left", "left", "right", "rest"];
    for (second, label) in labels.iter().enumerate() {
        rig.trial(second as u32, label, 1.0);
    }

    assert!(wait_until(|| rig.completed() == labels.len() as u64));
    let counts = rig.pipeline.query_marker_counts().unwrap();
    assert_eq!(counts.get("left"), Some(&3));
    assert_eq!(counts.get("right"), Some(&2));
    assert_eq!(counts.get("rest"), Some(&1));

    // Nothing else arrives, so the counts stay put.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(rig.completed(), labels.len() as u64);
    assert_eq!(rig.pipeline.stats().vectors_assembled, labels.len() as u64);
}

#[test]
fn test_mode_toggle_routes_each_vector_once() {
    let mut rig = Rig::new(1, config());
    rig.pipeline.start().unwrap();

    let mut expected_train = 0;
    for second in 0..8u32 {
        if second % 3 == 2 {
            rig.pipeline.set_test_mode();
        } else {
            rig.pipeline.set_train_mode();
            expected_train += 1;
        }
        let label = if second % 2 == 0 { "A" } else { "B" };
        rig.trial(second, label, 1.0);
        assert!(wait_until(|| rig.completed() == u64::from(second) + 1));
    }

    let stats = rig.pipeline.stats();
    assert_eq!(stats.vectors_assembled, 8);
    assert_eq!(stats.train_vectors + stats.test_vectors, 8);
    assert_eq!(stats.train_vectors, expected_train);

    let info = rig.pipeline.query_classifier_info().unwrap();
    assert_eq!(info.training_vectors as u64, expected_train);
}

#[test]
fn test_invalid_window_rejected_before_start() {
    let mut config = config();
    config.epochs = EpochSettings::new(GlobalEpochSettings {
        tmin: 0.1,
        tmax: 0.1,
        window_length: 0.5,
        baseline: None,
    });
    let mut rig = Rig::new(1, config);

    let err = rig.pipeline.start().unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Configuration(ConfigurationError::WindowTooLong { .. })
    ));
    assert!(!rig.pipeline.is_running());
    assert_eq!(rig.pipeline.stats().markers_received, 0);
    assert!(matches!(
        rig.pipeline.query_marker_counts(),
        Err(PipelineError::NotRunning)
    ));
}

#[test]
fn test_missing_marker_source_rejected() {
    let mut registry = MemoryRegistry::new();
    let _feed = registry.add_source(SourceInfo::new("eeg", "EEG", 2, SRATE));
    let mut pipeline = Pipeline::new(config(), Arc::new(registry), Box::new(NullEstimator));

    assert!(matches!(
        pipeline.start(),
        Err(PipelineError::Configuration(
            ConfigurationError::NoMarkerSource
        ))
    ));
    assert!(!pipeline.is_running());
}

#[test]
fn test_single_label_stays_collecting() {
    let mut rig = Rig::new(1, config());
    rig.pipeline.start().unwrap();

    for second in 0..6 {
        rig.trial(second, "A", 1.0);
    }
    assert!(wait_until(|| rig.completed() == 6));

    let info = rig.pipeline.query_classifier_info().unwrap();
    assert_eq!(info.state, ClassifierState::Collecting);
    assert_eq!(info.training_vectors, 6);
    assert_eq!(info.fits, 0);
}

#[test]
fn test_trains_then_predicts() {
    let mut rig = Rig::new(1, config());
    rig.pipeline.start().unwrap();

    for second in 0..8u32 {
        let (label, amplitude) = if second % 2 == 0 { ("A", 5.0) } else { ("B", 0.5) };
        rig.trial(second, label, amplitude);
    }
    assert!(wait_until(|| rig.completed() == 8));
    assert!(wait_until(|| {
        rig.pipeline
            .query_classifier_info()
            .map(|info| info.state == ClassifierState::Ready)
            .unwrap_or(false)
    }));

    rig.pipeline.set_test_mode();
    rig.trial(8, "A", 5.0);
    assert!(wait_until(|| {
        matches!(rig.pipeline.query_latest_guess(), Ok(Some(guess)) if guess.marker_label == "A")
    }));
    let guess = rig.pipeline.query_latest_guess().unwrap().unwrap();
    assert_eq!(guess.prediction, "A");

    rig.trial(9, "B", 0.5);
    assert!(wait_until(|| {
        matches!(rig.pipeline.query_latest_guess(), Ok(Some(guess)) if guess.marker_label == "B")
    }));
    let guess = rig.pipeline.query_latest_guess().unwrap().unwrap();
    assert_eq!(guess.prediction, "B");

    let info = rig.pipeline.query_classifier_info().unwrap();
    assert_eq!(info.state, ClassifierState::Inferring);
    assert_eq!(info.training_vectors, 8);
}

#[test]
fn test_disconnected_source_drops_sequences_without_blocking() {
    let mut config = config();
    config.limits.max_outstanding = 1;
    let mut rig = Rig::new(2, config);
    rig.pipeline.start().unwrap();

    rig.trial(0, "A", 1.0);
    assert!(wait_until(|| rig.completed() == 1));

    rig.sources[1].disconnect();
    assert!(wait_until(|| !rig.pipeline.status().sources[1].up));

    for second in 1..4 {
        rig.trial(second, "B", 1.0);
    }
    assert!(wait_until(|| rig.pipeline.stats().markers_received == 4));

    let counts = rig.pipeline.query_marker_counts().unwrap();
    assert_eq!(counts.get("A"), Some(&1));
    assert_eq!(counts.get("B"), None);

    let stats = rig.pipeline.stats();
    assert_eq!(stats.markers_dropped, 3);
    assert_eq!(stats.backpressure_stalls, 0);
    assert!(stats.source_disconnects >= 1);
    assert!(rig.pipeline.status().sources[0].up);
}

#[test]
fn test_restart_preserves_mode() {
    let mut rig = Rig::new(1, config());
    rig.pipeline.start().unwrap();
    rig.trial(0, "A", 1.0);
    assert!(wait_until(|| rig.completed() == 1));

    rig.pipeline.set_test_mode();
    rig.pipeline.stop().unwrap();
    assert!(!rig.pipeline.is_running());
    assert_eq!(rig.pipeline.mode(), Mode::Test);
    // A second stop is a no-op.
    rig.pipeline.stop().unwrap();

    rig.pipeline.start().unwrap();
    assert_eq!(rig.pipeline.mode(), Mode::Test);
    assert!(rig.pipeline.query_marker_counts().unwrap().is_empty());
    assert!(matches!(
        rig.pipeline.start(),
        Err(PipelineError::AlreadyRunning)
    ));
}

#[test]
fn test_channel_drops_apply_per_source() {
    let mut config = config();
    config.channel_drops.insert("eeg-0".to_string(), vec![1]);
    let mut with_drop = Rig::new(1, config);
    let mut without_drop = Rig::new(1, self::config());
    with_drop.pipeline.start().unwrap();
    without_drop.pipeline.start().unwrap();

    for second in 0..2 {
        with_drop.trial(second, if second == 0 { "A" } else { "B" }, 1.0);
        without_drop.trial(second, if second == 0 { "A" } else { "B" }, 1.0);
    }
    assert!(wait_until(|| with_drop.completed() == 2));
    assert!(wait_until(|| without_drop.completed() == 2));

    let dropped = with_drop.pipeline.stats();
    let kept = without_drop.pipeline.stats();
    assert_eq!(dropped.vectors_assembled, 2);
    assert_eq!(kept.vectors_assembled, 2);
    // The narrowed readings fit the narrowed buffer.
    assert_eq!(dropped.samples_rejected, 0);
    assert_eq!(dropped.samples_received, kept.samples_received);
}

#[test]
fn test_source_reconnects_and_resumes() {
    let mut config = config();
    config.limits.reconnect_interval = Duration::from_millis(50);
    let mut rig = Rig::new(2, config);
    rig.pipeline.start().unwrap();

    rig.trial(0, "A", 1.0);
    assert!(wait_until(|| rig.completed() == 1));

    rig.sources[1].disconnect();
    assert!(wait_until(|| !rig.pipeline.status().sources[1].up));
    rig.trial(1, "B", 1.0);
    assert!(wait_until(|| rig.pipeline.stats().markers_dropped == 1));

    rig.sources[1].reconnect();
    assert!(wait_until(|| rig.pipeline.status().sources[1].up));
    rig.trial(2, "A", 1.0);
    rig.trial(3, "B", 1.0);
    assert!(wait_until(|| rig.completed() == 3));

    let counts = rig.pipeline.query_marker_counts().unwrap();
    assert_eq!(counts.get("A"), Some(&2));
    assert_eq!(counts.get("B"), Some(&1));
    let stats = rig.pipeline.stats();
    assert!(stats.source_disconnects >= 1);
    assert!(stats.source_reconnects >= 1);
    assert_eq!(stats.markers_dropped, 1);
}

#[test]
fn test_custom_extractor_feeds_classifier() {
    let extractor = ChannelMean::default();
    let mut rig = Rig::new(1, config()).with_extractor(extractor.clone());
    rig.pipeline.start().unwrap();

    for second in 0..6u32 {
        let (label, amplitude) = if second % 2 == 0 { ("A", 5.0) } else { ("B", 0.5) };
        rig.trial(second, label, amplitude);
    }
    assert!(wait_until(|| rig.completed() == 6));
    assert!(wait_until(|| {
        rig.pipeline
            .query_classifier_info()
            .map(|info| info.state == ClassifierState::Ready)
            .unwrap_or(false)
    }));

    assert_eq!(extractor.seen(), vec![60; 6]);
    let info = rig.pipeline.query_classifier_info().unwrap();
    assert_eq!(info.estimator["type"], "nearest_centroid");
    assert_eq!(info.estimator["dimensions"], 1);
}

#[test]
fn test_estimator_swap_restarts_running_pipeline() {
    let mut rig = Rig::with_estimator(1, config(), Box::new(NullEstimator));
    rig.pipeline.start().unwrap();
    for second in 0..4u32 {
        rig.trial(second, if second % 2 == 0 { "A" } else { "B" }, 1.0);
    }
    assert!(wait_until(|| rig.completed() == 4));
    let info = rig.pipeline.query_classifier_info().unwrap();
    assert_eq!(info.state, ClassifierState::Idle);
    assert_eq!(info.estimator["type"], "none");

    rig.pipeline
        .set_estimator(Box::new(NearestCentroid::new()))
        .unwrap();
    assert!(rig.pipeline.is_running());
    assert!(rig.pipeline.query_marker_counts().unwrap().is_empty());

    for second in 4..10u32 {
        let (label, amplitude) = if second % 2 == 0 { ("A", 5.0) } else { ("B", 0.5) };
        rig.trial(second, label, amplitude);
    }
    assert!(wait_until(|| rig.completed() == 6));
    assert!(wait_until(|| {
        rig.pipeline
            .query_classifier_info()
            .map(|info| info.state == ClassifierState::Ready)
            .unwrap_or(false)
    }));
    let info = rig.pipeline.query_classifier_info().unwrap();
    assert_eq!(info.estimator["type"], "nearest_centroid");
    assert_eq!(info.training_vectors, 6);
}

#[test]
fn test_reconfigure_while_running_applies_new_window() {
    let extractor = ChannelMean::default();
    let mut rig = Rig::new(1, config()).with_extractor(extractor.clone());
    rig.pipeline.start().unwrap();
    rig.pipeline.set_test_mode();

    rig.trial(0, "A", 1.0);
    assert!(wait_until(|| rig.completed() == 1));
    assert_eq!(extractor.seen(), vec![60]);

    rig.pipeline
        .reconfigure(Reconfiguration::EpochSettings(EpochSettings::new(
            GlobalEpochSettings {
                tmin: 0.1,
                tmax: 0.3,
                window_length: 0.4,
                baseline: None,
            },
        )))
        .unwrap();
    assert!(rig.pipeline.is_running());
    assert_eq!(rig.pipeline.mode(), Mode::Test);
    assert!(rig.pipeline.query_marker_counts().unwrap().is_empty());
    assert_eq!(rig.pipeline.stats().vectors_assembled, 0);

    rig.trial(1, "B", 1.0);
    assert!(wait_until(|| rig.completed() == 1));
    assert_eq!(extractor.seen(), vec![60, 40]);
    let counts = rig.pipeline.query_marker_counts().unwrap();
    assert_eq!(counts.get("B"), Some(&1));
    assert_eq!(rig.pipeline.stats().test_vectors, 1);
}

#[test]
fn test_query_times_out_while_classifier_busy() {
    let (entered_tx, entered_rx) = unbounded();
    let (release_tx, release_rx) = unbounded();
    let mut config = config();
    config.classifier.minimum_epochs_required = 2;
    config.limits.query_timeout = Duration::from_millis(100);
    let mut rig = Rig::with_estimator(
        1,
        config,
        Box::new(GatedEstimator {
            entered: entered_tx,
            release: release_rx,
        }),
    );
    rig.pipeline.start().unwrap();

    rig.trial(0, "A", 1.0);
    rig.trial(1, "B", 1.0);
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert!(matches!(
        rig.pipeline.query_classifier_info(),
        Err(PipelineError::QueryTimeout("classifier_info"))
    ));
    // Other workers keep answering.
    assert!(wait_until(|| rig.completed() == 2));

    release_tx.send(()).unwrap();
    assert!(wait_until(|| {
        rig.pipeline
            .query_classifier_info()
            .map(|info| info.fits == 1)
            .unwrap_or(false)
    }));
}
