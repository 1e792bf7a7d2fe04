//! Pipeline supervisor.
//!
//! [`Pipeline`] owns the configuration, the mode switch and the estimator
//! between runs. `start` validates everything and opens every source before
//! the first worker thread exists; `stop` fires the shutdown signal and joins
//! the workers in pipeline order, taking the estimator back from the
//! classifier thread.

use crate::config::{EpochSettings, FeatureChoices, PipelineConfig};
use crate::core::buffer::retention_for;
use crate::core::{
    shutdown_pair, AssemblerLinks, ClassifierCoordinator, ClassifierInfo, CoordinatorLinks,
    EpochCounts, Estimator, FeatureAssembler, FeatureExtractor, GeneralFeatureExtractor,
    LatestGuess, MarkerRouter,
    Mode, ModeSwitch, NullEstimator, ReaderLinks, RouterLinks, ShutdownTrigger, SourceHealth,
    SourceReader,
};
use crate::error::{ConfigurationError, PipelineError, PipelineResult};
use crate::source::{select_sources, SelectedSources, SourceRegistry};
use crate::stats::{create_shared_stats, SharedPipelineStats, StatsSnapshot};
use crossbeam_channel::{bounded, unbounded, Sender};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Builds the feature extractor for each run from the configured choices.
pub type ExtractorFactory =
    Arc<dyn Fn(&FeatureChoices) -> Box<dyn FeatureExtractor> + Send + Sync>;

/// A settings change applied through stop, apply, start.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconfiguration {
    EpochSettings(EpochSettings),
    Features(FeatureChoices),
    ChannelDrops(HashMap<String, Vec<usize>>),
    MinimumEpochs(usize),
}

/// Health of one selected data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub name: String,
    pub source_type: String,
    pub channels: usize,
    pub srate: f64,
    pub up: bool,
}

/// Overall pipeline status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub mode: Mode,
    pub marker_source: Option<String>,
    pub sources: Vec<SourceStatus>,
    pub stats: StatsSnapshot,
}

/// Handles of one running set of workers.
struct RunningPipeline {
    trigger: ShutdownTrigger,
    router: Option<JoinHandle<()>>,
    readers: Vec<JoinHandle<()>>,
    assembler: Option<JoinHandle<()>>,
    coordinator: Option<JoinHandle<Box<dyn Estimator>>>,
    count_queries: Sender<Sender<EpochCounts>>,
    info_queries: Sender<Sender<ClassifierInfo>>,
    guess_queries: Sender<Sender<Option<LatestGuess>>>,
    sources: SelectedSources,
    health: SourceHealth,
}

impl RunningPipeline {
    /// Signal shutdown and join router, readers, assembler, coordinator in that order.
    fn shut_down(self) -> (Option<Box<dyn Estimator>>, Vec<String>) {
        self.trigger.trigger();
        let mut panicked = Vec::new();

        if let Some(router) = self.router {
            if router.join().is_err() {
                panicked.push("marker-router".to_string());
            }
        }
        for (index, reader) in self.readers.into_iter().enumerate() {
            if reader.join().is_err() {
                panicked.push(format!("reader-{index}"));
            }
        }
        if let Some(assembler) = self.assembler {
            if assembler.join().is_err() {
                panicked.push("feature-assembler".to_string());
            }
        }
        let estimator = match self.coordinator.map(JoinHandle::join) {
            Some(Ok(estimator)) => Some(estimator),
            Some(Err(_)) => {
                panicked.push("classifier".to_string());
                None
            }
            None => None,
        };
        (estimator, panicked)
    }
}

/// The control surface of the pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<dyn SourceRegistry>,
    estimator: Option<Box<dyn Estimator>>,
    // `estimator` is None while the classifier thread holds it.
    estimator_configured: bool,
    extractor: ExtractorFactory,
    mode: ModeSwitch,
    stats: SharedPipelineStats,
    running: Option<RunningPipeline>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        registry: Arc<dyn SourceRegistry>,
        estimator: Box<dyn Estimator>,
    ) -> Self {
        Self {
            config,
            registry,
            estimator_configured: estimator.is_configured(),
            estimator: Some(estimator),
            extractor: Arc::new(|choices: &FeatureChoices| -> Box<dyn FeatureExtractor> {
                Box::new(GeneralFeatureExtractor::new(choices.clone()))
            }),
            mode: ModeSwitch::new(Mode::Train),
            stats: create_shared_stats(),
            running: None,
        }
    }

    /// Replace the feature extractor. The factory runs on every start with
    /// the feature choices in effect for that run.
    pub fn with_extractor<F>(mut self, factory: F) -> Self
    where
        F: Fn(&FeatureChoices) -> Box<dyn FeatureExtractor> + Send + Sync + 'static,
    {
        self.extractor = Arc::new(factory);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Validate the configuration against the registry without starting.
    pub fn check(&self, config: &PipelineConfig) -> Result<SelectedSources, ConfigurationError> {
        config.validate()?;
        if config.classifier.require_estimator && !self.estimator_configured {
            return Err(ConfigurationError::EstimatorRequired);
        }
        let selected = select_sources(self.registry.as_ref(), &config.selection)?;
        for info in &selected.data {
            let Some(drops) = config.channel_drops.get(&info.name) else {
                continue;
            };
            if let Some(&index) = drops.iter().find(|&&i| i >= info.channel_count()) {
                return Err(ConfigurationError::UnknownDropChannel {
                    source_name: info.name.clone(),
                    index,
                    channels: info.channel_count(),
                });
            }
            let mut unique = drops.clone();
            unique.sort_unstable();
            unique.dedup();
            if unique.len() >= info.channel_count() {
                return Err(ConfigurationError::InvalidGeometry(format!(
                    "every channel of '{}' is dropped",
                    info.name
                )));
            }
        }
        Ok(selected)
    }

    /// Validate, open every source and spawn the workers.
    pub fn start(&mut self) -> PipelineResult<()> {
        if self.running.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }
        let selected = self.check(&self.config)?;

        let mut data_channels = Vec::with_capacity(selected.data.len());
        for info in &selected.data {
            data_channels.push(self.registry.open(info)?);
        }
        let marker_channel = self.registry.open_markers(&selected.markers)?;

        let config = &self.config;
        let limits = config.limits.clone();
        let stats = create_shared_stats();
        self.stats = Arc::clone(&stats);

        let (trigger, shutdown) = shutdown_pair();
        let (health, health_slots) = SourceHealth::new(selected.data.len());
        let (assembler_tx, assembler_rx) = unbounded();
        let (outcome_tx, outcome_rx) = unbounded();
        let (train_tx, train_rx) = bounded(limits.feature_queue_capacity);
        let (test_tx, test_rx) = bounded(limits.feature_queue_capacity);
        let (count_tx, count_rx) = unbounded();
        let (info_tx, info_rx) = unbounded();
        let (guess_tx, guess_rx) = unbounded();

        let mut run = RunningPipeline {
            trigger,
            router: None,
            readers: Vec::new(),
            assembler: None,
            coordinator: None,
            count_queries: count_tx,
            info_queries: info_tx,
            guess_queries: guess_tx,
            sources: selected.clone(),
            health: health.clone(),
        };

        let estimator = self
            .estimator
            .take()
            .unwrap_or_else(|| Box::new(NullEstimator));
        let coordinator = ClassifierCoordinator::new(
            estimator,
            config.classifier.clone(),
            CoordinatorLinks {
                train: train_rx,
                test: test_rx,
                info_queries: info_rx,
                guess_queries: guess_rx,
                mode: self.mode.flag(),
                shutdown: shutdown.clone(),
                stats: Arc::clone(&stats),
            },
        );
        // Consumers are spawned before producers.
        let spawned = (|| -> std::io::Result<()> {
            run.coordinator = Some(coordinator.spawn()?);

            let extractor = (self.extractor)(&config.features);
            tracing::debug!(extractor = extractor.name(), "Feature extractor ready");
            run.assembler = Some(
                FeatureAssembler::new(
                    selected.data.len(),
                    extractor,
                    limits.poll_interval,
                    AssemblerLinks {
                        inbox: assembler_rx,
                        outcomes: outcome_tx,
                        train: train_tx,
                        test: test_tx,
                        mode: self.mode.flag(),
                        shutdown: shutdown.clone(),
                        stats: Arc::clone(&stats),
                    },
                )
                .spawn()?,
            );

            let retention = retention_for(config.epochs.max_span(), limits.history_margin);
            let mut request_senders = Vec::with_capacity(data_channels.len());
            for (channel, slot) in data_channels.into_iter().zip(health_slots) {
                let mut drops = config
                    .channel_drops
                    .get(&channel.info().name)
                    .cloned()
                    .unwrap_or_default();
                drops.sort_unstable();
                drops.dedup();
                let (request_tx, request_rx) = unbounded();
                request_senders.push(request_tx);
                let reader = SourceReader::new(
                    channel,
                    drops,
                    retention,
                    limits.clone(),
                    ReaderLinks {
                        requests: request_rx,
                        assembler: assembler_tx.clone(),
                        health: slot,
                        shutdown: shutdown.clone(),
                        stats: Arc::clone(&stats),
                    },
                );
                run.readers.push(reader.spawn()?);
            }

            run.router = Some(
                MarkerRouter::new(
                    marker_channel,
                    config.epochs.clone(),
                    limits.clone(),
                    RouterLinks {
                        readers: request_senders,
                        assembler: assembler_tx,
                        outcomes: outcome_rx,
                        count_queries: count_rx,
                        health,
                        shutdown,
                        stats: Arc::clone(&stats),
                    },
                )
                .spawn()?,
            );
            Ok(())
        })();

        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to spawn pipeline workers");
            let (estimator, _) = run.shut_down();
            self.restore_estimator(estimator);
            return Err(PipelineError::Spawn(e));
        }

        tracing::info!(
            run_id = %stats.run_id(),
            sources = selected.data.len(),
            markers = %selected.markers.name,
            mode = %self.mode.get(),
            "Pipeline started"
        );
        self.running = Some(run);
        Ok(())
    }

    /// Stop every worker. Stopping a stopped pipeline is a no-op.
    pub fn stop(&mut self) -> PipelineResult<()> {
        let Some(run) = self.running.take() else {
            return Ok(());
        };
        let (estimator, panicked) = run.shut_down();
        self.restore_estimator(estimator);
        tracing::info!(run_id = %self.stats.run_id(), "Pipeline stopped");
        match panicked.into_iter().next() {
            Some(worker) => Err(PipelineError::WorkerPanicked(worker)),
            None => Ok(()),
        }
    }

    fn restore_estimator(&mut self, estimator: Option<Box<dyn Estimator>>) {
        if estimator.is_none() {
            tracing::error!("Estimator lost with the classifier thread");
            self.estimator_configured = false;
        }
        self.estimator = estimator;
    }

    /// Swap in a new estimator, restarting if running. The old estimator and
    /// its fitted state are dropped.
    pub fn set_estimator(&mut self, estimator: Box<dyn Estimator>) -> PipelineResult<()> {
        let configured = estimator.is_configured();
        if self.config.classifier.require_estimator && !configured {
            return Err(ConfigurationError::EstimatorRequired.into());
        }

        let was_running = self.is_running();
        let stopped = self.stop();
        tracing::info!(
            estimator = %estimator.describe(),
            restart = was_running,
            "Estimator replaced"
        );
        self.estimator = Some(estimator);
        self.estimator_configured = configured;
        stopped?;
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    /// Apply a settings change, restarting if running. Invalid settings
    /// are rejected before anything stops.
    pub fn reconfigure(&mut self, change: Reconfiguration) -> PipelineResult<()> {
        let mut config = self.config.clone();
        match change {
            Reconfiguration::EpochSettings(epochs) => config.epochs = epochs,
            Reconfiguration::Features(features) => config.features = features,
            Reconfiguration::ChannelDrops(drops) => config.channel_drops = drops,
            Reconfiguration::MinimumEpochs(minimum) => {
                config.classifier.minimum_epochs_required = minimum
            }
        }
        self.check(&config)?;

        let was_running = self.is_running();
        self.stop()?;
        self.config = config;
        tracing::info!(restart = was_running, "Pipeline reconfigured");
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        self.mode.get()
    }

    pub fn set_train_mode(&self) {
        self.set_mode(Mode::Train);
    }

    pub fn set_test_mode(&self) {
        self.set_mode(Mode::Test);
    }

    fn set_mode(&self, mode: Mode) {
        let previous = self.mode.set(mode);
        if previous != mode {
            tracing::info!(from = %previous, to = %mode, "Mode changed");
        }
    }

    fn query<T>(
        &self,
        name: &'static str,
        queries: impl FnOnce(&RunningPipeline) -> &Sender<Sender<T>>,
    ) -> PipelineResult<T> {
        let run = self.running.as_ref().ok_or(PipelineError::NotRunning)?;
        let (reply_tx, reply_rx) = bounded(1);
        queries(run)
            .send(reply_tx)
            .map_err(|_| PipelineError::NotRunning)?;
        reply_rx
            .recv_timeout(self.config.limits.query_timeout)
            .map_err(|_| PipelineError::QueryTimeout(name))
    }

    pub fn query_classifier_info(&self) -> PipelineResult<ClassifierInfo> {
        self.query("classifier_info", |run| &run.info_queries)
    }

    /// Latest prediction, `None` until the first one.
    pub fn query_latest_guess(&self) -> PipelineResult<Option<LatestGuess>> {
        self.query("latest_guess", |run| &run.guess_queries)
    }

    /// Completed epochs per label in the current run.
    pub fn query_marker_counts(&self) -> PipelineResult<EpochCounts> {
        self.query("marker_counts", |run| &run.count_queries)
    }

    /// Counters of the current (or last) run.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stats_summary(&self) -> String {
        self.stats.summary()
    }

    pub fn status(&self) -> PipelineStatus {
        let (marker_source, sources) = match &self.running {
            Some(run) => (
                Some(run.sources.markers.name.clone()),
                run.sources
                    .data
                    .iter()
                    .enumerate()
                    .map(|(index, info)| SourceStatus {
                        name: info.name.clone(),
                        source_type: info.source_type.clone(),
                        channels: info.channel_count(),
                        srate: info.nominal_srate,
                        up: run.health.is_up(index),
                    })
                    .collect(),
            ),
            None => (None, Vec::new()),
        };
        PipelineStatus {
            running: self.is_running(),
            mode: self.mode(),
            marker_source,
            sources,
            stats: self.stats(),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!(error = %e, "Error while stopping pipeline on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalEpochSettings;
    use crate::core::NearestCentroid;
    use crate::source::{MemoryRegistry, SourceInfo};

    fn registry() -> Arc<MemoryRegistry> {
        let mut registry = MemoryRegistry::new();
        // Feeds are dropped immediately; these tests never start reading.
        let _ = registry.add_source(SourceInfo::new("eeg", "EEG", 4, 100.0));
        let _ = registry.add_markers(SourceInfo::markers("markers"));
        Arc::new(registry)
    }

    #[test]
    fn test_rejects_unknown_drop_channel() {
        let pipeline = Pipeline::new(PipelineConfig::default(), registry(), Box::new(NullEstimator));
        let mut config = PipelineConfig::default();
        config.channel_drops.insert("eeg".to_string(), vec![1, 4]);
        assert_eq!(
            pipeline.check(&config),
            Err(ConfigurationError::UnknownDropChannel {
                source_name: "eeg".to_string(),
                index: 4,
                channels: 4,
            })
        );

        config.channel_drops.insert("eeg".to_string(), vec![0, 1, 2, 3]);
        assert!(matches!(
            pipeline.check(&config),
            Err(ConfigurationError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_requires_estimator_when_configured() {
        let mut config = PipelineConfig::default();
        config.classifier.require_estimator = true;
        let pipeline = Pipeline::new(config.clone(), registry(), Box::new(NullEstimator));
        assert_eq!(
            pipeline.check(&config),
            Err(ConfigurationError::EstimatorRequired)
        );

        let pipeline = Pipeline::new(config.clone(), registry(), Box::new(NearestCentroid::new()));
        assert!(pipeline.check(&config).is_ok());
    }

    #[test]
    fn test_set_estimator_checks_requirement() {
        let mut config = PipelineConfig::default();
        config.classifier.require_estimator = true;
        let mut pipeline =
            Pipeline::new(config.clone(), registry(), Box::new(NearestCentroid::new()));

        assert!(matches!(
            pipeline.set_estimator(Box::new(NullEstimator)),
            Err(PipelineError::Configuration(
                ConfigurationError::EstimatorRequired
            ))
        ));
        assert!(pipeline.check(&config).is_ok());

        config.classifier.require_estimator = false;
        let mut pipeline = Pipeline::new(config.clone(), registry(), Box::new(NullEstimator));
        pipeline
            .set_estimator(Box::new(NearestCentroid::new()))
            .unwrap();
        config.classifier.require_estimator = true;
        assert!(pipeline.check(&config).is_ok());
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_invalid_reconfigure_keeps_config() {
        let mut pipeline =
            Pipeline::new(PipelineConfig::default(), registry(), Box::new(NullEstimator));
        let bad = EpochSettings::new(GlobalEpochSettings {
            tmin: 0.1,
            tmax: 0.1,
            window_length: 0.5,
            baseline: None,
        });
        let err = pipeline
            .reconfigure(Reconfiguration::EpochSettings(bad))
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Configuration(ConfigurationError::WindowTooLong { .. })
        ));
        assert_eq!(pipeline.config().epochs, EpochSettings::default());

        pipeline
            .reconfigure(Reconfiguration::MinimumEpochs(3))
            .unwrap();
        assert_eq!(pipeline.config().classifier.minimum_epochs_required, 3);
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_queries_require_running_pipeline() {
        let pipeline = Pipeline::new(PipelineConfig::default(), registry(), Box::new(NullEstimator));
        assert!(matches!(
            pipeline.query_marker_counts(),
            Err(PipelineError::NotRunning)
        ));
        assert!(!pipeline.status().running);
        assert_eq!(pipeline.mode(), Mode::Train);
        pipeline.set_test_mode();
        assert_eq!(pipeline.mode(), Mode::Test);
    }
}
