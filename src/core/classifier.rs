//! Classifier coordinator.
//!
//! Owns the [`Estimator`] on its own thread. Training vectors accumulate
//! into a dataset that is fit once there is enough of it; test vectors are
//! predicted once a fit has succeeded. Queries are answered between vector
//! steps over per-query reply channels.

use crate::config::ClassifierSettings;
use crate::core::mode::{Mode, ModeFlag};
use crate::core::shutdown::Shutdown;
use crate::core::types::FeatureVector;
use crate::error::EstimatorError;
use crate::stats::SharedPipelineStats;
use crossbeam_channel::{select, Receiver, Sender};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::thread::{self, JoinHandle};

/// Fit/predict capability the pipeline delegates to.
pub trait Estimator: Send {
    /// Fit on `features[i]` labeled `labels[i]`. On error the previous
    /// model, if any, must remain usable.
    fn fit(&mut self, features: &[Vec<f64>], labels: &[String]) -> Result<(), EstimatorError>;

    fn predict(&self, features: &[f64]) -> Result<String, EstimatorError>;

    /// Free-form description for status queries.
    fn describe(&self) -> serde_json::Value;

    /// False for the null estimator.
    fn is_configured(&self) -> bool {
        true
    }
}

/// Stand-in when no estimator is supplied.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEstimator;

impl Estimator for NullEstimator {
    fn fit(&mut self, _features: &[Vec<f64>], _labels: &[String]) -> Result<(), EstimatorError> {
        Ok(())
    }

    fn predict(&self, _features: &[f64]) -> Result<String, EstimatorError> {
        Err(EstimatorError::NotFitted)
    }

    fn describe(&self) -> serde_json::Value {
        json!({ "type": "none" })
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// Assigns the label whose class mean is closest in Euclidean distance.
#[derive(Debug, Default, Clone)]
pub struct NearestCentroid {
    centroids: Vec<(String, Vec<f64>)>,
}

impl NearestCentroid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classes(&self) -> Vec<&str> {
        self.centroids.iter().map(|(label, _)| label.as_str()).collect()
    }

    fn dimensions(&self) -> Option<usize> {
        self.centroids.first().map(|(_, c)| c.len())
    }
}

impl Estimator for NearestCentroid {
    fn fit(&mut self, features: &[Vec<f64>], labels: &[String]) -> Result<(), EstimatorError> {
        if features.len() != labels.len() {
            return Err(EstimatorError::Fit(format!(
                "{} vectors but {} labels",
                features.len(),
                labels.len()
            )));
        }
        let Some(first) = features.first() else {
            return Err(EstimatorError::Fit("no training data".to_string()));
        };
        let dims = first.len();
        if let Some(bad) = features.iter().find(|f| f.len() != dims) {
            return Err(EstimatorError::DimensionMismatch {
                expected: dims,
                actual: bad.len(),
            });
        }

        let mut sums: BTreeMap<&str, (Vec<f64>, usize)> = BTreeMap::new();
        for (vector, label) in features.iter().zip(labels) {
            let (sum, count) = sums
                .entry(label.as_str())
                .or_insert_with(|| (vec![0.0; dims], 0));
            for (acc, v) in sum.iter_mut().zip(vector) {
                *acc += v;
            }
            *count += 1;
        }
        if sums.len() < 2 {
            return Err(EstimatorError::SingleClass);
        }

        self.centroids = sums
            .into_iter()
            .map(|(label, (sum, count))| {
                let mean = sum.into_iter().map(|s| s / count as f64).collect();
                (label.to_string(), mean)
            })
            .collect();
        Ok(())
    }

    fn predict(&self, features: &[f64]) -> Result<String, EstimatorError> {
        let dims = self.dimensions().ok_or(EstimatorError::NotFitted)?;
        if features.len() != dims {
            return Err(EstimatorError::DimensionMismatch {
                expected: dims,
                actual: features.len(),
            });
        }
        self.centroids
            .iter()
            .map(|(label, centroid)| {
                let distance: f64 = centroid
                    .iter()
                    .zip(features)
                    .map(|(c, x)| (c - x) * (c - x))
                    .sum();
                (label, distance)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(label, _)| label.clone())
            .ok_or(EstimatorError::NotFitted)
    }

    fn describe(&self) -> serde_json::Value {
        json!({
            "type": "nearest_centroid",
            "classes": self.classes(),
            "dimensions": self.dimensions(),
        })
    }
}

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierState {
    /// Accumulating training vectors, no model yet
    Collecting,
    /// A model is fit and the pipeline is training
    Ready,
    /// A model is fit and the pipeline is testing
    Inferring,
    /// No estimator configured
    Idle,
}

/// Answer to a classifier info query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierInfo {
    pub state: ClassifierState,
    pub estimator: serde_json::Value,
    pub training_vectors: usize,
    pub label_counts: BTreeMap<String, usize>,
    pub last_error: Option<String>,
    /// Successful fits this run
    pub fits: u64,
}

/// Most recent prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestGuess {
    pub sequence_id: u64,
    pub prediction: String,
    /// Label of the marker the epoch was cut for
    pub marker_label: String,
    pub marker_time: f64,
}

/// Channels the coordinator talks over.
pub struct CoordinatorLinks {
    pub train: Receiver<FeatureVector>,
    pub test: Receiver<FeatureVector>,
    pub info_queries: Receiver<Sender<ClassifierInfo>>,
    pub guess_queries: Receiver<Sender<Option<LatestGuess>>>,
    pub mode: ModeFlag,
    pub shutdown: Shutdown,
    pub stats: SharedPipelineStats,
}

enum Step {
    Train(FeatureVector),
    Test(FeatureVector),
    Info(Sender<ClassifierInfo>),
    Guess(Sender<Option<LatestGuess>>),
    Closed,
    Exit,
}

pub struct ClassifierCoordinator {
    estimator: Box<dyn Estimator>,
    settings: ClassifierSettings,
    links: CoordinatorLinks,
    features: Vec<Vec<f64>>,
    labels: Vec<String>,
    label_counts: BTreeMap<String, usize>,
    fitted: bool,
    /// Dataset size at the last fit attempt
    last_attempt: Option<usize>,
    last_error: Option<String>,
    fits: u64,
    latest: Option<LatestGuess>,
}

impl ClassifierCoordinator {
    pub fn new(
        estimator: Box<dyn Estimator>,
        settings: ClassifierSettings,
        links: CoordinatorLinks,
    ) -> Self {
        Self {
            estimator,
            settings,
            links,
            features: Vec::new(),
            labels: Vec::new(),
            label_counts: BTreeMap::new(),
            fitted: false,
            last_attempt: None,
            last_error: None,
            fits: 0,
            latest: None,
        }
    }

    /// Run on a new thread. Joining yields the estimator back.
    pub fn spawn(self) -> std::io::Result<JoinHandle<Box<dyn Estimator>>> {
        thread::Builder::new()
            .name("classifier".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) -> Box<dyn Estimator> {
        tracing::debug!(estimator = %self.estimator.describe(), "Classifier coordinator started");
        while !self.links.shutdown.is_triggered() {
            let step = select! {
                recv(self.links.shutdown.channel()) -> _ => Step::Exit,
                recv(self.links.train) -> v => v.map_or(Step::Closed, Step::Train),
                recv(self.links.test) -> v => v.map_or(Step::Closed, Step::Test),
                recv(self.links.info_queries) -> q => q.map_or(Step::Closed, Step::Info),
                recv(self.links.guess_queries) -> q => q.map_or(Step::Closed, Step::Guess),
            };
            match step {
                Step::Train(vector) => self.on_train(vector),
                Step::Test(vector) => self.on_test(vector),
                Step::Info(reply) => {
                    self.drain_vectors();
                    let _ = reply.send(self.info());
                }
                Step::Guess(reply) => {
                    self.drain_vectors();
                    let _ = reply.send(self.latest.clone());
                }
                Step::Closed => {
                    if !self.links.shutdown.is_triggered() {
                        tracing::error!("Classifier input closed before shutdown");
                    }
                    break;
                }
                Step::Exit => break,
            }
        }
        tracing::debug!(
            training_vectors = self.features.len(),
            fits = self.fits,
            "Classifier coordinator stopped"
        );
        self.estimator
    }

    /// Process every vector already queued, so a query sees them.
    fn drain_vectors(&mut self) {
        loop {
            if let Ok(vector) = self.links.train.try_recv() {
                self.on_train(vector);
            } else if let Ok(vector) = self.links.test.try_recv() {
                self.on_test(vector);
            } else {
                break;
            }
        }
    }

    pub fn state(&self) -> ClassifierState {
        if !self.estimator.is_configured() {
            ClassifierState::Idle
        } else if !self.fitted {
            ClassifierState::Collecting
        } else if self.links.mode.get() == Mode::Test {
            ClassifierState::Inferring
        } else {
            ClassifierState::Ready
        }
    }

    pub fn info(&self) -> ClassifierInfo {
        ClassifierInfo {
            state: self.state(),
            estimator: self.estimator.describe(),
            training_vectors: self.features.len(),
            label_counts: self.label_counts.clone(),
            last_error: self.last_error.clone(),
            fits: self.fits,
        }
    }

    fn on_train(&mut self, vector: FeatureVector) {
        *self.label_counts.entry(vector.label.clone()).or_insert(0) += 1;
        self.labels.push(vector.label);
        self.features.push(vector.values);
        if !self.estimator.is_configured() {
            return;
        }
        if self.should_fit() {
            self.fit();
        }
    }

    fn should_fit(&self) -> bool {
        let enough = self.features.len() >= self.settings.minimum_epochs_required
            && self.label_counts.len() >= 2;
        if !enough {
            return false;
        }
        match self.last_attempt {
            None => true,
            Some(size) => self.features.len() - size >= self.settings.refit_interval,
        }
    }

    fn fit(&mut self) {
        self.last_attempt = Some(self.features.len());
        self.links.stats.record_fit_attempt();
        match self.estimator.fit(&self.features, &self.labels) {
            Ok(()) => {
                if !self.fitted {
                    tracing::info!(
                        vectors = self.features.len(),
                        labels = self.label_counts.len(),
                        "Classifier ready"
                    );
                }
                self.fitted = true;
                self.fits += 1;
                self.last_error = None;
            }
            Err(e) => {
                tracing::warn!(error = %e, vectors = self.features.len(), fitted = self.fitted, "Fit failed");
                self.links.stats.record_fit_failure();
                self.last_error = Some(e.to_string());
            }
        }
    }

    fn on_test(&mut self, vector: FeatureVector) {
        match self.state() {
            ClassifierState::Idle => {
                tracing::trace!(seq = vector.sequence_id, "No estimator, test vector ignored");
            }
            ClassifierState::Collecting => {
                tracing::debug!(seq = vector.sequence_id, "Classifier not fit yet, test vector dropped");
            }
            ClassifierState::Ready | ClassifierState::Inferring => {
                match self.estimator.predict(&vector.values) {
                    Ok(prediction) => {
                        tracing::info!(seq = vector.sequence_id, marker = %vector.label, %prediction, "Prediction");
                        self.links.stats.record_prediction();
                        self.latest = Some(LatestGuess {
                            sequence_id: vector.sequence_id,
                            prediction,
                            marker_label: vector.label,
                            marker_time: vector.marker_time,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(seq = vector.sequence_id, error = %e, "Prediction failed");
                        self.last_error = Some(e.to_string());
                    }
                }
            }
        }
    }
}
