//! Incremental optimizer: closes the loop between decisions and outcomes.
//!
//! The orchestrator submits one observation per completed request,
//! fire-and-forget. A background trainer periodically retrains the learned
//! routing scorer over the retained window and publishes it atomically; a
//! candidate whose holdout reward regresses past the configured margin is
//! rejected and the previous model stays in force.

pub mod model;
pub mod store;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::router::types::{FeatureVector, RoutingOutcome};

pub use model::{ScoringModel, TrainConfig};
pub use store::{ObservationStore, SqliteObservationStore};

/// One completed routing decision and how it turned out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingObservation {
    pub request_id: String,
    pub features: FeatureVector,
    pub decision: RoutingOutcome,
    /// In [-1, 1]; 0 is neutral.
    pub reward: f64,
    pub timestamp: DateTime<Utc>,
}

/// Reward for a completed request.
///
/// Confidence 0.5 with no override and on-time completion is neutral (0).
/// A human override and missing the deadline each pull the reward down.
/// The exact shape is a tunable; deployments that change it should retrain
/// from scratch.
pub fn reward(confidence: f64, human_overrode: bool, latency_ms: u64, deadline_ms: u64) -> f64 {
    let mut r = 2.0 * confidence.clamp(0.0, 1.0) - 1.0;
    if human_overrode {
        r -= 0.5;
    }
    if latency_ms > deadline_ms {
        r -= 0.25;
    }
    r.clamp(-1.0, 1.0)
}

/// What one training pass did.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainOutcome {
    /// Candidate published.
    Updated { version: u64, samples: usize },
    /// Candidate regressed past the margin; previous model kept.
    Rejected {
        candidate_reward: f64,
        current_reward: f64,
    },
    /// Not enough observations to evaluate a candidate.
    Skipped,
}

/// Handle over the observation log, the current model, and the trainer.
pub struct Optimizer {
    store: Arc<dyn ObservationStore>,
    current: RwLock<Arc<ScoringModel>>,
    recent: Mutex<VecDeque<RoutingObservation>>,
    buffer_size: usize,
    retention: ChronoDuration,
    regression_margin: f64,
    train_config: TrainConfig,
    pending_since_train: AtomicUsize,
    rejected_updates: AtomicU64,
    threshold_reached: Notify,
    observation_threshold: usize,
}

impl Optimizer {
    /// Create an optimizer, restoring the last published model if one exists.
    pub fn new(store: Arc<dyn ObservationStore>, config: &EngineConfig) -> Result<Self> {
        let model = match store.get_model()? {
            Some(bytes) => {
                let model = ScoringModel::from_bytes(&bytes)?;
                info!(version = model.version, "restored routing model");
                model
            }
            None => ScoringModel::untrained(),
        };

        Ok(Self {
            store,
            current: RwLock::new(Arc::new(model)),
            recent: Mutex::new(VecDeque::new()),
            buffer_size: config.optimizer_buffer_size.max(1),
            retention: ChronoDuration::days(config.optimizer_retention_days as i64),
            regression_margin: config.optimizer_regression_margin,
            train_config: TrainConfig::default(),
            pending_since_train: AtomicUsize::new(0),
            rejected_updates: AtomicU64::new(0),
            threshold_reached: Notify::new(),
            observation_threshold: config.optimizer_observation_threshold.max(1),
        })
    }

    /// Record an observation. Fire-and-forget: failures are logged, never
    /// surfaced. A full recent-window buffer drops its oldest entry.
    pub fn record(&self, observation: RoutingObservation) {
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() >= self.buffer_size {
                recent.pop_front();
            }
            recent.push_back(observation.clone());
        }

        if let Err(e) = self.store.append(&observation) {
            warn!(request_id = %observation.request_id, error = %e, "failed to persist observation");
        }

        let pending = self.pending_since_train.fetch_add(1, Ordering::Relaxed) + 1;
        if pending >= self.observation_threshold {
            self.threshold_reached.notify_one();
        }
    }

    /// The most recent observations, newest last.
    pub fn recent(&self, n: usize) -> Vec<RoutingObservation> {
        match self.recent.lock() {
            Ok(recent) => recent.iter().rev().take(n).rev().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Snapshot of the model currently in force.
    ///
    /// Published atomically: callers see either the previous model or the
    /// next one, never a mix.
    pub fn current_model(&self) -> Arc<ScoringModel> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_else(|_| Arc::new(ScoringModel::untrained()))
    }

    /// How many candidate models have been rejected for regressing.
    pub fn rejected_count(&self) -> u64 {
        self.rejected_updates.load(Ordering::Relaxed)
    }

    /// Run one training pass over the retained window.
    pub fn train_once(&self) -> Result<TrainOutcome> {
        self.pending_since_train.store(0, Ordering::Relaxed);

        let cutoff = Utc::now() - self.retention;
        if let Err(e) = self.store.prune_older_than(cutoff) {
            warn!(error = %e, "observation prune failed");
        }

        let observations = self.store.scan(cutoff)?;
        if observations.len() < 4 {
            debug!(count = observations.len(), "too few observations, skipping training");
            return Ok(TrainOutcome::Skipped);
        }

        // Hold out the newest tail for evaluation, train on the rest.
        let holdout_len = ((observations.len() as f64 * self.train_config.holdout_fraction)
            .ceil() as usize)
            .clamp(1, observations.len() - 1);
        let split = observations.len() - holdout_len;
        let (train_set, holdout) = observations.split_at(split);

        let current = self.current_model();
        let candidate = current.train(train_set, &self.train_config);

        let current_reward = current.holdout_reward(holdout);
        let candidate_reward = candidate.holdout_reward(holdout);
        if candidate_reward < current_reward - self.regression_margin {
            self.rejected_updates.fetch_add(1, Ordering::Relaxed);
            warn!(
                candidate_reward,
                current_reward, "candidate model rejected: holdout reward regressed"
            );
            return Ok(TrainOutcome::Rejected {
                candidate_reward,
                current_reward,
            });
        }

        let version = candidate.version;
        let samples = candidate.sample_count;
        self.store.put_model(&candidate.to_bytes()?)?;
        let mut guard = self
            .current
            .write()
            .map_err(|_| Error::InternalInvariant("model lock poisoned".into()))?;
        *guard = Arc::new(candidate);
        drop(guard);

        info!(version, samples, "published retrained routing model");
        Ok(TrainOutcome::Updated { version, samples })
    }

    /// Retrain on an interval, or early when enough observations arrive,
    /// whichever comes first. Training failures keep the last good model.
    pub fn spawn_trainer(self: &Arc<Self>, config: &EngineConfig, token: CancellationToken) -> JoinHandle<()> {
        let optimizer = Arc::clone(self);
        let interval = Duration::from_secs(config.optimizer_update_interval_s.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = optimizer.threshold_reached.notified() => {}
                }
                if let Err(e) = optimizer.train_once() {
                    warn!(error = %e, "training pass failed, keeping last good model");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Request, RequestKind};
    use serde_json::json;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    fn optimizer() -> Optimizer {
        let store = Arc::new(SqliteObservationStore::in_memory().unwrap());
        Optimizer::new(store, &config()).unwrap()
    }

    fn observation(decision: RoutingOutcome, reward_value: f64) -> RoutingObservation {
        let request = Request::new(RequestKind::Analysis, json!("inspect")).with_complexity(0.7);
        RoutingObservation {
            request_id: request.id.to_string(),
            features: FeatureVector::from_request(&request),
            decision,
            reward: reward_value,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_reward_shape() {
        assert_eq!(reward(0.5, false, 100, 1_000), 0.0);
        assert_eq!(reward(1.0, false, 100, 1_000), 1.0);
        assert_eq!(reward(0.0, false, 100, 1_000), -1.0);
        // Override and lateness each pull the reward down.
        assert_eq!(reward(1.0, true, 100, 1_000), 0.5);
        assert_eq!(reward(1.0, false, 2_000, 1_000), 0.75);
        // Never below the floor.
        assert_eq!(reward(0.0, true, 2_000, 1_000), -1.0);
    }

    #[test]
    fn test_buffer_drops_oldest() {
        let store = Arc::new(SqliteObservationStore::in_memory().unwrap());
        let mut cfg = config();
        cfg.optimizer_buffer_size = 2;
        let optimizer = Optimizer::new(store, &cfg).unwrap();

        for reward_value in [0.1, 0.2, 0.3] {
            optimizer.record(observation(RoutingOutcome::Auto, reward_value));
        }
        let recent = optimizer.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].reward, 0.2);
        assert_eq!(recent[1].reward, 0.3);
        // The durable log kept everything.
        assert_eq!(optimizer.store.count().unwrap(), 3);
    }

    #[test]
    fn test_train_skips_without_data() {
        let optimizer = optimizer();
        assert_eq!(optimizer.train_once().unwrap(), TrainOutcome::Skipped);
    }

    #[test]
    fn test_train_publishes_new_version() {
        let optimizer = optimizer();
        for i in 0..40 {
            let decision = if i % 2 == 0 {
                RoutingOutcome::ExpertConsultation
            } else {
                RoutingOutcome::Auto
            };
            let reward_value = if i % 2 == 0 { 0.8 } else { -0.6 };
            optimizer.record(observation(decision, reward_value));
        }

        let before = optimizer.current_model();
        match optimizer.train_once().unwrap() {
            TrainOutcome::Updated { version, samples } => {
                assert_eq!(version, before.version + 1);
                assert!(samples > 0);
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert!(optimizer.current_model().is_trained());
    }

    #[test]
    fn test_model_restored_from_store() {
        let store = Arc::new(SqliteObservationStore::in_memory().unwrap());
        let optimizer = Optimizer::new(Arc::clone(&store) as Arc<dyn ObservationStore>, &config())
            .unwrap();
        for _ in 0..20 {
            optimizer.record(observation(RoutingOutcome::HumanRequired, 0.9));
        }
        optimizer.train_once().unwrap();
        let version = optimizer.current_model().version;
        assert!(version > 0);

        // A fresh handle over the same store comes up with the same model.
        let restored = Optimizer::new(store, &config()).unwrap();
        assert_eq!(restored.current_model().version, version);
    }

    #[test]
    fn test_regressive_candidate_rejected() {
        let store = Arc::new(SqliteObservationStore::in_memory().unwrap());
        let mut cfg = config();
        // Zero margin: any regression at all is rejected.
        cfg.optimizer_regression_margin = 0.0;
        let optimizer = Optimizer::new(store, &cfg).unwrap();

        // Train a model that strongly prefers EXPERT_CONSULTATION.
        for _ in 0..30 {
            optimizer.record(observation(RoutingOutcome::ExpertConsultation, 0.9));
        }
        optimizer.train_once().unwrap();
        let good_version = optimizer.current_model().version;

        // Now feed a training window that punishes the decision while the
        // newest tail (the holdout) still rewards it: training pulls
        // probability off a decision the holdout credits, so the candidate
        // scores worse than the current model.
        for _ in 0..160 {
            optimizer.record(observation(RoutingOutcome::ExpertConsultation, -0.9));
        }
        for _ in 0..40 {
            optimizer.record(observation(RoutingOutcome::ExpertConsultation, 0.9));
        }

        let outcome = optimizer.train_once().unwrap();
        match outcome {
            TrainOutcome::Rejected { .. } => {
                assert_eq!(optimizer.current_model().version, good_version);
                assert_eq!(optimizer.rejected_count(), 1);
            }
            TrainOutcome::Updated { .. } | TrainOutcome::Skipped => {
                panic!("expected rejection, got {outcome:?}")
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_trainer_task_runs_on_threshold() {
        let store = Arc::new(SqliteObservationStore::in_memory().unwrap());
        let mut cfg = config();
        cfg.optimizer_observation_threshold = 10;
        cfg.optimizer_update_interval_s = 3_600;
        let optimizer = Arc::new(Optimizer::new(store, &cfg).unwrap());

        let token = CancellationToken::new();
        let handle = optimizer.spawn_trainer(&cfg, token.clone());

        for _ in 0..10 {
            optimizer.record(observation(RoutingOutcome::Auto, 0.6));
        }
        // Let the notified trainer run.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert!(optimizer.current_model().is_trained());
        token.cancel();
        handle.await.unwrap();
    }
}
