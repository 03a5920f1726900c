//! Learned routing scorer.
//!
//! One logistic scorer per outcome over the request feature vector. Training
//! only ever updates the scorer of the outcome that was actually taken; the
//! reward tells it how good that outcome turned out to be.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::optimizer::RoutingObservation;
use crate::router::types::{FeatureVector, RoutingOutcome};

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    /// Fraction of observations held out for candidate evaluation.
    pub holdout_fraction: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            learning_rate: 0.05,
            holdout_fraction: 0.2,
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Logistic score of one weight row (last weight is the bias).
fn score_row(row: &[f64], features: &FeatureVector) -> f64 {
    let dot: f64 = row
        .iter()
        .zip(features.as_slice().iter().chain(std::iter::once(&1.0)))
        .map(|(w, x)| w * x)
        .sum();
    sigmoid(dot)
}

/// Per-outcome logistic weights: one weight per feature plus a bias term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringModel {
    /// Weight rows in [`RoutingOutcome::all`] order.
    weights: Vec<Vec<f64>>,
    pub version: u64,
    pub trained_at: Option<DateTime<Utc>>,
    /// Observations the model was trained on.
    pub sample_count: usize,
}

impl ScoringModel {
    /// A model with zero weights: every outcome scores 0.5, probabilities
    /// come out uniform, and the learned strategy stays neutral.
    pub fn untrained() -> Self {
        Self {
            weights: RoutingOutcome::all()
                .iter()
                .map(|_| vec![0.0; FeatureVector::DIM + 1])
                .collect(),
            version: 0,
            trained_at: None,
            sample_count: 0,
        }
    }

    pub fn is_trained(&self) -> bool {
        self.trained_at.is_some()
    }

    fn outcome_index(outcome: RoutingOutcome) -> usize {
        RoutingOutcome::all()
            .iter()
            .position(|o| *o == outcome)
            .expect("outcome present in all()")
    }

    /// Normalised outcome probabilities in [`RoutingOutcome::all`] order.
    pub fn outcome_probabilities(&self, features: &FeatureVector) -> Vec<(RoutingOutcome, f64)> {
        let raw: Vec<f64> = self
            .weights
            .iter()
            .map(|row| score_row(row, features))
            .collect();
        let total: f64 = raw.iter().sum();
        RoutingOutcome::all()
            .iter()
            .zip(raw)
            .map(|(outcome, score)| {
                let p = if total > 0.0 { score / total } else { 0.25 };
                (*outcome, p)
            })
            .collect()
    }

    /// The model's preferred outcome and its probability.
    pub fn best_outcome(&self, features: &FeatureVector) -> (RoutingOutcome, f64) {
        self.outcome_probabilities(features)
            .into_iter()
            .max_by(|(oa, pa), (ob, pb)| {
                pa.partial_cmp(pb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Lexicographic name order breaks exact ties.
                    .then_with(|| ob.as_str().cmp(oa.as_str()))
            })
            .expect("at least one outcome")
    }

    /// Train a candidate from this model over the given observations.
    ///
    /// The reward in [-1, 1] maps to a [0, 1] target for the taken outcome's
    /// scorer; other scorers are untouched by that observation.
    pub fn train(&self, observations: &[RoutingObservation], config: &TrainConfig) -> ScoringModel {
        let mut weights = self.weights.clone();
        for _ in 0..config.epochs {
            for obs in observations {
                let idx = Self::outcome_index(obs.decision);
                let target = (obs.reward + 1.0) / 2.0;
                let prediction = score_row(&weights[idx], &obs.features);
                let error = prediction - target;
                let row = &mut weights[idx];
                for (w, x) in row
                    .iter_mut()
                    .zip(obs.features.as_slice().iter().chain(std::iter::once(&1.0)))
                {
                    *w -= config.learning_rate * error * x;
                }
            }
        }

        ScoringModel {
            weights,
            version: self.version + 1,
            trained_at: Some(Utc::now()),
            sample_count: observations.len(),
        }
    }

    /// Off-policy holdout score: mean of `P(taken decision) × reward`.
    ///
    /// Rewards are only known for decisions actually taken, so the model is
    /// credited in proportion to how much probability it assigns to good
    /// decisions and penalised for probability on bad ones.
    pub fn holdout_reward(&self, observations: &[RoutingObservation]) -> f64 {
        if observations.is_empty() {
            return 0.0;
        }
        let total: f64 = observations
            .iter()
            .map(|obs| {
                let p = self
                    .outcome_probabilities(&obs.features)
                    .into_iter()
                    .find(|(o, _)| *o == obs.decision)
                    .map(|(_, p)| p)
                    .unwrap_or(0.0);
                p * obs.reward
            })
            .sum();
        total / observations.len() as f64
    }

    pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
