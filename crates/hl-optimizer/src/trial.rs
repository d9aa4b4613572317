//! Trial records and the append-only search history.

use chrono::{DateTime, Utc};
use hl_types::{Configuration, TrialArtifact};
use serde::{Deserialize, Serialize};

/// What an objective reports back for one evaluated configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    /// Validation loss; lower is better.
    pub loss: f64,
    /// Tracking run the trial was recorded under, if any.
    pub run_id: Option<String>,
    pub artifacts: Vec<TrialArtifact>,
}

impl TrialOutcome {
    pub fn new(loss: f64) -> Self {
        Self {
            loss,
            run_id: None,
            artifacts: Vec::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_artifact(mut self, artifact: TrialArtifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// A completed evaluation. Trials are immutable once added to a [`History`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub number: usize,
    pub configuration: Configuration,
    pub loss: f64,
    pub run_id: Option<String>,
    pub artifacts: Vec<TrialArtifact>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Trial {
    pub fn new(
        number: usize,
        configuration: Configuration,
        outcome: TrialOutcome,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            number,
            configuration,
            loss: outcome.loss,
            run_id: outcome.run_id,
            artifacts: outcome.artifacts,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn family(&self) -> &str {
        self.configuration.family()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Ordered sequence of completed trials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    trials: Vec<Trial>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed trial. Earlier entries are never touched.
    pub fn push(&mut self, trial: Trial) {
        self.trials.push(trial);
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trial> {
        self.trials.iter()
    }

    /// Lowest-loss trial; the earliest wins ties. NaN losses never beat a
    /// number.
    pub fn best(&self) -> Option<&Trial> {
        self.trials.iter().fold(None, |best: Option<&Trial>, t| match best {
            Some(b) if t.loss.is_nan() || b.loss <= t.loss => Some(b),
            _ => Some(t),
        })
    }

    /// Trials ordered by ascending loss, ties kept in insertion order.
    pub fn sorted_by_loss(&self) -> Vec<&Trial> {
        let mut sorted: Vec<&Trial> = self.trials.iter().collect();
        sorted.sort_by(|a, b| a.loss.total_cmp(&b.loss));
        sorted
    }

    pub fn into_trials(self) -> Vec<Trial> {
        self.trials
    }
}
