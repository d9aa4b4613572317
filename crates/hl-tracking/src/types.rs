//! Records kept by the tracking store and model registry.

use chrono::{DateTime, Utc};
use hl_types::ResolutionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A named group of runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
    pub artifact_location: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" | "SCHEDULED" => Ok(Self::Running),
            "FINISHED" => Ok(Self::Finished),
            "FAILED" | "KILLED" => Ok(Self::Failed),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub artifact_uri: String,
}

/// A run with everything logged against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub info: RunInfo,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Run {
    pub fn new(info: RunInfo) -> Self {
        Self {
            info,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.info.run_id
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }
}

/// Filter and ordering for [`crate::TrackingStore::search_runs`].
///
/// When `order_by_metric` is set only runs that logged that metric are
/// returned, sorted by its value (earliest start first on ties). When
/// `status` is set, runs in any other state are dropped.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunSearch {
    pub experiment_ids: Vec<String>,
    pub status: Option<RunStatus>,
    pub order_by_metric: Option<String>,
    pub ascending: bool,
    pub max_results: Option<usize>,
}

impl RunSearch {
    pub fn in_experiment(experiment_id: impl Into<String>) -> Self {
        Self {
            experiment_ids: vec![experiment_id.into()],
            status: None,
            order_by_metric: None,
            ascending: true,
            max_results: None,
        }
    }

    pub fn order_by_metric(mut self, metric: impl Into<String>, ascending: bool) -> Self {
        self.order_by_metric = Some(metric.into());
        self.ascending = ascending;
        self
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn max_results(mut self, n: usize) -> Self {
        self.max_results = Some(n);
        self
    }

    /// Apply ordering and limit to an unordered set of runs.
    pub fn arrange(&self, mut runs: Vec<Run>) -> Vec<Run> {
        runs.retain(|r| self.experiment_ids.iter().any(|id| *id == r.info.experiment_id));
        if let Some(status) = self.status {
            runs.retain(|r| r.info.status == status);
        }
        match &self.order_by_metric {
            Some(metric) => {
                runs.retain(|r| r.metric(metric).is_some_and(|v| !v.is_nan()));
                runs.sort_by(|a, b| {
                    let (va, vb) = (a.metrics[metric], b.metrics[metric]);
                    let by_value = if self.ascending {
                        va.total_cmp(&vb)
                    } else {
                        vb.total_cmp(&va)
                    };
                    by_value.then(a.info.start_time.cmp(&b.info.start_time))
                });
            }
            None => runs.sort_by(|a, b| b.info.start_time.cmp(&a.info.start_time)),
        }
        if let Some(n) = self.max_results {
            runs.truncate(n);
        }
        runs
    }
}

/// A registered model version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: u64,
    /// Where the registered files live (`runs:/<run_id>/<artifact_path>`).
    pub source: String,
    pub run_id: String,
    pub artifact_path: String,
}

impl ModelVersion {
    pub fn model_uri(&self) -> ModelUri {
        ModelUri {
            name: self.name.clone(),
            version: self.version,
        }
    }
}

/// `models:/<name>/<version>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelUri {
    pub name: String,
    pub version: u64,
}

impl ModelUri {
    pub fn new(name: impl Into<String>, version: u64) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Directory-safe rendering: '/' and ':' become '_'.
    pub fn flattened(&self) -> String {
        self.to_string().replace(['/', ':'], "_")
    }
}

impl fmt::Display for ModelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "models:/{}/{}", self.name, self.version)
    }
}

impl FromStr for ModelUri {
    type Err = ResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ResolutionError::InvalidModelUri { uri: s.to_string() };
        let rest = s.strip_prefix("models:/").ok_or_else(invalid)?;
        let (name, version) = rest.rsplit_once('/').ok_or_else(invalid)?;
        if name.is_empty() {
            return Err(invalid());
        }
        let version = version.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self::new(name, version))
    }
}

/// `runs:/<run_id>/<artifact_path>`
pub fn runs_uri(run_id: &str, artifact_path: &str) -> String {
    format!("runs:/{run_id}/{artifact_path}")
}
