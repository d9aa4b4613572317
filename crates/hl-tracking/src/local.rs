//! Filesystem-backed tracking store and model registry.
//!
//! Layout under the root directory:
//!
//! ```text
//! experiments/<experiment_id>/experiment.json
//! experiments/<experiment_id>/<run_id>/run.json
//! experiments/<experiment_id>/<run_id>/artifacts/...
//! models/<name>/version-<n>.json
//! ```
//!
//! Needs no server, which makes it the default for local development and the
//! store every integration test runs against.

use async_trait::async_trait;
use chrono::Utc;
use hl_types::{ExternalServiceError, HlError, HlResult, ResolutionError, Service};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::store::{ModelRegistry, TrackingStore};
use crate::types::{
    runs_uri, Experiment, ModelUri, ModelVersion, Run, RunInfo, RunSearch, RunStatus,
};

const EXPERIMENT_FILE: &str = "experiment.json";
const RUN_FILE: &str = "run.json";
const ARTIFACTS_DIR: &str = "artifacts";

#[derive(Debug)]
pub struct LocalTrackingStore {
    root: PathBuf,
    // serializes read-modify-write cycles on run and registry files
    write_lock: Mutex<()>,
}

impl LocalTrackingStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> HlResult<Self> {
        let root = root.into();
        for dir in [root.join("experiments"), root.join("models")] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(tracking_error("open"))?;
        }
        info!(root = %root.display(), "Opened local tracking store");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn experiments_dir(&self) -> PathBuf {
        self.root.join("experiments")
    }

    fn model_dir(&self, name: &str) -> PathBuf {
        self.root.join("models").join(name)
    }

    /// Local directory holding a run's artifacts.
    pub async fn artifact_dir(&self, run_id: &str) -> HlResult<PathBuf> {
        Ok(self.find_run_dir(run_id).await?.join(ARTIFACTS_DIR))
    }

    async fn list_experiments(&self) -> HlResult<Vec<Experiment>> {
        let mut experiments = Vec::new();
        for dir in subdirectories(&self.experiments_dir(), "list_experiments").await? {
            let path = dir.join(EXPERIMENT_FILE);
            if path.exists() {
                experiments.push(read_json(&path, Service::Tracking, "list_experiments").await?);
            }
        }
        Ok(experiments)
    }

    async fn find_run_dir(&self, run_id: &str) -> HlResult<PathBuf> {
        for dir in subdirectories(&self.experiments_dir(), "find_run").await? {
            let candidate = dir.join(run_id);
            if candidate.join(RUN_FILE).exists() {
                return Ok(candidate);
            }
        }
        Err(ExternalServiceError::RunNotFound {
            run_id: run_id.to_string(),
        }
        .into())
    }

    /// Apply `f` to an active run and persist the result.
    async fn update_run<F>(&self, run_id: &str, operation: &str, f: F) -> HlResult<()>
    where
        F: FnOnce(&mut Run) -> Result<(), String> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let path = self.find_run_dir(run_id).await?.join(RUN_FILE);
        let mut run: Run = read_json(&path, Service::Tracking, operation).await?;
        if run.info.status != RunStatus::Running {
            return Err(ExternalServiceError::call(
                Service::Tracking,
                operation,
                format!("run {run_id} is not active ({})", run.info.status.as_str()),
            )
            .into());
        }
        f(&mut run).map_err(|msg| ExternalServiceError::call(Service::Tracking, operation, msg))?;
        write_json(&path, &run, Service::Tracking, operation).await
    }

    async fn find_version(&self, uri: &ModelUri) -> HlResult<ModelVersion> {
        self.search_model_versions(&uri.name)
            .await?
            .into_iter()
            .find(|v| v.version == uri.version)
            .ok_or_else(|| {
                ExternalServiceError::call(
                    Service::Registry,
                    "download_artifacts",
                    format!("{uri} is not registered"),
                )
                .into()
            })
    }
}

#[async_trait]
impl TrackingStore for LocalTrackingStore {
    async fn get_or_create_experiment(&self, name: &str) -> HlResult<Experiment> {
        let _guard = self.write_lock.lock().await;
        let existing = self.list_experiments().await?;
        if let Some(experiment) = existing.iter().find(|e| e.name == name) {
            return Ok(experiment.clone());
        }

        let next_id = existing
            .iter()
            .filter_map(|e| e.experiment_id.parse::<u64>().ok())
            .max()
            .map_or(0, |id| id + 1);
        let dir = self.experiments_dir().join(next_id.to_string());
        let experiment = Experiment {
            experiment_id: next_id.to_string(),
            name: name.to_string(),
            artifact_location: dir.display().to_string(),
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(tracking_error("create_experiment"))?;
        write_json(
            &dir.join(EXPERIMENT_FILE),
            &experiment,
            Service::Tracking,
            "create_experiment",
        )
        .await?;
        info!(experiment = name, id = %experiment.experiment_id, "Created experiment");
        Ok(experiment)
    }

    async fn get_experiment_by_name(&self, name: &str) -> HlResult<Option<Experiment>> {
        Ok(self
            .list_experiments()
            .await?
            .into_iter()
            .find(|e| e.name == name))
    }

    async fn start_run(&self, experiment_id: &str) -> HlResult<RunInfo> {
        let exp_dir = self.experiments_dir().join(experiment_id);
        if !exp_dir.join(EXPERIMENT_FILE).exists() {
            return Err(ExternalServiceError::call(
                Service::Tracking,
                "start_run",
                format!("experiment {experiment_id} does not exist"),
            )
            .into());
        }

        let run_id = Uuid::new_v4().simple().to_string();
        let run_dir = exp_dir.join(&run_id);
        let artifacts = run_dir.join(ARTIFACTS_DIR);
        tokio::fs::create_dir_all(&artifacts)
            .await
            .map_err(tracking_error("start_run"))?;

        let info = RunInfo {
            run_id: run_id.clone(),
            experiment_id: experiment_id.to_string(),
            status: RunStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            artifact_uri: artifacts.display().to_string(),
        };
        write_json(
            &run_dir.join(RUN_FILE),
            &Run::new(info.clone()),
            Service::Tracking,
            "start_run",
        )
        .await?;
        debug!(run_id = %run_id, experiment_id, "Started run");
        Ok(info)
    }

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> HlResult<()> {
        self.update_run(run_id, "set_tag", |run| {
            run.tags.insert(key.to_string(), value.to_string());
            Ok(())
        })
        .await
    }

    async fn log_params(&self, run_id: &str, params: &BTreeMap<String, String>) -> HlResult<()> {
        self.update_run(run_id, "log_params", |run| {
            for (key, value) in params {
                match run.params.get(key) {
                    Some(existing) if existing != value => {
                        return Err(format!(
                            "param '{key}' already logged as '{existing}', refusing '{value}'"
                        ));
                    }
                    _ => {
                        run.params.insert(key.clone(), value.clone());
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> HlResult<()> {
        self.update_run(run_id, "log_metric", |run| {
            run.metrics.insert(key.to_string(), value);
            Ok(())
        })
        .await
    }

    async fn log_artifact(
        &self,
        run_id: &str,
        local_path: &Path,
        artifact_dir: Option<&str>,
    ) -> HlResult<()> {
        let mut dst = self.artifact_dir(run_id).await?;
        if let Some(sub) = artifact_dir {
            dst = dst.join(sub);
        }
        let file_name = local_path.file_name().ok_or_else(|| {
            ExternalServiceError::call(
                Service::Tracking,
                "log_artifact",
                format!("{} has no file name", local_path.display()),
            )
        })?;
        tokio::fs::create_dir_all(&dst)
            .await
            .map_err(tracking_error("log_artifact"))?;
        tokio::fs::copy(local_path, dst.join(file_name))
            .await
            .map_err(tracking_error("log_artifact"))?;
        debug!(run_id, file = %local_path.display(), "Logged artifact");
        Ok(())
    }

    async fn log_model(
        &self,
        run_id: &str,
        model_dir: &Path,
        artifact_path: &str,
    ) -> HlResult<()> {
        let dst = self.artifact_dir(run_id).await?.join(artifact_path);
        let copied = copy_tree(model_dir, &dst, Service::Tracking, "log_model").await?;
        debug!(run_id, artifact_path, files = copied, "Logged model");
        Ok(())
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> HlResult<()> {
        self.update_run(run_id, "end_run", |run| {
            run.info.status = status;
            run.info.end_time = Some(Utc::now());
            Ok(())
        })
        .await
    }

    async fn get_run(&self, run_id: &str) -> HlResult<Run> {
        let path = self.find_run_dir(run_id).await?.join(RUN_FILE);
        read_json(&path, Service::Tracking, "get_run").await
    }

    async fn search_runs(&self, search: &RunSearch) -> HlResult<Vec<Run>> {
        let mut runs = Vec::new();
        for experiment_id in &search.experiment_ids {
            let exp_dir = self.experiments_dir().join(experiment_id);
            if !exp_dir.exists() {
                continue;
            }
            for run_dir in subdirectories(&exp_dir, "search_runs").await? {
                let path = run_dir.join(RUN_FILE);
                if path.exists() {
                    runs.push(read_json(&path, Service::Tracking, "search_runs").await?);
                }
            }
        }
        Ok(search.arrange(runs))
    }
}

#[async_trait]
impl ModelRegistry for LocalTrackingStore {
    async fn search_model_versions(&self, name: &str) -> HlResult<Vec<ModelVersion>> {
        let dir = self.model_dir(name);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(registry_error("search_model_versions"))?;
        let mut versions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(registry_error("search_model_versions"))?
        {
            let path = entry.path();
            let is_version = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("version-") && n.ends_with(".json"));
            if is_version {
                versions.push(read_json(&path, Service::Registry, "search_model_versions").await?);
            }
        }
        Ok(versions)
    }

    async fn register_model(
        &self,
        name: &str,
        run_id: &str,
        artifact_path: &str,
    ) -> HlResult<ModelVersion> {
        let model_dir = self.artifact_dir(run_id).await?.join(artifact_path);
        if !model_dir.exists() {
            return Err(ExternalServiceError::call(
                Service::Registry,
                "register_model",
                format!("run {run_id} has no artifacts at '{artifact_path}'"),
            )
            .into());
        }

        let _guard = self.write_lock.lock().await;
        let next = self
            .search_model_versions(name)
            .await?
            .iter()
            .map(|v| v.version)
            .max()
            .unwrap_or(0)
            + 1;
        let version = ModelVersion {
            name: name.to_string(),
            version: next,
            source: runs_uri(run_id, artifact_path),
            run_id: run_id.to_string(),
            artifact_path: artifact_path.to_string(),
        };

        let dir = self.model_dir(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(registry_error("register_model"))?;
        write_json(
            &dir.join(format!("version-{next}.json")),
            &version,
            Service::Registry,
            "register_model",
        )
        .await?;
        info!(model = name, version = next, run_id, "Registered model version");
        Ok(version)
    }

    async fn download_artifacts(&self, model_uri: &str, dst: &Path) -> HlResult<PathBuf> {
        let uri: ModelUri = model_uri.parse().map_err(HlError::from)?;
        let version = self.find_version(&uri).await?;
        let src = self
            .artifact_dir(&version.run_id)
            .await?
            .join(&version.artifact_path);
        let copied = copy_tree(&src, dst, Service::Registry, "download_artifacts").await?;
        if copied == 0 {
            return Err(ResolutionError::NoModelVersions { model: uri.name }.into());
        }
        debug!(model_uri, dst = %dst.display(), files = copied, "Downloaded artifacts");
        Ok(dst.to_path_buf())
    }
}

fn tracking_error(operation: &'static str) -> impl Fn(std::io::Error) -> HlError {
    move |e| ExternalServiceError::call(Service::Tracking, operation, e).into()
}

fn registry_error(operation: &'static str) -> impl Fn(std::io::Error) -> HlError {
    move |e| ExternalServiceError::call(Service::Registry, operation, e).into()
}

async fn subdirectories(dir: &Path, operation: &'static str) -> HlResult<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(tracking_error(operation))?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(tracking_error(operation))? {
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn read_json<T: DeserializeOwned>(
    path: &Path,
    service: Service,
    operation: &str,
) -> HlResult<T> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ExternalServiceError::call(service, operation, e))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        ExternalServiceError::bad_response(
            service,
            operation,
            format!("{}: {e}", path.display()),
        )
        .into()
    })
}

async fn write_json<T: Serialize + Sync>(
    path: &Path,
    value: &T,
    service: Service,
    operation: &str,
) -> HlResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| ExternalServiceError::call(service, operation, e).into())
}

/// Copy every file under `src` into `dst`, keeping relative paths.
async fn copy_tree(src: &Path, dst: &Path, service: Service, operation: &str) -> HlResult<usize> {
    if !src.is_dir() {
        return Err(ExternalServiceError::call(
            service,
            operation,
            format!("{} is not a directory", src.display()),
        )
        .into());
    }
    let files: Vec<PathBuf> = WalkDir::new(src)
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ExternalServiceError::call(service, operation, e))?
        .into_iter()
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();

    for file in &files {
        let relative = file
            .strip_prefix(src)
            .map_err(|e| ExternalServiceError::call(service, operation, e))?;
        let target = dst.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExternalServiceError::call(service, operation, e))?;
        }
        tokio::fs::copy(file, &target)
            .await
            .map_err(|e| ExternalServiceError::call(service, operation, e))?;
    }
    Ok(files.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn store() -> (tempfile::TempDir, LocalTrackingStore) {
        let dir = tempdir().unwrap();
        let store = LocalTrackingStore::open(dir.path().join("mlruns")).await.unwrap();
        (dir, store)
    }

    async fn finished_run(store: &LocalTrackingStore, experiment_id: &str, loss: f64) -> String {
        let info = store.start_run(experiment_id).await.unwrap();
        store.log_metric(&info.run_id, "val_mse", loss).await.unwrap();
        store.end_run(&info.run_id, RunStatus::Finished).await.unwrap();
        info.run_id
    }

    #[tokio::test]
    async fn experiments_are_created_once() {
        let (_dir, store) = store().await;
        assert!(store.get_experiment_by_name("model-hyperopt").await.unwrap().is_none());

        let a = store.get_or_create_experiment("model-hyperopt").await.unwrap();
        let b = store.get_or_create_experiment("model-hyperopt").await.unwrap();
        let c = store.get_or_create_experiment("other").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a.experiment_id, c.experiment_id);
        assert_eq!(
            store.get_experiment_by_name("other").await.unwrap(),
            Some(c)
        );
    }

    #[tokio::test]
    async fn run_lifecycle_is_persisted() {
        let (_dir, store) = store().await;
        let exp = store.get_or_create_experiment("e").await.unwrap();
        let info = store.start_run(&exp.experiment_id).await.unwrap();

        store.set_tag(&info.run_id, "model", "Ridge").await.unwrap();
        let mut params = BTreeMap::new();
        params.insert("type".to_string(), "Ridge".to_string());
        params.insert("alpha".to_string(), "0.1".to_string());
        store.log_params(&info.run_id, &params).await.unwrap();
        store.log_metric(&info.run_id, "val_mse", 3.5).await.unwrap();
        store.end_run(&info.run_id, RunStatus::Finished).await.unwrap();

        let run = store.get_run(&info.run_id).await.unwrap();
        assert_eq!(run.info.status, RunStatus::Finished);
        assert!(run.info.end_time.is_some());
        assert_eq!(run.tags["model"], "Ridge");
        assert_eq!(run.params["type"], "Ridge");
        assert_eq!(run.metric("val_mse"), Some(3.5));
    }

    #[tokio::test]
    async fn finished_runs_reject_writes() {
        let (_dir, store) = store().await;
        let exp = store.get_or_create_experiment("e").await.unwrap();
        let run_id = finished_run(&store, &exp.experiment_id, 1.0).await;
        let err = store.log_metric(&run_id, "val_mse", 2.0).await.unwrap_err();
        assert!(matches!(err, HlError::ExternalService(_)));
    }

    #[tokio::test]
    async fn changing_a_param_is_rejected() {
        let (_dir, store) = store().await;
        let exp = store.get_or_create_experiment("e").await.unwrap();
        let info = store.start_run(&exp.experiment_id).await.unwrap();
        let mut params = BTreeMap::new();
        params.insert("alpha".to_string(), "0.1".to_string());
        store.log_params(&info.run_id, &params).await.unwrap();
        store.log_params(&info.run_id, &params).await.unwrap();
        params.insert("alpha".to_string(), "0.2".to_string());
        assert!(store.log_params(&info.run_id, &params).await.is_err());
    }

    #[tokio::test]
    async fn unknown_run_is_reported() {
        let (_dir, store) = store().await;
        let err = store.get_run("missing").await.unwrap_err();
        assert!(matches!(
            err,
            HlError::ExternalService(ExternalServiceError::RunNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn search_orders_by_metric() {
        let (_dir, store) = store().await;
        let exp = store.get_or_create_experiment("e").await.unwrap();
        let first = finished_run(&store, &exp.experiment_id, 12.4).await;
        let second = finished_run(&store, &exp.experiment_id, 9.1).await;
        let third = finished_run(&store, &exp.experiment_id, 15.0).await;

        let runs = store
            .search_runs(&RunSearch::in_experiment(&exp.experiment_id).order_by_metric("val_mse", true))
            .await
            .unwrap();
        let ids: Vec<&str> = runs.iter().map(|r| r.run_id()).collect();
        assert_eq!(ids, vec![second.as_str(), first.as_str(), third.as_str()]);
    }

    #[tokio::test]
    async fn artifacts_and_models_are_copied() {
        let (dir, store) = store().await;
        let exp = store.get_or_create_experiment("e").await.unwrap();
        let info = store.start_run(&exp.experiment_id).await.unwrap();

        let file = dir.path().join("feature_importance.json");
        std::fs::write(&file, b"[0.5, 0.5]").unwrap();
        store.log_artifact(&info.run_id, &file, None).await.unwrap();

        let model = dir.path().join("model");
        std::fs::create_dir_all(model.join("nested")).unwrap();
        std::fs::write(model.join("MLmodel"), b"{}").unwrap();
        std::fs::write(model.join("nested/extra.txt"), b"x").unwrap();
        store.log_model(&info.run_id, &model, "xgb_model").await.unwrap();

        let artifacts = store.artifact_dir(&info.run_id).await.unwrap();
        assert!(artifacts.join("feature_importance.json").exists());
        assert!(artifacts.join("xgb_model/MLmodel").exists());
        assert!(artifacts.join("xgb_model/nested/extra.txt").exists());
    }

    #[tokio::test]
    async fn versions_increment_and_download() {
        let (dir, store) = store().await;
        let exp = store.get_or_create_experiment("e").await.unwrap();
        let info = store.start_run(&exp.experiment_id).await.unwrap();
        let model = dir.path().join("model");
        std::fs::create_dir_all(&model).unwrap();
        std::fs::write(model.join("model.json"), b"{}").unwrap();
        store.log_model(&info.run_id, &model, "ridge_model").await.unwrap();

        assert!(store.search_model_versions("m").await.unwrap().is_empty());
        let v1 = store.register_model("m", &info.run_id, "ridge_model").await.unwrap();
        let v2 = store.register_model("m", &info.run_id, "ridge_model").await.unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));
        assert_eq!(v2.source, format!("runs:/{}/ridge_model", info.run_id));
        assert_eq!(store.search_model_versions("m").await.unwrap().len(), 2);

        let dst = dir.path().join("scratch");
        let out = store.download_artifacts("models:/m/2", &dst).await.unwrap();
        assert!(out.join("model.json").exists());

        assert!(store.download_artifacts("models:/m/9", &dst).await.is_err());
        assert!(store.register_model("m", &info.run_id, "nope").await.is_err());
    }
}
