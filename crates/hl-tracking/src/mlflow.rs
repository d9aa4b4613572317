//! MLflow tracking server client (REST API 2.0).
//!
//! Artifacts go through the server's `mlflow-artifacts` proxy, so runs must
//! live in an experiment whose artifact location uses that scheme (the
//! default for `mlflow server --serve-artifacts`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hl_types::{ExternalServiceError, HlError, HlResult, Service};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use walkdir::WalkDir;

use crate::store::{ModelRegistry, TrackingStore};
use crate::types::{
    runs_uri, Experiment, ModelUri, ModelVersion, Run, RunInfo, RunSearch, RunStatus,
};

const RESOURCE_DOES_NOT_EXIST: &str = "RESOURCE_DOES_NOT_EXIST";
const RESOURCE_ALREADY_EXISTS: &str = "RESOURCE_ALREADY_EXISTS";
const SEARCH_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct MlflowClient {
    base_url: String,
    client: reqwest::Client,
}

impl MlflowClient {
    pub fn new(tracking_uri: impl Into<String>) -> Self {
        let base_url = tracking_uri.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn tracking_uri(&self) -> &str {
        &self.base_url
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow/{}", self.base_url, path)
    }

    fn artifact_url(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow-artifacts/artifacts/{}", self.base_url, path)
    }

    async fn send_raw(
        &self,
        service: Service,
        operation: &str,
        request: RequestBuilder,
    ) -> HlResult<(StatusCode, Value)> {
        let response = request
            .send()
            .await
            .map_err(|e| ExternalServiceError::call(service, operation, e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExternalServiceError::call(service, operation, e))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok((status, body))
    }

    async fn send(&self, service: Service, operation: &str, request: RequestBuilder) -> HlResult<Value> {
        let (status, body) = self.send_raw(service, operation, request).await?;
        if status.is_success() {
            Ok(body)
        } else {
            let err = api_error(service, operation, status, &body);
            error!(operation, status = status.as_u16(), error = %err, "MLflow request failed");
            Err(err)
        }
    }

    async fn get(&self, operation: &str, path: &str, query: &[(&str, &str)]) -> HlResult<Value> {
        self.send(
            Service::Tracking,
            operation,
            self.client.get(self.api(path)).query(query),
        )
        .await
    }

    async fn post(&self, service: Service, operation: &str, path: &str, body: Value) -> HlResult<Value> {
        self.send(service, operation, self.client.post(self.api(path)).json(&body))
            .await
    }

    async fn upload(&self, operation: &str, remote: &str, local: &Path) -> HlResult<()> {
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|e| ExternalServiceError::call(Service::Tracking, operation, e))?;
        self.send(
            Service::Tracking,
            operation,
            self.client.put(self.artifact_url(remote)).body(bytes),
        )
        .await?;
        debug!(remote, local = %local.display(), "Uploaded artifact");
        Ok(())
    }

    async fn run_artifact_root(&self, run_id: &str, operation: &str) -> HlResult<String> {
        let run = self.get_run(run_id).await?;
        artifact_proxy_path(&run.info.artifact_uri).ok_or_else(|| {
            ExternalServiceError::bad_response(
                Service::Tracking,
                operation,
                format!(
                    "artifact uri '{}' is not served by the tracking server",
                    run.info.artifact_uri
                ),
            )
            .into()
        })
    }

    /// Files under an artifact directory, as paths relative to `root`.
    async fn list_artifacts(&self, root: &str) -> HlResult<Vec<String>> {
        let mut files = Vec::new();
        let mut pending = vec![String::new()];
        while let Some(relative) = pending.pop() {
            let path = join_remote(root, &relative);
            let body = self
                .send(
                    Service::Registry,
                    "list_artifacts",
                    self.client
                        .get(format!("{}/api/2.0/mlflow-artifacts/artifacts", self.base_url))
                        .query(&[("path", path.as_str())]),
                )
                .await?;
            for entry in body["files"].as_array().into_iter().flatten() {
                let Some(name) = entry["path"].as_str() else {
                    continue;
                };
                let child = join_remote(&relative, name);
                if entry["is_dir"].as_bool().unwrap_or(false) {
                    pending.push(child);
                } else {
                    files.push(child);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl TrackingStore for MlflowClient {
    async fn get_or_create_experiment(&self, name: &str) -> HlResult<Experiment> {
        if let Some(experiment) = self.get_experiment_by_name(name).await? {
            return Ok(experiment);
        }
        let body = self
            .post(
                Service::Tracking,
                "create_experiment",
                "experiments/create",
                json!({ "name": name }),
            )
            .await?;
        let id = body["experiment_id"].as_str().ok_or_else(|| {
            ExternalServiceError::bad_response(Service::Tracking, "create_experiment", "missing experiment_id")
        })?;
        info!(experiment = name, id, "Created experiment");
        self.get_experiment_by_name(name).await?.ok_or_else(|| {
            ExternalServiceError::bad_response(
                Service::Tracking,
                "create_experiment",
                format!("experiment '{name}' missing after creation"),
            )
            .into()
        })
    }

    async fn get_experiment_by_name(&self, name: &str) -> HlResult<Option<Experiment>> {
        let operation = "get_experiment_by_name";
        let request = self
            .client
            .get(self.api("experiments/get-by-name"))
            .query(&[("experiment_name", name)]);
        let (status, body) = self.send_raw(Service::Tracking, operation, request).await?;
        if status == StatusCode::NOT_FOUND || error_code(&body) == Some(RESOURCE_DOES_NOT_EXIST) {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(api_error(Service::Tracking, operation, status, &body));
        }
        parse_experiment(&body["experiment"])
            .map(Some)
            .map_err(|msg| ExternalServiceError::bad_response(Service::Tracking, operation, msg).into())
    }

    async fn start_run(&self, experiment_id: &str) -> HlResult<RunInfo> {
        let body = self
            .post(
                Service::Tracking,
                "start_run",
                "runs/create",
                json!({
                    "experiment_id": experiment_id,
                    "start_time": Utc::now().timestamp_millis(),
                }),
            )
            .await?;
        parse_run(&body["run"])
            .map(|run| run.info)
            .map_err(|msg| ExternalServiceError::bad_response(Service::Tracking, "start_run", msg).into())
    }

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> HlResult<()> {
        self.post(
            Service::Tracking,
            "set_tag",
            "runs/set-tag",
            json!({ "run_id": run_id, "key": key, "value": value }),
        )
        .await
        .map(|_| ())
    }

    async fn log_params(&self, run_id: &str, params: &BTreeMap<String, String>) -> HlResult<()> {
        let params: Vec<Value> = params
            .iter()
            .map(|(k, v)| json!({ "key": k, "value": v }))
            .collect();
        self.post(
            Service::Tracking,
            "log_params",
            "runs/log-batch",
            json!({ "run_id": run_id, "params": params }),
        )
        .await
        .map(|_| ())
    }

    async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> HlResult<()> {
        self.post(
            Service::Tracking,
            "log_metric",
            "runs/log-metric",
            json!({
                "run_id": run_id,
                "key": key,
                "value": value,
                "timestamp": Utc::now().timestamp_millis(),
                "step": 0,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn log_artifact(
        &self,
        run_id: &str,
        local_path: &Path,
        artifact_dir: Option<&str>,
    ) -> HlResult<()> {
        let root = self.run_artifact_root(run_id, "log_artifact").await?;
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ExternalServiceError::call(
                    Service::Tracking,
                    "log_artifact",
                    format!("{} has no file name", local_path.display()),
                )
            })?;
        let dir = join_remote(&root, artifact_dir.unwrap_or(""));
        self.upload("log_artifact", &join_remote(&dir, file_name), local_path)
            .await
    }

    async fn log_model(
        &self,
        run_id: &str,
        model_dir: &Path,
        artifact_path: &str,
    ) -> HlResult<()> {
        let root = join_remote(&self.run_artifact_root(run_id, "log_model").await?, artifact_path);
        let files: Vec<PathBuf> = WalkDir::new(model_dir)
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ExternalServiceError::call(Service::Tracking, "log_model", e))?
            .into_iter()
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        for file in &files {
            let relative = file
                .strip_prefix(model_dir)
                .map_err(|e| ExternalServiceError::call(Service::Tracking, "log_model", e))?;
            let remote = join_remote(&root, &relative.to_string_lossy().replace('\\', "/"));
            self.upload("log_model", &remote, file).await?;
        }
        Ok(())
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> HlResult<()> {
        self.post(
            Service::Tracking,
            "end_run",
            "runs/update",
            json!({
                "run_id": run_id,
                "status": status.as_str(),
                "end_time": Utc::now().timestamp_millis(),
            }),
        )
        .await
        .map(|_| ())
    }

    async fn get_run(&self, run_id: &str) -> HlResult<Run> {
        let operation = "get_run";
        let request = self
            .client
            .get(self.api("runs/get"))
            .query(&[("run_id", run_id)]);
        let (status, body) = self.send_raw(Service::Tracking, operation, request).await?;
        if status == StatusCode::NOT_FOUND || error_code(&body) == Some(RESOURCE_DOES_NOT_EXIST) {
            return Err(ExternalServiceError::RunNotFound {
                run_id: run_id.to_string(),
            }
            .into());
        }
        if !status.is_success() {
            return Err(api_error(Service::Tracking, operation, status, &body));
        }
        parse_run(&body["run"])
            .map_err(|msg| ExternalServiceError::bad_response(Service::Tracking, operation, msg).into())
    }

    async fn search_runs(&self, search: &RunSearch) -> HlResult<Vec<Run>> {
        let mut runs = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut body = json!({
                "experiment_ids": search.experiment_ids,
                "max_results": SEARCH_PAGE_SIZE,
            });
            if let Some(status) = search.status {
                body["filter"] = json!(status_filter(status));
            }
            if let Some(metric) = &search.order_by_metric {
                body["order_by"] = json!([order_by_clause(metric, search.ascending)]);
            }
            if let Some(token) = &page_token {
                body["page_token"] = json!(token);
            }
            let response = self
                .post(Service::Tracking, "search_runs", "runs/search", body)
                .await?;
            for raw in response["runs"].as_array().into_iter().flatten() {
                runs.push(parse_run(raw).map_err(|msg| {
                    ExternalServiceError::bad_response(Service::Tracking, "search_runs", msg)
                })?);
            }
            match response["next_page_token"].as_str() {
                Some(token) if !token.is_empty() => page_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(search.arrange(runs))
    }
}

#[async_trait]
impl ModelRegistry for MlflowClient {
    async fn search_model_versions(&self, name: &str) -> HlResult<Vec<ModelVersion>> {
        let filter = format!("name='{}'", name.replace('\'', "\\'"));
        let body = self
            .get("search_model_versions", "model-versions/search", &[("filter", filter.as_str())])
            .await?;
        body["model_versions"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|raw| {
                parse_model_version(raw).map_err(|msg| {
                    HlError::from(ExternalServiceError::bad_response(
                        Service::Registry,
                        "search_model_versions",
                        msg,
                    ))
                })
            })
            .collect()
    }

    async fn register_model(
        &self,
        name: &str,
        run_id: &str,
        artifact_path: &str,
    ) -> HlResult<ModelVersion> {
        let operation = "register_model";
        let request = self
            .client
            .post(self.api("registered-models/create"))
            .json(&json!({ "name": name }));
        let (status, body) = self.send_raw(Service::Registry, operation, request).await?;
        if !status.is_success() && error_code(&body) != Some(RESOURCE_ALREADY_EXISTS) {
            return Err(api_error(Service::Registry, operation, status, &body));
        }

        let body = self
            .post(
                Service::Registry,
                operation,
                "model-versions/create",
                json!({
                    "name": name,
                    "source": runs_uri(run_id, artifact_path),
                    "run_id": run_id,
                }),
            )
            .await?;
        let version = parse_model_version(&body["model_version"])
            .map_err(|msg| ExternalServiceError::bad_response(Service::Registry, operation, msg))?;
        info!(model = name, version = version.version, run_id, "Registered model version");
        Ok(version)
    }

    async fn download_artifacts(&self, model_uri: &str, dst: &Path) -> HlResult<PathBuf> {
        let operation = "download_artifacts";
        let uri: ModelUri = model_uri.parse().map_err(HlError::from)?;
        let version = uri.version.to_string();
        let body = self
            .get(
                operation,
                "model-versions/get-download-uri",
                &[("name", uri.name.as_str()), ("version", version.as_str())],
            )
            .await?;
        let artifact_uri = body["artifact_uri"].as_str().unwrap_or_default();
        let root = artifact_proxy_path(artifact_uri).ok_or_else(|| {
            ExternalServiceError::bad_response(
                Service::Registry,
                operation,
                format!("cannot download from '{artifact_uri}'"),
            )
        })?;

        for relative in self.list_artifacts(&root).await? {
            let bytes = self
                .send_bytes(operation, &join_remote(&root, &relative))
                .await?;
            let target = dst.join(&relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ExternalServiceError::call(Service::Filesystem, operation, e))?;
            }
            tokio::fs::write(&target, bytes)
                .await
                .map_err(|e| ExternalServiceError::call(Service::Filesystem, operation, e))?;
        }
        debug!(model_uri, dst = %dst.display(), "Downloaded artifacts");
        Ok(dst.to_path_buf())
    }
}

impl MlflowClient {
    async fn send_bytes(&self, operation: &str, remote: &str) -> HlResult<bytes::Bytes> {
        let response = self
            .client
            .get(self.artifact_url(remote))
            .send()
            .await
            .map_err(|e| ExternalServiceError::call(Service::Registry, operation, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExternalServiceError::bad_response(
                Service::Registry,
                operation,
                format!("{status} fetching {remote}"),
            )
            .into());
        }
        response
            .bytes()
            .await
            .map_err(|e| ExternalServiceError::call(Service::Registry, operation, e).into())
    }
}

fn api_error(service: Service, operation: &str, status: StatusCode, body: &Value) -> HlError {
    let code = error_code(body).unwrap_or("UNKNOWN");
    let message = body["message"].as_str().unwrap_or_default();
    ExternalServiceError::call(service, operation, format!("{status} {code}: {message}")).into()
}

fn error_code(body: &Value) -> Option<&str> {
    body["error_code"].as_str()
}

/// `metrics.`<name>` ASC|DESC`
pub(crate) fn order_by_clause(metric: &str, ascending: bool) -> String {
    format!(
        "metrics.`{}` {}",
        metric,
        if ascending { "ASC" } else { "DESC" }
    )
}

/// `attributes.status = '<STATUS>'`
pub(crate) fn status_filter(status: RunStatus) -> String {
    format!("attributes.status = '{}'", status.as_str())
}

/// Path below the artifact proxy for an `mlflow-artifacts:` URI.
pub(crate) fn artifact_proxy_path(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("mlflow-artifacts:")?;
    let path = match rest.strip_prefix("//") {
        // mlflow-artifacts://host:port/path
        Some(with_host) => with_host.split_once('/').map_or("", |(_, p)| p),
        None => rest,
    };
    Some(path.trim_matches('/').to_string())
}

fn join_remote(base: &str, child: &str) -> String {
    match (base.trim_end_matches('/'), child.trim_start_matches('/')) {
        ("", c) => c.to_string(),
        (b, "") => b.to_string(),
        (b, c) => format!("{b}/{c}"),
    }
}

fn millis(value: &Value) -> Option<DateTime<Utc>> {
    let ms = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    DateTime::from_timestamp_millis(ms)
}

fn key_values<T>(value: &Value, convert: impl Fn(&Value) -> Option<T>) -> BTreeMap<String, T> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|kv| Some((kv["key"].as_str()?.to_string(), convert(&kv["value"])?)))
        .collect()
}

pub(crate) fn parse_experiment(value: &Value) -> Result<Experiment, String> {
    Ok(Experiment {
        experiment_id: value["experiment_id"]
            .as_str()
            .ok_or("experiment without experiment_id")?
            .to_string(),
        name: value["name"].as_str().unwrap_or_default().to_string(),
        artifact_location: value["artifact_location"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
    })
}

pub(crate) fn parse_run(value: &Value) -> Result<Run, String> {
    let info = &value["info"];
    let run_id = info["run_id"]
        .as_str()
        .or_else(|| info["run_uuid"].as_str())
        .ok_or("run without run_id")?;
    let status = info["status"]
        .as_str()
        .unwrap_or("RUNNING")
        .parse::<RunStatus>()?;
    let start_time = millis(&info["start_time"]).ok_or("run without start_time")?;

    let data = &value["data"];
    Ok(Run {
        info: RunInfo {
            run_id: run_id.to_string(),
            experiment_id: info["experiment_id"].as_str().unwrap_or_default().to_string(),
            status,
            start_time,
            end_time: millis(&info["end_time"]),
            artifact_uri: info["artifact_uri"].as_str().unwrap_or_default().to_string(),
        },
        params: key_values(&data["params"], |v| v.as_str().map(str::to_string)),
        metrics: key_values(&data["metrics"], Value::as_f64),
        tags: key_values(&data["tags"], |v| v.as_str().map(str::to_string)),
    })
}

pub(crate) fn parse_model_version(value: &Value) -> Result<ModelVersion, String> {
    let version = match &value["version"] {
        Value::String(s) => s.parse::<u64>().map_err(|e| format!("bad version '{s}': {e}"))?,
        Value::Number(n) => n.as_u64().ok_or("bad version number")?,
        _ => return Err("model version without version".to_string()),
    };
    let source = value["source"].as_str().unwrap_or_default().to_string();
    let run_id = value["run_id"].as_str().unwrap_or_default().to_string();
    let artifact_path = source
        .strip_prefix("runs:/")
        .and_then(|rest| rest.split_once('/'))
        .map(|(_, path)| path.to_string())
        .unwrap_or_default();
    Ok(ModelVersion {
        name: value["name"].as_str().ok_or("model version without name")?.to_string(),
        version,
        source,
        run_id,
        artifact_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_by_uses_backticks() {
        assert_eq!(order_by_clause("val_mse", true), "metrics.`val_mse` ASC");
        assert_eq!(order_by_clause("r2", false), "metrics.`r2` DESC");
    }

    #[test]
    fn status_filter_quotes_the_state() {
        assert_eq!(
            status_filter(RunStatus::Finished),
            "attributes.status = 'FINISHED'"
        );
        assert_eq!(status_filter(RunStatus::Failed), "attributes.status = 'FAILED'");
    }

    #[test]
    fn proxy_paths() {
        assert_eq!(
            artifact_proxy_path("mlflow-artifacts:/1/abc/artifacts").as_deref(),
            Some("1/abc/artifacts")
        );
        assert_eq!(
            artifact_proxy_path("mlflow-artifacts://mlflow:5000/1/abc/artifacts").as_deref(),
            Some("1/abc/artifacts")
        );
        assert_eq!(artifact_proxy_path("s3://bucket/1/abc"), None);
    }

    #[test]
    fn joins_remote_paths() {
        assert_eq!(join_remote("1/abc/artifacts", ""), "1/abc/artifacts");
        assert_eq!(join_remote("", "model/MLmodel"), "model/MLmodel");
        assert_eq!(join_remote("root/", "/file"), "root/file");
    }

    #[test]
    fn parses_run_payload() {
        let payload = json!({
            "info": {
                "run_id": "abc123",
                "experiment_id": "2",
                "status": "FINISHED",
                "start_time": 1700000000000_i64,
                "end_time": "1700000005000",
                "artifact_uri": "mlflow-artifacts:/2/abc123/artifacts"
            },
            "data": {
                "metrics": [{"key": "val_mse", "value": 9.1, "timestamp": 0, "step": 0}],
                "params": [{"key": "type", "value": "Ridge"}, {"key": "alpha", "value": "0.1"}],
                "tags": [{"key": "model", "value": "Ridge"}]
            }
        });
        let run = parse_run(&payload).unwrap();
        assert_eq!(run.run_id(), "abc123");
        assert_eq!(run.info.status, RunStatus::Finished);
        assert_eq!(run.metric("val_mse"), Some(9.1));
        assert_eq!(run.params["type"], "Ridge");
        assert_eq!(run.tags["model"], "Ridge");
        assert_eq!(
            run.info.end_time.unwrap() - run.info.start_time,
            chrono::Duration::seconds(5)
        );
    }

    #[test]
    fn parses_model_versions() {
        let payload = json!({
            "name": "delivery-duration",
            "version": "4",
            "source": "runs:/abc123/xgb_model",
            "run_id": "abc123"
        });
        let version = parse_model_version(&payload).unwrap();
        assert_eq!(version.version, 4);
        assert_eq!(version.artifact_path, "xgb_model");
        assert_eq!(version.model_uri().to_string(), "models:/delivery-duration/4");

        assert!(parse_model_version(&json!({"name": "m", "version": "x"})).is_err());
    }

    #[test]
    fn parses_experiment() {
        let experiment = parse_experiment(&json!({
            "experiment_id": "7",
            "name": "model-hyperopt",
            "artifact_location": "mlflow-artifacts:/7"
        }))
        .unwrap();
        assert_eq!(experiment.experiment_id, "7");
        assert!(parse_experiment(&json!({"name": "x"})).is_err());
    }

    #[test]
    fn api_errors_name_the_operation() {
        let err = api_error(
            Service::Tracking,
            "log_metric",
            StatusCode::BAD_REQUEST,
            &json!({"error_code": "INVALID_PARAMETER_VALUE", "message": "bad"}),
        );
        let text = err.to_string();
        assert!(text.contains("log_metric"));
        assert!(text.contains("INVALID_PARAMETER_VALUE"));
    }

    #[test]
    fn client_trims_base_url() {
        let client = MlflowClient::new("http://localhost:5000/");
        assert_eq!(client.api("runs/get"), "http://localhost:5000/api/2.0/mlflow/runs/get");
        assert_eq!(client.tracking_uri(), "http://localhost:5000");
    }
}
