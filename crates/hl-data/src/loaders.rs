use csv::ReaderBuilder;
use hl_types::{DataError, Dataset, HlResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The pre-processed splits a data directory may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub fn file_stem(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Validation => "val",
            Self::Test => "test",
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_stem())
    }
}

#[derive(Debug, Deserialize)]
struct JsonSplit {
    #[serde(default)]
    feature_names: Vec<String>,
    features: Vec<Vec<f64>>,
    targets: Vec<f64>,
}

/// Reads `train`, `val` and `test` splits from a data directory.
///
/// Each split is either `<stem>.json` (`feature_names`, `features`, `targets`)
/// or `<stem>.csv` with a header row; JSON wins when both exist.
#[derive(Debug, Clone)]
pub struct SplitLoader {
    pub data_directory: PathBuf,
    pub target_column: Option<String>,
}

impl SplitLoader {
    pub fn new<P: AsRef<Path>>(data_directory: P) -> Self {
        Self {
            data_directory: data_directory.as_ref().to_path_buf(),
            target_column: None,
        }
    }

    /// Use a named CSV column as the target instead of the last one.
    pub fn with_target_column(mut self, column: &str) -> Self {
        self.target_column = Some(column.to_string());
        self
    }

    fn locate(&self, split: Split) -> HlResult<PathBuf> {
        for ext in ["json", "csv"] {
            let path = self
                .data_directory
                .join(format!("{}.{ext}", split.file_stem()));
            if path.exists() {
                return Ok(path);
            }
        }
        Err(DataError::SplitNotFound(format!(
            "{} in {}",
            split,
            self.data_directory.display()
        ))
        .into())
    }

    pub fn load(&self, split: Split) -> HlResult<Dataset> {
        let path = self.locate(split)?;
        let dataset = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => load_json(&path)?,
            _ => load_csv(&path, self.target_column.as_deref())?,
        };
        info!(
            split = %split,
            rows = dataset.n_samples(),
            features = dataset.n_features(),
            path = %path.display(),
            "Loaded split"
        );
        Ok(dataset)
    }

    /// Training and validation splits, in that order.
    pub fn load_train_val(&self) -> HlResult<(Dataset, Dataset)> {
        let train = self.load(Split::Train)?;
        let val = self.load(Split::Validation)?;
        if train.n_features() != val.n_features() {
            return Err(DataError::InvalidShape {
                message: format!(
                    "train has {} features, val has {}",
                    train.n_features(),
                    val.n_features()
                ),
            }
            .into());
        }
        Ok((train, val))
    }
}

fn load_json(path: &Path) -> HlResult<Dataset> {
    let file = std::fs::File::open(path)?;
    let split: JsonSplit =
        serde_json::from_reader(std::io::BufReader::new(file)).map_err(|e| {
            DataError::ParseError {
                message: format!("{}: {e}", path.display()),
            }
        })?;
    Dataset::from_rows(split.feature_names, split.features, split.targets)
}

fn load_csv(path: &Path, target_column: Option<&str>) -> HlResult<Dataset> {
    let file = std::fs::File::open(path)?;
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| DataError::ParseError {
            message: format!("CSV header error: {e}"),
        })?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if headers.len() < 2 {
        return Err(DataError::InvalidShape {
            message: format!("{} needs at least one feature and a target", path.display()),
        }
        .into());
    }

    let target_idx = match target_column {
        Some(column) => headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| DataError::TargetColumnNotFound {
                column: column.to_string(),
            })?,
        None => headers.len() - 1,
    };
    let feature_names: Vec<String> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != target_idx)
        .map(|(_, h)| h.clone())
        .collect();

    let mut rows = Vec::new();
    let mut targets = Vec::new();
    for (row_idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| DataError::ParseError {
            message: format!("CSV parsing error: {e}"),
        })?;
        let mut row = Vec::with_capacity(feature_names.len());
        for (col_idx, field) in record.iter().enumerate() {
            let value: f64 = field.trim().parse().map_err(|_| DataError::ParseError {
                message: format!(
                    "row {row_idx}, column '{}': '{field}' is not a number",
                    headers.get(col_idx).map(String::as_str).unwrap_or("?")
                ),
            })?;
            if col_idx == target_idx {
                targets.push(value);
            } else {
                row.push(value);
            }
        }
        rows.push(row);
    }

    debug!(rows = rows.len(), path = %path.display(), "Parsed CSV split");
    Dataset::from_rows(feature_names, rows, targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn loads_json_split() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("train.json"),
            r#"{"feature_names": ["distance", "items"], "features": [[1.0, 2.0], [3.0, 4.0]], "targets": [10.0, 20.0]}"#,
        )
        .unwrap();

        let ds = SplitLoader::new(dir.path()).load(Split::Train).unwrap();
        assert_eq!(ds.n_samples(), 2);
        assert_eq!(ds.feature_names, vec!["distance", "items"]);
        assert_eq!(ds.targets[1], 20.0);
    }

    #[test]
    fn loads_csv_with_last_column_target() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("val.csv"),
            "distance,items,duration\n1.5,2,30\n2.5,1,45\n",
        )
        .unwrap();

        let ds = SplitLoader::new(dir.path()).load(Split::Validation).unwrap();
        assert_eq!(ds.feature_names, vec!["distance", "items"]);
        assert_eq!(ds.features[[1, 0]], 2.5);
        assert_eq!(ds.targets.to_vec(), vec![30.0, 45.0]);
    }

    #[test]
    fn csv_named_target_column() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("test.csv"), "duration,distance\n30,1.5\n").unwrap();

        let ds = SplitLoader::new(dir.path())
            .with_target_column("duration")
            .load(Split::Test)
            .unwrap();
        assert_eq!(ds.feature_names, vec!["distance"]);
        assert_eq!(ds.targets[0], 30.0);
    }

    #[test]
    fn csv_rejects_non_numeric() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("train.csv"), "a,b\nx,1\n").unwrap();
        let err = SplitLoader::new(dir.path()).load(Split::Train).unwrap_err();
        assert!(err.to_string().contains("not a number"));
    }

    #[test]
    fn missing_split_is_reported() {
        let dir = tempdir().unwrap();
        let err = SplitLoader::new(dir.path()).load(Split::Train).unwrap_err();
        assert!(err.to_string().contains("Split not found"));
    }

    #[test]
    fn train_val_feature_count_must_agree() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("train.csv"), "a,b,y\n1,2,3\n").unwrap();
        fs::write(dir.path().join("val.csv"), "a,y\n1,3\n").unwrap();
        let err = SplitLoader::new(dir.path()).load_train_val().unwrap_err();
        assert!(err.to_string().contains("train has 2 features"));
    }
}
