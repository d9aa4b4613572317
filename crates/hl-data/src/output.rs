//! Prediction tables written as Parquet.

use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use hl_types::{DataError, Dataset, HlResult};
use parquet::arrow::ArrowWriter;
use std::sync::Arc;
use uuid::Uuid;

/// Test features joined with per-row predictions of one model version.
#[derive(Debug, Clone)]
pub struct PredictionTable {
    pub feature_names: Vec<String>,
    pub feature_columns: Vec<Vec<f64>>,
    pub trip_ids: Vec<String>,
    pub actual: Vec<f64>,
    pub predicted: Vec<f64>,
    pub model_version: String,
}

impl PredictionTable {
    /// Pair `predictions` with the rows of `dataset`; every row gets a fresh
    /// trip id.
    pub fn new(dataset: &Dataset, predictions: &[f64], model_version: &str) -> HlResult<Self> {
        if predictions.len() != dataset.n_samples() {
            return Err(DataError::InvalidShape {
                message: format!(
                    "{} predictions for {} rows",
                    predictions.len(),
                    dataset.n_samples()
                ),
            }
            .into());
        }

        let feature_columns = dataset
            .features
            .columns()
            .into_iter()
            .map(|c| c.to_vec())
            .collect();

        Ok(Self {
            feature_names: dataset.feature_names.clone(),
            feature_columns,
            trip_ids: (0..dataset.n_samples())
                .map(|_| Uuid::new_v4().to_string())
                .collect(),
            actual: dataset.targets.to_vec(),
            predicted: predictions.to_vec(),
            model_version: model_version.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.actual.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actual.is_empty()
    }

    fn schema(&self) -> Schema {
        let mut fields: Vec<Field> = self
            .feature_names
            .iter()
            .map(|name| Field::new(name, DataType::Float64, false))
            .collect();
        fields.push(Field::new("trip_id", DataType::Utf8, false));
        fields.push(Field::new("actual_duration", DataType::Float64, false));
        fields.push(Field::new("predicted_duration", DataType::Float64, false));
        fields.push(Field::new("diff", DataType::Float64, false));
        fields.push(Field::new("model_version", DataType::Utf8, false));
        Schema::new(fields)
    }

    pub fn to_record_batch(&self) -> HlResult<RecordBatch> {
        let mut columns: Vec<ArrayRef> = self
            .feature_columns
            .iter()
            .map(|c| Arc::new(Float64Array::from(c.clone())) as ArrayRef)
            .collect();

        let diff: Vec<f64> = self
            .actual
            .iter()
            .zip(&self.predicted)
            .map(|(a, p)| a - p)
            .collect();

        columns.push(Arc::new(StringArray::from(self.trip_ids.clone())));
        columns.push(Arc::new(Float64Array::from(self.actual.clone())));
        columns.push(Arc::new(Float64Array::from(self.predicted.clone())));
        columns.push(Arc::new(Float64Array::from(diff)));
        columns.push(Arc::new(StringArray::from(vec![
            self.model_version.clone();
            self.len()
        ])));

        RecordBatch::try_new(Arc::new(self.schema()), columns).map_err(|e| {
            DataError::Encoding {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Encode the table as a single-row-group Parquet file.
    pub fn to_parquet_bytes(&self) -> HlResult<Vec<u8>> {
        let batch = self.to_record_batch()?;
        let encoding = |e: parquet::errors::ParquetError| DataError::Encoding {
            message: e.to_string(),
        };

        let mut writer =
            ArrowWriter::try_new(Vec::new(), batch.schema(), None).map_err(encoding)?;
        writer.write(&batch).map_err(encoding)?;
        Ok(writer.into_inner().map_err(encoding)?)
    }
}
