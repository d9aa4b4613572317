use hl_types::TrainingError;
use ndarray::Array1;

/// Mean squared error between true and predicted values.
pub fn mean_squared_error(
    y_true: &Array1<f64>,
    y_pred: &Array1<f64>,
) -> Result<f64, TrainingError> {
    if y_true.len() != y_pred.len() {
        return Err(hl_types::shape_error!(
            "{} true values vs {} predictions",
            y_true.len(),
            y_pred.len()
        ));
    }
    if y_true.is_empty() {
        return Err(TrainingError::EmptyData);
    }

    let sse: f64 = y_true
        .iter()
        .zip(y_pred.iter())
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    let mse = sse / y_true.len() as f64;
    if !mse.is_finite() {
        return Err(TrainingError::Failed(format!("non-finite loss {mse}")));
    }
    Ok(mse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn mse_of_known_values() {
        let t = array![1.0, 2.0, 3.0];
        let p = array![1.0, 3.0, 5.0];
        assert!((mean_squared_error(&t, &p).unwrap() - 5.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn mse_requires_equal_lengths() {
        assert!(mean_squared_error(&array![1.0], &array![1.0, 2.0]).is_err());
    }

    #[test]
    fn mse_rejects_infinite_predictions() {
        let err = mean_squared_error(&array![1.0], &array![f64::INFINITY]).unwrap_err();
        assert!(matches!(err, TrainingError::Failed(_)));
    }
}
