//! `hyperlift best-run` and `hyperlift register`

use anyhow::Result;
use hl_engine::{register_best_run, resolve_best_model, resolve_best_run};
use hl_types::Settings;
use tracing::info;

use super::backends;

pub async fn best_run(
    settings: &Settings,
    experiment: Option<String>,
    model_name: Option<&str>,
) -> Result<()> {
    let backends = backends(settings).await?;
    let experiment = experiment.unwrap_or_else(|| settings.experiment_name.clone());

    match model_name {
        Some(model_name) => {
            let reference = resolve_best_model(
                backends.tracking.as_ref(),
                backends.registry.as_ref(),
                &experiment,
                model_name,
                &settings.metric_name,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&reference)?);
        }
        None => {
            let run = resolve_best_run(
                backends.tracking.as_ref(),
                &experiment,
                &settings.metric_name,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
    }
    Ok(())
}

pub async fn register(settings: &Settings, experiment: Option<String>, model_name: &str) -> Result<()> {
    let backends = backends(settings).await?;
    let experiment = experiment.unwrap_or_else(|| settings.experiment_name.clone());

    let version = register_best_run(
        backends.tracking.as_ref(),
        backends.registry.as_ref(),
        &experiment,
        model_name,
        &settings.metric_name,
    )
    .await?;
    info!(model_uri = %version.model_uri(), run_id = %version.run_id, "Registered best run");
    println!("{}", serde_json::to_string_pretty(&version)?);
    Ok(())
}
