//! Hyperlift
//!
//! Hyperparameter search over regression model families, with every trial
//! recorded to a tracking store and the winning model promoted to an
//! artifact bucket.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hl_types::Settings;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "hyperlift")]
#[command(about = "Hyperparameter search, run tracking and model promotion")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Tracking server URI (overrides MLFLOW_TRACKING_URI)
    #[arg(long, global = true)]
    tracking_uri: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a TPE search over Ridge and XGBRegressor configurations
    Search {
        /// Directory holding train and val splits
        #[arg(long)]
        data_path: PathBuf,

        /// Number of trials to evaluate
        #[arg(long, default_value = "50")]
        num_trials: usize,

        #[arg(long, default_value = "42")]
        seed: u64,

        #[arg(long)]
        experiment: Option<String>,

        /// Random draws before TPE takes over
        #[arg(long, default_value = "20")]
        startup_trials: usize,

        /// CSV column holding the target (defaults to the last column)
        #[arg(long)]
        target_column: Option<String>,
    },

    /// Print the lowest-loss run of an experiment
    BestRun {
        #[arg(long)]
        experiment: Option<String>,

        /// Also look up the registered version of this model
        #[arg(long)]
        model_name: Option<String>,
    },

    /// Register the best run's model as a new model version
    Register {
        #[arg(long)]
        experiment: Option<String>,

        #[arg(long)]
        model_name: String,
    },

    /// Copy the latest model version into an artifact bucket
    Promote {
        #[arg(long)]
        model_name: String,

        #[arg(long)]
        bucket: String,

        #[arg(long)]
        region: Option<String>,
    },

    /// Score a test split with the latest model version
    Apply {
        /// Directory holding the test split
        #[arg(long)]
        test_data_path: PathBuf,

        #[arg(long)]
        model_name: String,

        #[arg(long)]
        dest_bucket: String,

        #[arg(long)]
        target_column: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut settings = Settings::from_env();
    if let Some(uri) = cli.tracking_uri {
        settings.tracking_uri = Some(uri);
    }

    match cli.command {
        Commands::Search {
            data_path,
            num_trials,
            seed,
            experiment,
            startup_trials,
            target_column,
        } => {
            let args = commands::search::SearchArgs {
                data_path,
                num_trials,
                seed,
                experiment,
                startup_trials,
                target_column,
            };
            commands::search::run(&settings, args).await?;
        }
        Commands::BestRun {
            experiment,
            model_name,
        } => {
            commands::resolve::best_run(&settings, experiment, model_name.as_deref()).await?;
        }
        Commands::Register {
            experiment,
            model_name,
        } => {
            commands::resolve::register(&settings, experiment, &model_name).await?;
        }
        Commands::Promote {
            model_name,
            bucket,
            region,
        } => {
            if let Some(region) = region {
                settings.region = region;
            }
            commands::promote::promote(&settings, &model_name, &bucket).await?;
        }
        Commands::Apply {
            test_data_path,
            model_name,
            dest_bucket,
            target_column,
        } => {
            commands::promote::apply(
                &settings,
                &test_data_path,
                &model_name,
                &dest_bucket,
                target_column,
            )
            .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_search_with_defaults() {
        let cli = Cli::try_parse_from(["hyperlift", "search", "--data-path", "data"]).unwrap();
        match cli.command {
            Commands::Search {
                data_path,
                num_trials,
                seed,
                experiment,
                ..
            } => {
                assert_eq!(data_path, PathBuf::from("data"));
                assert_eq!(num_trials, 50);
                assert_eq!(seed, 42);
                assert!(experiment.is_none());
            }
            _ => panic!("expected search"),
        }
    }

    #[test]
    fn parses_promote_and_global_flags() {
        let cli = Cli::try_parse_from([
            "hyperlift",
            "promote",
            "--model-name",
            "duration-model",
            "--bucket",
            "mlflow-models",
            "--region",
            "eu-west-1",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Promote { ref bucket, region: Some(ref r), .. } if bucket == "mlflow-models" && r == "eu-west-1"
        ));
    }

    #[test]
    fn apply_requires_a_destination() {
        assert!(Cli::try_parse_from([
            "hyperlift",
            "apply",
            "--test-data-path",
            "data",
            "--model-name",
            "m",
        ])
        .is_err());
    }
}
