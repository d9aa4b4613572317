//! CLI command implementations.

pub mod promote;
pub mod resolve;
pub mod search;

use std::sync::Arc;

use anyhow::{Context, Result};
use hl_tracking::{LocalTrackingStore, MlflowClient, ModelRegistry, TrackingStore};
use hl_types::Settings;
use tracing::info;

/// Tracking store and registry handles for the configured backend.
pub struct Backends {
    pub tracking: Arc<dyn TrackingStore>,
    pub registry: Arc<dyn ModelRegistry>,
}

/// MLflow server when a tracking URI is configured, the filesystem store
/// otherwise.
pub async fn backends(settings: &Settings) -> Result<Backends> {
    match &settings.tracking_uri {
        Some(uri) => {
            info!(tracking_uri = %uri, "Using MLflow tracking server");
            let client = Arc::new(MlflowClient::new(uri.as_str()));
            let tracking: Arc<dyn TrackingStore> = client.clone();
            Ok(Backends {
                tracking,
                registry: client,
            })
        }
        None => {
            let store = LocalTrackingStore::open(settings.tracking_dir.clone())
                .await
                .with_context(|| {
                    format!(
                        "Failed to open tracking store at {}",
                        settings.tracking_dir.display()
                    )
                })?;
            let store = Arc::new(store);
            let tracking: Arc<dyn TrackingStore> = store.clone();
            Ok(Backends {
                tracking,
                registry: store,
            })
        }
    }
}
