//! Orchestration configuration loader.
//!
//! Reads a TOML file into [`OrchestrationConfig`]. Falls back to defaults when
//! the file is missing or malformed.

use std::path::Path;

use cortex_types::config::OrchestrationConfig;

/// Load orchestration configuration from `path`.
///
/// - If the file does not exist, returns [`OrchestrationConfig::default()`].
/// - If the file cannot be read or parsed, logs a warning and returns the default.
/// - Otherwise returns the parsed config; omitted fields keep their defaults.
pub async fn load_orchestration_config(path: &Path) -> OrchestrationConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return OrchestrationConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return OrchestrationConfig::default();
        }
    };

    match toml::from_str::<OrchestrationConfig>(&content) {
        Ok(config) => {
            tracing::debug!(
                path = %path.display(),
                max_concurrent_workflows = config.max_concurrent_workflows,
                strategy = config.task_distribution_strategy.as_str(),
                "loaded orchestration config"
            );
            config
        }
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            OrchestrationConfig::default()
        }
    }
}
