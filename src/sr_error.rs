use thiserror::Error;

/// Rejected scenario configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: `{field}` {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse scenario JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse scenario YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("batch was cancelled before all runs completed")]
    Cancelled,

    #[error("no batch has been started")]
    NoActiveBatch,

    #[error("worker {worker_id} stopped without reporting its results")]
    WorkerLost { worker_id: usize },
}
