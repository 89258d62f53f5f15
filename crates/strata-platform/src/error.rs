use std::path::PathBuf;
use strata_core::ConfigurationError;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file{}: {source}", path.as_ref().map(|p| format!(" {}", p.display())).unwrap_or_default())]
    Parse {
        path: Option<PathBuf>,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    #[error(transparent)]
    Topology(#[from] ConfigurationError),
}
