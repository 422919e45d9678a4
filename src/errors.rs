use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("home directory is unknown; set HOME or `home_dir` in the config file")]
    MissingHome,
    #[error("no `{key} =` line found in {path}")]
    MissingKey { key: String, path: PathBuf },
    #[error("unexpected status output: {0}")]
    Status(String),
    #[error("status output is not JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl SetupError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SetupError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type SetupResult<T> = Result<T, SetupError>;
