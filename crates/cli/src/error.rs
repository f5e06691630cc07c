use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Engine(#[from] changemerge_engine::EngineError),
    #[error(transparent)]
    Storage(#[from] changemerge_storage::StorageError),
    #[error(transparent)]
    Core(#[from] changemerge_core::CoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Path is not valid UTF-8: {0}")]
    InvalidPath(String),
    #[error("Changeset was not merged: {0}")]
    NotMerged(String),
}
