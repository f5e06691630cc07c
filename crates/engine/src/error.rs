use changemerge_core::{CoreError, conflict::ConflictCause};
use changemerge_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// The conflict hook answered with something other than a resolution.
    #[error("conflict hook returned invalid resolution code {code} for {table}")]
    HookContract { table: String, code: i64 },

    #[error("reversing a local txn aborted on a {cause} conflict in {table}")]
    ReversalAborted { table: String, cause: ConflictCause },

    #[error("unsaved local changes must be saved or abandoned first")]
    UnsavedChanges,
}
