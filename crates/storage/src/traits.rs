use changemerge_core::{
    change::ChangeRecord, changeset::ChangesetKind, conflict::ConflictCause, ids::TxnId,
    value::ColumnValue,
};

use crate::error::StorageError;

/// Result of one attempt to write a change to local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAttempt {
    Applied,
    Conflict(ConflictCause),
}

/// A saved local txn.
#[derive(Debug, Clone)]
pub struct TxnRecord {
    pub id: TxnId,
    pub description: String,
    pub kind: ChangesetKind,
    pub changeset: Vec<u8>,
}

/// Column layout of a local table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub pk_columns: Vec<bool>,
}

impl TableInfo {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }
}

/// The transactional primitive a change stream is applied through.
///
/// One pass is bracketed by `begin_pass` and exactly one of `commit_pass` or
/// `rollback_pass`. Foreign keys are only checked when asked for through
/// `foreign_key_violations`, after all records have been written.
pub trait ChangeTarget {
    fn begin_pass(&mut self) -> Result<(), StorageError>;

    /// Write `change` if it applies cleanly, otherwise report why not.
    fn try_apply(&mut self, change: &ChangeRecord) -> Result<ApplyAttempt, StorageError>;

    /// Write `change` over a `Data` or `Conflict` cause. A constraint hit by
    /// the forced write is reported as a `Constraint` conflict. Any other
    /// cause is a misuse.
    fn force_apply(
        &mut self,
        change: &ChangeRecord,
        cause: ConflictCause,
    ) -> Result<ApplyAttempt, StorageError>;

    /// The local row `change` targets, if any.
    fn current_row(&self, change: &ChangeRecord) -> Result<Option<Vec<ColumnValue>>, StorageError>;

    /// Foreign-key violations introduced by the open pass. Violations that
    /// existed before `begin_pass` are not counted. Outside a pass, every
    /// violation in the database is counted.
    fn foreign_key_violations(&self) -> Result<u64, StorageError>;

    fn commit_pass(&mut self) -> Result<(), StorageError>;

    fn rollback_pass(&mut self) -> Result<(), StorageError>;

    /// Whether saved local txns are waiting to be pushed.
    fn has_pending_txns(&self) -> Result<bool, StorageError>;

    /// The persisted `DebugAllowFkViolations` flag.
    fn allows_foreign_key_violations(&self) -> Result<bool, StorageError>;
}
