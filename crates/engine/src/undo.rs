use std::collections::VecDeque;

use tracing::{debug, error, warn};

use changemerge_core::{
    change::DbOpcode,
    codec::ChangeReader,
    conflict::{ConflictCause, ConflictResolution},
    ids::TxnId,
};
use changemerge_storage::{ApplyAttempt, ChangeTarget, TxnRecord};

use crate::error::EngineError;

pub struct UndoManager {
    redo_stack: VecDeque<TxnRecord>,
    max_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoReport {
    pub txn: TxnId,
    pub description: String,
    pub applied: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoResult {
    Applied(UndoReport),
    Empty,
}

impl UndoManager {
    pub fn new(max_depth: usize) -> Self {
        Self {
            redo_stack: VecDeque::new(),
            max_depth,
        }
    }

    pub fn push_redo(&mut self, txn: TxnRecord) {
        self.redo_stack.push_back(txn);
        // Enforce depth limit by dropping oldest entry
        if self.redo_stack.len() > self.max_depth {
            self.redo_stack.pop_front();
        }
    }

    pub fn pop_redo(&mut self) -> Option<TxnRecord> {
        self.redo_stack.pop_back()
    }

    pub fn clear_redo(&mut self) {
        self.redo_stack.clear();
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }
}

/// Resolution for a conflict hit while reversing or reinstating a local txn.
///
/// Rows the txn inserted and then changed again, or rows removed by a
/// cascading delete, show up as missing or stale. Those are skipped; any
/// other conflict is unexpected and only logged.
pub fn undo_resolution(cause: ConflictCause, opcode: DbOpcode) -> ConflictResolution {
    match (cause, opcode) {
        (ConflictCause::NotFound, DbOpcode::Delete | DbOpcode::Update) => ConflictResolution::Skip,
        (ConflictCause::Data, DbOpcode::Delete) => ConflictResolution::Skip,
        (cause, opcode) => {
            error!(%cause, %opcode, "unexpected conflict while reversing local txn");
            ConflictResolution::Skip
        }
    }
}

/// Apply `changeset` inside an already open pass, resolving conflicts with
/// [`undo_resolution`]. Returns the applied and skipped record counts.
pub(crate) fn apply_reversal<T: ChangeTarget>(
    target: &mut T,
    changeset: &[u8],
) -> Result<(u64, u64), EngineError> {
    reverse_with(target, changeset, undo_resolution)
}

fn reverse_with<T, F>(target: &mut T, changeset: &[u8], resolve: F) -> Result<(u64, u64), EngineError>
where
    T: ChangeTarget,
    F: Fn(ConflictCause, DbOpcode) -> ConflictResolution,
{
    let mut applied = 0;
    let mut skipped = 0;
    for record in ChangeReader::new(changeset) {
        let record = record?;
        let cause = match target.try_apply(&record)? {
            ApplyAttempt::Applied => {
                applied += 1;
                continue;
            }
            ApplyAttempt::Conflict(cause) => cause,
        };

        let resolution = resolve(cause, record.opcode);
        debug!(table = %record.table, %cause, resolution = resolution.as_str(), "txn reversal conflict");
        match resolution {
            ConflictResolution::Skip => skipped += 1,
            ConflictResolution::Replace => match target.force_apply(&record, cause)? {
                ApplyAttempt::Applied => applied += 1,
                ApplyAttempt::Conflict(again) => {
                    warn!(table = %record.table, cause = %again, "forced txn reversal write skipped");
                    skipped += 1;
                }
            },
            ConflictResolution::Abort => {
                return Err(EngineError::ReversalAborted {
                    table: record.table.clone(),
                    cause,
                });
            }
        }
    }
    Ok((applied, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use changemerge_core::{change::ChangeRecord, codec::encode_changeset, value::ColumnValue};
    use changemerge_storage::SqliteStorage;

    #[test]
    fn missing_rows_and_stale_deletes_are_skipped() {
        assert_eq!(
            undo_resolution(ConflictCause::NotFound, DbOpcode::Delete),
            ConflictResolution::Skip
        );
        assert_eq!(
            undo_resolution(ConflictCause::NotFound, DbOpcode::Update),
            ConflictResolution::Skip
        );
        assert_eq!(
            undo_resolution(ConflictCause::Data, DbOpcode::Delete),
            ConflictResolution::Skip
        );
    }

    #[test]
    fn unexpected_conflicts_never_replace() {
        for cause in [ConflictCause::Conflict, ConflictCause::Constraint, ConflictCause::Data] {
            assert_eq!(
                undo_resolution(cause, DbOpcode::Insert),
                ConflictResolution::Skip
            );
        }
    }

    #[test]
    fn redo_stack_is_bounded() {
        let mut manager = UndoManager::new(2);
        for id in 1..=3 {
            manager.push_redo(TxnRecord {
                id: TxnId::new(id),
                description: format!("txn {id}"),
                kind: changemerge_core::changeset::ChangesetKind::Data,
                changeset: Vec::new(),
            });
        }
        assert_eq!(manager.redo_depth(), 2);
        assert_eq!(manager.pop_redo().map(|t| t.id), Some(TxnId::new(3)));
        assert_eq!(manager.pop_redo().map(|t| t.id), Some(TxnId::new(2)));
        assert!(manager.pop_redo().is_none());
    }

    fn stale_widget() -> Result<(SqliteStorage, Vec<u8>), Box<dyn std::error::Error>> {
        let mut storage = SqliteStorage::open_in_memory()?;
        storage.execute_ddl("CREATE TABLE app_Widget (Id INTEGER PRIMARY KEY, Name TEXT)")?;
        storage.insert_row("app_Widget", vec![ColumnValue::Integer(1), "local".into()])?;
        let update = ChangeRecord::update(
            "app_Widget",
            vec![true, false],
            vec![ColumnValue::Integer(1), "base".into()],
            vec![ColumnValue::Integer(1), "remote".into()],
        );
        Ok((storage, encode_changeset(&[update])?))
    }

    #[test]
    fn reversal_follows_the_chosen_resolution() -> Result<(), Box<dyn std::error::Error>> {
        let (mut storage, changeset) = stale_widget()?;

        storage.begin_pass()?;
        assert_eq!(apply_reversal(&mut storage, &changeset)?, (0, 1));
        storage.rollback_pass()?;

        storage.begin_pass()?;
        let counts = reverse_with(&mut storage, &changeset, |_, _| ConflictResolution::Replace)?;
        assert_eq!(counts, (1, 0));
        storage.commit_pass()?;
        assert_eq!(
            storage.get_row("app_Widget", &[ColumnValue::Integer(1)])?,
            Some(vec![ColumnValue::Integer(1), "remote".into()])
        );
        Ok(())
    }

    #[test]
    fn aborting_resolution_stops_the_reversal() -> Result<(), Box<dyn std::error::Error>> {
        let (mut storage, changeset) = stale_widget()?;
        storage.begin_pass()?;
        let result = reverse_with(&mut storage, &changeset, |_, _| ConflictResolution::Abort);
        assert!(matches!(
            result,
            Err(EngineError::ReversalAborted { cause: ConflictCause::Data, .. })
        ));
        storage.rollback_pass()?;
        Ok(())
    }
}
