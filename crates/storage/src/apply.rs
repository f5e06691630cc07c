use std::collections::HashSet;

use rusqlite::Connection;
use tracing::{debug, trace};

use changemerge_core::{
    change::{ChangeRecord, DbOpcode},
    conflict::ConflictCause,
    value::ColumnValue,
};

use crate::error::{StorageError, is_constraint_violation};
use crate::sqlite::{
    DEBUG_ALLOW_FK_VIOLATIONS, SqliteStorage, exec_delete, exec_insert, exec_update, fetch_row,
    load_table_info, record_key,
};
use crate::traits::{ApplyAttempt, ChangeTarget, TableInfo};

const SAVEPOINT: &str = "changeset_apply";
const FORCE_SAVEPOINT: &str = "changeset_force";

/// One row of `PRAGMA foreign_key_check`: child table, child rowid, parent
/// table and foreign key index.
pub(crate) type FkViolation = (String, Option<i64>, String, i64);

fn read_fk_violation(row: &rusqlite::Row) -> rusqlite::Result<FkViolation> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

pub(crate) fn foreign_key_check(conn: &Connection) -> Result<Vec<FkViolation>, StorageError> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let rows = stmt.query_map([], read_fk_violation)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

impl SqliteStorage {
    fn require_pass(&self) -> Result<(), StorageError> {
        if !self.in_pass {
            return Err(StorageError::Misuse("no changeset apply pass is open".into()));
        }
        Ok(())
    }

    fn target_table(&self, change: &ChangeRecord) -> Result<TableInfo, StorageError> {
        let info = load_table_info(self.conn(), &change.table)?;
        if change.column_count() > info.columns.len() {
            return Err(StorageError::SchemaMismatch {
                table: change.table.clone(),
                reason: format!(
                    "change has {} columns, table has {}",
                    change.column_count(),
                    info.columns.len()
                ),
            });
        }
        if info.pk_columns[..change.column_count()] != change.pk_columns[..] {
            return Err(StorageError::SchemaMismatch {
                table: change.table.clone(),
                reason: "primary key columns differ".into(),
            });
        }
        Ok(info)
    }
}

/// Turn a constraint failure into a `Constraint` conflict.
fn attempt(result: rusqlite::Result<usize>) -> Result<ApplyAttempt, StorageError> {
    match result {
        Ok(_) => Ok(ApplyAttempt::Applied),
        Err(e) if is_constraint_violation(&e) => {
            trace!(error = %e, "constraint hit");
            Ok(ApplyAttempt::Conflict(ConflictCause::Constraint))
        }
        Err(e) => Err(StorageError::Sqlite(e)),
    }
}

fn new_values(change: &ChangeRecord) -> Vec<ColumnValue> {
    change.new.iter().flatten().cloned().collect()
}

fn assignments(change: &ChangeRecord) -> Vec<(usize, &ColumnValue)> {
    change
        .changed_columns()
        .into_iter()
        .filter_map(|i| change.new_value(i).map(|v| (i, v)))
        .collect()
}

impl ChangeTarget for SqliteStorage {
    fn begin_pass(&mut self) -> Result<(), StorageError> {
        if self.in_pass || !self.conn().is_autocommit() {
            return Err(StorageError::Misuse(
                "changeset apply requires no open transaction".into(),
            ));
        }
        let baseline: HashSet<FkViolation> = foreign_key_check(self.conn())?.into_iter().collect();
        self.conn().execute_batch(&format!(
            "PRAGMA foreign_keys = OFF; SAVEPOINT {SAVEPOINT};"
        ))?;
        self.in_pass = true;
        debug!(existing_fk_violations = baseline.len(), "changeset apply pass opened");
        self.fk_baseline = baseline;
        Ok(())
    }

    fn try_apply(&mut self, change: &ChangeRecord) -> Result<ApplyAttempt, StorageError> {
        self.require_pass()?;
        change.validate()?;
        let info = self.target_table(change)?;
        let key = record_key(change);
        let conn = self.conn();

        match change.opcode {
            DbOpcode::Insert => {
                if fetch_row(conn, &info, change.column_count(), &key)?.is_some() {
                    return Ok(ApplyAttempt::Conflict(ConflictCause::Conflict));
                }
                attempt(exec_insert(conn, &info, &new_values(change)))
            }
            DbOpcode::Update | DbOpcode::Delete => {
                let Some(row) = fetch_row(conn, &info, change.column_count(), &key)? else {
                    return Ok(ApplyAttempt::Conflict(ConflictCause::NotFound));
                };
                // Key columns already matched under the table's collation.
                let stale = change
                    .old
                    .iter()
                    .zip(&row)
                    .zip(&change.pk_columns)
                    .filter(|(_, is_pk)| !**is_pk)
                    .any(|((old, current), _)| old.as_ref().is_some_and(|v| v != current));
                if stale {
                    return Ok(ApplyAttempt::Conflict(ConflictCause::Data));
                }
                if change.opcode == DbOpcode::Update {
                    attempt(exec_update(conn, &info, &assignments(change), &key))
                } else {
                    attempt(exec_delete(conn, &info, &key))
                }
            }
        }
    }

    fn force_apply(
        &mut self,
        change: &ChangeRecord,
        cause: ConflictCause,
    ) -> Result<ApplyAttempt, StorageError> {
        self.require_pass()?;
        let info = self.target_table(change)?;
        let key = record_key(change);
        let conn = self.conn();

        match (change.opcode, cause) {
            (DbOpcode::Insert, ConflictCause::Conflict) => {
                // Only the row at this key is replaced. A clash on any other
                // unique index undoes the delete and surfaces as a conflict.
                conn.execute_batch(&format!("SAVEPOINT {FORCE_SAVEPOINT}"))?;
                let result = attempt(
                    exec_delete(conn, &info, &key)
                        .and_then(|_| exec_insert(conn, &info, &new_values(change))),
                );
                if matches!(result, Ok(ApplyAttempt::Applied)) {
                    conn.execute_batch(&format!("RELEASE {FORCE_SAVEPOINT}"))?;
                } else {
                    conn.execute_batch(&format!(
                        "ROLLBACK TO {FORCE_SAVEPOINT}; RELEASE {FORCE_SAVEPOINT}"
                    ))?;
                }
                result
            }
            (DbOpcode::Update, ConflictCause::Data) => {
                attempt(exec_update(conn, &info, &assignments(change), &key))
            }
            (DbOpcode::Delete, ConflictCause::Data) => attempt(exec_delete(conn, &info, &key)),
            (opcode, cause) => Err(StorageError::Misuse(format!(
                "cannot replace {opcode} on {} over a {cause} conflict",
                change.table
            ))),
        }
    }

    fn current_row(&self, change: &ChangeRecord) -> Result<Option<Vec<ColumnValue>>, StorageError> {
        let info = self.target_table(change)?;
        fetch_row(self.conn(), &info, change.column_count(), &record_key(change))
    }

    fn foreign_key_violations(&self) -> Result<u64, StorageError> {
        let count = foreign_key_check(self.conn())?
            .iter()
            .filter(|v| !self.fk_baseline.contains(*v))
            .count();
        Ok(count as u64)
    }

    fn commit_pass(&mut self) -> Result<(), StorageError> {
        self.require_pass()?;
        self.in_pass = false;
        self.fk_baseline.clear();
        self.conn().execute_batch(&format!(
            "RELEASE {SAVEPOINT}; PRAGMA foreign_keys = ON;"
        ))?;
        debug!("changeset apply pass committed");
        Ok(())
    }

    fn rollback_pass(&mut self) -> Result<(), StorageError> {
        self.require_pass()?;
        self.in_pass = false;
        self.fk_baseline.clear();
        self.conn().execute_batch(&format!(
            "ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT}; PRAGMA foreign_keys = ON;"
        ))?;
        debug!("changeset apply pass rolled back");
        Ok(())
    }

    fn has_pending_txns(&self) -> Result<bool, StorageError> {
        let pending: bool = self
            .conn()
            .query_row("SELECT EXISTS (SELECT 1 FROM be_Txns)", [], |row| row.get(0))?;
        Ok(pending)
    }

    fn allows_foreign_key_violations(&self) -> Result<bool, StorageError> {
        Ok(self
            .query_local::<bool>(DEBUG_ALLOW_FK_VIOLATIONS)?
            .unwrap_or(false))
    }
}
