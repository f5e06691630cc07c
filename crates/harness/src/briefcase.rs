use std::path::Path;

use changemerge_core::{ids::TxnId, value::ColumnValue};
use changemerge_engine::{ApplyOutcome, Engine, EngineError};
use changemerge_storage::{SqliteStorage, StorageError};
use tempfile::TempDir;

use crate::SEED_SCHEMA;

/// A local copy of the shared database with helpers for the seed tables.
pub struct TestBriefcase {
    pub engine: Engine,
    _dir: Option<TempDir>,
}

impl TestBriefcase {
    pub fn new() -> Result<Self, StorageError> {
        let storage = SqliteStorage::open_in_memory()?;
        storage.execute_ddl(SEED_SCHEMA)?;
        Ok(Self {
            engine: Engine::new(storage),
            _dir: None,
        })
    }

    /// A briefcase backed by a file in its own temporary directory.
    pub fn temporary() -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let mut briefcase = Self::open(&dir.path().join("briefcase.db"))?;
        briefcase._dir = Some(dir);
        Ok(briefcase)
    }

    pub fn open(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.to_str().ok_or("briefcase path is not valid UTF-8")?;
        let storage = SqliteStorage::open(path)?;
        storage.execute_ddl(SEED_SCHEMA)?;
        Ok(Self {
            engine: Engine::new(storage),
            _dir: None,
        })
    }

    pub fn storage(&self) -> &SqliteStorage {
        self.engine.storage()
    }

    pub fn storage_mut(&mut self) -> &mut SqliteStorage {
        self.engine.storage_mut()
    }

    pub fn add_widget(&mut self, id: i64, name: &str, size: i64) -> Result<(), StorageError> {
        self.storage_mut().insert_row(
            "app_Widget",
            vec![ColumnValue::Integer(id), name.into(), ColumnValue::Integer(size)],
        )
    }

    pub fn rename_widget(&mut self, id: i64, name: &str) -> Result<(), StorageError> {
        self.storage_mut()
            .update_row("app_Widget", &[ColumnValue::Integer(id)], &[("Name", name.into())])
    }

    pub fn remove_widget(&mut self, id: i64) -> Result<(), StorageError> {
        self.storage_mut()
            .delete_row("app_Widget", &[ColumnValue::Integer(id)])
    }

    pub fn add_class(&mut self, id: i64, name: &str) -> Result<(), StorageError> {
        self.storage_mut()
            .insert_row("ec_Class", vec![ColumnValue::Integer(id), name.into()])
    }

    pub fn widget(&self, id: i64) -> Result<Option<Vec<ColumnValue>>, StorageError> {
        self.storage().get_row("app_Widget", &[ColumnValue::Integer(id)])
    }

    pub fn widget_name(&self, id: i64) -> Result<Option<String>, StorageError> {
        Ok(self
            .widget(id)?
            .and_then(|row| row.get(1).and_then(|v| v.as_text().map(str::to_string))))
    }

    pub fn rows(&self, table: &str) -> Result<Vec<Vec<ColumnValue>>, StorageError> {
        self.storage().all_rows(table)
    }

    /// Save tracked edits as a local txn.
    pub fn commit(&mut self, description: &str) -> Result<Option<TxnId>, EngineError> {
        self.engine.save_changes(description)
    }

    /// Hand over all pending txns as one changeset and clear them locally.
    pub fn push(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        let changeset = self.storage().pending_changeset()?;
        if changeset.is_some() {
            self.storage_mut().drop_pending_txns()?;
        }
        Ok(changeset)
    }

    pub fn pull(&mut self, changeset: &[u8]) -> Result<ApplyOutcome, EngineError> {
        self.engine.merge_changeset(changeset, "pull")
    }

    pub fn has_pending_txns(&self) -> Result<bool, StorageError> {
        Ok(!self.storage().pending_txns()?.is_empty())
    }
}
