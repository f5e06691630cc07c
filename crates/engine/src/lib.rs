pub mod applier;
pub mod classify;
pub mod config;
pub mod error;
pub mod hook;
pub mod policy;
pub mod undo;

pub use applier::{AppliedConflictLog, ApplyOutcome, ApplyReport, ChangesetApplier, ConflictEntry};
pub use classify::{Classification, TableClass, classify};
pub use config::SessionConfig;
pub use error::EngineError;
pub use hook::{ConflictContext, ConflictHook, HookReply};
pub use policy::{Decision, PolicyInput, PolicyRule, decide};
pub use undo::{UndoReport, UndoResult};

use tracing::{info, warn};

use changemerge_core::{
    changeset::ChangesetProps,
    group::invert_changeset,
    ids::{BriefcaseId, ChangesetId, TxnId},
};
use changemerge_storage::{ChangeTarget, SqliteStorage};

use crate::undo::{UndoManager, apply_reversal};

const DEFAULT_UNDO_DEPTH: usize = 100;
const PARENT_CHANGESET_KEY: &str = "ParentChangesetId";
const PARENT_CHANGESET_INDEX_KEY: &str = "ParentChangesetIndex";

/// A briefcase: local storage plus the merge and undo machinery around it.
pub struct Engine {
    storage: SqliteStorage,
    config: SessionConfig,
    hook: Option<Box<dyn ConflictHook + Send>>,
    undo_manager: UndoManager,
}

impl Engine {
    pub fn new(storage: SqliteStorage) -> Self {
        Self {
            storage,
            config: SessionConfig::default(),
            hook: None,
            undo_manager: UndoManager::new(DEFAULT_UNDO_DEPTH),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn set_config(&mut self, config: SessionConfig) {
        self.config = config;
    }

    pub fn with_hook(mut self, hook: impl ConflictHook + Send + 'static) -> Self {
        self.set_hook(hook);
        self
    }

    pub fn set_hook(&mut self, hook: impl ConflictHook + Send + 'static) {
        self.hook = Some(Box::new(hook));
    }

    pub fn clear_hook(&mut self) {
        self.hook = None;
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut SqliteStorage {
        &mut self.storage
    }

    pub fn briefcase_id(&self) -> Result<BriefcaseId, EngineError> {
        Ok(self.storage.briefcase_id()?)
    }

    /// Id and index of the last changeset merged into this briefcase.
    pub fn parent_changeset(&self) -> Result<Option<(ChangesetId, u64)>, EngineError> {
        let id = self.storage.query_local::<ChangesetId>(PARENT_CHANGESET_KEY)?;
        let index = self.storage.query_local::<u64>(PARENT_CHANGESET_INDEX_KEY)?;
        Ok(id.zip(index))
    }

    /// Save tracked local edits as a txn. Clears the redo stack.
    pub fn save_changes(&mut self, description: &str) -> Result<Option<TxnId>, EngineError> {
        let id = self.storage.save_changes(description)?;
        if id.is_some() {
            self.undo_manager.clear_redo();
        }
        Ok(id)
    }

    /// Merge an incoming changeset. Whether local txns are pending is read
    /// from the txn log; unsaved edits must be saved or abandoned first.
    pub fn merge_changeset(
        &mut self,
        changeset: &[u8],
        description: &str,
    ) -> Result<ApplyOutcome, EngineError> {
        if self.storage.has_unsaved_changes() {
            return Err(EngineError::UnsavedChanges);
        }

        let pending = self.config.has_pending_local_txns || self.storage.has_pending_txns()?;
        let config = self.config.clone().with_pending_local_txns(pending);

        let parent = self.parent_changeset()?;
        let index = parent.map_or(0, |(_, index)| index + 1);
        let props = match ChangesetProps::describe(
            changeset,
            parent.map(|(id, _)| id),
            index,
            description,
        ) {
            Ok(props) => props,
            Err(e) if e.is_decode() => {
                warn!(error = %e, description, "rejecting undecodable changeset");
                return Ok(ApplyOutcome::DecodeError(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let id = props.id;

        let mut applier = ChangesetApplier::new(config).with_props(props);
        if let Some(hook) = self.hook.as_deref_mut() {
            applier = applier.with_hook(hook);
        }
        let outcome = applier.apply(&mut self.storage, changeset)?;

        if outcome.is_success() {
            self.storage.save_local(PARENT_CHANGESET_KEY, &id)?;
            self.storage.save_local(PARENT_CHANGESET_INDEX_KEY, &index)?;
            self.undo_manager.clear_redo();
            info!(changeset = %id, index, pending, description, "merged changeset");
        }
        Ok(outcome)
    }

    /// Reverse the most recent local txn and move it to the redo stack.
    pub fn undo(&mut self) -> Result<UndoResult, EngineError> {
        if self.storage.has_unsaved_changes() {
            return Err(EngineError::UnsavedChanges);
        }
        let Some(txn) = self.storage.last_txn()? else {
            return Ok(UndoResult::Empty);
        };
        let inverted = invert_changeset(&txn.changeset)?;

        self.storage.begin_pass()?;
        let result = self.reverse_txn(&inverted, txn.id);
        let (applied, skipped) = self.finish_pass(result)?;

        info!(txn = %txn.id, description = %txn.description, applied, skipped, "undid local txn");
        let report = UndoReport {
            txn: txn.id,
            description: txn.description.clone(),
            applied,
            skipped,
        };
        self.undo_manager.push_redo(txn);
        Ok(UndoResult::Applied(report))
    }

    /// Reinstate the most recently undone txn as a new local txn.
    pub fn redo(&mut self) -> Result<UndoResult, EngineError> {
        if self.storage.has_unsaved_changes() {
            return Err(EngineError::UnsavedChanges);
        }
        let Some(txn) = self.undo_manager.pop_redo() else {
            return Ok(UndoResult::Empty);
        };

        self.storage.begin_pass()?;
        let result = self.reinstate_txn(&txn);
        let (id, applied, skipped) = match self.finish_pass(result) {
            Ok(counts) => counts,
            Err(e) => {
                self.undo_manager.push_redo(txn);
                return Err(e);
            }
        };

        info!(txn = %id, description = %txn.description, applied, skipped, "redid local txn");
        Ok(UndoResult::Applied(UndoReport {
            txn: id,
            description: txn.description,
            applied,
            skipped,
        }))
    }

    pub fn redo_depth(&self) -> usize {
        self.undo_manager.redo_depth()
    }

    fn reverse_txn(&mut self, inverted: &[u8], id: TxnId) -> Result<(u64, u64), EngineError> {
        let counts = apply_reversal(&mut self.storage, inverted)?;
        self.storage.delete_txn(id)?;
        Ok(counts)
    }

    fn reinstate_txn(&mut self, txn: &changemerge_storage::TxnRecord) -> Result<(TxnId, u64, u64), EngineError> {
        let (applied, skipped) = apply_reversal(&mut self.storage, &txn.changeset)?;
        let id = self
            .storage
            .append_txn(&txn.description, txn.kind, &txn.changeset)?;
        Ok((id, applied, skipped))
    }

    fn finish_pass<R>(&mut self, result: Result<R, EngineError>) -> Result<R, EngineError> {
        match result {
            Ok(value) => {
                self.storage.commit_pass()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.storage.rollback_pass() {
                    tracing::error!(error = %rollback, "rollback after failed txn reversal also failed");
                }
                Err(e)
            }
        }
    }
}
