use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use changemerge_core::codec::{ChangeReader, decode_changeset};
use changemerge_core::change::format_key;
use changemerge_engine::{ApplyOutcome, Engine, SessionConfig, UndoResult};
use changemerge_storage::{ChangeTarget, SqliteStorage};

use crate::error::CliError;

fn open_storage(db: &Path) -> Result<SqliteStorage, CliError> {
    let path = db
        .to_str()
        .ok_or_else(|| CliError::InvalidPath(db.display().to_string()))?;
    Ok(SqliteStorage::open(path)?)
}

pub fn load_config(path: Option<&Path>) -> Result<SessionConfig, CliError> {
    match path {
        Some(path) => Ok(serde_json::from_str(&fs::read_to_string(path)?)?),
        None => Ok(SessionConfig::default()),
    }
}

// ============================================================================
// apply
// ============================================================================

#[derive(Debug, Serialize)]
struct ConflictLine {
    table: String,
    opcode: Option<&'static str>,
    cause: &'static str,
    resolution: &'static str,
    rule: &'static str,
    hook_override: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum OutcomeSummary {
    Success {
        applied: u64,
        replaced: u64,
        skipped: u64,
        filtered: u64,
        fk_violations: u64,
        conflicts: Vec<ConflictLine>,
    },
    Aborted {
        message: String,
        dump: Option<String>,
    },
    DecodeError {
        message: String,
    },
}

fn summarize(outcome: &ApplyOutcome) -> OutcomeSummary {
    match outcome {
        ApplyOutcome::Success(report) => OutcomeSummary::Success {
            applied: report.applied,
            replaced: report.replaced,
            skipped: report.skipped,
            filtered: report.filtered,
            fk_violations: report.fk_violations,
            conflicts: report
                .conflicts
                .iter()
                .map(|c| ConflictLine {
                    table: c.table.clone(),
                    opcode: c.opcode.map(|op| op.as_str()),
                    cause: c.cause.describe(),
                    resolution: c.resolution.as_str(),
                    rule: c.rule.as_str(),
                    hook_override: c.hook_override,
                })
                .collect(),
        },
        ApplyOutcome::Aborted { message, dump } => OutcomeSummary::Aborted {
            message: message.clone(),
            dump: dump.clone(),
        },
        ApplyOutcome::DecodeError(message) => OutcomeSummary::DecodeError {
            message: message.clone(),
        },
    }
}

pub fn render_outcome(outcome: &ApplyOutcome) -> String {
    let mut out = String::new();
    match outcome {
        ApplyOutcome::Success(report) => {
            let _ = writeln!(
                out,
                "merged: {} applied, {} replaced, {} skipped, {} filtered",
                report.applied, report.replaced, report.skipped, report.filtered
            );
            for c in &report.conflicts {
                let _ = writeln!(
                    out,
                    "  {} {} {} -> {} ({})",
                    c.table,
                    c.opcode.map_or("-", |op| op.as_str()),
                    c.cause,
                    c.resolution,
                    c.rule
                );
            }
        }
        ApplyOutcome::Aborted { message, dump } => {
            let _ = writeln!(out, "aborted: {message}");
            if let Some(dump) = dump {
                out.push_str(dump);
            }
        }
        ApplyOutcome::DecodeError(message) => {
            let _ = writeln!(out, "decode error: {message}");
        }
    }
    out
}

pub fn merge_file(
    changeset: &Path,
    db: &Path,
    config: SessionConfig,
    description: &str,
) -> Result<ApplyOutcome, CliError> {
    let bytes = fs::read(changeset)?;
    info!(path = %changeset.display(), bytes = bytes.len(), "read changeset");
    let mut engine = Engine::new(open_storage(db)?).with_config(config);
    Ok(engine.merge_changeset(&bytes, description)?)
}

pub fn run_apply(
    changeset: &Path,
    db: &Path,
    config: Option<&Path>,
    description: &str,
    as_json: bool,
) -> Result<(), CliError> {
    let outcome = merge_file(changeset, db, load_config(config)?, description)?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&summarize(&outcome))?);
    } else {
        print!("{}", render_outcome(&outcome));
    }
    match outcome {
        ApplyOutcome::Success(_) => Ok(()),
        ApplyOutcome::Aborted { message, .. } | ApplyOutcome::DecodeError(message) => {
            Err(CliError::NotMerged(message))
        }
    }
}

// ============================================================================
// dump
// ============================================================================

pub fn render_dump(bytes: &[u8], storage: Option<&SqliteStorage>) -> Result<String, CliError> {
    let mut out = String::new();
    let mut reader = ChangeReader::new(bytes);
    for record in reader.by_ref() {
        let record = record?;
        out.push_str(&record.dump());
        if let Some(storage) = storage {
            match storage.current_row(&record) {
                Ok(Some(row)) => {
                    let _ = writeln!(out, "  local row {}", format_key(&row));
                }
                Ok(None) => out.push_str("  no local row\n"),
                Err(e) => {
                    let _ = writeln!(out, "  local row unavailable: {e}");
                }
            }
        }
    }
    if reader.fk_violations() > 0 {
        let _ = writeln!(out, "foreign key violations: {}", reader.fk_violations());
    }
    Ok(out)
}

pub fn run_dump(changeset: &Path, db: Option<&Path>) -> Result<(), CliError> {
    let bytes = fs::read(changeset)?;
    let storage = db.map(open_storage).transpose()?;
    print!("{}", render_dump(&bytes, storage.as_ref())?);
    Ok(())
}

// ============================================================================
// inspect
// ============================================================================

#[derive(Debug, Serialize)]
pub struct TxnSummary {
    pub id: i64,
    pub description: String,
    pub kind: &'static str,
    pub changes: usize,
}

#[derive(Debug, Serialize)]
pub struct Inspection {
    pub briefcase_id: String,
    pub parent_changeset: Option<String>,
    pub parent_index: Option<u64>,
    pub pending_txns: Vec<TxnSummary>,
}

pub fn inspect(db: &Path) -> Result<Inspection, CliError> {
    let engine = Engine::new(open_storage(db)?);
    let parent = engine.parent_changeset()?;
    let mut pending_txns = Vec::new();
    for txn in engine.storage().pending_txns()? {
        pending_txns.push(TxnSummary {
            id: txn.id.value(),
            description: txn.description,
            kind: txn.kind.as_str(),
            changes: decode_changeset(&txn.changeset)?.len(),
        });
    }
    Ok(Inspection {
        briefcase_id: engine.briefcase_id()?.to_string(),
        parent_changeset: parent.map(|(id, _)| id.to_string()),
        parent_index: parent.map(|(_, index)| index),
        pending_txns,
    })
}

pub fn run_inspect(db: &Path, as_json: bool) -> Result<(), CliError> {
    let inspection = inspect(db)?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&inspection)?);
        return Ok(());
    }
    println!("briefcase {}", inspection.briefcase_id);
    match (&inspection.parent_changeset, inspection.parent_index) {
        (Some(id), Some(index)) => println!("parent changeset #{index} {id}"),
        _ => println!("no changesets merged"),
    }
    println!("{} pending txns", inspection.pending_txns.len());
    for txn in &inspection.pending_txns {
        println!(
            "  {:>4} {:<6} {:>3} changes  {}",
            txn.id, txn.kind, txn.changes, txn.description
        );
    }
    Ok(())
}

// ============================================================================
// undo
// ============================================================================

pub fn run_undo(db: &Path) -> Result<(), CliError> {
    let mut engine = Engine::new(open_storage(db)?);
    info!(db = %db.display(), "reversing last txn");
    match engine.undo()? {
        UndoResult::Applied(report) => println!(
            "undid txn {} \"{}\": {} applied, {} skipped",
            report.txn, report.description, report.applied, report.skipped
        ),
        UndoResult::Empty => println!("nothing to undo"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use changemerge_core::{change::ChangeRecord, codec::encode_changeset, value::ColumnValue};

    const SCHEMA: &str = "CREATE TABLE app_Widget (Id INTEGER PRIMARY KEY, Name TEXT)";

    fn widget(id: i64, name: &str) -> ChangeRecord {
        ChangeRecord::insert(
            "app_Widget",
            vec![true, false],
            vec![ColumnValue::Integer(id), name.into()],
        )
    }

    fn setup() -> Result<(tempfile::TempDir, std::path::PathBuf), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let db = dir.path().join("local.db");
        open_storage(&db)?.execute_ddl(SCHEMA)?;
        Ok((dir, db))
    }

    #[test]
    fn config_loads_from_partial_json() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("session.json");
        fs::write(&path, r#"{"allow_foreign_key_violations": true, "skip_tables": ["app_Audit"]}"#)?;
        let config = load_config(Some(&path))?;
        assert!(config.allow_foreign_key_violations);
        assert!(!config.has_pending_local_txns);
        assert_eq!(config.internal_table_prefix, "ec_");
        assert!(config.is_filtered("app_Audit"));
        Ok(())
    }

    #[test]
    fn merge_file_applies_and_records_parent() -> Result<(), Box<dyn std::error::Error>> {
        let (dir, db) = setup()?;
        let file = dir.path().join("one.changeset");
        fs::write(&file, encode_changeset(&[widget(1, "one"), widget(2, "two")])?)?;

        let outcome = merge_file(&file, &db, SessionConfig::default(), "first")?;
        assert!(outcome.is_success());
        assert!(render_outcome(&outcome).starts_with("merged: 2 applied"));

        let inspection = inspect(&db)?;
        assert_eq!(inspection.parent_index, Some(0));
        assert!(inspection.pending_txns.is_empty());
        Ok(())
    }

    #[test]
    fn aborted_merge_renders_message_and_json_status() -> Result<(), Box<dyn std::error::Error>> {
        let (dir, db) = setup()?;
        let mut storage = open_storage(&db)?;
        storage.insert_row("app_Widget", vec![ColumnValue::Integer(1), "local".into()])?;
        storage.save_changes("local insert")?;
        drop(storage);

        let file = dir.path().join("clash.changeset");
        fs::write(&file, encode_changeset(&[widget(1, "remote")])?)?;
        let outcome = merge_file(&file, &db, SessionConfig::default(), "clash")?;
        assert!(render_outcome(&outcome).contains("PRIMARY KEY INSERT CONFLICT"));

        let json = serde_json::to_value(summarize(&outcome))?;
        assert_eq!(json["status"], "aborted");
        Ok(())
    }

    #[test]
    fn dump_shows_local_rows() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, db) = setup()?;
        let mut storage = open_storage(&db)?;
        storage.insert_row("app_Widget", vec![ColumnValue::Integer(1), "local".into()])?;

        let bytes = encode_changeset(&[widget(1, "remote"), widget(2, "new")])?;
        let text = render_dump(&bytes, Some(&storage))?;
        assert!(text.contains("INSERT app_Widget"));
        assert!(text.contains("local row (1, 'local')"));
        assert!(text.contains("no local row"));
        Ok(())
    }
}
