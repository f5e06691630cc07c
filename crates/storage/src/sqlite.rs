use std::collections::HashSet;

use rusqlite::{Connection, params, params_from_iter, types::Value};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use changemerge_core::{
    change::{ChangeRecord, DbOpcode},
    changeset::{ChangesetKind, ChangesetProps},
    codec::{ChangesetWriter, unwrap_txn_blob, wrap_txn_blob},
    group::ChangeGroup,
    ids::{BriefcaseId, TxnId},
    value::{ColumnValue, ValueStage},
};

use crate::apply::FkViolation;
use crate::error::{StorageError, is_constraint_violation};
use crate::schema::{LOCAL_TABLE, PROPERTY_TABLE};
use crate::traits::{TableInfo, TxnRecord};

/// Name of the persisted flag that lets foreign-key violations through.
pub const DEBUG_ALLOW_FK_VIOLATIONS: &str = "DebugAllowFkViolations";
const BRIEFCASE_ID_KEY: &str = "BriefcaseId";

pub struct SqliteStorage {
    conn: Connection,
    /// Local edits made since the last `save_changes`.
    tracked: Vec<ChangeRecord>,
    pub(crate) in_pass: bool,
    /// Foreign-key violations already present when the current pass began.
    pub(crate) fk_baseline: HashSet<FkViolation>,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            tracked: Vec::new(),
            in_pass: false,
            fk_baseline: HashSet::new(),
        }
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run schema DDL. Schema statements are not captured as row changes.
    pub fn execute_ddl(&self, sql: &str) -> Result<(), StorageError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn table_info(&self, table: &str) -> Result<TableInfo, StorageError> {
        load_table_info(&self.conn, table)
    }

    pub fn get_row(
        &self,
        table: &str,
        key: &[ColumnValue],
    ) -> Result<Option<Vec<ColumnValue>>, StorageError> {
        let info = self.table_info(table)?;
        let key = key_columns(&info, key)?;
        fetch_row(&self.conn, &info, info.columns.len(), &key)
    }

    /// Every row of `table` in rowid order.
    pub fn all_rows(&self, table: &str) -> Result<Vec<Vec<ColumnValue>>, StorageError> {
        let info = self.table_info(table)?;
        let cols: Vec<String> = info.columns.iter().map(|c| quote(c)).collect();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY rowid",
            cols.join(", "),
            quote(&info.name)
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(cols.len());
            for i in 0..cols.len() {
                values.push(from_sql_value(row.get::<_, Value>(i)?));
            }
            out.push(values);
        }
        Ok(out)
    }

    pub fn row_count(&self, table: &str) -> Result<u64, StorageError> {
        let info = self.table_info(table)?;
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote(&info.name)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ========================================================================
    // Tracked local edits
    // ========================================================================

    pub fn insert_row(&mut self, table: &str, values: Vec<ColumnValue>) -> Result<(), StorageError> {
        self.require_idle()?;
        let info = self.table_info(table)?;
        if values.len() != info.columns.len() {
            return Err(StorageError::SchemaMismatch {
                table: info.name,
                reason: format!("expected {} values, got {}", info.columns.len(), values.len()),
            });
        }
        exec_insert(&self.conn, &info, &values).map_err(|e| constraint_or_sqlite(e, &info.name))?;
        self.tracked
            .push(ChangeRecord::insert(&info.name, info.pk_columns.clone(), values));
        Ok(())
    }

    pub fn update_row(
        &mut self,
        table: &str,
        key: &[ColumnValue],
        assignments: &[(&str, ColumnValue)],
    ) -> Result<(), StorageError> {
        self.require_idle()?;
        let info = self.table_info(table)?;
        let key_cols = key_columns(&info, key)?;
        let before = fetch_row(&self.conn, &info, info.columns.len(), &key_cols)?
            .ok_or_else(|| StorageError::NotFound(format!("row {key:?} in {}", info.name)))?;

        let mut after = before.clone();
        for (column, value) in assignments {
            let index = info.column_index(column).ok_or_else(|| {
                StorageError::NotFound(format!("column {column} in {}", info.name))
            })?;
            if info.pk_columns[index] {
                return Err(StorageError::Misuse(format!(
                    "cannot assign primary key column {column} of {}",
                    info.name
                )));
            }
            after[index] = value.clone();
        }
        if before == after {
            return Ok(());
        }

        let set: Vec<(usize, &ColumnValue)> = (0..after.len())
            .filter(|i| before[*i] != after[*i])
            .map(|i| (i, &after[i]))
            .collect();
        exec_update(&self.conn, &info, &set, &key_cols).map_err(|e| constraint_or_sqlite(e, &info.name))?;
        self.tracked.push(ChangeRecord::update(
            &info.name,
            info.pk_columns.clone(),
            before,
            after,
        ));
        Ok(())
    }

    pub fn delete_row(&mut self, table: &str, key: &[ColumnValue]) -> Result<(), StorageError> {
        self.require_idle()?;
        let info = self.table_info(table)?;
        let key_cols = key_columns(&info, key)?;
        let before = fetch_row(&self.conn, &info, info.columns.len(), &key_cols)?
            .ok_or_else(|| StorageError::NotFound(format!("row {key:?} in {}", info.name)))?;
        exec_delete(&self.conn, &info, &key_cols).map_err(|e| constraint_or_sqlite(e, &info.name))?;
        self.tracked
            .push(ChangeRecord::delete(&info.name, info.pk_columns.clone(), before));
        Ok(())
    }

    /// Insert or update a string property in `be_Prop`, tracked like any
    /// other local edit.
    pub fn save_property(&mut self, namespace: &str, name: &str, value: &str) -> Result<(), StorageError> {
        let key = property_key(namespace, name);
        if self.get_row(PROPERTY_TABLE, &key)?.is_some() {
            self.update_row(PROPERTY_TABLE, &key, &[("StrData", value.into())])
        } else {
            let mut row = key;
            row.extend([
                ColumnValue::Integer(0),
                value.into(),
                ColumnValue::Null,
                ColumnValue::Null,
            ]);
            self.insert_row(PROPERTY_TABLE, row)
        }
    }

    pub fn query_property(&self, namespace: &str, name: &str) -> Result<Option<String>, StorageError> {
        let row = self.get_row(PROPERTY_TABLE, &property_key(namespace, name))?;
        Ok(row.and_then(|r| r.get(5).and_then(|v| v.as_text().map(str::to_string))))
    }

    pub fn has_unsaved_changes(&self) -> bool {
        !self.tracked.is_empty()
    }

    /// Save tracked edits as one local txn. Returns `None` when the edits
    /// cancel out.
    pub fn save_changes(&mut self, description: &str) -> Result<Option<TxnId>, StorageError> {
        let mut group = ChangeGroup::new();
        for record in self.tracked.drain(..) {
            group.add(record)?;
        }
        let records = group.into_records();
        if records.is_empty() {
            debug!(description, "nothing to save");
            return Ok(None);
        }

        let kind = ChangesetProps::kind_of(&records);
        let mut writer = ChangesetWriter::changeset();
        for record in &records {
            writer.write(record)?;
        }
        let id = self.append_txn(description, kind, &writer.finish())?;
        debug!(txn = %id, changes = records.len(), "saved local txn");
        Ok(Some(id))
    }

    /// Append a changeset to the local txn log.
    pub fn append_txn(
        &mut self,
        description: &str,
        kind: ChangesetKind,
        changeset: &[u8],
    ) -> Result<TxnId, StorageError> {
        let blob = wrap_txn_blob(changeset)?;
        self.conn.execute(
            "INSERT INTO be_Txns (Operation, TxnType, Change) VALUES (?1, ?2, ?3)",
            params![description, kind_code(kind), blob],
        )?;
        let id = TxnId::new(self.conn.last_insert_rowid());
        debug!(txn = %id, description, kind = kind.as_str(), "appended local txn");
        Ok(id)
    }

    /// Reverse tracked edits that were never saved.
    pub fn abandon_changes(&mut self) -> Result<usize, StorageError> {
        self.require_idle()?;
        let records: Vec<ChangeRecord> = self.tracked.drain(..).collect();
        let count = records.len();
        self.conn.execute_batch("SAVEPOINT abandon_changes")?;
        for record in records.iter().rev() {
            if let Err(e) = write_record(&self.conn, &record.invert()) {
                self.conn
                    .execute_batch("ROLLBACK TO abandon_changes; RELEASE abandon_changes")?;
                return Err(e);
            }
        }
        self.conn.execute_batch("RELEASE abandon_changes")?;
        if count > 0 {
            warn!(count, "abandoned unsaved local changes");
        }
        Ok(count)
    }

    // ========================================================================
    // Local txn log
    // ========================================================================

    pub fn pending_txns(&self) -> Result<Vec<TxnRecord>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT Id, Operation, TxnType, Change FROM be_Txns ORDER BY Id")?;
        let rows = stmt.query_map([], read_txn_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode_txn(row?)?);
        }
        Ok(out)
    }

    pub fn last_txn(&self) -> Result<Option<TxnRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT Id, Operation, TxnType, Change FROM be_Txns ORDER BY Id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], read_txn_row)?;
        match rows.next() {
            Some(row) => Ok(Some(decode_txn(row?)?)),
            None => Ok(None),
        }
    }

    pub fn delete_txn(&mut self, id: TxnId) -> Result<(), StorageError> {
        let n = self
            .conn
            .execute("DELETE FROM be_Txns WHERE Id = ?1", params![id.value()])?;
        if n == 0 {
            return Err(StorageError::NotFound(format!("txn {id}")));
        }
        Ok(())
    }

    /// All pending txns consolidated into one changeset.
    pub fn pending_changeset(&self) -> Result<Option<Vec<u8>>, StorageError> {
        let txns = self.pending_txns()?;
        if txns.is_empty() {
            return Ok(None);
        }
        let mut group = ChangeGroup::new();
        for txn in &txns {
            group.add_changeset(&txn.changeset)?;
        }
        if group.is_empty() {
            return Ok(None);
        }
        Ok(Some(group.to_changeset()?))
    }

    pub fn drop_pending_txns(&mut self) -> Result<usize, StorageError> {
        Ok(self.conn.execute("DELETE FROM be_Txns", [])?)
    }

    // ========================================================================
    // Briefcase-local values
    // ========================================================================

    pub fn save_local<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StorageError> {
        let bytes = rmp_serde::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.conn.execute(
            "INSERT INTO be_Local (Name, Val) VALUES (?1, ?2)
             ON CONFLICT(Name) DO UPDATE SET Val = excluded.Val",
            params![name, bytes],
        )?;
        Ok(())
    }

    pub fn query_local<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StorageError> {
        let mut stmt = self.conn.prepare("SELECT Val FROM be_Local WHERE Name = ?1")?;
        let mut rows = stmt.query_map(params![name], |row| row.get::<_, Option<Vec<u8>>>(0))?;
        match rows.next() {
            Some(Ok(Some(bytes))) => rmp_serde::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Serialization(e.to_string())),
            Some(Ok(None)) | None => Ok(None),
            Some(Err(e)) => Err(StorageError::Sqlite(e)),
        }
    }

    pub fn delete_local(&self, name: &str) -> Result<(), StorageError> {
        self.conn
            .execute(&format!("DELETE FROM {LOCAL_TABLE} WHERE Name = ?1"), params![name])?;
        Ok(())
    }

    pub fn set_debug_allow_fk_violations(&self, allow: bool) -> Result<(), StorageError> {
        if allow {
            self.save_local(DEBUG_ALLOW_FK_VIOLATIONS, &true)
        } else {
            self.delete_local(DEBUG_ALLOW_FK_VIOLATIONS)
        }
    }

    /// The id of this briefcase, assigned on first use.
    pub fn briefcase_id(&self) -> Result<BriefcaseId, StorageError> {
        if let Some(id) = self.query_local::<BriefcaseId>(BRIEFCASE_ID_KEY)? {
            return Ok(id);
        }
        let id = BriefcaseId::new();
        self.save_local(BRIEFCASE_ID_KEY, &id)?;
        Ok(id)
    }

    fn require_idle(&self) -> Result<(), StorageError> {
        if self.in_pass {
            return Err(StorageError::Misuse(
                "local edits are not allowed while a changeset is being applied".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SQL helpers
// ============================================================================

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub(crate) fn to_sql_value(value: &ColumnValue) -> Value {
    match value {
        ColumnValue::Null => Value::Null,
        ColumnValue::Integer(n) => Value::Integer(*n),
        ColumnValue::Real(r) => Value::Real(*r),
        ColumnValue::Text(s) => Value::Text(s.clone()),
        ColumnValue::Blob(b) => Value::Blob(b.clone()),
    }
}

pub(crate) fn from_sql_value(value: Value) -> ColumnValue {
    match value {
        Value::Null => ColumnValue::Null,
        Value::Integer(n) => ColumnValue::Integer(n),
        Value::Real(r) => ColumnValue::Real(r),
        Value::Text(s) => ColumnValue::Text(s),
        Value::Blob(b) => ColumnValue::Blob(b),
    }
}

pub(crate) fn load_table_info(conn: &Connection, table: &str) -> Result<TableInfo, StorageError> {
    let mut stmt = conn.prepare("SELECT name, pk FROM pragma_table_info(?1) ORDER BY cid")?;
    let rows = stmt.query_map(params![table], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut columns = Vec::new();
    let mut pk_columns = Vec::new();
    for row in rows {
        let (name, pk) = row?;
        columns.push(name);
        pk_columns.push(pk > 0);
    }
    if columns.is_empty() {
        return Err(StorageError::NotFound(format!("table {table}")));
    }
    Ok(TableInfo {
        name: table.to_string(),
        columns,
        pk_columns,
    })
}

fn key_columns<'a>(
    info: &TableInfo,
    key: &'a [ColumnValue],
) -> Result<Vec<(usize, &'a ColumnValue)>, StorageError> {
    let pk: Vec<usize> = (0..info.columns.len())
        .filter(|i| info.pk_columns[*i])
        .collect();
    if pk.len() != key.len() {
        return Err(StorageError::SchemaMismatch {
            table: info.name.clone(),
            reason: format!("primary key has {} columns, got {}", pk.len(), key.len()),
        });
    }
    Ok(pk.into_iter().zip(key).collect())
}

/// Primary-key columns of `record` on the side that identifies the row.
pub(crate) fn record_key(record: &ChangeRecord) -> Vec<(usize, &ColumnValue)> {
    let stage = match record.opcode {
        DbOpcode::Insert => ValueStage::New,
        DbOpcode::Update | DbOpcode::Delete => ValueStage::Old,
    };
    record
        .pk_indices()
        .into_iter()
        .filter_map(|i| record.value(i, stage).map(|v| (i, v)))
        .collect()
}

pub(crate) fn fetch_row(
    conn: &Connection,
    info: &TableInfo,
    n_cols: usize,
    key: &[(usize, &ColumnValue)],
) -> Result<Option<Vec<ColumnValue>>, StorageError> {
    let cols: Vec<String> = info.columns[..n_cols].iter().map(|c| quote(c)).collect();
    let filter: Vec<String> = key
        .iter()
        .enumerate()
        .map(|(n, (i, _))| format!("{} IS ?{}", quote(&info.columns[*i]), n + 1))
        .collect();
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        cols.join(", "),
        quote(&info.name),
        filter.join(" AND ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let values: Vec<Value> = key.iter().map(|(_, v)| to_sql_value(v)).collect();
    let mut rows = stmt.query(params_from_iter(values.iter()))?;
    match rows.next()? {
        Some(row) => {
            let mut out = Vec::with_capacity(n_cols);
            for i in 0..n_cols {
                out.push(from_sql_value(row.get::<_, Value>(i)?));
            }
            Ok(Some(out))
        }
        None => Ok(None),
    }
}

pub(crate) fn exec_insert(
    conn: &Connection,
    info: &TableInfo,
    values: &[ColumnValue],
) -> rusqlite::Result<usize> {
    let cols: Vec<String> = info.columns[..values.len()].iter().map(|c| quote(c)).collect();
    let placeholders: Vec<String> = (1..=values.len()).map(|n| format!("?{n}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(&info.name),
        cols.join(", "),
        placeholders.join(", ")
    );
    let values: Vec<Value> = values.iter().map(to_sql_value).collect();
    conn.execute(&sql, params_from_iter(values.iter()))
}

pub(crate) fn exec_update(
    conn: &Connection,
    info: &TableInfo,
    set: &[(usize, &ColumnValue)],
    key: &[(usize, &ColumnValue)],
) -> rusqlite::Result<usize> {
    if set.is_empty() {
        return Ok(0);
    }
    let mut n = 0;
    let mut next = || {
        n += 1;
        n
    };
    let assignments: Vec<String> = set
        .iter()
        .map(|(i, _)| format!("{} = ?{}", quote(&info.columns[*i]), next()))
        .collect();
    let filter: Vec<String> = key
        .iter()
        .map(|(i, _)| format!("{} IS ?{}", quote(&info.columns[*i]), next()))
        .collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        quote(&info.name),
        assignments.join(", "),
        filter.join(" AND ")
    );
    let values: Vec<Value> = set
        .iter()
        .chain(key)
        .map(|(_, v)| to_sql_value(v))
        .collect();
    conn.execute(&sql, params_from_iter(values.iter()))
}

pub(crate) fn exec_delete(
    conn: &Connection,
    info: &TableInfo,
    key: &[(usize, &ColumnValue)],
) -> rusqlite::Result<usize> {
    let filter: Vec<String> = key
        .iter()
        .enumerate()
        .map(|(n, (i, _))| format!("{} IS ?{}", quote(&info.columns[*i]), n + 1))
        .collect();
    let sql = format!("DELETE FROM {} WHERE {}", quote(&info.name), filter.join(" AND "));
    let values: Vec<Value> = key.iter().map(|(_, v)| to_sql_value(v)).collect();
    conn.execute(&sql, params_from_iter(values.iter()))
}

/// Write a record without any conflict checks. Constraint failures are
/// returned, never resolved by displacing other rows.
pub(crate) fn write_record(conn: &Connection, record: &ChangeRecord) -> Result<(), StorageError> {
    let info = load_table_info(conn, &record.table)?;
    let key = record_key(record);
    let result = match record.opcode {
        DbOpcode::Insert => {
            let values: Vec<ColumnValue> = record.new.iter().flatten().cloned().collect();
            exec_insert(conn, &info, &values)
        }
        DbOpcode::Update => {
            let set: Vec<(usize, &ColumnValue)> = record
                .changed_columns()
                .into_iter()
                .filter_map(|i| record.new_value(i).map(|v| (i, v)))
                .collect();
            exec_update(conn, &info, &set, &key)
        }
        DbOpcode::Delete => exec_delete(conn, &info, &key),
    };
    result.map(|_| ()).map_err(|e| constraint_or_sqlite(e, &record.table))
}

pub(crate) fn constraint_or_sqlite(err: rusqlite::Error, table: &str) -> StorageError {
    if is_constraint_violation(&err) {
        StorageError::ConstraintViolation(format!("{table}: {err}"))
    } else {
        StorageError::Sqlite(err)
    }
}

fn property_key(namespace: &str, name: &str) -> Vec<ColumnValue> {
    vec![
        namespace.into(),
        name.into(),
        ColumnValue::Integer(0),
        ColumnValue::Integer(0),
    ]
}

fn kind_code(kind: ChangesetKind) -> i64 {
    match kind {
        ChangesetKind::Data => 0,
        ChangesetKind::Schema => 1,
    }
}

type TxnRow = (i64, Option<String>, i64, Vec<u8>);

fn read_txn_row(row: &rusqlite::Row) -> rusqlite::Result<TxnRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_txn((id, operation, txn_type, blob): TxnRow) -> Result<TxnRecord, StorageError> {
    let kind = match txn_type {
        0 => ChangesetKind::Data,
        1 => ChangesetKind::Schema,
        other => {
            return Err(StorageError::Serialization(format!(
                "unknown txn type {other} for txn {id}"
            )));
        }
    };
    Ok(TxnRecord {
        id: TxnId::new(id),
        description: operation.unwrap_or_default(),
        kind,
        changeset: unwrap_txn_blob(&blob)?.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use changemerge_core::codec::decode_changeset;

    fn storage() -> Result<SqliteStorage, Box<dyn std::error::Error>> {
        let storage = SqliteStorage::open_in_memory()?;
        storage.execute_ddl("CREATE TABLE app_Note (Id INTEGER PRIMARY KEY, Body TEXT)")?;
        Ok(storage)
    }

    fn note(id: i64, body: &str) -> Vec<ColumnValue> {
        vec![ColumnValue::Integer(id), body.into()]
    }

    #[test]
    fn saved_edits_become_one_consolidated_txn() -> Result<(), Box<dyn std::error::Error>> {
        let mut s = storage()?;
        s.insert_row("app_Note", note(1, "draft"))?;
        s.update_row("app_Note", &[ColumnValue::Integer(1)], &[("Body", "final".into())])?;
        s.insert_row("app_Note", note(2, "gone"))?;
        s.delete_row("app_Note", &[ColumnValue::Integer(2)])?;
        assert!(s.has_unsaved_changes());

        let id = s.save_changes("edit notes")?;
        assert!(id.is_some());
        assert!(!s.has_unsaved_changes());

        let txns = s.pending_txns()?;
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].description, "edit notes");
        let records = decode_changeset(&txns[0].changeset)?;
        assert_eq!(records, vec![ChangeRecord::insert(
            "app_Note",
            vec![true, false],
            note(1, "final")
        )]);
        Ok(())
    }

    #[test]
    fn cancelled_edits_save_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let mut s = storage()?;
        s.insert_row("app_Note", note(1, "x"))?;
        s.delete_row("app_Note", &[ColumnValue::Integer(1)])?;
        assert_eq!(s.save_changes("noop")?, None);
        assert!(s.pending_txns()?.is_empty());
        Ok(())
    }

    #[test]
    fn abandon_restores_rows() -> Result<(), Box<dyn std::error::Error>> {
        let mut s = storage()?;
        s.insert_row("app_Note", note(1, "kept"))?;
        s.save_changes("seed")?;
        s.update_row("app_Note", &[ColumnValue::Integer(1)], &[("Body", "changed".into())])?;
        s.insert_row("app_Note", note(2, "new"))?;
        assert_eq!(s.abandon_changes()?, 2);
        assert_eq!(s.get_row("app_Note", &[ColumnValue::Integer(1)])?, Some(note(1, "kept")));
        assert_eq!(s.row_count("app_Note")?, 1);
        Ok(())
    }

    #[test]
    fn abandon_never_displaces_rows_on_a_unique_index() -> Result<(), Box<dyn std::error::Error>> {
        let mut s = storage()?;
        s.execute_ddl("CREATE TABLE app_Tag (Id INTEGER PRIMARY KEY, Name TEXT UNIQUE)")?;
        s.insert_row("app_Tag", note(1, "red"))?;
        s.save_changes("seed")?;
        s.delete_row("app_Tag", &[ColumnValue::Integer(1)])?;
        s.conn()
            .execute("INSERT INTO app_Tag (Id, Name) VALUES (2, 'red')", [])?;

        assert!(matches!(
            s.abandon_changes(),
            Err(StorageError::ConstraintViolation(_))
        ));
        assert_eq!(s.get_row("app_Tag", &[ColumnValue::Integer(2)])?, Some(note(2, "red")));
        assert_eq!(s.get_row("app_Tag", &[ColumnValue::Integer(1)])?, None);
        Ok(())
    }

    #[test]
    fn primary_key_assignment_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let mut s = storage()?;
        s.insert_row("app_Note", note(1, "x"))?;
        let err = s.update_row("app_Note", &[ColumnValue::Integer(1)], &[("Id", ColumnValue::Integer(2))]);
        assert!(matches!(err, Err(StorageError::Misuse(_))));
        Ok(())
    }

    #[test]
    fn properties_round_trip_through_be_prop() -> Result<(), Box<dyn std::error::Error>> {
        let mut s = storage()?;
        assert_eq!(s.query_property("ec_Db", "localDbInfo")?, None);
        s.save_property("ec_Db", "localDbInfo", "{\"v\":1}")?;
        s.save_property("ec_Db", "localDbInfo", "{\"v\":2}")?;
        assert_eq!(
            s.query_property("EC_DB", "localdbinfo")?.as_deref(),
            Some("{\"v\":2}")
        );
        Ok(())
    }

    #[test]
    fn briefcase_id_is_stable() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("local.db");
        let path = path.to_str().ok_or("non-utf8 path")?;
        let first = SqliteStorage::open(path)?.briefcase_id()?;
        let second = SqliteStorage::open(path)?.briefcase_id()?;
        assert_eq!(first, second);
        Ok(())
    }
}
