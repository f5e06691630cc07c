//! Combining and inverting change streams.
//!
//! Changes to the same row are consolidated with the storage engine's
//! changegroup rules:
//!
//! | Existing | Incoming | Result |
//! |----------|----------|--------|
//! | INSERT | INSERT | keep existing |
//! | INSERT | UPDATE | INSERT with updated values |
//! | INSERT | DELETE | nothing |
//! | UPDATE | INSERT | keep existing |
//! | UPDATE | UPDATE | single UPDATE original -> final |
//! | UPDATE | DELETE | DELETE of the original row |
//! | DELETE | INSERT | UPDATE if different, nothing if same |
//! | DELETE | UPDATE / DELETE | keep existing |

use std::collections::HashMap;

use crate::change::{ChangeRecord, DbOpcode};
use crate::codec::{ChangeReader, ChangesetWriter};
use crate::error::CoreError;

type RowKey = (String, Vec<String>);

#[derive(Default)]
pub struct ChangeGroup {
    entries: Vec<Option<ChangeRecord>>,
    index: HashMap<RowKey, usize>,
    tables: Vec<String>,
}

impl ChangeGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(Option::is_none)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn add(&mut self, record: ChangeRecord) -> Result<(), CoreError> {
        record.validate()?;
        let key = row_key(&record)?;
        if !self.tables.contains(&record.table) {
            self.tables.push(record.table.clone());
        }

        let Some(&slot) = self.index.get(&key) else {
            self.index.insert(key, self.entries.len());
            self.entries.push(Some(record));
            return Ok(());
        };

        if self.entries[slot]
            .as_ref()
            .is_some_and(|e| e.pk_columns != record.pk_columns)
        {
            return Err(CoreError::InvalidData(format!(
                "table {} changed shape between changesets",
                record.table
            )));
        }
        let Some(existing) = self.entries[slot].take() else {
            self.entries[slot] = Some(record);
            return Ok(());
        };

        match merge(existing, record) {
            Some(merged) => self.entries[slot] = Some(merged),
            None => {
                self.index.remove(&key);
            }
        }
        Ok(())
    }

    pub fn add_changeset(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        for record in ChangeReader::new(bytes) {
            self.add(record?)?;
        }
        Ok(())
    }

    /// Consolidated records, grouped by table in order of first appearance.
    pub fn into_records(self) -> Vec<ChangeRecord> {
        let tables = self.tables;
        let mut records: Vec<ChangeRecord> = self.entries.into_iter().flatten().collect();
        records.sort_by_key(|r| tables.iter().position(|t| *t == r.table));
        records
    }

    pub fn to_changeset(self) -> Result<Vec<u8>, CoreError> {
        let mut writer = ChangesetWriter::changeset();
        for record in self.into_records() {
            writer.write(&record)?;
        }
        Ok(writer.finish())
    }
}

fn row_key(record: &ChangeRecord) -> Result<RowKey, CoreError> {
    let pk = record.primary_key().ok_or_else(|| {
        CoreError::InvalidData(format!("change to {} has no key", record.table))
    })?;
    let parts = pk
        .iter()
        .map(|v| format!("{}:{v}", v.type_name()))
        .collect();
    Ok((record.table.to_ascii_lowercase(), parts))
}

fn merge(existing: ChangeRecord, incoming: ChangeRecord) -> Option<ChangeRecord> {
    let indirect = existing.indirect && incoming.indirect;
    let merged = match (existing.opcode, incoming.opcode) {
        (DbOpcode::Insert, DbOpcode::Insert)
        | (DbOpcode::Update, DbOpcode::Insert)
        | (DbOpcode::Delete, DbOpcode::Update)
        | (DbOpcode::Delete, DbOpcode::Delete) => Some(existing),

        (DbOpcode::Insert, DbOpcode::Delete) => None,

        (DbOpcode::Insert, DbOpcode::Update) => {
            let mut out = existing;
            for (slot, value) in out.new.iter_mut().zip(incoming.new) {
                if value.is_some() {
                    *slot = value;
                }
            }
            Some(out)
        }

        (DbOpcode::Update, DbOpcode::Update) => {
            let before: Vec<_> = existing
                .old
                .iter()
                .zip(&incoming.old)
                .map(|(a, b)| a.clone().or_else(|| b.clone()))
                .collect();
            let after: Vec<_> = incoming
                .new
                .iter()
                .zip(&existing.new)
                .map(|(b, a)| b.clone().or_else(|| a.clone()))
                .collect();
            normalize_update(existing, before, after)
        }

        (DbOpcode::Update, DbOpcode::Delete) => {
            let mut out = incoming;
            for (i, slot) in out.old.iter_mut().enumerate() {
                if existing.new[i].is_some() {
                    *slot = existing.old[i].clone();
                }
            }
            Some(out)
        }

        (DbOpcode::Delete, DbOpcode::Insert) => {
            let before = existing.old.clone();
            let after = incoming.new.clone();
            normalize_update(existing, before, after)
        }
    };
    merged.map(|r| r.with_indirect(indirect))
}

/// Turn a before/after pair into update form: keys stay on the old side,
/// unchanged columns become undefined. Returns `None` for a no-op.
fn normalize_update(
    template: ChangeRecord,
    before: Vec<Option<crate::value::ColumnValue>>,
    after: Vec<Option<crate::value::ColumnValue>>,
) -> Option<ChangeRecord> {
    let mut old = Vec::with_capacity(before.len());
    let mut new = Vec::with_capacity(after.len());
    let mut changed = false;
    for (i, (b, a)) in before.into_iter().zip(after).enumerate() {
        let is_pk = template.pk_columns[i];
        match a {
            Some(a) if b.as_ref() != Some(&a) => {
                changed = true;
                old.push(b);
                new.push(Some(a));
            }
            _ => {
                old.push(if is_pk { b } else { None });
                new.push(None);
            }
        }
    }
    changed.then(|| ChangeRecord {
        table: template.table,
        opcode: DbOpcode::Update,
        indirect: template.indirect,
        pk_columns: template.pk_columns,
        old,
        new,
    })
}

/// Concatenate two change streams into one consolidated changeset.
pub fn concat_changesets(first: &[u8], second: &[u8]) -> Result<Vec<u8>, CoreError> {
    let mut group = ChangeGroup::new();
    group.add_changeset(first)?;
    group.add_changeset(second)?;
    group.to_changeset()
}

/// Build the changeset that reverses `bytes`. Records are emitted in reverse
/// order so dependent rows are undone before the rows they depend on.
pub fn invert_changeset(bytes: &[u8]) -> Result<Vec<u8>, CoreError> {
    let records: Vec<ChangeRecord> = ChangeReader::new(bytes).collect::<Result<_, _>>()?;
    let mut writer = ChangesetWriter::changeset();
    for record in records.iter().rev() {
        if record.is_patch() {
            return Err(CoreError::InvalidData(format!(
                "cannot invert patchset change to {}",
                record.table
            )));
        }
        writer.write(&record.invert())?;
    }
    Ok(writer.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_changeset, encode_changeset};
    use crate::value::ColumnValue;

    const PK: [bool; 3] = [true, false, false];

    fn row(id: i64, name: &str, qty: i64) -> Vec<ColumnValue> {
        vec![id.into(), name.into(), qty.into()]
    }

    #[test]
    fn insert_then_update_collapses_to_insert() {
        let mut group = ChangeGroup::new();
        group
            .add(ChangeRecord::insert("app_Widget", PK.to_vec(), row(1, "a", 1)))
            .unwrap();
        group
            .add(ChangeRecord::update("app_Widget", PK.to_vec(), row(1, "a", 1), row(1, "a", 5)))
            .unwrap();
        let records = group.into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].opcode, DbOpcode::Insert);
        assert_eq!(records[0].new_value(2), Some(&ColumnValue::Integer(5)));
    }

    #[test]
    fn insert_then_delete_cancels() {
        let mut group = ChangeGroup::new();
        group
            .add(ChangeRecord::insert("app_Widget", PK.to_vec(), row(1, "a", 1)))
            .unwrap();
        group
            .add(ChangeRecord::delete("app_Widget", PK.to_vec(), row(1, "a", 1)))
            .unwrap();
        assert!(group.is_empty());

        group
            .add(ChangeRecord::insert("app_Widget", PK.to_vec(), row(1, "b", 2)))
            .unwrap();
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn update_chain_keeps_original_before_values() {
        let mut group = ChangeGroup::new();
        group
            .add(ChangeRecord::update("app_Widget", PK.to_vec(), row(1, "a", 1), row(1, "b", 1)))
            .unwrap();
        group
            .add(ChangeRecord::update("app_Widget", PK.to_vec(), row(1, "b", 1), row(1, "b", 3)))
            .unwrap();
        let records = group.into_records();
        assert_eq!(records[0].old_value(1), Some(&ColumnValue::from("a")));
        assert_eq!(records[0].new_value(1), Some(&ColumnValue::from("b")));
        assert_eq!(records[0].old_value(2), Some(&ColumnValue::Integer(1)));
        assert_eq!(records[0].new_value(2), Some(&ColumnValue::Integer(3)));
    }

    #[test]
    fn update_reverted_is_dropped() {
        let mut group = ChangeGroup::new();
        group
            .add(ChangeRecord::update("app_Widget", PK.to_vec(), row(1, "a", 1), row(1, "b", 1)))
            .unwrap();
        group
            .add(ChangeRecord::update("app_Widget", PK.to_vec(), row(1, "b", 1), row(1, "a", 1)))
            .unwrap();
        assert!(group.is_empty());
    }

    #[test]
    fn update_then_delete_deletes_original_row() {
        let mut group = ChangeGroup::new();
        group
            .add(ChangeRecord::update("app_Widget", PK.to_vec(), row(1, "a", 1), row(1, "b", 1)))
            .unwrap();
        group
            .add(ChangeRecord::delete("app_Widget", PK.to_vec(), row(1, "b", 1)))
            .unwrap();
        let records = group.into_records();
        assert_eq!(records[0].opcode, DbOpcode::Delete);
        assert_eq!(records[0].old_value(1), Some(&ColumnValue::from("a")));
    }

    #[test]
    fn delete_then_insert_becomes_update() {
        let mut group = ChangeGroup::new();
        group
            .add(ChangeRecord::delete("app_Widget", PK.to_vec(), row(1, "a", 1)))
            .unwrap();
        group
            .add(ChangeRecord::insert("app_Widget", PK.to_vec(), row(1, "a", 2)))
            .unwrap();
        let records = group.into_records();
        assert_eq!(records[0].opcode, DbOpcode::Update);
        assert_eq!(records[0].changed_columns(), vec![2]);
    }

    #[test]
    fn records_are_grouped_by_table() {
        let a = encode_changeset(&[
            ChangeRecord::insert("app_Widget", PK.to_vec(), row(1, "a", 1)),
            ChangeRecord::insert("ec_Class", vec![true, false], vec![1.into(), "C".into()]),
        ])
        .unwrap();
        let b = encode_changeset(&[ChangeRecord::insert("app_Widget", PK.to_vec(), row(2, "b", 1))])
            .unwrap();
        let tables: Vec<String> = decode_changeset(&concat_changesets(&a, &b).unwrap())
            .unwrap()
            .into_iter()
            .map(|r| r.table)
            .collect();
        assert_eq!(tables, vec!["app_Widget", "app_Widget", "ec_Class"]);
    }

    #[test]
    fn invert_reverses_order_and_opcodes() {
        let bytes = encode_changeset(&[
            ChangeRecord::insert("app_Widget", PK.to_vec(), row(1, "a", 1)),
            ChangeRecord::delete("app_Widget", PK.to_vec(), row(2, "b", 2)),
        ])
        .unwrap();
        let inverted = decode_changeset(&invert_changeset(&bytes).unwrap()).unwrap();
        assert_eq!(inverted[0].opcode, DbOpcode::Insert);
        assert_eq!(inverted[0].new_value(0), Some(&ColumnValue::Integer(2)));
        assert_eq!(inverted[1].opcode, DbOpcode::Delete);
    }
}
