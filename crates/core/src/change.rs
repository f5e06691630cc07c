use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::value::{ColumnValue, ValueStage};

/// Row-level operation carried by a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DbOpcode {
    Insert,
    Update,
    Delete,
}

impl DbOpcode {
    pub const INSERT_CODE: u8 = 18;
    pub const UPDATE_CODE: u8 = 23;
    pub const DELETE_CODE: u8 = 9;

    pub fn code(self) -> u8 {
        match self {
            Self::Insert => Self::INSERT_CODE,
            Self::Update => Self::UPDATE_CODE,
            Self::Delete => Self::DELETE_CODE,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            Self::INSERT_CODE => Some(Self::Insert),
            Self::UPDATE_CODE => Some(Self::Update),
            Self::DELETE_CODE => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    pub fn inverse(self) -> Self {
        match self {
            Self::Insert => Self::Delete,
            Self::Update => Self::Update,
            Self::Delete => Self::Insert,
        }
    }
}

impl fmt::Display for DbOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One column of a change record viewed from both stages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnChange<'a> {
    pub index: usize,
    pub is_pk: bool,
    pub old: Option<&'a ColumnValue>,
    pub new: Option<&'a ColumnValue>,
}

impl ColumnChange<'_> {
    pub fn old_is_null(&self) -> bool {
        self.old.is_some_and(ColumnValue::is_null)
    }

    pub fn new_is_null(&self) -> bool {
        self.new.is_some_and(ColumnValue::is_null)
    }
}

/// A single row-level mutation read from, or written to, a change stream.
///
/// `old` and `new` are either empty (stage not present for the opcode) or
/// hold exactly one slot per column. A `None` slot is an undefined value: an
/// unchanged column of an update, or a non-key column of a patchset record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub table: String,
    pub opcode: DbOpcode,
    pub indirect: bool,
    pub pk_columns: Vec<bool>,
    pub old: Vec<Option<ColumnValue>>,
    pub new: Vec<Option<ColumnValue>>,
}

impl ChangeRecord {
    pub fn insert(table: &str, pk_columns: Vec<bool>, values: Vec<ColumnValue>) -> Self {
        Self {
            table: table.to_string(),
            opcode: DbOpcode::Insert,
            indirect: false,
            pk_columns,
            old: Vec::new(),
            new: values.into_iter().map(Some).collect(),
        }
    }

    pub fn delete(table: &str, pk_columns: Vec<bool>, values: Vec<ColumnValue>) -> Self {
        Self {
            table: table.to_string(),
            opcode: DbOpcode::Delete,
            indirect: false,
            pk_columns,
            old: values.into_iter().map(Some).collect(),
            new: Vec::new(),
        }
    }

    /// Build an update from full before/after rows. Key columns are kept in
    /// the old record; columns whose value did not change are left undefined.
    pub fn update(
        table: &str,
        pk_columns: Vec<bool>,
        before: Vec<ColumnValue>,
        after: Vec<ColumnValue>,
    ) -> Self {
        let mut old = Vec::with_capacity(before.len());
        let mut new = Vec::with_capacity(after.len());
        for (index, (b, a)) in before.into_iter().zip(after).enumerate() {
            let is_pk = pk_columns.get(index).copied().unwrap_or(false);
            if b == a {
                old.push(is_pk.then_some(b));
                new.push(None);
            } else {
                old.push(Some(b));
                new.push(Some(a));
            }
        }
        Self {
            table: table.to_string(),
            opcode: DbOpcode::Update,
            indirect: false,
            pk_columns,
            old,
            new,
        }
    }

    pub fn with_indirect(mut self, indirect: bool) -> Self {
        self.indirect = indirect;
        self
    }

    pub fn column_count(&self) -> usize {
        self.pk_columns.len()
    }

    pub fn pk_indices(&self) -> Vec<usize> {
        self.pk_columns
            .iter()
            .enumerate()
            .filter_map(|(i, is_pk)| is_pk.then_some(i))
            .collect()
    }

    pub fn value(&self, column: usize, stage: ValueStage) -> Option<&ColumnValue> {
        let values = match stage {
            ValueStage::Old => &self.old,
            ValueStage::New => &self.new,
        };
        values.get(column).and_then(Option::as_ref)
    }

    pub fn old_value(&self, column: usize) -> Option<&ColumnValue> {
        self.value(column, ValueStage::Old)
    }

    pub fn new_value(&self, column: usize) -> Option<&ColumnValue> {
        self.value(column, ValueStage::New)
    }

    pub fn columns(&self) -> impl Iterator<Item = ColumnChange<'_>> + '_ {
        self.pk_columns
            .iter()
            .enumerate()
            .map(move |(index, is_pk)| ColumnChange {
                index,
                is_pk: *is_pk,
                old: self.old_value(index),
                new: self.new_value(index),
            })
    }

    /// Primary-key values identifying the affected row.
    pub fn primary_key(&self) -> Option<Vec<ColumnValue>> {
        let stage = match self.opcode {
            DbOpcode::Insert => ValueStage::New,
            DbOpcode::Update | DbOpcode::Delete => ValueStage::Old,
        };
        self.pk_indices()
            .into_iter()
            .map(|i| self.value(i, stage).cloned())
            .collect()
    }

    /// Primary-key values the row carries after the change (updates may move
    /// a row to a new key).
    pub fn new_primary_key(&self) -> Option<Vec<ColumnValue>> {
        match self.opcode {
            DbOpcode::Delete => None,
            DbOpcode::Insert => self.primary_key(),
            DbOpcode::Update => self
                .pk_indices()
                .into_iter()
                .map(|i| self.new_value(i).or_else(|| self.old_value(i)).cloned())
                .collect(),
        }
    }

    /// Non-key columns assigned by an update.
    pub fn changed_columns(&self) -> Vec<usize> {
        (0..self.column_count())
            .filter(|i| self.new_value(*i).is_some())
            .collect()
    }

    /// Whether the record only carries key columns on its old side.
    pub fn is_patch(&self) -> bool {
        match self.opcode {
            DbOpcode::Insert => false,
            DbOpcode::Update | DbOpcode::Delete => self
                .columns()
                .any(|c| !c.is_pk && c.old.is_none() && (self.opcode == DbOpcode::Delete || c.new.is_some())),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let n = self.column_count();
        if n == 0 {
            return Err(CoreError::InvalidData(format!(
                "change to {} has no columns",
                self.table
            )));
        }
        if !self.pk_columns.iter().any(|pk| *pk) {
            return Err(CoreError::InvalidData(format!(
                "table {} has no primary key columns",
                self.table
            )));
        }
        let (want_old, want_new) = match self.opcode {
            DbOpcode::Insert => (false, true),
            DbOpcode::Update => (true, true),
            DbOpcode::Delete => (true, false),
        };
        for (present, values, label) in [(want_old, &self.old, "old"), (want_new, &self.new, "new")] {
            let expected = if present { n } else { 0 };
            if values.len() != expected {
                return Err(CoreError::InvalidData(format!(
                    "{} change to {} has {} {label} values, expected {expected}",
                    self.opcode,
                    self.table,
                    values.len()
                )));
            }
        }
        if self.primary_key().is_none() {
            return Err(CoreError::InvalidData(format!(
                "{} change to {} is missing primary key values",
                self.opcode, self.table
            )));
        }
        Ok(())
    }

    /// The record that undoes this one.
    pub fn invert(&self) -> Self {
        let (old, new) = match self.opcode {
            DbOpcode::Insert | DbOpcode::Delete => (self.new.clone(), self.old.clone()),
            DbOpcode::Update => {
                let mut old = Vec::with_capacity(self.column_count());
                let mut new = Vec::with_capacity(self.column_count());
                for c in self.columns() {
                    match c.new {
                        Some(after) => {
                            old.push(Some(after.clone()));
                            new.push(c.old.cloned());
                        }
                        None => {
                            old.push(c.old.cloned());
                            new.push(None);
                        }
                    }
                }
                (old, new)
            }
        };
        Self {
            table: self.table.clone(),
            opcode: self.opcode.inverse(),
            indirect: self.indirect,
            pk_columns: self.pk_columns.clone(),
            old,
            new,
        }
    }

    /// Multi-line rendering used in conflict diagnostics.
    pub fn dump(&self) -> String {
        let mut out = format!(
            "{} {}{}\n",
            self.opcode,
            self.table,
            if self.indirect { " (indirect)" } else { "" }
        );
        for c in self.columns() {
            let old = c.old.map_or_else(|| "-".to_string(), ToString::to_string);
            let new = c.new.map_or_else(|| "-".to_string(), ToString::to_string);
            out.push_str(&format!(
                "  [{}]{} old={} new={}\n",
                c.index,
                if c.is_pk { " pk" } else { "" },
                old,
                new
            ));
        }
        out
    }
}

pub fn format_key(values: &[ColumnValue]) -> String {
    let parts: Vec<String> = values.iter().map(ToString::to_string).collect();
    format!("({})", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget_update() -> ChangeRecord {
        ChangeRecord::update(
            "app_Widget",
            vec![true, false, false],
            vec![1.into(), "bolt".into(), 4.into()],
            vec![1.into(), "bolt".into(), 9.into()],
        )
    }

    #[test]
    fn update_leaves_unchanged_columns_undefined() {
        let rec = widget_update();
        assert_eq!(rec.old_value(0), Some(&ColumnValue::Integer(1)));
        assert_eq!(rec.old_value(1), None);
        assert_eq!(rec.new_value(1), None);
        assert_eq!(rec.new_value(2), Some(&ColumnValue::Integer(9)));
        assert_eq!(rec.changed_columns(), vec![2]);
        assert_eq!(rec.primary_key(), Some(vec![ColumnValue::Integer(1)]));
        assert!(rec.validate().is_ok());
    }

    #[test]
    fn invert_update_swaps_changed_values() {
        let inv = widget_update().invert();
        assert_eq!(inv.opcode, DbOpcode::Update);
        assert_eq!(inv.old_value(0), Some(&ColumnValue::Integer(1)));
        assert_eq!(inv.old_value(2), Some(&ColumnValue::Integer(9)));
        assert_eq!(inv.new_value(2), Some(&ColumnValue::Integer(4)));
        assert_eq!(inv.new_value(0), None);
        assert_eq!(inv.invert(), widget_update());
    }

    #[test]
    fn invert_insert_is_delete() {
        let ins = ChangeRecord::insert("t", vec![true, false], vec![7.into(), "x".into()]);
        let inv = ins.invert();
        assert_eq!(inv.opcode, DbOpcode::Delete);
        assert_eq!(inv.old_value(1), Some(&ColumnValue::from("x")));
        assert!(inv.new.is_empty());
    }

    #[test]
    fn validate_rejects_missing_key() {
        let rec = ChangeRecord::insert("t", vec![false, false], vec![1.into(), 2.into()]);
        assert!(rec.validate().is_err());

        let mut rec = ChangeRecord::delete("t", vec![true, false], vec![1.into(), 2.into()]);
        rec.old[0] = None;
        assert!(rec.validate().is_err());
    }

    #[test]
    fn dump_marks_key_columns() {
        let text = widget_update().dump();
        assert!(text.starts_with("UPDATE app_Widget"));
        assert!(text.contains("[0] pk old=1 new=-"));
        assert!(text.contains("[2] old=4 new=9"));
    }
}
