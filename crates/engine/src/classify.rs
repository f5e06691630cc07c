use changemerge_core::{
    change::{ChangeRecord, DbOpcode},
    conflict::ConflictCause,
};
use changemerge_storage::schema::PROPERTY_TABLE;

/// Property row whose value must always follow the incoming changeset.
pub const SCHEMA_PROPERTY_NAMESPACE: &str = "ec_Db";
pub const SCHEMA_PROPERTY_NAME: &str = "localDbInfo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableClass {
    User,
    /// Name carries the internal-table prefix.
    Internal,
    /// The `ec_Db`/`localDbInfo` row of the property table.
    SchemaProperty,
}

/// Everything the resolution policy needs to know about one conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub cause: ConflictCause,
    pub opcode: Option<DbOpcode>,
    pub indirect: bool,
    pub pending: bool,
    pub table_class: TableClass,
}

/// Classify a conflict. `record` is `None` only for the session-level
/// foreign-key conflict.
pub fn classify(
    cause: ConflictCause,
    record: Option<&ChangeRecord>,
    pending: bool,
    internal_prefix: &str,
) -> Classification {
    Classification {
        cause,
        opcode: record.map(|r| r.opcode),
        indirect: record.is_some_and(|r| r.indirect),
        pending,
        table_class: record.map_or(TableClass::User, |r| table_class(r, internal_prefix)),
    }
}

fn table_class(record: &ChangeRecord, internal_prefix: &str) -> TableClass {
    if changemerge_core::changeset::is_internal_table(&record.table, internal_prefix) {
        TableClass::Internal
    } else if is_schema_property(record) {
        TableClass::SchemaProperty
    } else {
        TableClass::User
    }
}

fn is_schema_property(record: &ChangeRecord) -> bool {
    if !record.table.eq_ignore_ascii_case(PROPERTY_TABLE) {
        return false;
    }
    let Some(key) = record.primary_key() else {
        return false;
    };
    let text = |i: usize| key.get(i).and_then(|v| v.as_text());
    text(0).is_some_and(|ns| ns.eq_ignore_ascii_case(SCHEMA_PROPERTY_NAMESPACE))
        && text(1).is_some_and(|name| name.eq_ignore_ascii_case(SCHEMA_PROPERTY_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use changemerge_core::value::ColumnValue;

    fn prop_update(namespace: &str, name: &str) -> ChangeRecord {
        let key = |data: &str| {
            vec![
                ColumnValue::from(namespace),
                name.into(),
                ColumnValue::Integer(0),
                ColumnValue::Integer(0),
                ColumnValue::Integer(0),
                data.into(),
                ColumnValue::Null,
                ColumnValue::Null,
            ]
        };
        ChangeRecord::update(
            "be_Prop",
            vec![true, true, true, true, false, false, false, false],
            key("old"),
            key("new"),
        )
    }

    #[test]
    fn internal_prefix_wins_over_user() {
        let rec = ChangeRecord::insert("ec_Class", vec![true], vec![ColumnValue::Integer(1)]);
        let c = classify(ConflictCause::Conflict, Some(&rec), true, "ec_");
        assert_eq!(c.table_class, TableClass::Internal);
        assert_eq!(c.opcode, Some(DbOpcode::Insert));
    }

    #[test]
    fn schema_property_row_is_recognized() {
        let c = classify(
            ConflictCause::Data,
            Some(&prop_update("ec_Db", "localDbInfo")),
            true,
            "ec_",
        );
        assert_eq!(c.table_class, TableClass::SchemaProperty);

        let other = classify(
            ConflictCause::Data,
            Some(&prop_update("ec_Db", "somethingElse")),
            true,
            "ec_",
        );
        assert_eq!(other.table_class, TableClass::User);
    }

    #[test]
    fn session_level_conflict_has_no_record() {
        let c = classify(ConflictCause::ForeignKey, None, false, "ec_");
        assert_eq!(c.opcode, None);
        assert!(!c.indirect);
        assert_eq!(c.table_class, TableClass::User);
    }
}
