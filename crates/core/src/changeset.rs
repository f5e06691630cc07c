use serde::{Deserialize, Serialize};

use crate::change::ChangeRecord;
use crate::codec::ChangeReader;
use crate::error::CoreError;
use crate::ids::ChangesetId;

/// Reserved prefix of internal schema tables.
pub const INTERNAL_TABLE_PREFIX: &str = "ec_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangesetKind {
    Data,
    Schema,
}

impl ChangesetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Schema => "schema",
        }
    }
}

/// Metadata about the logical operation a changeset was produced by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetProps {
    pub id: ChangesetId,
    pub parent_id: Option<ChangesetId>,
    pub index: u64,
    pub description: String,
    pub kind: ChangesetKind,
}

impl ChangesetProps {
    /// Describe `bytes`, deriving the id from its contents and the kind from
    /// the tables it touches.
    pub fn describe(
        bytes: &[u8],
        parent_id: Option<ChangesetId>,
        index: u64,
        description: &str,
    ) -> Result<Self, CoreError> {
        let mut kind = ChangesetKind::Data;
        for record in ChangeReader::new(bytes) {
            if is_internal_table(&record?.table, INTERNAL_TABLE_PREFIX) {
                kind = ChangesetKind::Schema;
            }
        }
        Ok(Self {
            id: ChangesetId::of(bytes),
            parent_id,
            index,
            description: description.to_string(),
            kind,
        })
    }

    pub fn kind_of(records: &[ChangeRecord]) -> ChangesetKind {
        if records
            .iter()
            .any(|r| is_internal_table(&r.table, INTERNAL_TABLE_PREFIX))
        {
            ChangesetKind::Schema
        } else {
            ChangesetKind::Data
        }
    }
}

pub fn is_internal_table(table: &str, prefix: &str) -> bool {
    table
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_changeset;

    #[test]
    fn internal_prefix_is_case_insensitive() {
        assert!(is_internal_table("ec_Class", "ec_"));
        assert!(is_internal_table("EC_Property", "ec_"));
        assert!(!is_internal_table("app_Widget", "ec_"));
        assert!(!is_internal_table("ec", "ec_"));
    }

    #[test]
    fn schema_kind_detected_from_records() {
        let bytes = encode_changeset(&[ChangeRecord::insert(
            "ec_Class",
            vec![true, false],
            vec![1.into(), "Widget".into()],
        )])
        .unwrap();
        let props = ChangesetProps::describe(&bytes, None, 1, "add class").unwrap();
        assert_eq!(props.kind, ChangesetKind::Schema);
        assert_eq!(props.id, ChangesetId::of(&bytes));
    }
}
