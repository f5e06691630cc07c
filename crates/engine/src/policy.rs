//! The conflict resolution decision table.
//!
//! [`decide`] is a pure function of one classified conflict. Rules are
//! checked in priority order and the first match wins.

use std::fmt;

use changemerge_core::{
    change::{ChangeRecord, DbOpcode, format_key},
    conflict::{ConflictCause, ConflictResolution},
};

use crate::classify::{
    Classification, SCHEMA_PROPERTY_NAME, SCHEMA_PROPERTY_NAMESPACE, TableClass,
};

/// The rule that produced a decision, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PolicyRule {
    HookOverride,
    BenignData,
    InternalDataSkip,
    SchemaPropertyReplace,
    PendingDataAbort,
    BenignConflict,
    InternalConflictSkip,
    PendingConflictAbort,
    ForeignKey,
    NotFound,
    Constraint,
    Fallback,
}

impl PolicyRule {
    pub fn priority(self) -> u8 {
        match self {
            PolicyRule::HookOverride => 1,
            PolicyRule::BenignData => 2,
            PolicyRule::InternalDataSkip => 3,
            PolicyRule::SchemaPropertyReplace => 4,
            PolicyRule::PendingDataAbort => 5,
            PolicyRule::BenignConflict => 6,
            PolicyRule::InternalConflictSkip => 7,
            PolicyRule::PendingConflictAbort => 8,
            PolicyRule::ForeignKey => 9,
            PolicyRule::NotFound => 10,
            PolicyRule::Constraint => 11,
            PolicyRule::Fallback => 12,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PolicyRule::HookOverride => "hook-override",
            PolicyRule::BenignData => "benign-data",
            PolicyRule::InternalDataSkip => "internal-data-skip",
            PolicyRule::SchemaPropertyReplace => "schema-property-replace",
            PolicyRule::PendingDataAbort => "pending-data-abort",
            PolicyRule::BenignConflict => "benign-conflict",
            PolicyRule::InternalConflictSkip => "internal-conflict-skip",
            PolicyRule::PendingConflictAbort => "pending-conflict-abort",
            PolicyRule::ForeignKey => "foreign-key",
            PolicyRule::NotFound => "not-found",
            PolicyRule::Constraint => "constraint",
            PolicyRule::Fallback => "fallback",
        }
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (rule {})", self.as_str(), self.priority())
    }
}

/// One conflict as seen by the policy.
#[derive(Debug, Clone)]
pub struct PolicyInput<'a> {
    pub classification: Classification,
    pub table: &'a str,
    /// Rendered primary key of the affected row, empty when there is none.
    pub key: String,
    pub hook_override: Option<ConflictResolution>,
    pub fk_violations: u64,
    pub allow_fk_violations: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub resolution: ConflictResolution,
    pub rule: PolicyRule,
    pub message: String,
}

impl Decision {
    fn new(resolution: ConflictResolution, rule: PolicyRule, message: String) -> Self {
        Self {
            resolution,
            rule,
            message,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.resolution == ConflictResolution::Abort
    }
}

pub fn decide(input: &PolicyInput<'_>) -> Decision {
    use ConflictResolution::{Abort, Replace, Skip};

    let c = &input.classification;
    let table = input.table;
    let key = &input.key;

    if let Some(resolution) = input.hook_override {
        return Decision::new(
            resolution,
            PolicyRule::HookOverride,
            format!("{} conflict in {table} {key}: conflict hook chose {resolution}", c.cause),
        );
    }

    match c.cause {
        ConflictCause::Data if !c.indirect => match (c.pending, c.table_class) {
            (false, _) => Decision::new(
                Replace,
                PolicyRule::BenignData,
                format!("data conflict in {table} {key} with no pending local txns, accepting incoming values"),
            ),
            (true, TableClass::Internal) => Decision::new(
                Skip,
                PolicyRule::InternalDataSkip,
                format!("data conflict in internal table {table} {key}, skipping"),
            ),
            (true, TableClass::SchemaProperty) => Decision::new(
                Replace,
                PolicyRule::SchemaPropertyReplace,
                format!(
                    "data conflict on property {SCHEMA_PROPERTY_NAMESPACE}:{SCHEMA_PROPERTY_NAME}, accepting incoming value"
                ),
            ),
            (true, TableClass::User) => Decision::new(
                Abort,
                PolicyRule::PendingDataAbort,
                format!(
                    "UPDATE/DELETE before value do not match with one in db or CASCADE action was triggered (table {table}, {key})"
                ),
            ),
        },
        ConflictCause::Conflict => match (c.pending, c.table_class) {
            (false, _) => Decision::new(
                Replace,
                PolicyRule::BenignConflict,
                format!("primary key conflict in {table} {key} with no pending local txns, accepting incoming row"),
            ),
            (true, TableClass::Internal) => Decision::new(
                Skip,
                PolicyRule::InternalConflictSkip,
                format!("primary key conflict in internal table {table} {key}, skipping"),
            ),
            (true, _) => Decision::new(
                Abort,
                PolicyRule::PendingConflictAbort,
                format!("PRIMARY KEY INSERT CONFLICT - rejecting this changeset (table {table}, {key})"),
            ),
        },
        ConflictCause::ForeignKey if input.allow_fk_violations => Decision::new(
            Skip,
            PolicyRule::ForeignKey,
            format!(
                "Detected {} foreign key conflicts in changeset. Continuing merge as 'DebugAllowFkViolations' flag is set.",
                input.fk_violations
            ),
        ),
        ConflictCause::ForeignKey => Decision::new(
            Abort,
            PolicyRule::ForeignKey,
            format!(
                "Detected {} foreign key conflicts in changeset. Unable to merge changes with local repository.",
                input.fk_violations
            ),
        ),
        ConflictCause::NotFound => Decision::new(
            Skip,
            PolicyRule::NotFound,
            format!("target row {key} not found in {table}, skipping"),
        ),
        ConflictCause::Constraint => Decision::new(
            Skip,
            PolicyRule::Constraint,
            format!(
                "constraint conflict in {table} {key}, skipping. Two clients may have inserted the same business key."
            ),
        ),
        ConflictCause::Data => Decision::new(
            Replace,
            PolicyRule::Fallback,
            format!("{} conflict in {table} {key}, accepting incoming values", c.cause),
        ),
    }
}

/// Render the key of the row a record touches, with the new key when an
/// update moves the row.
pub fn describe_key(record: &ChangeRecord) -> String {
    let Some(old) = record.primary_key() else {
        return "primary key unknown".to_string();
    };
    match record.new_primary_key() {
        Some(new) if record.opcode == DbOpcode::Update && new != old => {
            format!("primary key {} -> {}", format_key(&old), format_key(&new))
        }
        _ => format!("primary key {}", format_key(&old)),
    }
}
