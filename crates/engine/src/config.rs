use changemerge_core::changeset::{INTERNAL_TABLE_PREFIX, is_internal_table};
use serde::{Deserialize, Serialize};

/// Per-session options for one changeset apply pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Whether the target has saved local txns that were not pushed yet.
    pub has_pending_local_txns: bool,
    /// Let foreign-key violations through instead of aborting.
    pub allow_foreign_key_violations: bool,
    /// Tables starting with this prefix hold internal bookkeeping.
    pub internal_table_prefix: String,
    /// Tables whose changes are ignored entirely.
    pub skip_tables: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            has_pending_local_txns: false,
            allow_foreign_key_violations: false,
            internal_table_prefix: INTERNAL_TABLE_PREFIX.to_string(),
            skip_tables: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn with_pending_local_txns(mut self, pending: bool) -> Self {
        self.has_pending_local_txns = pending;
        self
    }

    pub fn with_foreign_key_violations_allowed(mut self, allow: bool) -> Self {
        self.allow_foreign_key_violations = allow;
        self
    }

    pub fn skip_table(mut self, table: &str) -> Self {
        self.skip_tables.push(table.to_string());
        self
    }

    pub fn is_filtered(&self, table: &str) -> bool {
        self.skip_tables.iter().any(|t| t.eq_ignore_ascii_case(table))
    }

    pub fn is_internal(&self, table: &str) -> bool {
        is_internal_table(table, &self.internal_table_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prefix_marks_ec_tables_internal() {
        let config = SessionConfig::default();
        assert!(config.is_internal("ec_Class"));
        assert!(config.is_internal("EC_Schema"));
        assert!(!config.is_internal("app_Widget"));
        assert!(!config.is_internal("be_Prop"));
    }

    #[test]
    fn filtered_tables_match_case_insensitively() {
        let config = SessionConfig::default().skip_table("app_Audit");
        assert!(config.is_filtered("APP_AUDIT"));
        assert!(!config.is_filtered("app_Widget"));
    }
}
