use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

/// Single-row-per-key property table shared through changesets.
pub const PROPERTY_TABLE: &str = "be_Prop";
/// Briefcase-local values, never part of a changeset.
pub const LOCAL_TABLE: &str = "be_Local";
/// Saved local txns not yet pushed.
pub const TXN_TABLE: &str = "be_Txns";

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS be_Prop (
    Namespace TEXT NOT NULL COLLATE NOCASE,
    Name TEXT NOT NULL COLLATE NOCASE,
    Id INTEGER NOT NULL DEFAULT 0,
    SubId INTEGER NOT NULL DEFAULT 0,
    TxnMode INTEGER NOT NULL DEFAULT 0,
    StrData TEXT,
    RawSize INTEGER,
    Data BLOB,
    PRIMARY KEY (Namespace, Name, Id, SubId)
);

CREATE TABLE IF NOT EXISTS be_Local (
    Name TEXT NOT NULL PRIMARY KEY COLLATE NOCASE,
    Val BLOB
);

CREATE TABLE IF NOT EXISTS be_Txns (
    Id INTEGER PRIMARY KEY,
    Operation TEXT,
    TxnType INTEGER NOT NULL,
    Change BLOB NOT NULL,
    SavedAt INTEGER NOT NULL DEFAULT (CAST(unixepoch('now','subsec') * 1000 AS INTEGER))
);
";
