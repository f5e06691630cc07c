use std::fmt;

use serde::{Deserialize, Serialize};

/// A typed column value as carried by a change stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl PartialEq for ColumnValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Real(a), Self::Real(b)) => a.total_cmp(b).is_eq(),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Blob(a), Self::Blob(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ColumnValue {}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ColumnValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            ColumnValue::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ColumnValue::Null => "null",
            ColumnValue::Integer(_) => "integer",
            ColumnValue::Real(_) => "real",
            ColumnValue::Text(_) => "text",
            ColumnValue::Blob(_) => "blob",
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null => write!(f, "NULL"),
            ColumnValue::Integer(n) => write!(f, "{n}"),
            ColumnValue::Real(r) => write!(f, "{r}"),
            ColumnValue::Text(s) => write!(f, "'{s}'"),
            ColumnValue::Blob(b) => {
                write!(f, "x'")?;
                for byte in b.iter().take(32) {
                    write!(f, "{byte:02x}")?;
                }
                if b.len() > 32 {
                    write!(f, "...")?;
                }
                write!(f, "'")
            }
        }
    }
}

impl From<i64> for ColumnValue {
    fn from(n: i64) -> Self {
        ColumnValue::Integer(n)
    }
}

impl From<f64> for ColumnValue {
    fn from(r: f64) -> Self {
        ColumnValue::Real(r)
    }
}

impl From<&str> for ColumnValue {
    fn from(s: &str) -> Self {
        ColumnValue::Text(s.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(s: String) -> Self {
        ColumnValue::Text(s)
    }
}

impl From<Vec<u8>> for ColumnValue {
    fn from(b: Vec<u8>) -> Self {
        ColumnValue::Blob(b)
    }
}

/// Which side of a change a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueStage {
    Old,
    New,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_equality_is_bitwise_total() {
        assert_eq!(ColumnValue::Real(f64::NAN), ColumnValue::Real(f64::NAN));
        assert_ne!(ColumnValue::Real(0.0), ColumnValue::Real(-0.0));
        assert_ne!(ColumnValue::Integer(1), ColumnValue::Real(1.0));
    }

    #[test]
    fn display_truncates_long_blobs() {
        let v = ColumnValue::Blob(vec![0xAB; 40]);
        let shown = v.to_string();
        assert!(shown.starts_with("x'abab"));
        assert!(shown.ends_with("...'"));
        assert_eq!(ColumnValue::from("w").to_string(), "'w'");
    }
}
