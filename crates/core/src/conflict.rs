use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Why a change could not be applied cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictCause {
    /// Before-values of an update or delete do not match the local row.
    Data,
    /// An update or delete targets a row that does not exist locally.
    NotFound,
    /// An insert collides with an existing row's primary key.
    Conflict,
    /// A non-foreign-key constraint rejected the change.
    Constraint,
    /// Foreign keys are violated once the whole stream is applied.
    ForeignKey,
}

impl ConflictCause {
    pub fn code(self) -> i32 {
        match self {
            Self::Data => 1,
            Self::NotFound => 2,
            Self::Conflict => 3,
            Self::Constraint => 4,
            Self::ForeignKey => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Data),
            2 => Some(Self::NotFound),
            3 => Some(Self::Conflict),
            4 => Some(Self::Constraint),
            5 => Some(Self::ForeignKey),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Constraint => "constraint",
            Self::ForeignKey => "foreign key",
        }
    }
}

impl fmt::Display for ConflictCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Decision taken for one conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// Drop the incoming change for this row and continue.
    Skip,
    /// Force the incoming change over the local row.
    Replace,
    /// Abandon the whole apply pass.
    Abort,
}

impl ConflictResolution {
    pub fn code(self) -> i64 {
        match self {
            Self::Skip => 0,
            Self::Replace => 1,
            Self::Abort => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Replace => "replace",
            Self::Abort => "abort",
        }
    }
}

impl TryFrom<i64> for ConflictResolution {
    type Error = CoreError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Skip),
            1 => Ok(Self::Replace),
            2 => Ok(Self::Abort),
            other => Err(CoreError::InvalidResolution(other)),
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_codes() {
        for r in [
            ConflictResolution::Skip,
            ConflictResolution::Replace,
            ConflictResolution::Abort,
        ] {
            assert_eq!(ConflictResolution::try_from(r.code()).unwrap(), r);
        }
        assert!(matches!(
            ConflictResolution::try_from(3),
            Err(CoreError::InvalidResolution(3))
        ));
        assert!(ConflictResolution::try_from(-1).is_err());
    }

    #[test]
    fn cause_names() {
        assert_eq!(ConflictCause::NotFound.to_string(), "not found");
        assert_eq!(ConflictCause::from_code(5), Some(ConflictCause::ForeignKey));
        assert_eq!(ConflictCause::from_code(0), None);
    }
}
