pub mod change;
pub mod changeset;
pub mod codec;
pub mod conflict;
pub mod error;
pub mod group;
pub mod ids;
pub mod value;

pub use change::{ChangeRecord, ColumnChange, DbOpcode};
pub use changeset::{ChangesetKind, ChangesetProps};
pub use codec::{ChangeReader, ChangesetWriter};
pub use conflict::{ConflictCause, ConflictResolution};
pub use error::CoreError;
pub use group::ChangeGroup;
pub use ids::*;
pub use value::{ColumnValue, ValueStage};
