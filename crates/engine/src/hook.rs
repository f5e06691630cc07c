use changemerge_core::{
    change::ChangeRecord,
    changeset::ChangesetProps,
    conflict::{ConflictCause, ConflictResolution},
    value::{ColumnValue, ValueStage},
};

/// What a conflict hook answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookReply {
    /// Let the built-in policy decide.
    Decline,
    Resolve(ConflictResolution),
    /// A raw resolution code (0 skip, 1 replace, 2 abort) from a host callback.
    Code(i64),
}

impl HookReply {
    /// The override this reply asks for. `Err` carries a code outside the
    /// known resolutions.
    pub fn resolution(self) -> Result<Option<ConflictResolution>, i64> {
        match self {
            HookReply::Decline => Ok(None),
            HookReply::Resolve(r) => Ok(Some(r)),
            HookReply::Code(code) => ConflictResolution::try_from(code)
                .map(Some)
                .map_err(|_| code),
        }
    }
}

/// Read-only view of one conflict handed to a [`ConflictHook`].
#[derive(Debug, Clone)]
pub struct ConflictContext {
    cause: ConflictCause,
    record: Option<ChangeRecord>,
    local_row: Option<Vec<ColumnValue>>,
    props: Option<ChangesetProps>,
    fk_violations: u64,
    last_error: Option<String>,
}

impl ConflictContext {
    pub(crate) fn new(
        cause: ConflictCause,
        record: Option<ChangeRecord>,
        local_row: Option<Vec<ColumnValue>>,
        props: Option<ChangesetProps>,
        fk_violations: u64,
    ) -> Self {
        Self {
            cause,
            record,
            local_row,
            props,
            fk_violations,
            last_error: None,
        }
    }

    pub fn cause(&self) -> ConflictCause {
        self.cause
    }

    /// The conflicting record. `None` for the foreign-key check at the end of
    /// a pass.
    pub fn record(&self) -> Option<&ChangeRecord> {
        self.record.as_ref()
    }

    pub fn table(&self) -> Option<&str> {
        self.record.as_ref().map(|r| r.table.as_str())
    }

    pub fn column_count(&self) -> usize {
        self.record.as_ref().map_or(0, ChangeRecord::column_count)
    }

    pub fn value(&self, column: usize, stage: ValueStage) -> Option<&ColumnValue> {
        self.record.as_ref()?.value(column, stage)
    }

    pub fn pk_indices(&self) -> Vec<usize> {
        self.record
            .as_ref()
            .map(ChangeRecord::pk_indices)
            .unwrap_or_default()
    }

    /// The local row the record collided with, if there is one.
    pub fn local_row(&self) -> Option<&[ColumnValue]> {
        self.local_row.as_deref()
    }

    pub fn props(&self) -> Option<&ChangesetProps> {
        self.props.as_ref()
    }

    pub fn fk_violations(&self) -> u64 {
        self.fk_violations
    }

    /// Leave a message that is reported if the pass ends up aborting.
    pub fn set_last_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    pub(crate) fn take_last_error(&mut self) -> Option<String> {
        self.last_error.take()
    }
}

/// Intercepts each conflict before the built-in policy runs.
pub trait ConflictHook {
    fn on_conflict(&mut self, context: &mut ConflictContext) -> HookReply;
}

impl<F> ConflictHook for F
where
    F: FnMut(&mut ConflictContext) -> HookReply,
{
    fn on_conflict(&mut self, context: &mut ConflictContext) -> HookReply {
        self(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_map_to_resolutions() {
        assert_eq!(HookReply::Code(0).resolution(), Ok(Some(ConflictResolution::Skip)));
        assert_eq!(HookReply::Code(1).resolution(), Ok(Some(ConflictResolution::Replace)));
        assert_eq!(HookReply::Code(2).resolution(), Ok(Some(ConflictResolution::Abort)));
        assert_eq!(HookReply::Code(9).resolution(), Err(9));
        assert_eq!(HookReply::Decline.resolution(), Ok(None));
    }

    #[test]
    fn context_exposes_values_by_stage() {
        let record = ChangeRecord::update(
            "app_Widget",
            vec![true, false],
            vec![ColumnValue::Integer(3), "before".into()],
            vec![ColumnValue::Integer(3), "after".into()],
        );
        let mut ctx = ConflictContext::new(ConflictCause::Data, Some(record), None, None, 0);
        assert_eq!(ctx.table(), Some("app_Widget"));
        assert_eq!(ctx.pk_indices(), vec![0]);
        assert_eq!(ctx.value(1, ValueStage::Old), Some(&ColumnValue::from("before")));
        assert_eq!(ctx.value(1, ValueStage::New), Some(&ColumnValue::from("after")));
        assert_eq!(ctx.value(0, ValueStage::New), None);

        let mut hook = |c: &mut ConflictContext| {
            c.set_last_error("checked");
            HookReply::Decline
        };
        assert_eq!(hook.on_conflict(&mut ctx), HookReply::Decline);
        assert_eq!(ctx.take_last_error().as_deref(), Some("checked"));
    }
}
