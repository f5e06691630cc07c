use tracing::{debug, error, info, warn};

use changemerge_core::{
    change::{ChangeRecord, DbOpcode, format_key},
    changeset::ChangesetProps,
    codec::ChangeReader,
    conflict::{ConflictCause, ConflictResolution},
};
use changemerge_storage::{ApplyAttempt, ChangeTarget};

use crate::classify::classify;
use crate::config::SessionConfig;
use crate::error::EngineError;
use crate::hook::{ConflictContext, ConflictHook};
use crate::policy::{Decision, PolicyInput, PolicyRule, decide, describe_key};

/// Terminal result of one apply pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Success(ApplyReport),
    Aborted {
        message: String,
        dump: Option<String>,
    },
    DecodeError(String),
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ApplyOutcome::Success(_))
    }

    pub fn report(&self) -> Option<&ApplyReport> {
        match self {
            ApplyOutcome::Success(report) => Some(report),
            _ => None,
        }
    }
}

/// One resolved conflict, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    pub table: String,
    /// `None` for the foreign-key check at the end of the pass.
    pub opcode: Option<DbOpcode>,
    pub cause: ConflictCause,
    pub resolution: ConflictResolution,
    pub rule: PolicyRule,
    pub hook_override: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub conflicts: Vec<ConflictEntry>,
    /// Records written without a conflict.
    pub applied: u64,
    /// Records written over a conflict.
    pub replaced: u64,
    pub skipped: u64,
    /// Records of tables excluded by the session config.
    pub filtered: u64,
    pub fk_violations: u64,
}

impl ApplyReport {
    pub fn resolutions(&self) -> Vec<ConflictResolution> {
        self.conflicts.iter().map(|c| c.resolution).collect()
    }
}

/// Last error message and diagnostic dump seen during a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedConflictLog {
    pub last_error: Option<String>,
    pub last_dump: Option<String>,
}

impl AppliedConflictLog {
    fn record(&mut self, message: String, dump: Option<String>) {
        self.last_error = Some(message);
        self.last_dump = dump;
    }
}

enum Step {
    Continue,
    Abort,
}

/// Applies one changeset to a [`ChangeTarget`], resolving conflicts through
/// the optional hook and then the built-in policy.
pub struct ChangesetApplier<'h> {
    config: SessionConfig,
    hook: Option<&'h mut dyn ConflictHook>,
    props: Option<ChangesetProps>,
    log: AppliedConflictLog,
}

impl<'h> ChangesetApplier<'h> {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            hook: None,
            props: None,
            log: AppliedConflictLog::default(),
        }
    }

    pub fn with_hook(mut self, hook: &'h mut dyn ConflictHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_props(mut self, props: ChangesetProps) -> Self {
        self.props = Some(props);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn log(&self) -> &AppliedConflictLog {
        &self.log
    }

    /// Run one pass. Everything is committed on success and rolled back
    /// otherwise. `Err` is reserved for storage failures and hook contract
    /// violations.
    pub fn apply<T: ChangeTarget>(
        &mut self,
        target: &mut T,
        changeset: &[u8],
    ) -> Result<ApplyOutcome, EngineError> {
        self.log = AppliedConflictLog::default();
        let allow_fk =
            self.config.allow_foreign_key_violations || target.allows_foreign_key_violations()?;

        target.begin_pass()?;
        match self.run_pass(target, changeset, allow_fk) {
            Ok(ApplyOutcome::Success(report)) => {
                target.commit_pass()?;
                info!(
                    applied = report.applied,
                    replaced = report.replaced,
                    skipped = report.skipped,
                    conflicts = report.conflicts.len(),
                    "changeset applied"
                );
                Ok(ApplyOutcome::Success(report))
            }
            Ok(outcome) => {
                target.rollback_pass()?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback) = target.rollback_pass() {
                    error!(error = %rollback, "rollback after failed pass also failed");
                }
                Err(e)
            }
        }
    }

    fn run_pass<T: ChangeTarget>(
        &mut self,
        target: &mut T,
        changeset: &[u8],
        allow_fk: bool,
    ) -> Result<ApplyOutcome, EngineError> {
        let mut report = ApplyReport::default();
        let mut reader = ChangeReader::new(changeset);

        for item in reader.by_ref() {
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    error!(error = %e, "failed to decode changeset");
                    return Ok(ApplyOutcome::DecodeError(e.to_string()));
                }
            };
            if self.config.is_filtered(&record.table) {
                report.filtered += 1;
                continue;
            }
            if let Step::Abort = self.apply_record(target, &record, &mut report)? {
                return Ok(self.aborted());
            }
        }

        let fk_violations = target.foreign_key_violations()?;
        report.fk_violations = fk_violations;
        let trailer = reader.fk_violations();
        if trailer != 0 && trailer != fk_violations {
            debug!(trailer, fk_violations, "stream foreign key count differs from local check");
        }

        if fk_violations > 0 {
            let decision =
                self.resolve(target, ConflictCause::ForeignKey, None, fk_violations, allow_fk, &mut report)?;
            if decision.is_fatal() {
                return Ok(self.aborted());
            }
        }
        Ok(ApplyOutcome::Success(report))
    }

    fn apply_record<T: ChangeTarget>(
        &mut self,
        target: &mut T,
        record: &ChangeRecord,
        report: &mut ApplyReport,
    ) -> Result<Step, EngineError> {
        let mut attempt = target.try_apply(record)?;
        let mut forced = false;
        loop {
            let cause = match attempt {
                ApplyAttempt::Applied if forced => {
                    report.replaced += 1;
                    return Ok(Step::Continue);
                }
                ApplyAttempt::Applied => {
                    report.applied += 1;
                    return Ok(Step::Continue);
                }
                ApplyAttempt::Conflict(cause) => cause,
            };

            let decision = self.resolve(target, cause, Some(record), 0, false, report)?;
            match decision.resolution {
                ConflictResolution::Skip => {
                    report.skipped += 1;
                    return Ok(Step::Continue);
                }
                ConflictResolution::Abort => return Ok(Step::Abort),
                ConflictResolution::Replace => {
                    attempt = target.force_apply(record, cause)?;
                    forced = true;
                }
            }
        }
    }

    /// Ask the hook, then the policy, for a resolution and log it.
    fn resolve<T: ChangeTarget>(
        &mut self,
        target: &T,
        cause: ConflictCause,
        record: Option<&ChangeRecord>,
        fk_violations: u64,
        allow_fk: bool,
        report: &mut ApplyReport,
    ) -> Result<Decision, EngineError> {
        let table = record.map_or("", |r| r.table.as_str());
        let local_row = match record {
            Some(r) if cause != ConflictCause::NotFound => target.current_row(r)?,
            _ => None,
        };

        let mut hook_message = None;
        let hook_override = match self.hook.as_deref_mut() {
            Some(hook) => {
                let mut context = ConflictContext::new(
                    cause,
                    record.cloned(),
                    local_row.clone(),
                    self.props.clone(),
                    fk_violations,
                );
                let reply = hook.on_conflict(&mut context);
                hook_message = context.take_last_error();
                match reply.resolution() {
                    Ok(resolution) => resolution,
                    Err(code) => {
                        error!(table, %cause, code, "conflict hook returned an invalid resolution");
                        return Err(EngineError::HookContract {
                            table: table.to_string(),
                            code,
                        });
                    }
                }
            }
            None => None,
        };

        let classification = classify(
            cause,
            record,
            self.config.has_pending_local_txns,
            &self.config.internal_table_prefix,
        );
        let decision = decide(&PolicyInput {
            classification,
            table,
            key: record.map(describe_key).unwrap_or_default(),
            hook_override,
            fk_violations,
            allow_fk_violations: allow_fk,
        });

        let rule = decision.rule.as_str();
        let resolution = decision.resolution.as_str();
        let dump = record.map(|r| conflict_dump(cause, r, local_row.as_deref()));
        match decision.rule {
            _ if decision.is_fatal() => {
                error!(table, %cause, rule, resolution, "{}", decision.message);
                if let Some(dump) = &dump {
                    error!("{dump}");
                }
            }
            PolicyRule::BenignData | PolicyRule::BenignConflict | PolicyRule::Constraint => {
                warn!(table, %cause, rule, resolution, "{}", decision.message);
                if let Some(dump) = &dump {
                    debug!("{dump}");
                }
            }
            PolicyRule::Fallback => info!(table, %cause, rule, resolution, "{}", decision.message),
            _ => debug!(table, %cause, rule, resolution, "{}", decision.message),
        }

        let message = match hook_message {
            Some(message) if decision.rule == PolicyRule::HookOverride => message,
            Some(message) => {
                debug!(table, "conflict hook message: {message}");
                decision.message.clone()
            }
            None => decision.message.clone(),
        };
        self.log.record(message, dump);

        report.conflicts.push(ConflictEntry {
            table: table.to_string(),
            opcode: record.map(|r| r.opcode),
            cause,
            resolution: decision.resolution,
            rule: decision.rule,
            hook_override: decision.rule == PolicyRule::HookOverride,
        });
        Ok(decision)
    }

    fn aborted(&self) -> ApplyOutcome {
        ApplyOutcome::Aborted {
            message: self
                .log
                .last_error
                .clone()
                .unwrap_or_else(|| "changeset apply aborted".to_string()),
            dump: self.log.last_dump.clone(),
        }
    }
}

/// Human-readable rendering of a conflicting record and the local row it hit.
pub fn conflict_dump(
    cause: ConflictCause,
    record: &ChangeRecord,
    local_row: Option<&[changemerge_core::value::ColumnValue]>,
) -> String {
    let mut out = format!("{cause} conflict: {}", record.dump());
    if let Some(row) = local_row {
        out.push_str(&format!("  local row {}\n", format_key(row)));
    }
    out
}
