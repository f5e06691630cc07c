use changemerge_core::{changeset::ChangesetProps, ids::ChangesetId};
use changemerge_engine::ApplyOutcome;

use crate::TestBriefcase;

/// Ordered history of pushed changesets shared by test briefcases.
pub struct TestHub {
    changesets: Vec<(ChangesetProps, Vec<u8>)>,
}

impl Default for TestHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHub {
    pub fn new() -> Self {
        Self {
            changesets: Vec::new(),
        }
    }

    pub fn add_briefcase(&self) -> Result<TestBriefcase, Box<dyn std::error::Error>> {
        Ok(TestBriefcase::new()?)
    }

    pub fn len(&self) -> usize {
        self.changesets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changesets.is_empty()
    }

    pub fn tip(&self) -> Option<ChangesetId> {
        self.changesets.last().map(|(props, _)| props.id)
    }

    /// Commit the briefcase's tracked edits and push everything pending.
    /// Returns the index of the new changeset, or `None` if nothing changed.
    pub fn push(
        &mut self,
        briefcase: &mut TestBriefcase,
        description: &str,
    ) -> Result<Option<usize>, Box<dyn std::error::Error>> {
        briefcase.commit(description)?;
        let Some(bytes) = briefcase.push()? else {
            return Ok(None);
        };
        let props = ChangesetProps::describe(&bytes, self.tip(), self.changesets.len() as u64, description)?;
        self.changesets.push((props, bytes));
        Ok(Some(self.changesets.len() - 1))
    }

    pub fn changeset(&self, index: usize) -> &[u8] {
        &self.changesets[index].1
    }

    pub fn props(&self, index: usize) -> &ChangesetProps {
        &self.changesets[index].0
    }

    /// Merge changesets `from..` into `briefcase`, stopping at the first
    /// one that does not succeed.
    pub fn pull(
        &self,
        briefcase: &mut TestBriefcase,
        from: usize,
    ) -> Result<Vec<ApplyOutcome>, Box<dyn std::error::Error>> {
        let mut outcomes = Vec::new();
        for (props, bytes) in &self.changesets[from..] {
            let outcome = briefcase.engine.merge_changeset(bytes, &props.description)?;
            let done = !outcome.is_success();
            outcomes.push(outcome);
            if done {
                break;
            }
        }
        Ok(outcomes)
    }
}
