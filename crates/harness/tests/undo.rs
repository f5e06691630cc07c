use changemerge_engine::{EngineError, UndoResult};
use changemerge_harness::TestBriefcase;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn applied(result: UndoResult) -> Result<changemerge_engine::UndoReport, Box<dyn std::error::Error>> {
    match result {
        UndoResult::Applied(report) => Ok(report),
        UndoResult::Empty => Err("nothing was undone".into()),
    }
}

#[test]
fn undo_reverses_the_last_local_txn() -> TestResult {
    let mut b = TestBriefcase::new()?;
    b.add_widget(1, "alpha", 10)?;
    b.commit("add widget")?;
    b.rename_widget(1, "alpha-2")?;
    b.add_widget(2, "beta", 20)?;
    b.commit("rename and add")?;

    let report = applied(b.engine.undo()?)?;
    assert_eq!(report.description, "rename and add");
    assert_eq!(report.applied, 2);
    assert_eq!(report.skipped, 0);
    assert_eq!(b.widget_name(1)?.as_deref(), Some("alpha"));
    assert_eq!(b.widget(2)?, None);
    assert_eq!(b.storage().pending_txns()?.len(), 1);
    assert_eq!(b.engine.redo_depth(), 1);
    Ok(())
}

#[test]
fn redo_reinstates_an_undone_txn() -> TestResult {
    let mut b = TestBriefcase::new()?;
    b.add_widget(1, "alpha", 10)?;
    b.commit("add widget")?;
    b.rename_widget(1, "alpha-2")?;
    b.commit("rename")?;

    applied(b.engine.undo()?)?;
    let report = applied(b.engine.redo()?)?;
    assert_eq!(report.description, "rename");
    assert_eq!(b.widget_name(1)?.as_deref(), Some("alpha-2"));
    let txns = b.storage().pending_txns()?;
    assert_eq!(txns.len(), 2);
    assert_eq!(txns[1].description, "rename");
    assert_eq!(b.engine.redo()?, UndoResult::Empty);
    Ok(())
}

#[test]
fn new_local_txn_clears_redo() -> TestResult {
    let mut b = TestBriefcase::new()?;
    b.add_widget(1, "alpha", 10)?;
    b.commit("add")?;
    applied(b.engine.undo()?)?;
    assert_eq!(b.engine.redo_depth(), 1);

    b.add_widget(2, "beta", 20)?;
    b.commit("other add")?;
    assert_eq!(b.engine.redo_depth(), 0);
    Ok(())
}

#[test]
fn undo_with_no_txns_is_empty() -> TestResult {
    let mut b = TestBriefcase::new()?;
    assert_eq!(b.engine.undo()?, UndoResult::Empty);
    Ok(())
}

#[test]
fn undo_skips_rows_that_are_already_gone() -> TestResult {
    let mut b = TestBriefcase::new()?;
    b.add_widget(5, "five", 5)?;
    b.commit("add five")?;
    b.storage()
        .conn()
        .execute("DELETE FROM app_Widget WHERE Id = 5", [])?;

    let report = applied(b.engine.undo()?)?;
    assert_eq!(report.applied, 0);
    assert_eq!(report.skipped, 1);
    assert!(b.storage().pending_txns()?.is_empty());
    Ok(())
}

#[test]
fn undo_requires_saved_changes() -> TestResult {
    let mut b = TestBriefcase::new()?;
    b.add_widget(1, "alpha", 10)?;
    b.commit("add")?;
    b.rename_widget(1, "unsaved")?;
    assert!(matches!(b.engine.undo(), Err(EngineError::UnsavedChanges)));

    assert_eq!(b.storage_mut().abandon_changes()?, 1);
    assert_eq!(b.widget_name(1)?.as_deref(), Some("alpha"));
    applied(b.engine.undo()?)?;
    assert_eq!(b.widget(1)?, None);
    Ok(())
}
