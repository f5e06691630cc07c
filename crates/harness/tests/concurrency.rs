use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::thread;

use changemerge_engine::{ConflictContext, HookReply};
use changemerge_harness::{TestBriefcase, TestHub};

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[test]
fn separate_briefcases_merge_in_parallel() -> TestResult {
    let mut hub = TestHub::new();
    let mut a = hub.add_briefcase()?;
    for id in 1..=20 {
        a.add_widget(id, &format!("widget-{id}"), id)?;
    }
    let seed = hub.push(&mut a, "seed")?.ok_or("nothing pushed")?;
    let changeset = hub.changeset(seed).to_vec();
    let expected = a.rows("app_Widget")?;
    let hook_calls = Arc::new(AtomicUsize::new(0));

    let results: Vec<Result<usize, String>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let changeset = &changeset;
                let expected = &expected;
                let hook_calls = Arc::clone(&hook_calls);
                scope.spawn(move || -> Result<usize, String> {
                    let mut b = TestBriefcase::temporary().map_err(|e| e.to_string())?;
                    // Odd briefcases already hold one of the rows.
                    if n % 2 == 1 {
                        b.add_widget(1, "widget-1", 1).map_err(|e| e.to_string())?;
                        b.commit("local").map_err(|e| e.to_string())?;
                        b.push().map_err(|e| e.to_string())?;
                    }
                    b.engine.set_hook(move |_: &mut ConflictContext| {
                        hook_calls.fetch_add(1, Ordering::SeqCst);
                        HookReply::Decline
                    });
                    let outcome = b.pull(changeset).map_err(|e| e.to_string())?;
                    if !outcome.is_success() {
                        return Err(format!("briefcase {n}: {outcome:?}"));
                    }
                    let rows = b.rows("app_Widget").map_err(|e| e.to_string())?;
                    if rows != *expected {
                        return Err(format!("briefcase {n} diverged"));
                    }
                    Ok(rows.len())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err("thread panicked".into())))
            .collect()
    });

    for result in results {
        assert_eq!(result?, 20);
    }
    assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
    Ok(())
}
