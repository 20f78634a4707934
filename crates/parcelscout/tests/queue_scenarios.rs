//! Queue and deduplication behaviour against a file-backed database.

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use parcelscout::queue::{Disposition, EnqueueOptions, JobQuery};
use parcelscout::{FailOutcome, JobState, TermStatus};

use common::TestHarness;

#[test]
fn test_more_urgent_duplicate_wins_before_dequeue() {
    let harness = TestHarness::new();
    let queue = &harness.queue;

    let first = queue.submit("Trust", Some(1), None).unwrap();
    let second = queue.submit("Trust", Some(5), None).unwrap();

    assert_eq!(first, second);
    let counts = queue.counts().unwrap();
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.superseded, 0);

    let job = queue.find("Trust").unwrap().unwrap();
    assert_eq!(job.priority, 1);
    assert_eq!(job.state, JobState::Waiting);
}

#[test]
fn test_less_urgent_waiting_job_is_replaced() {
    let harness = TestHarness::new();
    let queue = &harness.queue;

    let old = queue.submit("Trust", Some(5), None).unwrap();
    let handle = queue
        .enqueue("trust ", 1, EnqueueOptions::default())
        .unwrap();

    assert_eq!(
        handle.disposition,
        Disposition::Replaced {
            superseded: vec![old.clone()]
        }
    );
    let counts = queue.counts().unwrap();
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.superseded, 1);

    let replaced = queue.find_by_id(&old).unwrap().unwrap();
    assert_eq!(replaced.state, JobState::Superseded);
    assert_eq!(replaced.superseded_by, Some(handle.id.clone()));
    assert_eq!(queue.find("TRUST").unwrap().unwrap().priority, 1);
}

#[test]
fn test_whitespace_terms_rejected() {
    let harness = TestHarness::new();
    for term in ["", "   ", "\t\n"] {
        let err = harness.queue.submit(term, None, None).unwrap_err();
        assert!(
            err.to_string().contains("empty"),
            "unexpected error for {:?}: {}",
            term,
            err
        );
    }
    assert_eq!(harness.queue.counts().unwrap().live(), 0);
}

#[test]
fn test_three_failures_end_failed_with_last_error() {
    let harness = TestHarness::new();
    let queue = &harness.queue;
    let id = queue
        .submit(
            "Smith",
            None,
            Some(EnqueueOptions {
                max_attempts: Some(3),
                dedupe: true,
            }),
        )
        .unwrap();

    let mut attempts = Vec::new();
    let mut last = None;
    for n in 1..=3 {
        let job = queue.dequeue("worker-0").unwrap().expect("job should be dispatchable");
        assert_eq!(job.id, id);
        let outcome = queue
            .fail(&id, "worker-0", &format!("Source server error (status 503): attempt {}", n))
            .unwrap();
        match outcome {
            FailOutcome::RetriedWithBackoff { attempt, .. } => {
                assert!(n < 3, "attempt {} should have been terminal", n);
                attempts.push(attempt);
            }
            FailOutcome::Exhausted { attempt } => attempts.push(attempt),
        }
        last = Some(outcome);
    }

    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(last, Some(FailOutcome::Exhausted { attempt: 3 }));

    let status = queue.status(&id).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt, 3);
    assert_eq!(
        status.error.as_deref(),
        Some("Source server error (status 503): attempt 3")
    );
    assert!(!status.zero_results);
    assert!(queue.dequeue("worker-0").unwrap().is_none());
}

#[test]
fn test_concurrent_dequeue_claims_each_job_once() {
    let harness = TestHarness::new();
    let queue = harness.queue.clone();

    // Duplicates bypass dedupe so the dispatcher has to keep them apart.
    let no_dedupe = EnqueueOptions {
        max_attempts: None,
        dedupe: false,
    };
    let mut expected = 0;
    for i in 0..20 {
        queue
            .enqueue(&format!("Term{}", i), 5, no_dedupe.clone())
            .unwrap();
        expected += 1;
    }
    for _ in 0..5 {
        queue.enqueue("Garcia", 5, no_dedupe.clone()).unwrap();
        expected += 1;
    }

    let workers = 6;
    let barrier = Arc::new(Barrier::new(workers));
    let active_terms = Arc::new(Mutex::new(HashSet::new()));
    let claimed = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..workers)
        .map(|w| {
            let queue = queue.clone();
            let barrier = Arc::clone(&barrier);
            let active_terms = Arc::clone(&active_terms);
            let claimed = Arc::clone(&claimed);
            thread::spawn(move || {
                let worker_id = format!("worker-{}", w);
                barrier.wait();
                let mut idle_polls = 0;
                while idle_polls < 50 {
                    let Some(job) = queue.dequeue(&worker_id).unwrap() else {
                        idle_polls += 1;
                        thread::sleep(Duration::from_millis(5));
                        continue;
                    };
                    idle_polls = 0;
                    let term = job.search_term.to_lowercase();
                    assert!(
                        active_terms.lock().unwrap().insert(term.clone()),
                        "two active jobs for '{}'",
                        term
                    );
                    claimed.lock().unwrap().push(job.id.clone());
                    thread::sleep(Duration::from_millis(2));
                    active_terms.lock().unwrap().remove(&term);
                    queue.complete(&job.id, &worker_id, 0, None).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let claimed = claimed.lock().unwrap();
    let unique: HashSet<_> = claimed.iter().collect();
    assert_eq!(claimed.len(), expected);
    assert_eq!(unique.len(), expected);
    assert_eq!(queue.counts().unwrap().completed, expected as u64);
}

#[test]
fn test_plan_is_idempotent_and_filters_covered_terms() {
    let harness = TestHarness::new();
    let queue = &harness.queue;
    let planner = harness.planner();

    // Completed with zero results still counts as tried.
    let done = queue.submit("Zzyzx", None, None).unwrap();
    queue.dequeue("worker-0").unwrap();
    queue.complete(&done, "worker-0", 0, None).unwrap();
    queue.submit("Lopez", Some(3), None).unwrap();

    let candidates: Vec<String> = ["Zzyzx", "Lopez", "Nguyen", "nguyen", " Patel "]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let first = planner.plan(&candidates, 5).unwrap();
    let second = planner.plan(&candidates, 5).unwrap();
    assert_eq!(first, vec!["Nguyen".to_string(), "Patel".to_string()]);
    assert_eq!(first, second);

    // A more urgent candidate displaces the waiting job.
    let urgent = planner.plan(&candidates, 1).unwrap();
    assert!(urgent.contains(&"Lopez".to_string()));
    assert!(!urgent.contains(&"Zzyzx".to_string()));
}

#[test]
fn test_coverage_reports_each_status() {
    let harness = TestHarness::new();
    let queue = &harness.queue;
    let failed = queue
        .submit(
            "Failing",
            None,
            Some(EnqueueOptions {
                max_attempts: Some(1),
                dedupe: true,
            }),
        )
        .unwrap();
    queue.dequeue("worker-0").unwrap();
    queue.fail(&failed, "worker-0", "boom").unwrap();
    queue.submit("Waiting", Some(7), None).unwrap();

    let terms: Vec<String> = ["Failing", "Waiting", "Unknown"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let coverage = harness.planner().coverage(&terms).unwrap();

    assert_eq!(coverage[0].status, TermStatus::NeverTried);
    assert_eq!(
        coverage[1].status,
        TermStatus::PendingInQueue {
            priority: 7,
            active: false
        }
    );
    assert_eq!(coverage[2].status, TermStatus::NeverTried);
}

#[test]
fn test_sweep_collapses_duplicates_from_concurrent_producers() {
    let harness = TestHarness::new();
    let queue = &harness.queue;
    let raw = EnqueueOptions {
        max_attempts: None,
        dedupe: false,
    };
    let keeper = queue.enqueue("Church", 2, raw.clone()).unwrap().id;
    queue.enqueue("church", 2, raw.clone()).unwrap();
    queue.enqueue("CHURCH", 8, raw.clone()).unwrap();
    queue.enqueue("Estate", 4, raw).unwrap();

    let report = harness.planner().sweep().unwrap();
    assert_eq!(report.groups, 1);
    assert_eq!(report.removed, 2);
    assert_eq!(report.failed, 0);

    let live = queue.live_jobs().unwrap();
    assert_eq!(live.len(), 2);
    assert!(live.iter().any(|j| j.id == keeper));

    // Nothing left to collapse.
    assert_eq!(harness.planner().sweep().unwrap().removed, 0);
}

#[test]
fn test_reclaimed_run_counts_as_an_attempt() {
    let harness = TestHarness::new();
    let queue = &harness.queue;
    let id = queue.submit("Miller", None, None).unwrap();
    queue.dequeue("worker-0").unwrap();
    queue.fail(&id, "worker-0", "timeout").unwrap();
    queue.dequeue("worker-1").unwrap();
    thread::sleep(Duration::from_millis(20));

    assert_eq!(queue.reclaim_stale(Duration::ZERO).unwrap(), 1);
    let job = queue.find_by_id(&id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.attempt, 2);
    assert!(job.worker_id.is_none());
    assert!(job.last_error.unwrap().contains("worker-1"));
}

#[test]
fn test_job_that_always_stalls_ends_failed() {
    let harness = TestHarness::new();
    let queue = &harness.queue;
    let id = queue.submit("Hangs", None, None).unwrap();

    for round in 0..10 {
        let Some(job) = queue.dequeue(&format!("worker-{}", round)).unwrap() else {
            break;
        };
        assert_eq!(job.id, id);
        thread::sleep(Duration::from_millis(5));
        queue.reclaim_stale(Duration::ZERO).unwrap();
    }

    let status = queue.status(&id).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt, status.max_attempts);
}

#[test]
fn test_late_worker_cannot_finish_a_reclaimed_job() {
    let harness = TestHarness::new();
    let queue = &harness.queue;
    let id = queue.submit("Slowpoke", None, None).unwrap();
    queue.dequeue("worker-0").unwrap();
    thread::sleep(Duration::from_millis(5));
    queue.reclaim_stale(Duration::ZERO).unwrap();
    let retaken = queue.dequeue("worker-1").unwrap().unwrap();
    assert_eq!(retaken.id, id);

    let late = queue.complete(&id, "worker-0", 7, None).unwrap_err();
    assert!(late.to_string().contains("no longer held"), "unexpected: {}", late);
    queue.complete(&id, "worker-1", 3, None).unwrap();

    let status = queue.status(&id).unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.result_count, Some(3));
}

#[test]
fn test_history_listing_filters_and_paginates() {
    let harness = TestHarness::new();
    let queue = &harness.queue;
    for i in 0..5 {
        queue.submit(&format!("Owner{}", i), None, None).unwrap();
    }
    let done = queue.dequeue("worker-0").unwrap().unwrap();
    queue.complete(&done.id, "worker-0", 12, None).unwrap();

    let (waiting, total) = queue
        .recent(&JobQuery {
            state: Some(JobState::Waiting),
            limit: Some(2),
            ..JobQuery::default()
        })
        .unwrap();
    assert_eq!(total, 4);
    assert_eq!(waiting.len(), 2);

    let (completed, total) = queue
        .recent(&JobQuery {
            state: Some(JobState::Completed),
            ..JobQuery::default()
        })
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(completed[0].result_count, Some(12));
}

#[test]
fn test_data_survives_reopen() {
    let harness = TestHarness::new();
    let id = harness.queue.submit("Johnson", Some(2), None).unwrap();

    let reopened = parcelscout::Database::open(&harness.db_path).unwrap();
    let queue = parcelscout::JobQueue::new(reopened, &parcelscout::config::QueueConfig::default());
    let job = queue.find_by_id(&id).unwrap().unwrap();
    assert_eq!(job.search_term, "Johnson");
    assert_eq!(job.priority, 2);
}
