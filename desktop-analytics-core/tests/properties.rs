//! Property tests for delivery accounting and identity sanitization

use desktop_analytics_core::{Identity, StatisticsMonitor};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, Copy)]
enum Op {
    Submit,
    Succeed,
    FailAll,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Submit),
        2 => Just(Op::Succeed),
        1 => Just(Op::FailAll),
    ]
}

fn apply(monitor: &StatisticsMonitor, op: Op) {
    match op {
        Op::Submit => monitor.record_submission(),
        Op::Succeed => monitor.record_success(),
        Op::FailAll => monitor.record_bulk_failure(),
    }
}

// ── Resolved never exceeds submitted ──────────────────────────────────────

proptest! {
    #[test]
    fn resolved_never_exceeds_submitted(ops in prop::collection::vec(op(), 0..200)) {
        let monitor = StatisticsMonitor::new();
        for op in ops {
            apply(&monitor, op);
            let snap = monitor.snapshot();
            prop_assert!(snap.succeeded + snap.failed <= snap.submitted);
        }
    }

    #[test]
    fn resolved_never_exceeds_submitted_across_threads(
        lanes in prop::collection::vec(prop::collection::vec(op(), 0..100), 1..6)
    ) {
        let monitor = Arc::new(StatisticsMonitor::new());
        let expected_submissions = lanes
            .iter()
            .flatten()
            .filter(|op| matches!(op, Op::Submit))
            .count() as u64;

        let handles: Vec<_> = lanes
            .into_iter()
            .map(|lane| {
                let monitor = Arc::clone(&monitor);
                thread::spawn(move || {
                    lane.into_iter().all(|op| {
                        apply(&monitor, op);
                        let snap = monitor.snapshot();
                        snap.succeeded + snap.failed <= snap.submitted
                    })
                })
            })
            .collect();

        for handle in handles {
            prop_assert!(handle.join().unwrap());
        }
        prop_assert_eq!(monitor.snapshot().submitted, expected_submissions);
    }

    #[test]
    fn bulk_failure_without_outstanding_changes_nothing(
        ops in prop::collection::vec(op(), 0..100)
    ) {
        let monitor = StatisticsMonitor::new();
        for op in ops {
            apply(&monitor, op);
        }
        // Settle everything, then a further failure must be a no-op.
        monitor.record_bulk_failure();
        let settled = monitor.snapshot();
        monitor.record_bulk_failure();
        prop_assert_eq!(monitor.snapshot(), settled);
    }
}

// ── Sanitization ──────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn sanitized_email_keeps_only_domain(
        user in "[a-z0-9.]{1,12}",
        domain in "[a-z]{2,10}\\.[a-z]{2,4}"
    ) {
        let identity = Identity {
            email: format!("{user}@{domain}"),
            ..Default::default()
        };
        prop_assert_eq!(identity.sanitized().email, format!("@{domain}"));
    }

    #[test]
    fn sanitized_name_is_initial_plus_digest(name in "[A-Z][a-z]{1,15}") {
        let identity = Identity {
            first_name: name.clone(),
            ..Default::default()
        };
        let first = identity.sanitized().first_name;
        let again = identity.sanitized().first_name;

        prop_assert_eq!(&first, &again);
        prop_assert_ne!(&first, &name);
        prop_assert!(first.starts_with(&name[..1]));
        prop_assert!(first.len() > 1);
    }
}
