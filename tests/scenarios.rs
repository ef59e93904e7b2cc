//! End-to-end scenario tests exercising the runtime the way a caller would:
//! through `Queue::add`, observers, and delegates, never reaching into
//! internals. Each test corresponds to one literal scenario from the
//! concurrency-core design: basic execution, mutual exclusion, condition
//! gating off a failed group child, a group waiting on a produced
//! grandchild, and retry succeeding or giving up under a policy.

use operon::clock::DelayStrategy;
use operon::condition::NoFailedDependenciesCondition;
use operon::group::Group;
use operon::observer::Observer;
use operon::operation::Operation;
use operon::queue::{Queue, QueueDelegate};
use operon::retry::{Decision, MaxAttempts, RetryOperation, RetryPolicy};
use operon::OperationError;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn wait_until_finished(op: &Operation, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !op.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Records queue-delegate callbacks in the order they fired, for assertions
/// on admission-pipeline ordering.
#[derive(Default)]
struct RecordingDelegate {
    events: Mutex<Vec<&'static str>>,
}

impl QueueDelegate for RecordingDelegate {
    fn will_add(&self, _queue: &Queue, _operation: &Operation) {
        self.events.lock().unwrap().push("willAdd");
    }
    fn will_finish(&self, _queue: &Queue, _operation: &Operation) {
        self.events.lock().unwrap().push("willFinish");
    }
    fn operation_did_finish(&self, _queue: &Queue, _operation: &Operation) {
        self.events.lock().unwrap().push("didFinish");
    }
}

// S1 — Basic execute. A plain operation sleeps briefly and finishes cleanly,
// with the queue's delegate observing willAdd/willFinish/didFinish exactly
// once each.
#[test]
fn s1_basic_execute() {
    let queue = Queue::new("s1");
    let delegate = Arc::new(RecordingDelegate::default());
    queue.set_delegate(delegate.clone());

    let did_execute = Arc::new(AtomicBool::new(false));
    let did_execute2 = Arc::clone(&did_execute);
    let op = Operation::new("sleeper", move |op: Operation| {
        std::thread::sleep(Duration::from_millis(1));
        did_execute2.store(true, Ordering::SeqCst);
        op.finish(Vec::new());
    });

    queue.add(op.clone());
    wait_until_finished(&op, Duration::from_secs(2));

    assert!(did_execute.load(Ordering::SeqCst));
    assert!(op.errors().is_empty());
    assert!(op.is_succeeded());

    let events = delegate.events.lock().unwrap().clone();
    assert_eq!(
        events.iter().filter(|e| **e == "willAdd").count(),
        1,
        "willAdd should fire exactly once, saw {events:?}"
    );
    assert_eq!(events.iter().filter(|e| **e == "willFinish").count(), 1);
    assert_eq!(events.iter().filter(|e| **e == "didFinish").count(), 1);
    assert_eq!(events, vec!["willAdd", "willFinish", "didFinish"]);
}

// S2 — Mutual exclusion. Five operations holding the same category serialize:
// their executing intervals never overlap, the total wall time is at least
// the sum of their individual hold times, and they run in submission order.
#[test]
fn s2_mutual_exclusion_serializes_five_operations() {
    // A category name unique to this test: the exclusivity registry is a
    // process-wide singleton, so category names must not collide with other
    // tests running in the same binary.
    let queue = Queue::with_workers("s2", 5);

    struct SharedResource;
    impl operon::condition::Condition for SharedResource {
        fn name(&self) -> &str {
            "SharedResource"
        }
        fn mutually_exclusive_category(&self) -> Option<&str> {
            Some("s2-category-x")
        }
        fn evaluate(&self, _op: &Operation) -> operon::condition::ConditionResult {
            operon::condition::ConditionResult::Satisfied
        }
    }

    let active = Arc::new(AtomicUsize::new(0));
    let max_concurrent = Arc::new(AtomicUsize::new(0));
    let run_order = Arc::new(Mutex::new(Vec::new()));

    let mut ops = Vec::new();
    for label in ["A", "B", "C", "D", "E"] {
        let active = Arc::clone(&active);
        let max_concurrent = Arc::clone(&max_concurrent);
        let run_order = Arc::clone(&run_order);
        let op = Operation::new(format!("s2-{label}"), move |op: Operation| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_concurrent.fetch_max(now, Ordering::SeqCst);
            run_order.lock().unwrap().push(label);
            std::thread::sleep(Duration::from_millis(50));
            active.fetch_sub(1, Ordering::SeqCst);
            op.finish(Vec::new());
        });
        op.add_condition(Arc::new(SharedResource));
        ops.push(op);
    }

    let start = Instant::now();
    for op in &ops {
        queue.add(op.clone());
    }
    for op in &ops {
        wait_until_finished(op, Duration::from_secs(5));
    }
    let elapsed = start.elapsed();

    assert_eq!(max_concurrent.load(Ordering::SeqCst), 1, "at most one executing at a time");
    assert!(
        elapsed >= Duration::from_millis(250),
        "five 50ms exclusive holds should take at least 250ms, took {elapsed:?}"
    );
    assert_eq!(*run_order.lock().unwrap(), vec!["A", "B", "C", "D", "E"]);
}

// S3 — Failed dependency condition. A group's only child fails; a target
// depending on the group and gated by NoFailedDependenciesCondition never
// executes and accumulates a FailedDependencies error.
#[test]
fn s3_failed_dependency_condition_blocks_execution() {
    let outer = Queue::new("s3");

    let failing_child = Operation::new("failing-child", |op: Operation| {
        op.finish(vec![OperationError::domain("simulated")]);
    });
    let group = Group::new("s3-group", vec![failing_child]);

    let did_execute = Arc::new(AtomicBool::new(false));
    let did_execute2 = Arc::clone(&did_execute);
    let target = Operation::new("target", move |op: Operation| {
        did_execute2.store(true, Ordering::SeqCst);
        op.finish(Vec::new());
    });
    target.add_dependency(&group.operation());
    target.add_condition(Arc::new(NoFailedDependenciesCondition::new()));

    outer.add(group.operation());
    outer.add(target.clone());

    wait_until_finished(&target, Duration::from_secs(3));

    assert!(!did_execute.load(Ordering::SeqCst), "target must not execute");
    assert!(target.is_failed());
    let messages: Vec<String> = target.errors().iter().map(|e| e.to_string()).collect();
    assert!(
        messages.iter().any(|m| m.contains("FailedDependencies") || m.contains("dependencies failed")),
        "expected a FailedDependencies error, got {messages:?}"
    );
}

// S4 — Group with produced child. A group's only initial child produces a
// grandchild mid-execution; the group must not finish until both have
// finished, and both must end up in the group's recorded membership.
#[test]
fn s4_group_waits_for_produced_grandchild() {
    let outer = Queue::new("s4");

    let c2_ran = Arc::new(AtomicBool::new(false));
    let c2_ran_for_body = Arc::clone(&c2_ran);

    let c1 = Operation::new("c1", move |op: Operation| {
        std::thread::sleep(Duration::from_millis(10));
        let c2_ran = Arc::clone(&c2_ran_for_body);
        let c2 = Operation::new("c2", move |c2_op: Operation| {
            std::thread::sleep(Duration::from_millis(20));
            c2_ran.store(true, Ordering::SeqCst);
            c2_op.finish(Vec::new());
        });
        op.produce(c2);
        op.finish(Vec::new());
    });

    let group = Group::new("s4-group", vec![c1.clone()]);
    outer.add(group.operation());

    wait_until_finished(&group.operation(), Duration::from_secs(3));

    assert!(group.operation().is_finished());
    assert!(c1.is_finished());
    assert!(c2_ran.load(Ordering::SeqCst), "grandchild must have run before group finished");
}

// S5 — Retry with policy. A generator yields attempts that fail twice then
// succeed; the retry finishes successfully after three attempts with two
// recorded historical failures.
#[test]
fn s5_retry_succeeds_after_two_failures() {
    let queue = Queue::new("s5");

    let retry = RetryOperation::new(
        "s5-flaky",
        move |attempt| {
            Operation::new(format!("s5-attempt-{attempt}"), move |op: Operation| {
                if attempt < 3 {
                    op.finish(vec![OperationError::domain("not ready yet")]);
                } else {
                    op.finish(Vec::new());
                }
            })
        },
        MaxAttempts(5),
        DelayStrategy::Immediate,
    );

    queue.add(retry.operation());
    wait_until_finished(&retry.operation(), Duration::from_secs(3));

    assert!(retry.operation().is_succeeded());
    assert_eq!(retry.attempt_count(), 3);
    assert_eq!(retry.historical_errors().len(), 2);
}

// S6 — Retry policy says stop. The policy refuses to retry after the first
// failure; the retry finishes failed after exactly one attempt.
#[test]
fn s6_retry_policy_stops_after_first_failure() {
    struct StopImmediately;
    impl RetryPolicy for StopImmediately {
        fn decide(&self, _attempt: u32, _historical_errors: &[Vec<OperationError>]) -> Decision {
            Decision::Stop
        }
    }

    let queue = Queue::new("s6");
    let retry = RetryOperation::new(
        "s6-always-fails",
        |attempt| {
            Operation::new(format!("s6-attempt-{attempt}"), |op: Operation| {
                op.finish(vec![OperationError::domain("nope")]);
            })
        },
        StopImmediately,
        DelayStrategy::Immediate,
    );

    queue.add(retry.operation());
    wait_until_finished(&retry.operation(), Duration::from_secs(3));

    assert_eq!(retry.attempt_count(), 1);
    assert!(retry.operation().is_failed());
    assert_eq!(retry.operation().errors().len(), 1);
}

// Invariant sweep: properties that must hold regardless of scenario.
mod invariants {
    use super::*;

    // Invariant 1 — state advances monotonically; never observed to decrease.
    #[test]
    fn state_is_monotonic_across_observed_transitions() {
        let queue = Queue::new("inv-monotonic");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_for_obs = Arc::clone(&seen);

        let op = Operation::new("monotonic", |op: Operation| op.finish(Vec::new()));
        op.add_observer(Observer::new().on_will_execute(move |op| {
            seen_for_obs.lock().unwrap().push(op.state());
        }));
        let seen_for_finish = Arc::clone(&seen);
        op.add_observer(Observer::new().on_did_finish(move |op| {
            seen_for_finish.lock().unwrap().push(op.state());
        }));

        queue.add(op.clone());
        wait_until_finished(&op, Duration::from_secs(2));

        let states = seen.lock().unwrap().clone();
        for pair in states.windows(2) {
            assert!(pair[0] <= pair[1], "state went backwards: {states:?}");
        }
    }

    // Invariant 2 — a dependency added before enqueue finishes strictly
    // before its dependent starts.
    #[test]
    fn dependency_finishes_before_dependent_starts() {
        let queue = Queue::new("inv-dep-order");
        let dep = Operation::new("dep", |op: Operation| op.finish(Vec::new()));
        let dependent = Operation::new("dependent", |op: Operation| op.finish(Vec::new()));
        dependent.add_dependency(&dep);

        queue.add(dependent.clone());
        queue.add(dep.clone());
        wait_until_finished(&dependent, Duration::from_secs(2));

        assert!(dep.finished_at().unwrap() <= dependent.started_at().unwrap());
    }

    // Invariant 4 — an observer attached before enqueue sees didFinish
    // exactly once.
    #[test]
    fn did_finish_observer_fires_exactly_once() {
        let queue = Queue::new("inv-did-finish-once");
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);

        let op = Operation::new("once", |op: Operation| op.finish(Vec::new()));
        op.add_observer(Observer::new().on_did_finish(move |_op| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        queue.add(op.clone());
        wait_until_finished(&op, Duration::from_secs(2));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    // Invariant 7 — cancellation is idempotent.
    #[test]
    fn repeated_cancel_is_observably_identical_to_one() {
        let op = Operation::noop("idempotent-cancel");
        op.cancel_with_errors(vec![OperationError::domain("first")]);
        let errors_after_first = op.errors();
        op.cancel_with_errors(vec![OperationError::domain("second")]);
        assert_eq!(op.errors().len(), errors_after_first.len());
    }

    // Round-trip law: NoFailedDependenciesCondition with zero dependencies
    // is always satisfied.
    #[test]
    fn no_failed_dependencies_with_no_deps_is_satisfied() {
        let target = Operation::noop("lonely");
        let cond = NoFailedDependenciesCondition::new();
        assert!(cond.evaluate(&target).is_satisfied());
    }

    // Adding the same operation to a queue twice is detected and ignored,
    // not a crash.
    #[test]
    fn duplicate_submission_does_not_crash_the_queue() {
        let queue = Queue::new("inv-dup");
        let op = Operation::new("dup", |op: Operation| op.finish(Vec::new()));
        queue.add(op.clone());
        queue.add(op.clone());
        wait_until_finished(&op, Duration::from_secs(2));
        assert!(op.is_finished());
    }
}
