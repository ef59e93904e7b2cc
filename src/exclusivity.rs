//! Process-wide mutual exclusion registry (C6).
//!
//! Operations attaching a condition with a
//! [`crate::condition::Condition::mutually_exclusive_category`] are
//! serialized against every other operation sharing that category name,
//! regardless of which queue they were submitted to. The registry is a
//! single process-wide singleton — exactly one of these per process, not
//! one per queue — so two independent queues still can't run two
//! `"photos-library"`-category operations concurrently.

use crate::cell::ProtectedCell;
use crate::operation::Operation;
use std::collections::HashMap;
use std::sync::OnceLock;

fn registry() -> &'static ProtectedCell<HashMap<String, Vec<Operation>>> {
    static REGISTRY: OnceLock<ProtectedCell<HashMap<String, Vec<Operation>>>> = OnceLock::new();
    REGISTRY.get_or_init(ProtectedCell::default)
}

/// Register `operation` as wanting exclusive access to `category`, and
/// return the operations that currently hold (or are waiting on) it — the
/// caller should add each as a dependency so `operation` cannot become ready
/// until they've all finished.
pub(crate) fn acquire(category: &str, operation: &Operation) -> Vec<Operation> {
    registry().with_write(|registry| {
        let holders = registry.entry(category.to_string()).or_default();
        let previous = holders.clone();
        holders.push(operation.clone());
        previous
    })
}

/// Remove `operation` from `category`'s holder list. Safe to call even if
/// `operation` was never registered (a no-op in that case).
pub(crate) fn release(category: &str, operation: &Operation) {
    registry().with_write(|registry| {
        if let Some(holders) = registry.get_mut(category) {
            holders.retain(|op| op.id() != operation.id());
        }
    });
}

/// Clear all categories. Test-only: prevents state bleeding between tests
/// that exercise the same category name against the shared singleton.
#[cfg(test)]
pub(crate) fn reset_for_test() {
    registry().with_write(|registry| registry.clear());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_acquirer_has_no_predecessors() {
        reset_for_test();
        let op = Operation::noop("first");
        let previous = acquire("cat-a", &op);
        assert!(previous.is_empty());
    }

    #[test]
    fn second_acquirer_depends_on_first() {
        reset_for_test();
        let first = Operation::noop("first");
        let second = Operation::noop("second");
        acquire("cat-b", &first);
        let previous = acquire("cat-b", &second);
        assert_eq!(previous.len(), 1);
        assert_eq!(previous[0].id(), first.id());
    }

    #[test]
    fn release_removes_holder() {
        reset_for_test();
        let first = Operation::noop("first");
        acquire("cat-c", &first);
        release("cat-c", &first);
        let second = Operation::noop("second");
        let previous = acquire("cat-c", &second);
        assert!(previous.is_empty());
    }
}
