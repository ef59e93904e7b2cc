//! Pre-flight conditions (C7).
//!
//! A [`Condition`] is a predicate evaluated once, synchronously, inside a
//! synthesized "evaluator" operation before its target is allowed to become
//! ready. The evaluator is an ordinary operation wired into the target's
//! dependency graph by the queue adapter — conditions never get their own
//! bespoke state-tracking; they ride the same dependency-countdown
//! machinery every other edge uses.

use crate::error::{ConditionFailure, OperationError};
use crate::operation::Operation;
use std::fmt;
use std::sync::Arc;

/// The outcome of evaluating a single condition against its operation.
#[derive(Debug, Clone)]
pub enum ConditionResult {
    Satisfied,
    Failed(ConditionFailure),
}

impl ConditionResult {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, ConditionResult::Satisfied)
    }
}

/// A named, evaluatable pre-flight requirement.
///
/// `dependencies` lets a condition contribute its own operations (e.g. a
/// permission-prompt operation) that must finish before the target's
/// evaluator runs; the queue adapter wires these in as indirect
/// dependencies alongside the target's direct ones.
pub trait Condition: Send + Sync {
    /// A short, human-readable name, surfaced in debug dumps.
    fn name(&self) -> &str;

    /// Operations this condition needs to have finished before it can be
    /// evaluated. Defaults to none.
    fn dependencies(&self, _operation: &Operation) -> Vec<Operation> {
        Vec::new()
    }

    /// Whether this condition mutually excludes concurrent execution of
    /// other operations carrying the same category name.
    fn mutually_exclusive_category(&self) -> Option<&str> {
        None
    }

    /// Evaluate the condition against its target operation.
    fn evaluate(&self, operation: &Operation) -> ConditionResult;
}

/// Always satisfied.
pub struct TrueCondition;

impl Condition for TrueCondition {
    fn name(&self) -> &str {
        "TrueCondition"
    }
    fn evaluate(&self, _operation: &Operation) -> ConditionResult {
        ConditionResult::Satisfied
    }
}

/// Always fails.
pub struct FalseCondition;

impl Condition for FalseCondition {
    fn name(&self) -> &str {
        "FalseCondition"
    }
    fn evaluate(&self, _operation: &Operation) -> ConditionResult {
        ConditionResult::Failed(ConditionFailure::FalseCondition)
    }
}

/// Wraps a synchronous predicate over the target operation.
pub struct BlockCondition<F> {
    name: String,
    predicate: F,
}

impl<F> BlockCondition<F>
where
    F: Fn(&Operation) -> bool + Send + Sync,
{
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }
}

impl<F> Condition for BlockCondition<F>
where
    F: Fn(&Operation) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, operation: &Operation) -> ConditionResult {
        if (self.predicate)(operation) {
            ConditionResult::Satisfied
        } else {
            ConditionResult::Failed(ConditionFailure::BlockFailed)
        }
    }
}

/// Fails if any direct dependency of the target was cancelled or finished
/// with errors.
pub struct NoFailedDependenciesCondition {
    ignore_cancellations: bool,
}

impl NoFailedDependenciesCondition {
    pub fn new() -> Self {
        Self {
            ignore_cancellations: false,
        }
    }

    pub fn ignoring_cancellations(mut self) -> Self {
        self.ignore_cancellations = true;
        self
    }
}

impl Default for NoFailedDependenciesCondition {
    fn default() -> Self {
        Self::new()
    }
}

impl Condition for NoFailedDependenciesCondition {
    fn name(&self) -> &str {
        "NoFailedDependenciesCondition"
    }

    fn evaluate(&self, operation: &Operation) -> ConditionResult {
        let mut any_cancelled = false;
        let mut any_failed = false;

        for dep in operation.direct_dependencies() {
            if dep.is_cancelled() && !self.ignore_cancellations {
                any_cancelled = true;
            }
            if !dep.errors().is_empty() {
                any_failed = true;
            }
        }

        if any_cancelled {
            ConditionResult::Failed(ConditionFailure::CancelledDependencies)
        } else if any_failed {
            ConditionResult::Failed(ConditionFailure::FailedDependencies)
        } else {
            ConditionResult::Satisfied
        }
    }
}

/// Wraps another condition, optionally negating its result and/or
/// suppressing the underlying failure detail (reporting only
/// `RequirementNotSatisfied` on negation).
///
/// `ComposedCondition::new(ComposedCondition::new(c))` behaves identically
/// to `ComposedCondition::new(c)` in the default (non-negated, non-silent)
/// case: composing is idempotent unless negation or silencing is requested.
pub struct ComposedCondition {
    inner: Arc<dyn Condition>,
    negated: bool,
    silent: bool,
}

impl ComposedCondition {
    pub fn new(inner: Arc<dyn Condition>) -> Self {
        Self {
            inner,
            negated: false,
            silent: false,
        }
    }

    pub fn negated(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

impl Condition for ComposedCondition {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn dependencies(&self, operation: &Operation) -> Vec<Operation> {
        self.inner.dependencies(operation)
    }

    fn mutually_exclusive_category(&self) -> Option<&str> {
        self.inner.mutually_exclusive_category()
    }

    fn evaluate(&self, operation: &Operation) -> ConditionResult {
        let result = self.inner.evaluate(operation);
        let satisfied = result.is_satisfied() ^ self.negated;

        if satisfied {
            ConditionResult::Satisfied
        } else if self.silent || self.negated {
            ConditionResult::Failed(ConditionFailure::RequirementNotSatisfied)
        } else {
            match result {
                ConditionResult::Failed(f) => ConditionResult::Failed(f),
                ConditionResult::Satisfied => {
                    ConditionResult::Failed(ConditionFailure::RequirementNotSatisfied)
                }
            }
        }
    }
}

impl fmt::Debug for ComposedCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedCondition")
            .field("inner", &self.inner.name())
            .field("negated", &self.negated)
            .field("silent", &self.silent)
            .finish()
    }
}

/// Build the synthesized evaluator operation for `target`: evaluating every
/// condition attached to it and finishing with a `Condition` error for the
/// first failure encountered, in attachment order.
pub(crate) fn build_evaluator(target: &Operation) -> Operation {
    let conditions = target.conditions();
    let target_for_body = target.clone();

    Operation::new(format!("{}.evaluator", target.name()), move |op: Operation| {
        let mut errors = Vec::new();
        for condition in &conditions {
            match condition.evaluate(&target_for_body) {
                ConditionResult::Satisfied => {}
                ConditionResult::Failed(failure) => {
                    errors.push(OperationError::from(failure));
                }
            }
        }
        op.finish(errors);
    })
}
