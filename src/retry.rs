//! Retry operations (C9): an operation that re-attempts a unit of work
//! according to a caller-supplied policy.
//!
//! Unlike [`crate::group::Group`], a retry operation doesn't need its own
//! private queue or a rotating barrier — its children form a strict linear
//! chain, one attempt at a time, so it just rides the ordinary `produce`
//! routing every operation already gets from whichever queue hosts it.

use crate::cell::ProtectedCell;
use crate::clock::DelayStrategy;
use crate::config::RuntimeConfig;
use crate::error::OperationError;
use crate::observer::Observer;
use crate::operation::Operation;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// What a [`RetryPolicy`] decides after an attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry,
    Stop,
}

/// Decides, after each failed attempt, whether to try again.
///
/// `attempt` is the 1-based number of the attempt that just failed;
/// `historical_errors` holds the error list from every attempt so far, in
/// order, including the one that just failed.
pub trait RetryPolicy: Send + Sync {
    fn decide(&self, attempt: u32, historical_errors: &[Vec<OperationError>]) -> Decision;
}

/// Retries up to a fixed number of times, then stops.
pub struct MaxAttempts(pub u32);

impl RetryPolicy for MaxAttempts {
    fn decide(&self, attempt: u32, _historical_errors: &[Vec<OperationError>]) -> Decision {
        if attempt < self.0 {
            Decision::Retry
        } else {
            Decision::Stop
        }
    }
}

/// Wraps an arbitrary closure as a [`RetryPolicy`].
pub struct ClosurePolicy<F>(pub F);

impl<F> RetryPolicy for ClosurePolicy<F>
where
    F: Fn(u32, &[Vec<OperationError>]) -> Decision + Send + Sync,
{
    fn decide(&self, attempt: u32, historical_errors: &[Vec<OperationError>]) -> Decision {
        (self.0)(attempt, historical_errors)
    }
}

type Generator = dyn Fn(u32) -> Operation + Send + Sync;

struct RetryInner {
    generator: Arc<Generator>,
    policy: Arc<dyn RetryPolicy>,
    delay: DelayStrategy,
    historical_errors: ProtectedCell<Vec<Vec<OperationError>>>,
    attempt_count: AtomicU32,
}

/// An operation that drives a sequence of attempts, each built by a
/// generator function, stopping on the first success or when the policy
/// says to give up.
#[derive(Clone)]
pub struct RetryOperation {
    inner: Arc<RetryInner>,
    operation: Operation,
}

impl RetryOperation {
    /// `generator(attempt)` builds the operation to run for 1-based
    /// `attempt`. It may return a different kind of operation on each call
    /// (e.g. a fallback strategy after the first few attempts).
    pub fn new(
        name: impl Into<String>,
        generator: impl Fn(u32) -> Operation + Send + Sync + 'static,
        policy: impl RetryPolicy + 'static,
        delay: DelayStrategy,
    ) -> Self {
        let inner = Arc::new(RetryInner {
            generator: Arc::new(generator),
            policy: Arc::new(policy),
            delay,
            historical_errors: ProtectedCell::new(Vec::new()),
            attempt_count: AtomicU32::new(0),
        });

        let body_inner = Arc::clone(&inner);
        let operation = Operation::new(name, move |op: Operation| {
            body_inner.run_attempt(&op, 1);
        });

        RetryOperation { inner, operation }
    }

    /// Like [`RetryOperation::new`], but takes its delay strategy from
    /// `config.default_delay_strategy` rather than requiring the caller to
    /// name one explicitly.
    pub fn with_config(
        name: impl Into<String>,
        generator: impl Fn(u32) -> Operation + Send + Sync + 'static,
        policy: impl RetryPolicy + 'static,
        config: &RuntimeConfig,
    ) -> Self {
        Self::new(name, generator, policy, config.default_delay_strategy.clone())
    }

    pub fn operation(&self) -> Operation {
        self.operation.clone()
    }

    /// How many attempts have been started so far.
    pub fn attempt_count(&self) -> u32 {
        self.inner.attempt_count.load(Ordering::SeqCst)
    }

    /// The error list from every attempt so far, in order.
    pub fn historical_errors(&self) -> Vec<Vec<OperationError>> {
        self.inner.historical_errors.snapshot()
    }
}

impl RetryInner {
    fn run_attempt(self: &Arc<Self>, retry_op: &Operation, attempt: u32) {
        self.attempt_count.store(attempt, Ordering::SeqCst);

        let attempt_op = (self.generator)(attempt);

        let inner = Arc::clone(self);
        let retry_op_for_observer = retry_op.clone();
        attempt_op.add_observer(Observer::new().on_did_finish(move |finished_attempt| {
            let errors = finished_attempt.errors();
            if errors.is_empty() {
                retry_op_for_observer.finish(Vec::new());
                return;
            }

            let historical = inner.historical_errors.with_write(|log| {
                log.push(errors.clone());
                log.clone()
            });

            match inner.policy.decide(attempt, &historical) {
                Decision::Stop => retry_op_for_observer.finish(errors),
                Decision::Retry => {
                    let delay = inner.delay.delay_for(attempt + 1);
                    let inner = Arc::clone(&inner);
                    let retry_op = retry_op_for_observer.clone();
                    std::thread::spawn(move || {
                        if !delay.is_zero() {
                            crate::clock::sleep_until(Instant::now() + delay);
                        }
                        inner.run_attempt(&retry_op, attempt + 1);
                    });
                }
            }
        }));

        retry_op.produce(attempt_op);
    }
}
