//! The queue adapter (C5): the thing user code actually submits operations
//! to.
//!
//! A [`Queue`] is the admission point that wires an operation's conditions
//! and mutual-exclusion requirements into ordinary dependency edges, then
//! hands the operation to the underlying [`Scheduler`] once it becomes
//! ready. None of that wiring lives inside [`crate::operation::Operation`]
//! itself — the operation core only ever sees "I have N dependencies and M
//! of them are evaluator edges"; it is this module's job to produce that
//! shape from conditions, exclusivity categories, and produced children.

use crate::condition;
use crate::config::RuntimeConfig;
use crate::exclusivity;
use crate::observer::Observer;
use crate::operation::{Operation, OperationId};
use crate::scheduler::{Scheduler, Task};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Sentinel stored in `QueueInner::max_concurrent` meaning "no cap".
const UNCAPPED: usize = 0;

/// Hooks into a queue's admission pipeline.
///
/// Mirrors the observer bus but at queue granularity: a delegate sees every
/// operation that passes through `add`, including ones produced internally
/// (evaluators) and ones routed in via another operation's `produce`.
pub trait QueueDelegate: Send + Sync {
    /// Called just before `operation` is wired into the dependency graph and
    /// submitted. Returning is the only contract — a delegate cannot veto
    /// admission, only observe and react (e.g. a group routing a produced
    /// child into its own bookkeeping).
    fn will_add(&self, queue: &Queue, operation: &Operation) {
        let _ = (queue, operation);
    }

    /// Called as `operation` enters `Finishing`, before dependents are
    /// unblocked.
    fn will_finish(&self, queue: &Queue, operation: &Operation) {
        let _ = (queue, operation);
    }

    /// Called after `operation` finishes.
    fn operation_did_finish(&self, queue: &Queue, operation: &Operation) {
        let _ = (queue, operation);
    }

    /// Called when `parent` is about to route `child` to this queue via
    /// `produce`, before `child` is admitted.
    fn will_produce(&self, queue: &Queue, parent: &Operation, child: &Operation) {
        let _ = (queue, parent, child);
    }
}

struct QueueInner {
    name: String,
    scheduler: Scheduler,
    delegate: Mutex<Option<Arc<dyn QueueDelegate>>>,
    tracked: Mutex<HashSet<OperationId>>,
    suspended: AtomicBool,
    /// `UNCAPPED` (0) means no limit; otherwise the maximum number of
    /// operations this queue will have in flight at once.
    max_concurrent: AtomicUsize,
    in_flight: AtomicUsize,
    /// Operations that became `Ready` while suspended, or while already at
    /// `max_concurrent`, waiting for a slot.
    held: Mutex<VecDeque<Operation>>,
}

/// A queue of operations: the primary entry point for submitting work.
#[derive(Clone)]
pub struct Queue(Arc<QueueInner>);

impl Queue {
    /// Create a queue backed by a scheduler with `num_workers` threads (`0`
    /// defaults to the number of available CPUs).
    pub fn with_workers(name: impl Into<String>, num_workers: usize) -> Self {
        Queue(Arc::new(QueueInner {
            name: name.into(),
            scheduler: Scheduler::new(num_workers),
            delegate: Mutex::new(None),
            tracked: Mutex::new(HashSet::new()),
            suspended: AtomicBool::new(false),
            max_concurrent: AtomicUsize::new(UNCAPPED),
            in_flight: AtomicUsize::new(0),
            held: Mutex::new(VecDeque::new()),
        }))
    }

    /// Create a queue with a default-sized scheduler.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_workers(name, 0)
    }

    /// Create a queue whose worker count and concurrency cap are drawn from
    /// `config` (`worker_count` sizes the scheduler, `max_concurrent_operations`
    /// becomes the queue's QoS-hint cap).
    pub fn from_config(name: impl Into<String>, config: &RuntimeConfig) -> Self {
        let queue = Self::with_workers(name, config.worker_count);
        queue.set_max_concurrent(config.max_concurrent_operations);
        queue
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Suspend or resume the queue. While suspended, operations that become
    /// `Ready` are held rather than dispatched; resuming drains whatever is
    /// held, subject to the concurrency cap.
    pub fn set_suspended(&self, suspended: bool) {
        self.0.suspended.store(suspended, Ordering::SeqCst);
        if !suspended {
            self.try_drain();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.0.suspended.load(Ordering::SeqCst)
    }

    /// Set the maximum number of operations this queue runs concurrently.
    /// `None` removes the cap; worker-thread count remains the separate,
    /// coarser bound underneath it.
    pub fn set_max_concurrent(&self, max_concurrent: Option<usize>) {
        self.0
            .max_concurrent
            .store(max_concurrent.unwrap_or(UNCAPPED), Ordering::SeqCst);
        self.try_drain();
    }

    pub fn max_concurrent(&self) -> Option<usize> {
        match self.0.max_concurrent.load(Ordering::SeqCst) {
            UNCAPPED => None,
            n => Some(n),
        }
    }

    pub fn set_delegate(&self, delegate: Arc<dyn QueueDelegate>) {
        *self.0.delegate.lock().unwrap() = Some(delegate);
    }

    fn delegate(&self) -> Option<Arc<dyn QueueDelegate>> {
        self.0.delegate.lock().unwrap().clone()
    }

    /// Admit `operation`: wire conditions, exclusivity, and produced-child
    /// routing, then submit it. Submitting the same operation twice is a
    /// no-op (logged), matching [`Operation::submit`]'s own idempotence.
    pub fn add(&self, operation: Operation) {
        {
            let mut tracked = self.0.tracked.lock().unwrap();
            if !tracked.insert(operation.id()) {
                tracing::warn!(
                    queue = %self.name(),
                    operation = %operation.name(),
                    "operation already added to this queue; ignoring duplicate add"
                );
                return;
            }
        }

        if let Some(delegate) = self.delegate() {
            delegate.will_add(self, &operation);
        }

        operation.set_enclosing_queue(self);

        self.wire_produced_children(&operation);
        self.wire_finish_hooks(&operation);

        let exclusivity_categories = self.wire_exclusivity(&operation);
        self.wire_conditions(&operation, &exclusivity_categories);

        operation.submit();
    }

    /// Admit every operation in `operations`, in order.
    pub fn add_all(&self, operations: impl IntoIterator<Item = Operation>) {
        for op in operations {
            self.add(op);
        }
    }

    fn wire_produced_children(&self, operation: &Operation) {
        let queue = self.clone();
        operation.add_observer(Observer::new().on_did_produce(move |parent, child| {
            if let Some(delegate) = queue.delegate() {
                delegate.will_produce(&queue, parent, child);
            }
            queue.add(child.clone());
        }));
    }

    fn wire_finish_hooks(&self, operation: &Operation) {
        let queue = self.clone();
        operation.add_observer(Observer::new().on_will_finish(move |op| {
            if let Some(delegate) = queue.delegate() {
                delegate.will_finish(&queue, op);
            }
        }));

        let queue = self.clone();
        operation.add_observer(Observer::new().on_did_finish(move |op| {
            if let Some(delegate) = queue.delegate() {
                delegate.operation_did_finish(&queue, op);
            }
        }));
    }

    /// Register each of `operation`'s mutually-exclusive categories with the
    /// exclusivity manager, wiring previous holders in as indirect
    /// dependencies and releasing on finish. Returns the category names
    /// registered, for the evaluator to also depend on.
    fn wire_exclusivity(&self, operation: &Operation) -> Vec<String> {
        let conditions = operation.conditions();
        let mut categories = Vec::new();

        for condition in &conditions {
            if let Some(category) = condition.mutually_exclusive_category() {
                let category = category.to_string();
                let previous_holders = exclusivity::acquire(&category, operation);
                for holder in previous_holders {
                    operation.add_indirect_dependency(&holder);
                }

                let category_for_release = category.clone();
                let op_for_release = operation.clone();
                operation.add_observer(Observer::new().on_did_finish(move |_op| {
                    exclusivity::release(&category_for_release, &op_for_release);
                }));

                categories.push(category);
            }
        }

        categories
    }

    /// If `operation` carries conditions, synthesize an evaluator operation,
    /// wire it as `operation`'s evaluator edge, and give the evaluator every
    /// indirect dependency `operation` picked up from exclusivity plus
    /// `operation`'s own direct dependencies and each condition's own
    /// dependencies — a safe superset, ensuring conditions never evaluate
    /// before anything they might read has actually finished.
    fn wire_conditions(&self, operation: &Operation, _exclusivity_categories: &[String]) {
        let conditions = operation.conditions();
        if conditions.is_empty() {
            return;
        }

        let evaluator = condition::build_evaluator(operation);

        for dep in operation.direct_dependencies() {
            evaluator.add_indirect_dependency(&dep);
        }
        for condition in &conditions {
            for dep in condition.dependencies(operation) {
                evaluator.add_indirect_dependency(&dep);
            }
        }

        operation.set_evaluator(&evaluator);
        operation.add_dependency(&evaluator);

        // If the evaluator finishes with errors, the target must never
        // execute: fail it directly with those errors rather than letting
        // the ordinary dependency-countdown path carry it to `Ready`. This
        // observer runs during the evaluator's own `didFinish` dispatch,
        // strictly before `notify_dependents` advances the target's state,
        // so it always wins the race against the target becoming ready.
        let target_for_evaluation = operation.clone();
        evaluator.add_observer(Observer::new().on_did_finish(move |eval_op| {
            let errors = eval_op.errors();
            if !errors.is_empty() {
                target_for_evaluation.fail_from_condition_failure(errors);
            }
        }));

        self.add(evaluator);
    }

    /// Called by a ready operation to hand itself to the scheduler. Held
    /// back instead if the queue is suspended or already at its concurrency
    /// cap; `try_drain` releases it once a slot opens up.
    pub(crate) fn dispatch(&self, operation: Operation) {
        self.0.held.lock().unwrap().push_back(operation);
        self.try_drain();
    }

    /// Hand held operations to the scheduler while the queue is not
    /// suspended and has room under its concurrency cap. Each dispatched
    /// operation gets a `did_finish` observer that frees its slot and
    /// re-runs this drain, so a cap never leaves work stranded once it
    /// finishes.
    fn try_drain(&self) {
        loop {
            if self.is_suspended() {
                return;
            }

            let cap = self.0.max_concurrent.load(Ordering::SeqCst);
            if cap != UNCAPPED && self.0.in_flight.load(Ordering::SeqCst) >= cap {
                return;
            }

            let Some(operation) = self.0.held.lock().unwrap().pop_front() else {
                return;
            };

            self.0.in_flight.fetch_add(1, Ordering::SeqCst);

            let queue = self.clone();
            operation.add_observer(Observer::new().on_did_finish(move |_op| {
                queue.0.in_flight.fetch_sub(1, Ordering::SeqCst);
                queue.try_drain();
            }));

            self.0.scheduler.spawn(Task::new(move || {
                operation.run_on_worker();
            }));
        }
    }

    pub fn worker_count(&self) -> usize {
        self.0.scheduler.worker_count()
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name())
            .field("worker_count", &self.worker_count())
            .field("suspended", &self.is_suspended())
            .field("max_concurrent", &self.max_concurrent())
            .finish()
    }
}
