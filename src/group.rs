//! Group operations (C8): an operation that is itself a little queue of
//! other operations.
//!
//! A group finishes only once every operation it has ever been given —
//! whether supplied up front, added later via [`Group::add_operations`], or
//! produced at runtime by one of its own children — has finished. The
//! classic difficulty here is a child producing a grandchild *after* the
//! group thought it was done counting: this module resolves it with a
//! rotating barrier (`CanFinish`) rather than a single static count.
//!
//! # The rotating barrier
//!
//! `CanFinish` is a plain internal operation whose dependencies are a
//! snapshot of "children not yet finished". When it becomes ready it
//! re-checks the live children list: if nothing is unfinished and no add is
//! in flight, it finishes for real. Otherwise it builds a *successor*
//! `CanFinish` depending on whatever is still unfinished, installs the
//! successor as the new current barrier, rewires the group's
//! `finishingOperation` to also depend on the successor, and only then
//! finishes itself — without ever flipping the group into its finishing
//! state. `finishingOperation` ends up depending on a chain of barriers
//! rather than a fixed count, so a grandchild produced mid-flight always
//! has a barrier left to attach to.

use crate::cell::ProtectedCell;
use crate::error::OperationError;
use crate::observer::Observer;
use crate::operation::{Operation, OperationId};
use crate::queue::{Queue, QueueDelegate};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

type RecoveryHook = dyn Fn(&[OperationError]) -> Vec<Operation> + Send + Sync;

struct GroupInner {
    name: String,
    private_queue: Queue,
    operations: ProtectedCell<Vec<Operation>>,
    tracked_ids: ProtectedCell<HashSet<OperationId>>,
    fatal_errors: ProtectedCell<Vec<OperationError>>,
    attempted_recovery: AtomicBool,
    adding_count: AtomicUsize,
    is_group_finishing: AtomicBool,
    rotation_lock: Mutex<()>,
    can_finish: Mutex<Operation>,
    finishing_operation: Mutex<Operation>,
    recovery_hook: Mutex<Option<Arc<RecoveryHook>>>,
}

/// A group of operations exposed to the outside world as a single
/// [`Operation`].
#[derive(Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
    operation: Operation,
}

impl Group {
    /// Build a group seeded with `initial_children`. The group does not
    /// start running any of them until its own [`Group::operation`] is
    /// submitted to a queue and becomes ready, exactly like any other
    /// operation with conditions and dependencies of its own.
    pub fn new(name: impl Into<String>, initial_children: Vec<Operation>) -> Self {
        let name = name.into();

        let inner = Arc::new_cyclic(|weak: &Weak<GroupInner>| {
            let private_queue = Queue::new(format!("{name}.private"));
            let finishing_operation = Operation::noop(format!("{name}.finishingOperation"));
            let can_finish = Self::build_can_finish(weak.clone(), format!("{name}.canFinish#0"));

            for child in &initial_children {
                can_finish.add_dependency(child);
            }
            finishing_operation.add_dependency(&can_finish);

            let tracked_ids = initial_children.iter().map(|op| op.id()).collect();

            GroupInner {
                name,
                private_queue,
                operations: ProtectedCell::new(initial_children),
                tracked_ids: ProtectedCell::new(tracked_ids),
                fatal_errors: ProtectedCell::new(Vec::new()),
                attempted_recovery: AtomicBool::new(false),
                adding_count: AtomicUsize::new(0),
                is_group_finishing: AtomicBool::new(false),
                rotation_lock: Mutex::new(()),
                can_finish: Mutex::new(can_finish),
                finishing_operation: Mutex::new(finishing_operation),
                recovery_hook: Mutex::new(None),
            }
        });

        let delegate = Arc::new(GroupQueueDelegate {
            inner: Arc::clone(&inner),
        });
        inner.private_queue.set_delegate(delegate);

        let body_inner = Arc::clone(&inner);
        let operation = Operation::new(inner.name.clone(), move |op: Operation| {
            body_inner.on_execute(&op);
        });

        Group { inner, operation }
    }

    /// The operation handle to submit to an outer queue.
    pub fn operation(&self) -> Operation {
        self.operation.clone()
    }

    /// Install a recovery hook: called at most once, the first time the
    /// group's children have all finished with at least one fatal error.
    /// Returning a non-empty list of operations adds them as further
    /// children and defers finishing until they, too, complete.
    pub fn set_recovery_hook(&self, hook: impl Fn(&[OperationError]) -> Vec<Operation> + Send + Sync + 'static) {
        *self.inner.recovery_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Add operations to a group that may already be running.
    pub fn add_operations(&self, ops: Vec<Operation>) {
        self.inner.add_operations(ops, true);
    }

    pub fn add_operation(&self, op: Operation) {
        self.add_operations(vec![op]);
    }

    /// Cancel the group and every operation it currently knows about,
    /// wrapping each child's cancellation errors as
    /// [`OperationError::ParentCancelled`].
    pub fn cancel_with_errors(&self, errors: Vec<OperationError>) {
        self.inner.is_group_finishing.store(true, Ordering::SeqCst);
        let children = self.inner.operations.snapshot();
        for child in &children {
            child.cancel_with_errors(vec![OperationError::ParentCancelled(errors.clone())]);
        }
        self.operation.cancel_with_errors(errors);
    }

    pub fn cancel(&self) {
        self.cancel_with_errors(Vec::new());
    }
}

impl GroupInner {
    fn on_execute(self: &Arc<Self>, op: &Operation) {
        let finishing_operation = self.finishing_operation.lock().unwrap().clone();

        let group_op = op.clone();
        let inner_for_finish = Arc::clone(self);
        finishing_operation.add_observer(Observer::new().on_did_finish(move |_fin_op| {
            let errors = inner_for_finish.fatal_errors.snapshot();
            group_op.finish(errors);
        }));

        let initial_children = self.operations.snapshot();
        for child in &initial_children {
            self.attach_child_hooks(child);
        }

        self.private_queue.add_all(initial_children);
        self.private_queue.add(self.can_finish.lock().unwrap().clone());
        self.private_queue.add(finishing_operation);
    }

    fn attach_child_hooks(self: &Arc<Self>, child: &Operation) {
        let inner = Arc::clone(self);
        let child_for_hook = child.clone();
        child.add_observer(Observer::new().on_did_finish(move |_op| {
            let errors = child_for_hook.errors();
            if !errors.is_empty() {
                inner.fatal_errors.with_write(|fatal| fatal.extend(errors));
            }
        }));
    }

    /// Core bookkeeping for both `Group::add_operations` and grandchildren
    /// arriving via the private queue's produce-routing. `submit` is false
    /// for the latter case: the queue is already in the middle of admitting
    /// that exact operation, so we must not call `queue.add` on it again.
    fn add_operations(self: &Arc<Self>, ops: Vec<Operation>, submit: bool) {
        if ops.is_empty() {
            return;
        }

        if self.is_group_finishing.load(Ordering::SeqCst) {
            for op in &ops {
                op.cancel();
            }
            if submit {
                self.private_queue.add_all(ops);
            }
            return;
        }

        self.adding_count.fetch_add(1, Ordering::SeqCst);
        {
            let _guard = self.rotation_lock.lock().unwrap();
            let mut fresh = Vec::new();
            self.tracked_ids.with_write(|tracked| {
                for op in &ops {
                    if tracked.insert(op.id()) {
                        fresh.push(op.clone());
                    }
                }
            });

            self.operations.with_write(|operations| operations.extend(fresh.iter().cloned()));
            for child in &fresh {
                self.attach_child_hooks(child);
            }

            let barrier = self.can_finish.lock().unwrap().clone();
            for child in &fresh {
                barrier.add_dependency(child);
            }
        }

        if submit {
            self.private_queue.add_all(ops);
        }
        self.adding_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn build_can_finish(weak: Weak<GroupInner>, name: String) -> Operation {
        Operation::new(name, move |op: Operation| {
            let Some(inner) = weak.upgrade() else {
                op.finish(Vec::new());
                return;
            };
            inner.evaluate_can_finish(&op);
        })
    }

    fn evaluate_can_finish(self: &Arc<Self>, barrier: &Operation) {
        let _guard = self.rotation_lock.lock().unwrap();

        let unfinished: Vec<Operation> = self
            .operations
            .read()
            .iter()
            .filter(|op| !op.is_finished())
            .cloned()
            .collect();
        let adding_in_progress = self.adding_count.load(Ordering::SeqCst) > 0;

        if unfinished.is_empty() && !adding_in_progress {
            if let Some(recovery_ops) = self.try_recover() {
                if !recovery_ops.is_empty() {
                    self.rotate_with_new_dependencies(barrier, recovery_ops);
                    return;
                }
            }
            barrier.finish(Vec::new());
            return;
        }

        self.rotate_with_new_dependencies(barrier, unfinished);
    }

    /// If there are fatal errors and recovery hasn't been attempted yet,
    /// consult the recovery hook. Returns `None` if recovery does not
    /// apply (already attempted, no hook, or no errors); `Some(ops)`
    /// otherwise, where `ops` may be empty (hook declined to add anything).
    fn try_recover(self: &Arc<Self>) -> Option<Vec<Operation>> {
        let errors = self.fatal_errors.snapshot();
        if errors.is_empty() {
            return None;
        }
        if self.attempted_recovery.swap(true, Ordering::SeqCst) {
            return None;
        }
        let hook = self.recovery_hook.lock().unwrap().clone()?;
        Some(hook(&errors))
    }

    fn rotate_with_new_dependencies(self: &Arc<Self>, barrier: &Operation, new_deps: Vec<Operation>) {
        let next_index = self.operations.read().len();
        let successor = Self::build_can_finish(
            Arc::downgrade(self),
            format!("{}.canFinish#{next_index}", self.name),
        );

        for dep in &new_deps {
            successor.add_dependency(dep);
            // `new_deps` drawn from `unfinished` are already tracked children;
            // ones drawn from recovery are not yet, so register them too.
            let newly_tracked = self.tracked_ids.with_write(|tracked| tracked.insert(dep.id()));
            if newly_tracked {
                self.operations.with_write(|operations| operations.push(dep.clone()));
                self.attach_child_hooks(dep);
            }
        }

        let finishing_operation = self.finishing_operation.lock().unwrap().clone();
        finishing_operation.add_dependency(&successor);

        *self.can_finish.lock().unwrap() = successor.clone();
        self.private_queue.add(successor);
        self.private_queue.add_all(new_deps.into_iter().filter(|d| {
            // Recovery operations need admitting to the private queue;
            // pre-existing unfinished children are already admitted.
            d.state() == crate::operation::State::Initialized
        }));

        barrier.finish(Vec::new());
    }
}

/// Routes operations produced by a running child back into the group's own
/// bookkeeping, and admits the group's own internal barrier operations
/// without re-triggering bookkeeping for them.
struct GroupQueueDelegate {
    inner: Arc<GroupInner>,
}

impl QueueDelegate for GroupQueueDelegate {
    fn will_add(&self, _queue: &Queue, operation: &Operation) {
        let already_tracked = self.inner.tracked_ids.read().contains(&operation.id());
        if already_tracked {
            return;
        }
        let is_barrier_or_finisher = operation.id() == self.inner.can_finish.lock().unwrap().id()
            || operation.id() == self.inner.finishing_operation.lock().unwrap().id();
        if is_barrier_or_finisher {
            return;
        }
        self.inner.add_operations(vec![operation.clone()], false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Queue;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::{Duration, Instant};

    fn wait_until_finished(op: &Operation, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !op.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn group_finishes_after_all_children_finish() {
        let outer = Queue::new("outer");
        let ran = Arc::new(AtomicUsize::new(0));

        let mut children = Vec::new();
        for i in 0..3 {
            let ran = Arc::clone(&ran);
            children.push(Operation::new(format!("child-{i}"), move |op: Operation| {
                ran.fetch_add(1, Ordering::SeqCst);
                op.finish(Vec::new());
            }));
        }

        let group = Group::new("group", children);
        outer.add(group.operation());

        wait_until_finished(&group.operation(), Duration::from_secs(3));
        assert!(group.operation().is_finished());
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn group_waits_for_a_grandchild_produced_mid_flight() {
        let outer = Queue::new("outer-grandchild");
        let grandchild_ran = Arc::new(AtomicBool::new(false));
        let grandchild_ran2 = Arc::clone(&grandchild_ran);

        let child = Operation::new("producer-child", move |op: Operation| {
            let grandchild_ran3 = Arc::clone(&grandchild_ran2);
            let grandchild = Operation::new("grandchild", move |gc_op: Operation| {
                grandchild_ran3.store(true, Ordering::SeqCst);
                gc_op.finish(Vec::new());
            });
            op.produce(grandchild);
            op.finish(Vec::new());
        });

        let group = Group::new("group-gc", vec![child]);
        outer.add(group.operation());

        wait_until_finished(&group.operation(), Duration::from_secs(3));
        assert!(group.operation().is_finished());
        assert!(grandchild_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn group_collects_child_errors_as_fatal_errors() {
        let outer = Queue::new("outer-errors");
        let failing = Operation::new("failing", |op: Operation| {
            op.finish(vec![OperationError::domain("boom")]);
        });

        let group = Group::new("group-err", vec![failing]);
        outer.add(group.operation());

        wait_until_finished(&group.operation(), Duration::from_secs(3));
        assert!(group.operation().is_finished());
        assert!(!group.operation().errors().is_empty());
    }

    #[test]
    fn dynamically_added_operations_are_waited_on() {
        let outer = Queue::new("outer-dyn");
        let group = Group::new("group-dyn", Vec::new());
        outer.add(group.operation());

        let later_ran = Arc::new(AtomicBool::new(false));
        let later_ran2 = Arc::clone(&later_ran);
        let later = Operation::new("later", move |op: Operation| {
            std::thread::sleep(Duration::from_millis(20));
            later_ran2.store(true, Ordering::SeqCst);
            op.finish(Vec::new());
        });
        group.add_operation(later);

        wait_until_finished(&group.operation(), Duration::from_secs(3));
        assert!(later_ran.load(Ordering::SeqCst));
    }
}
