//! Lifecycle event registration and fan-out (C3).
//!
//! An [`Observer`] is a record of callbacks for any subset of the lifecycle
//! phases; a composite observer is simply one [`Observer`] with several
//! callbacks populated. Observers are dispatched in registration order and
//! must never mutate the state machine of the operation they're attached to
//! — they may only read it and enqueue further work.

use crate::operation::Operation;
use std::fmt;
use std::sync::Arc;

type Callback = Arc<dyn Fn(&Operation) + Send + Sync>;
type ProduceCallback = Arc<dyn Fn(&Operation, &Operation) + Send + Sync>;

/// A tagged lifecycle event dispatched to an operation's observers.
#[derive(Clone)]
pub enum ObserverEvent {
    WillExecute,
    WillCancel,
    DidCancel,
    DidProduce(Operation),
    WillFinish,
    DidFinish,
    DidAttach,
}

impl fmt::Debug for ObserverEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObserverEvent::WillExecute => write!(f, "WillExecute"),
            ObserverEvent::WillCancel => write!(f, "WillCancel"),
            ObserverEvent::DidCancel => write!(f, "DidCancel"),
            ObserverEvent::DidProduce(child) => write!(f, "DidProduce({})", child.name()),
            ObserverEvent::WillFinish => write!(f, "WillFinish"),
            ObserverEvent::DidFinish => write!(f, "DidFinish"),
            ObserverEvent::DidAttach => write!(f, "DidAttach"),
        }
    }
}

/// A record of lifecycle callbacks attached to an operation.
///
/// Construct with [`Observer::new`] and chain the `on_*` builders for the
/// phases you care about; unset phases are simply skipped during fan-out.
#[derive(Clone, Default)]
pub struct Observer {
    will_execute: Option<Callback>,
    will_cancel: Option<Callback>,
    did_cancel: Option<Callback>,
    did_produce: Option<ProduceCallback>,
    will_finish: Option<Callback>,
    did_finish: Option<Callback>,
    did_attach: Option<Callback>,
}

impl Observer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_will_execute(mut self, f: impl Fn(&Operation) + Send + Sync + 'static) -> Self {
        self.will_execute = Some(Arc::new(f));
        self
    }

    pub fn on_will_cancel(mut self, f: impl Fn(&Operation) + Send + Sync + 'static) -> Self {
        self.will_cancel = Some(Arc::new(f));
        self
    }

    pub fn on_did_cancel(mut self, f: impl Fn(&Operation) + Send + Sync + 'static) -> Self {
        self.did_cancel = Some(Arc::new(f));
        self
    }

    pub fn on_did_produce(
        mut self,
        f: impl Fn(&Operation, &Operation) + Send + Sync + 'static,
    ) -> Self {
        self.did_produce = Some(Arc::new(f));
        self
    }

    pub fn on_will_finish(mut self, f: impl Fn(&Operation) + Send + Sync + 'static) -> Self {
        self.will_finish = Some(Arc::new(f));
        self
    }

    pub fn on_did_finish(mut self, f: impl Fn(&Operation) + Send + Sync + 'static) -> Self {
        self.did_finish = Some(Arc::new(f));
        self
    }

    pub fn on_did_attach(mut self, f: impl Fn(&Operation) + Send + Sync + 'static) -> Self {
        self.did_attach = Some(Arc::new(f));
        self
    }

    /// Dispatch `event`, invoking whichever callback on this observer
    /// matches. A no-op if the matching phase was never registered.
    pub(crate) fn dispatch(&self, op: &Operation, event: &ObserverEvent) {
        match event {
            ObserverEvent::WillExecute => Self::call(&self.will_execute, op),
            ObserverEvent::WillCancel => Self::call(&self.will_cancel, op),
            ObserverEvent::DidCancel => Self::call(&self.did_cancel, op),
            ObserverEvent::DidProduce(child) => {
                if let Some(f) = &self.did_produce {
                    f(op, child);
                }
            }
            ObserverEvent::WillFinish => Self::call(&self.will_finish, op),
            ObserverEvent::DidFinish => Self::call(&self.did_finish, op),
            ObserverEvent::DidAttach => Self::call(&self.did_attach, op),
        }
    }

    fn call(slot: &Option<Callback>, op: &Operation) {
        if let Some(f) = slot {
            f(op);
        }
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("will_execute", &self.will_execute.is_some())
            .field("will_cancel", &self.will_cancel.is_some())
            .field("did_cancel", &self.did_cancel.is_some())
            .field("did_produce", &self.did_produce.is_some())
            .field("will_finish", &self.will_finish.is_some())
            .field("did_finish", &self.did_finish.is_some())
            .field("did_attach", &self.did_attach.is_some())
            .finish()
    }
}
