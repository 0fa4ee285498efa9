//! Per-coroutine rendezvous state.
//!
//! A coroutine is a stackless future polled by the dispatcher. Returning
//! `Poll::Pending` from a [`Yield`] is the about-to-block hand-off; the next
//! poll is the unblock hand-off. `kept_blocked` is set when a yield resumes
//! and cleared by [`CoroutineState::unblocked`] when a primitive observed
//! progress, which is exactly what quiescence detection keys on.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;

use crate::context::{WorkflowContext, COROUTINES_CTX_KEY};
use crate::dispatcher::{DispatcherInner, DispatcherShared};
use crate::error::PanicError;

pub(crate) const ILLEGAL_ACCESS_FROM_OUTSIDE_WORKFLOW: &str =
    "get_state: illegal access from outside of workflow context";

/// Panic payload that terminates a coroutine's execution unit without
/// recording an error. Thrown when a zombie coroutine touches the runtime
/// after its dispatcher was closed.
pub(crate) struct CoroutineExit;

pub(crate) fn exit_coroutine() -> ! {
    std::panic::panic_any(CoroutineExit)
}

pub(crate) struct CoroutineState {
    name: String,
    pub(crate) dispatcher: Weak<Mutex<DispatcherInner>>,
    pub(crate) shared: Arc<DispatcherShared>,
    status: Mutex<String>,
    blocked: AtomicBool,
    kept_blocked: AtomicBool,
    closed: AtomicBool,
    panic_error: Mutex<Option<PanicError>>,
}

impl CoroutineState {
    pub(crate) fn new(
        name: String,
        dispatcher: Weak<Mutex<DispatcherInner>>,
        shared: Arc<DispatcherShared>,
    ) -> Arc<CoroutineState> {
        Arc::new(CoroutineState {
            name,
            dispatcher,
            shared,
            status: Mutex::new(String::new()),
            blocked: AtomicBool::new(false),
            kept_blocked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            panic_error: Mutex::new(None),
        })
    }

    pub(crate) fn yield_now(self: &Arc<Self>, status: impl Into<String>) -> Yield {
        Yield {
            state: self.clone(),
            status: status.into(),
            parked: false,
        }
    }

    /// Called by a primitive immediately after it observed progress, so the
    /// dispatcher knows this coroutine did not stay blocked this pass.
    pub(crate) fn unblocked(&self) {
        self.kept_blocked.store(false, Ordering::SeqCst);
    }

    pub(crate) fn kept_blocked(&self) -> bool {
        self.kept_blocked.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_panic(&self, err: PanicError) {
        *self.panic_error.lock() = Some(err);
    }

    pub(crate) fn take_panic(&self) -> Option<PanicError> {
        self.panic_error.lock().take()
    }

    pub(crate) fn status_report(&self) -> String {
        format!("coroutine {} [{}]", self.name, self.status.lock())
    }
}

/// One-shot suspension point. First poll parks the coroutine; the next poll
/// resumes it.
pub(crate) struct Yield {
    state: Arc<CoroutineState>,
    status: String,
    parked: bool,
}

impl Future for Yield {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if !self.parked {
            if self.state.blocked.swap(true, Ordering::SeqCst) {
                panic!(
                    "trying to block a coroutine which is already blocked, most likely a wrong \
                     context is used for a blocking call like Future::get or Channel::receive"
                );
            }
            *self.state.status.lock() = self.status.clone();
            self.parked = true;
            return Poll::Pending;
        }
        self.state.blocked.store(false, Ordering::SeqCst);
        self.state.kept_blocked.store(true, Ordering::SeqCst);
        Poll::Ready(())
    }
}

/// Coroutine state of the calling coroutine.
///
/// Panics when called outside a workflow context or while the dispatcher is
/// not executing; terminates the caller outright when the dispatcher was
/// closed, so code still unwinding after an eviction cannot touch the
/// runtime.
pub(crate) fn get_state(ctx: &WorkflowContext) -> Arc<CoroutineState> {
    let Some(state) = ctx.value::<CoroutineState>(COROUTINES_CTX_KEY) else {
        panic!("get_state: not a workflow context");
    };
    if state.shared.closed.load(Ordering::SeqCst) {
        exit_coroutine();
    }
    if !state.shared.executing.load(Ordering::SeqCst) {
        panic!("{}", ILLEGAL_ACCESS_FROM_OUTSIDE_WORKFLOW);
    }
    state
}

/// Coroutine state lookup without the execution guards. Used for naming new
/// channels and selectors, which is legal between decision turns.
pub(crate) fn coroutine_state(ctx: &WorkflowContext) -> Option<Arc<CoroutineState>> {
    ctx.value::<CoroutineState>(COROUTINES_CTX_KEY)
}
