//! The dispatcher: drives a set of coroutines to a quiescent state.
//!
//! Scheduling is deterministic. Coroutines run in spawn order, each gets at
//! most one slice per pass, and a pass repeats while anything made progress
//! or new coroutines appeared. Only the driver thread ever polls.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::debug;

use crate::context::{WorkflowContext, COROUTINES_CTX_KEY};
use crate::coroutine::{get_state, CoroutineExit, CoroutineState};
use crate::error::PanicError;

pub(crate) struct DispatcherShared {
    pub(crate) executing: AtomicBool,
    pub(crate) closed: AtomicBool,
}

pub(crate) struct DispatcherInner {
    pub(crate) sequence: usize,
    pub(crate) channel_sequence: usize,
    pub(crate) selector_sequence: usize,
    coroutines: Vec<CoroutineHandle>,
}

struct CoroutineHandle {
    state: Arc<CoroutineState>,
    future: Option<BoxFuture<'static, ()>>,
}

/// Container of a set of coroutines, executed one by one in deterministic
/// order until all of them are completed or blocked.
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
    inner: Arc<Mutex<DispatcherInner>>,
    run_lock: Mutex<()>,
}

impl Dispatcher {
    /// Creates a dispatcher with a root coroutine. The returned context is
    /// the root coroutine's context and can be used to pass values into it.
    pub fn new<F, Fut>(root_ctx: &WorkflowContext, root: F) -> (Dispatcher, WorkflowContext)
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let dispatcher = Dispatcher {
            shared: Arc::new(DispatcherShared {
                executing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            inner: Arc::new(Mutex::new(DispatcherInner {
                sequence: 0,
                channel_sequence: 0,
                selector_sequence: 0,
                coroutines: Vec::new(),
            })),
            run_lock: Mutex::new(()),
        };
        let ctx = new_coroutine_on(&dispatcher.shared, &dispatcher.inner, root_ctx, None, root);
        (dispatcher, ctx)
    }

    /// Sole driver entry. Gives every coroutine slices until all survivors
    /// are blocked, removing completed ones in place, and returns the first
    /// captured panic.
    ///
    /// Panics on re-entry and on a closed dispatcher; both are programmer
    /// errors.
    pub fn execute_until_all_blocked(&self) -> Result<(), PanicError> {
        {
            let _guard = self.run_lock.lock();
            if self.shared.closed.load(Ordering::SeqCst) {
                panic!("dispatcher is closed");
            }
            if self.shared.executing.load(Ordering::SeqCst) {
                panic!(
                    "call to execute_until_all_blocked (possibly from a coroutine) while it is \
                     already running"
                );
            }
            self.shared.executing.store(true, Ordering::SeqCst);
        }
        let _reset = ExecutingReset(&self.shared);

        let waker = noop_waker();
        let mut poll_cx = Context::from_waker(&waker);

        let mut all_blocked = false;
        while !all_blocked {
            all_blocked = true;
            let last_sequence = self.inner.lock().sequence;
            let mut i = 0;
            loop {
                // Take the future out so the coroutine can spawn siblings
                // (which lock the same registry) while it runs.
                let (state, future) = {
                    let mut inner = self.inner.lock();
                    if i >= inner.coroutines.len() {
                        break;
                    }
                    let handle = &mut inner.coroutines[i];
                    let future = if handle.state.is_closed() {
                        None
                    } else {
                        handle.future.take()
                    };
                    (handle.state.clone(), future)
                };

                if let Some(mut future) = future {
                    match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut poll_cx))) {
                        Ok(Poll::Pending) => {
                            // Spawns only append, so index i still names us.
                            self.inner.lock().coroutines[i].future = Some(future);
                        }
                        Ok(Poll::Ready(())) => {
                            state.set_closed();
                        }
                        Err(payload) => {
                            state.set_closed();
                            if !payload.is::<CoroutineExit>() {
                                state.set_panic(PanicError::from_panic(
                                    payload,
                                    state.status_report(),
                                ));
                            }
                        }
                    }
                }

                if state.is_closed() {
                    self.inner.lock().coroutines.remove(i);
                    if let Some(err) = state.take_panic() {
                        debug!(coroutine = %state.status_report(), "coroutine panicked");
                        return Err(err);
                    }
                    all_blocked = false;
                } else {
                    all_blocked = all_blocked && state.kept_blocked();
                    i += 1;
                }
            }
            let inner = self.inner.lock();
            // New coroutines force another pass so they get their first slice.
            all_blocked = all_blocked && last_sequence == inner.sequence;
            if inner.coroutines.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// True when no coroutines remain.
    pub fn is_done(&self) -> bool {
        self.inner.lock().coroutines.is_empty()
    }

    /// Destroys all coroutines without waiting for their completion.
    /// Idempotent.
    pub fn close(&self) {
        {
            let _guard = self.run_lock.lock();
            if self.shared.closed.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        let futures: Vec<BoxFuture<'static, ()>> = {
            let mut inner = self.inner.lock();
            inner
                .coroutines
                .iter_mut()
                .filter(|handle| !handle.state.is_closed())
                .filter_map(|handle| {
                    handle.state.set_closed();
                    handle.future.take()
                })
                .collect()
        };
        // Dropping a future runs destructors in the coroutine; any of them
        // touching the runtime observes `closed` and exits via the sentinel.
        for future in futures {
            let _ = catch_unwind(AssertUnwindSafe(move || drop(future)));
        }
    }

    /// Yield-point reports of every live coroutine, blank-line separated.
    pub fn stack_trace(&self) -> String {
        let reports: Vec<String> = self
            .inner
            .lock()
            .coroutines
            .iter()
            .filter(|handle| !handle.state.is_closed())
            .map(|handle| handle.state.status_report())
            .collect();
        reports.join("\n\n")
    }
}

struct ExecutingReset<'a>(&'a DispatcherShared);

impl Drop for ExecutingReset<'_> {
    fn drop(&mut self) {
        self.0.executing.store(false, Ordering::SeqCst);
    }
}

/// Spawns a coroutine from workflow code. It is appended to the dispatcher's
/// list and gets its first slice before the current pass can go quiescent.
pub fn spawn<F, Fut>(ctx: &WorkflowContext, f: F)
where
    F: FnOnce(WorkflowContext) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    spawn_internal(ctx, None, f);
}

/// [`spawn`] with an explicit coroutine name, visible in stack traces.
pub fn spawn_named<F, Fut>(ctx: &WorkflowContext, name: impl Into<String>, f: F)
where
    F: FnOnce(WorkflowContext) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    spawn_internal(ctx, Some(name.into()), f);
}

fn spawn_internal<F, Fut>(ctx: &WorkflowContext, name: Option<String>, f: F)
where
    F: FnOnce(WorkflowContext) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let state = get_state(ctx);
    let Some(inner) = state.dispatcher.upgrade() else {
        panic!("spawn: dispatcher is gone");
    };
    new_coroutine_on(&state.shared, &inner, ctx, name, f);
}

fn new_coroutine_on<F, Fut>(
    shared: &Arc<DispatcherShared>,
    inner: &Arc<Mutex<DispatcherInner>>,
    ctx: &WorkflowContext,
    name: Option<String>,
    f: F,
) -> WorkflowContext
where
    F: FnOnce(WorkflowContext) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (state, spawned) = {
        let mut guard = inner.lock();
        let name = name.unwrap_or_else(|| format!("{}", guard.sequence + 1));
        let state = CoroutineState::new(name, Arc::downgrade(inner), shared.clone());
        guard.sequence += 1;
        (state.clone(), ctx.with_value_arc(COROUTINES_CTX_KEY, state))
    };
    // The closure body runs here, outside the registry lock, so it may
    // itself create channels or spawn.
    let future = f(spawned.clone()).boxed();
    inner.lock().coroutines.push(CoroutineHandle {
        state,
        future: Some(future),
    });
    spawned
}

pub(crate) fn next_channel_name(ctx: &WorkflowContext) -> String {
    if let Some(state) = crate::coroutine::coroutine_state(ctx) {
        if let Some(inner) = state.dispatcher.upgrade() {
            let mut guard = inner.lock();
            guard.channel_sequence += 1;
            return format!("chan-{}", guard.channel_sequence);
        }
    }
    "chan".to_string()
}

pub(crate) fn next_selector_name(ctx: &WorkflowContext) -> String {
    if let Some(state) = crate::coroutine::coroutine_state(ctx) {
        if let Some(inner) = state.dispatcher.upgrade() {
            let mut guard = inner.lock();
            guard.selector_sequence += 1;
            return format!("selector-{}", guard.selector_sequence);
        }
    }
    "selector".to_string()
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}
