//! Counting barrier built on a future.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::WorkflowContext;
use crate::future::{new_future, Settable, WorkflowFuture};

struct WaitGroupInner {
    n: i64,
    waiting: bool,
    pair: Option<(WorkflowFuture, Settable)>,
}

/// Waits for a collection of coroutines to finish. May be reused after a
/// `wait` has returned.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<Mutex<WaitGroupInner>>,
}

impl WaitGroup {
    pub fn new() -> WaitGroup {
        WaitGroup {
            inner: Arc::new(Mutex::new(WaitGroupInner {
                n: 0,
                waiting: false,
                pair: None,
            })),
        }
    }

    /// Adds `delta` (which may be negative) to the counter. Panics if the
    /// counter goes negative. Releases the waiter when the counter reaches
    /// zero while a `wait` is in progress.
    ///
    /// Calls with a positive delta that start from a zero counter must
    /// happen before `wait`; when reusing the group, they must happen after
    /// the previous `wait` returned.
    pub fn add(&self, delta: i64) {
        let settable = {
            let mut inner = self.inner.lock();
            inner.n += delta;
            if inner.n < 0 {
                panic!("negative WaitGroup counter");
            }
            if inner.n > 0 || !inner.waiting {
                return;
            }
            inner.pair.as_ref().map(|(_, settable)| settable.clone())
        };
        if let Some(settable) = settable {
            settable.set_value(&false);
        }
    }

    /// Decrements the counter by one.
    pub fn done(&self) {
        self.add(-1);
    }

    /// Blocks until the counter reaches zero. Returns immediately when it
    /// already is. Panics when the group is reused before a previous `wait`
    /// has returned.
    pub async fn wait(&self, ctx: &WorkflowContext) {
        let future = {
            let mut inner = self.inner.lock();
            if inner.n <= 0 {
                return;
            }
            if inner.waiting {
                panic!("WaitGroup is reused before previous Wait has returned");
            }
            inner.waiting = true;
            let (future, settable) = new_future(ctx);
            inner.pair = Some((future.clone(), settable));
            future
        };
        if let Err(err) = future.get::<bool>(ctx).await {
            panic!("WaitGroup wait failed: {err}");
        }
        let mut inner = self.inner.lock();
        inner.waiting = false;
        inner.pair = None;
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        WaitGroup::new()
    }
}
