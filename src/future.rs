//! One-shot result cell layered on a channel.
//!
//! The internal channel never carries a value; closing it is the readiness
//! signal, which is what lets a selector wait on futures and channels through
//! one callback protocol.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::channel::{Channel, ReceiveCallback};
use crate::context::WorkflowContext;
use crate::convert::{decode_arg, encode_arg, Payload};
use crate::error::WorkflowError;

struct FutureInner {
    value: Option<Payload>,
    err: Option<WorkflowError>,
    ready: bool,
    chained: Vec<WorkflowFuture>,
}

/// Read side of a one-shot result. Cloneable; all clones observe the same
/// cell.
#[derive(Clone)]
pub struct WorkflowFuture {
    inner: Arc<Mutex<FutureInner>>,
    channel: Channel,
}

/// Write side of a [`WorkflowFuture`]. Set-once.
#[derive(Clone)]
pub struct Settable {
    future: WorkflowFuture,
}

/// Creates a future together with the settable that resolves it.
pub fn new_future(ctx: &WorkflowContext) -> (WorkflowFuture, Settable) {
    let future = WorkflowFuture {
        inner: Arc::new(Mutex::new(FutureInner {
            value: None,
            err: None,
            ready: false,
            chained: Vec::new(),
        })),
        channel: Channel::new(ctx),
    };
    (future.clone(), Settable { future })
}

impl WorkflowFuture {
    /// Blocks until ready, then decodes the value. An error set on the
    /// future takes precedence over the value.
    pub async fn get<T: DeserializeOwned>(
        &self,
        ctx: &WorkflowContext,
    ) -> Result<Option<T>, WorkflowError> {
        match self.get_raw(ctx).await? {
            None => Ok(None),
            Some(payload) => {
                let decoded = decode_arg::<T>(self.channel.converter().as_ref(), &payload)?;
                Ok(Some(decoded))
            }
        }
    }

    /// Blocks until ready and returns the payload verbatim, bypassing the
    /// data converter.
    pub async fn get_raw(&self, ctx: &WorkflowContext) -> Result<Option<Payload>, WorkflowError> {
        let (_, more) = self.channel.receive_payload(ctx).await;
        if more {
            panic!("future channel not closed");
        }
        let inner = self.inner.lock();
        if !inner.ready {
            panic!("future not ready");
        }
        if let Some(err) = inner.err.clone() {
            return Err(err);
        }
        Ok(inner.value.clone())
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    // Selector integration: if ready, returns the value immediately;
    // otherwise registers the callback for the readiness signal.
    pub(crate) fn get_async(
        &self,
        callback: &Arc<ReceiveCallback>,
    ) -> (Option<Payload>, bool, Option<WorkflowError>) {
        let (_, _, more) = self.channel.receive_async_impl(Some(callback));
        // The readiness channel closes on set, so an open channel means the
        // future is not ready yet.
        if more {
            return (None, false, None);
        }
        let inner = self.inner.lock();
        if !inner.ready {
            panic!("future not ready");
        }
        (inner.value.clone(), true, inner.err.clone())
    }

    pub(crate) fn remove_receive_callback(&self, callback: &Arc<ReceiveCallback>) {
        self.channel.remove_receive_callback(callback);
    }

    pub(crate) fn value_and_error(&self) -> (Option<Payload>, Option<WorkflowError>) {
        let inner = self.inner.lock();
        (inner.value.clone(), inner.err.clone())
    }

    fn set_internal(&self, value: Option<Payload>, err: Option<WorkflowError>) {
        let chained = {
            let mut inner = self.inner.lock();
            if inner.ready {
                drop(inner);
                panic!("future already set");
            }
            inner.value = value.clone();
            inner.err = err.clone();
            inner.ready = true;
            std::mem::take(&mut inner.chained)
        };
        self.channel.close();
        // Depth-first fan-out in chain-registration order. Cyclic chains are
        // a caller error and would not terminate.
        for dependent in chained {
            dependent.set_internal(value.clone(), err.clone());
        }
    }

    fn chain_future(&self, dependent: WorkflowFuture) {
        self.inner.lock().chained.push(dependent);
    }
}

impl Settable {
    /// Resolves the future. Panics if it was already set.
    pub fn set(&self, value: Option<Payload>, err: Option<WorkflowError>) {
        self.future.set_internal(value, err);
    }

    pub fn set_value<T: Serialize>(&self, value: &T) {
        let payload = encode_arg(self.future.channel.converter().as_ref(), value)
            .unwrap_or_else(|e| panic!("failed to encode future value: {e}"));
        self.future.set_internal(Some(payload), None);
    }

    pub fn set_error(&self, err: WorkflowError) {
        self.future.set_internal(None, Some(err));
    }

    /// Makes this settable's future mirror `other`: an already-ready `other`
    /// resolves it immediately, otherwise it resolves when `other` does.
    pub fn chain(&self, other: &WorkflowFuture) {
        if self.future.is_ready() {
            panic!("future already set");
        }
        if !other.is_ready() {
            other.chain_future(self.future.clone());
            return;
        }
        let (value, err) = other.value_and_error();
        self.future.set_internal(value, err);
    }

    pub fn future(&self) -> &WorkflowFuture {
        &self.future
    }
}

/// A future whose type parameter guides decoding of the resolved payload.
pub struct DecodeFuture<T> {
    future: WorkflowFuture,
    _decoded: PhantomData<fn() -> T>,
}

impl<T> Clone for DecodeFuture<T> {
    fn clone(&self) -> Self {
        DecodeFuture {
            future: self.future.clone(),
            _decoded: PhantomData,
        }
    }
}

/// Creates a typed decode future with its settable.
pub fn new_decode_future<T>(ctx: &WorkflowContext) -> (DecodeFuture<T>, Settable) {
    let (future, settable) = new_future(ctx);
    (
        DecodeFuture {
            future,
            _decoded: PhantomData,
        },
        settable,
    )
}

impl<T: DeserializeOwned> DecodeFuture<T> {
    pub async fn get(&self, ctx: &WorkflowContext) -> Result<Option<T>, WorkflowError> {
        self.future.get::<T>(ctx).await
    }

    pub fn is_ready(&self) -> bool {
        self.future.is_ready()
    }

    /// Untyped view, e.g. for selector registration.
    pub fn future(&self) -> &WorkflowFuture {
        &self.future
    }
}
