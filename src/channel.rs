//! Typed queue with cooperative blocking send/receive.
//!
//! A channel carries converter-encoded payloads. Delivery order: the
//! pre-fetch slot first, then the buffer head (pulling a blocked sender into
//! the vacated slot), then end-of-stream if closed, then a direct hand-off
//! from a blocked sender.
//!
//! Blocked senders and receivers are callbacks queued FIFO. A callback
//! returning `false` refuses the interaction and leaves the value in flight
//! for other consumers; the drain that popped it drops it. Selectors rely on
//! this to race many channels while firing at most one branch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

use crate::context::{get_workflow_environment, WorkflowContext};
use crate::convert::{decode_arg, encode_arg, DataConverter, Payload};
use crate::coroutine::get_state;
use crate::dispatcher::next_channel_name;
use crate::env::{MetricsScope, CORRUPTED_SIGNALS_COUNTER};
use crate::error::ConversionError;
use crate::options::data_converter_from_workflow_context;

/// Receive-side delivery callback. Returns `false` to refuse the value and
/// keep it in flight.
pub(crate) struct ReceiveCallback {
    f: Mutex<Box<dyn FnMut(Option<&Payload>, bool) -> bool + Send>>,
}

impl ReceiveCallback {
    pub(crate) fn new(
        f: impl FnMut(Option<&Payload>, bool) -> bool + Send + 'static,
    ) -> Arc<ReceiveCallback> {
        Arc::new(ReceiveCallback {
            f: Mutex::new(Box::new(f)),
        })
    }

    fn invoke(&self, value: Option<&Payload>, more: bool) -> bool {
        let mut f = self.f.lock();
        (*f)(value, more)
    }
}

/// Send-side callback carrying the value in flight. Returns `false` to
/// refuse consumption.
pub(crate) struct SendCallback {
    value: Payload,
    f: Mutex<Box<dyn FnMut() -> bool + Send>>,
}

impl SendCallback {
    pub(crate) fn new(
        value: Payload,
        f: impl FnMut() -> bool + Send + 'static,
    ) -> Arc<SendCallback> {
        Arc::new(SendCallback {
            value,
            f: Mutex::new(Box::new(f)),
        })
    }

    fn invoke(&self) -> bool {
        let mut f = self.f.lock();
        (*f)()
    }
}

#[derive(Default)]
struct ChannelInner {
    buffer: VecDeque<Payload>,
    blocked_sends: VecDeque<Arc<SendCallback>>,
    blocked_receives: VecDeque<Arc<ReceiveCallback>>,
    closed: bool,
    // One-value stash for a payload a selector peeked but did not consume.
    pre_fetched: Option<Payload>,
}

struct ChannelCore {
    name: String,
    capacity: usize,
    converter: Arc<dyn DataConverter>,
    metrics: Arc<dyn MetricsScope>,
    inner: Mutex<ChannelInner>,
}

#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

impl Channel {
    /// Rendezvous channel (no buffer).
    pub fn new(ctx: &WorkflowContext) -> Channel {
        let name = next_channel_name(ctx);
        Channel::build(ctx, name, 0)
    }

    pub fn new_named(ctx: &WorkflowContext, name: impl Into<String>) -> Channel {
        Channel::build(ctx, name.into(), 0)
    }

    pub fn new_buffered(ctx: &WorkflowContext, capacity: usize) -> Channel {
        let name = next_channel_name(ctx);
        Channel::build(ctx, name, capacity)
    }

    pub fn new_named_buffered(
        ctx: &WorkflowContext,
        name: impl Into<String>,
        capacity: usize,
    ) -> Channel {
        Channel::build(ctx, name.into(), capacity)
    }

    fn build(ctx: &WorkflowContext, name: String, capacity: usize) -> Channel {
        Channel {
            core: Arc::new(ChannelCore {
                name,
                capacity,
                converter: data_converter_from_workflow_context(ctx),
                metrics: get_workflow_environment(ctx).metrics_scope(),
                inner: Mutex::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn is_closed(&self) -> bool {
        self.core.inner.lock().closed
    }

    pub(crate) fn converter(&self) -> &Arc<dyn DataConverter> {
        &self.core.converter
    }

    /// Blocking send. Yields until a receiver or buffer slot accepts the
    /// value. Panics if the channel is (or becomes) closed.
    pub async fn send<T: Serialize>(&self, ctx: &WorkflowContext, value: &T) {
        let payload = encode_arg(self.core.converter.as_ref(), value)
            .unwrap_or_else(|e| panic!("failed to encode value for channel {}: {e}", self.name()));
        self.send_payload(ctx, payload).await
    }

    /// [`Channel::send`] for an already-encoded payload.
    pub async fn send_payload(&self, ctx: &WorkflowContext, value: Payload) {
        let state = get_state(ctx);
        let consumed = Arc::new(AtomicBool::new(false));
        let callback = SendCallback::new(value.clone(), {
            let consumed = consumed.clone();
            move || {
                consumed.store(true, Ordering::SeqCst);
                true
            }
        });
        if self.send_async_impl(value, Some(&callback)) {
            state.unblocked();
            return;
        }
        loop {
            if consumed.load(Ordering::SeqCst) {
                state.unblocked();
                return;
            }
            // Close can land while the send is parked.
            if self.is_closed() {
                panic!("send on closed channel {}", self.name());
            }
            state
                .yield_now(format!("blocked on {}.Send", self.name()))
                .await;
        }
    }

    /// Non-blocking send. Returns false when no receiver was ready and the
    /// buffer was full. Panics on a closed channel.
    pub fn send_async<T: Serialize>(&self, value: &T) -> bool {
        let payload = encode_arg(self.core.converter.as_ref(), value)
            .unwrap_or_else(|e| panic!("failed to encode value for channel {}: {e}", self.name()));
        self.send_async_impl(payload, None)
    }

    /// [`Channel::send_async`] for an already-encoded payload.
    pub fn send_payload_async(&self, value: Payload) -> bool {
        self.send_async_impl(value, None)
    }

    /// Blocking receive. Returns the decoded value (None only at
    /// end-of-stream) and a flag telling whether more deliveries are
    /// possible. Corrupt payloads are logged, counted, dropped, and the
    /// receive retries.
    pub async fn receive<T: DeserializeOwned>(&self, ctx: &WorkflowContext) -> (Option<T>, bool) {
        let state = get_state(ctx);
        let cell: Arc<Mutex<ReceiveCell>> = Arc::new(Mutex::new(ReceiveCell::default()));
        let callback = ReceiveCallback::new({
            let cell = cell.clone();
            move |value, more| {
                let mut cell = cell.lock();
                cell.value = value.cloned();
                cell.more = more;
                cell.has_result = true;
                true
            }
        });
        loop {
            cell.lock().has_result = false;
            let (value, ok, more) = self.receive_async_impl(Some(&callback));
            if !ok && !more {
                return (None, false);
            }
            if ok {
                if let Some(payload) = value {
                    if let Ok(decoded) = self.assign_value::<T>(&payload) {
                        state.unblocked();
                        return (Some(decoded), more);
                    }
                }
                continue; // corrupt payload dropped, restart
            }
            loop {
                let delivered = {
                    let mut cell = cell.lock();
                    if cell.has_result {
                        Some((cell.value.take(), cell.more))
                    } else {
                        None
                    }
                };
                if let Some((value, more)) = delivered {
                    match value {
                        // Channel closed while we were parked.
                        None => {
                            state.unblocked();
                            return (None, more);
                        }
                        Some(payload) => match self.assign_value::<T>(&payload) {
                            Ok(decoded) => {
                                state.unblocked();
                                return (Some(decoded), more);
                            }
                            Err(_) => break, // corrupt, re-register and retry
                        },
                    }
                }
                state
                    .yield_now(format!("blocked on {}.Receive", self.name()))
                    .await;
            }
        }
    }

    /// Non-blocking receive of the decoded value.
    pub fn receive_async<T: DeserializeOwned>(&self) -> Option<T> {
        self.receive_async_with_more().0
    }

    /// Non-blocking receive; the second flag is false once the channel is
    /// closed and drained. Corrupt payloads are silently dropped and the
    /// drain continues.
    pub fn receive_async_with_more<T: DeserializeOwned>(&self) -> (Option<T>, bool) {
        loop {
            let (value, ok, more) = self.receive_async_impl(None);
            if !ok && !more {
                return (None, false);
            }
            let Some(payload) = value else {
                return (None, more); // empty but still open
            };
            match self.assign_value::<T>(&payload) {
                Ok(decoded) => return (Some(decoded), more),
                Err(_) => continue,
            }
        }
    }

    /// Blocking wait for the next raw payload (or end-of-stream). No
    /// decoding, so no corrupt-payload retry.
    pub async fn receive_payload(&self, ctx: &WorkflowContext) -> (Option<Payload>, bool) {
        let state = get_state(ctx);
        let cell: Arc<Mutex<ReceiveCell>> = Arc::new(Mutex::new(ReceiveCell::default()));
        let callback = ReceiveCallback::new({
            let cell = cell.clone();
            move |value, more| {
                let mut cell = cell.lock();
                cell.value = value.cloned();
                cell.more = more;
                cell.has_result = true;
                true
            }
        });
        let (value, ok, more) = self.receive_async_impl(Some(&callback));
        if !ok && !more {
            return (None, false);
        }
        if ok {
            state.unblocked();
            return (value, more);
        }
        loop {
            let delivered = {
                let mut cell = cell.lock();
                if cell.has_result {
                    Some((cell.value.take(), cell.more))
                } else {
                    None
                }
            };
            if let Some((value, more)) = delivered {
                state.unblocked();
                return (value, more);
            }
            state
                .yield_now(format!("blocked on {}.Receive", self.name()))
                .await;
        }
    }

    /// Closes the channel. Every blocked receiver observes end-of-stream.
    /// Blocked senders are failed: their queue is cleared so later drains
    /// cannot adopt their values, and each parked send panics at its next
    /// resume. Buffered values remain receivable.
    pub fn close(&self) {
        let receivers: Vec<Arc<ReceiveCallback>> = {
            let mut inner = self.core.inner.lock();
            inner.closed = true;
            inner.blocked_sends.clear();
            inner.blocked_receives.iter().cloned().collect()
        };
        for callback in receivers {
            callback.invoke(None, false);
        }
    }

    // ok means a value was received; more means the channel is not closed
    // and further deliveries are possible.
    pub(crate) fn receive_async_impl(
        &self,
        callback: Option<&Arc<ReceiveCallback>>,
    ) -> (Option<Payload>, bool, bool) {
        let mut inner = self.core.inner.lock();
        if let Some(pre) = inner.pre_fetched.take() {
            return (Some(pre), true, true);
        }
        if let Some(head) = inner.buffer.pop_front() {
            // Pull a blocked sender into the slot the head vacated.
            while let Some(sender) = inner.blocked_sends.pop_front() {
                if sender.invoke() {
                    let value = sender.value.clone();
                    inner.buffer.push_back(value);
                    break;
                }
            }
            return (Some(head), true, true);
        }
        if inner.closed {
            return (None, false, false);
        }
        while let Some(sender) = inner.blocked_sends.pop_front() {
            if sender.invoke() {
                return (Some(sender.value.clone()), true, true);
            }
        }
        if let Some(callback) = callback {
            inner.blocked_receives.push_back(callback.clone());
        }
        (None, false, true)
    }

    pub(crate) fn send_async_impl(
        &self,
        value: Payload,
        callback: Option<&Arc<SendCallback>>,
    ) -> bool {
        let mut inner = self.core.inner.lock();
        if inner.closed {
            drop(inner);
            panic!("send on closed channel {}", self.name());
        }
        while let Some(receiver) = inner.blocked_receives.pop_front() {
            if receiver.invoke(Some(&value), true) {
                return true;
            }
        }
        if inner.buffer.len() < self.core.capacity {
            inner.buffer.push_back(value);
            return true;
        }
        if let Some(callback) = callback {
            inner.blocked_sends.push_back(callback.clone());
        }
        false
    }

    pub(crate) fn remove_receive_callback(&self, callback: &Arc<ReceiveCallback>) {
        let mut inner = self.core.inner.lock();
        if let Some(pos) = inner
            .blocked_receives
            .iter()
            .position(|c| Arc::ptr_eq(c, callback))
        {
            inner.blocked_receives.remove(pos);
        }
    }

    pub(crate) fn remove_send_callback(&self, callback: &Arc<SendCallback>) {
        let mut inner = self.core.inner.lock();
        if let Some(pos) = inner
            .blocked_sends
            .iter()
            .position(|c| Arc::ptr_eq(c, callback))
        {
            inner.blocked_sends.remove(pos);
        }
    }

    pub(crate) fn set_pre_fetched(&self, value: Payload) {
        self.core.inner.lock().pre_fetched = Some(value);
    }

    fn assign_value<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, ConversionError> {
        decode_arg::<T>(self.core.converter.as_ref(), payload).map_err(|err| {
            error!(channel = %self.name(), %err, "corrupt signal received, dropping payload");
            self.core.metrics.increment_counter(CORRUPTED_SIGNALS_COUNTER);
            err
        })
    }
}

#[derive(Default)]
struct ReceiveCell {
    value: Option<Payload>,
    more: bool,
    has_result: bool,
}
