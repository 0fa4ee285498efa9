//! Multi-way wait over channels and futures.
//!
//! Cases are attempted in registration order, each with a capture callback
//! that atomically claims the single ready-branch slot. The first claim
//! wins; every later callback sees the slot occupied, returns `false`, and
//! the primitive leaves its value in flight. A sentinel fills the slot
//! before a branch runs so a still-registered callback from this select can
//! never consume a second value. `select` consumes the selector, so cases
//! cannot be re-added after it returns.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::channel::{Channel, ReceiveCallback, SendCallback};
use crate::context::WorkflowContext;
use crate::convert::{encode_arg, Payload};
use crate::coroutine::get_state;
use crate::dispatcher::next_selector_name;
use crate::future::WorkflowFuture;

type BranchFn = Box<dyn FnOnce() + Send>;
type ReadySlot = Arc<Mutex<Option<BranchFn>>>;

enum SelectCase {
    Receive {
        channel: Channel,
        handler: Box<dyn FnOnce(Channel, bool) + Send>,
    },
    Send {
        channel: Channel,
        value: Payload,
        handler: Box<dyn FnOnce() + Send>,
    },
    Future {
        future: WorkflowFuture,
        handler: Box<dyn FnOnce(WorkflowFuture) + Send>,
    },
}

enum Cleanup {
    Receive(Channel, Arc<ReceiveCallback>),
    Send(Channel, Arc<SendCallback>),
    Future(WorkflowFuture, Arc<ReceiveCallback>),
}

pub struct Selector {
    name: String,
    cases: Vec<SelectCase>,
    default_handler: Option<Box<dyn FnOnce() + Send>>,
}

impl Selector {
    pub fn new(ctx: &WorkflowContext) -> Selector {
        let name = next_selector_name(ctx);
        Selector::new_named(ctx, name)
    }

    pub fn new_named(_ctx: &WorkflowContext, name: impl Into<String>) -> Selector {
        Selector {
            name: name.into(),
            cases: Vec::new(),
            default_handler: None,
        }
    }

    /// Fires `handler` when `channel` has a value. The value is stashed in
    /// the channel's pre-fetch slot, so the handler observes it through a
    /// normal receive.
    pub fn add_receive(
        mut self,
        channel: &Channel,
        handler: impl FnOnce(Channel, bool) + Send + 'static,
    ) -> Selector {
        self.cases.push(SelectCase::Receive {
            channel: channel.clone(),
            handler: Box::new(handler),
        });
        self
    }

    /// Fires `handler` once `channel` accepted `value`.
    pub fn add_send<T: Serialize>(
        mut self,
        channel: &Channel,
        value: &T,
        handler: impl FnOnce() + Send + 'static,
    ) -> Selector {
        let payload = encode_arg(channel.converter().as_ref(), value).unwrap_or_else(|e| {
            panic!(
                "failed to encode value for selector send on channel {}: {e}",
                channel.name()
            )
        });
        self.cases.push(SelectCase::Send {
            channel: channel.clone(),
            value: payload,
            handler: Box::new(handler),
        });
        self
    }

    /// Fires `handler` when `future` becomes ready.
    pub fn add_future(
        mut self,
        future: &WorkflowFuture,
        handler: impl FnOnce(WorkflowFuture) + Send + 'static,
    ) -> Selector {
        self.cases.push(SelectCase::Future {
            future: future.clone(),
            handler: Box::new(handler),
        });
        self
    }

    /// Fires `handler` when no case is ready at activation, instead of
    /// blocking.
    pub fn add_default(mut self, handler: impl FnOnce() + Send + 'static) -> Selector {
        self.default_handler = Some(Box::new(handler));
        self
    }

    /// Waits until exactly one registered case fires (or the default, when
    /// present and nothing is ready). Consumes the selector.
    pub async fn select(mut self, ctx: &WorkflowContext) {
        let state = get_state(ctx);
        let ready: ReadySlot = Arc::new(Mutex::new(None));
        let mut cleanups: Vec<Cleanup> = Vec::new();
        let mut fired = false;

        for case in self.cases.drain(..) {
            match case {
                SelectCase::Receive { channel, handler } => {
                    let handler = Arc::new(Mutex::new(Some(handler)));
                    let callback = ReceiveCallback::new({
                        let ready = ready.clone();
                        let channel = channel.clone();
                        let handler = handler.clone();
                        move |value: Option<&Payload>, more: bool| {
                            let mut slot = ready.lock();
                            if slot.is_some() {
                                return false;
                            }
                            let Some(handler) = handler.lock().take() else {
                                return false;
                            };
                            let value = value.cloned();
                            let channel = channel.clone();
                            *slot = Some(Box::new(move || {
                                if let Some(value) = value {
                                    channel.set_pre_fetched(value);
                                }
                                let branch_channel = channel.clone();
                                handler(branch_channel, more);
                            }));
                            true
                        }
                    });
                    let (value, ok, more) = channel.receive_async_impl(Some(&callback));
                    if ok || !more {
                        // This branch fires now. Claim the slot so callbacks
                        // already registered by earlier cases cannot consume
                        // another value on behalf of this select.
                        *ready.lock() = Some(Box::new(|| {}));
                        if more {
                            if let Some(value) = value {
                                channel.set_pre_fetched(value);
                            }
                        }
                        if let Some(handler) = handler.lock().take() {
                            handler(channel.clone(), more);
                        }
                        fired = true;
                        break;
                    }
                    cleanups.push(Cleanup::Receive(channel, callback));
                }
                SelectCase::Send {
                    channel,
                    value,
                    handler,
                } => {
                    let handler = Arc::new(Mutex::new(Some(handler)));
                    let callback = SendCallback::new(value.clone(), {
                        let ready = ready.clone();
                        let handler = handler.clone();
                        move || {
                            let mut slot = ready.lock();
                            if slot.is_some() {
                                return false;
                            }
                            let Some(handler) = handler.lock().take() else {
                                return false;
                            };
                            *slot = Some(Box::new(move || handler()));
                            true
                        }
                    });
                    if channel.send_async_impl(value, Some(&callback)) {
                        *ready.lock() = Some(Box::new(|| {}));
                        if let Some(handler) = handler.lock().take() {
                            handler();
                        }
                        fired = true;
                        break;
                    }
                    cleanups.push(Cleanup::Send(channel, callback));
                }
                SelectCase::Future { future, handler } => {
                    let handler = Arc::new(Mutex::new(Some(handler)));
                    let callback = ReceiveCallback::new({
                        let ready = ready.clone();
                        let handler = handler.clone();
                        let future = future.clone();
                        move |_value, _more| {
                            let mut slot = ready.lock();
                            if slot.is_some() {
                                return false;
                            }
                            let Some(handler) = handler.lock().take() else {
                                return false;
                            };
                            let future = future.clone();
                            *slot = Some(Box::new(move || handler(future)));
                            true
                        }
                    });
                    let (_, ok, _) = future.get_async(&callback);
                    if ok {
                        *ready.lock() = Some(Box::new(|| {}));
                        if let Some(handler) = handler.lock().take() {
                            handler(future.clone());
                        }
                        fired = true;
                        break;
                    }
                    cleanups.push(Cleanup::Future(future, callback));
                }
            }
        }

        if !fired {
            if let Some(default_handler) = self.default_handler.take() {
                default_handler();
            } else {
                loop {
                    let branch = {
                        let mut slot = ready.lock();
                        // Swap in the sentinel rather than emptying the slot:
                        // the branch body may interact with channels this
                        // select still has callbacks on.
                        if slot.is_some() {
                            slot.replace(Box::new(|| {}))
                        } else {
                            None
                        }
                    };
                    if let Some(branch) = branch {
                        branch();
                        state.unblocked();
                        break;
                    }
                    state
                        .yield_now(format!("blocked on {}.Select", self.name))
                        .await;
                }
            }
        }

        // Remove every callback this select registered, on every exit path.
        for cleanup in cleanups {
            match cleanup {
                Cleanup::Receive(channel, callback) => channel.remove_receive_callback(&callback),
                Cleanup::Send(channel, callback) => channel.remove_send_callback(&callback),
                Cleanup::Future(future, callback) => future.remove_receive_callback(&callback),
            }
        }
    }
}
