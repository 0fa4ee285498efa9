//! Workflow context: an immutable keyed value chain plus cancel scopes.
//!
//! A [`WorkflowContext`] is a cheap cloneable handle. Deriving a context with
//! [`WorkflowContext::with_value`] shadows the key for the subtree without
//! touching the parent, which is what lets the dispatcher install a coroutine
//! state per spawned coroutine while everything else is shared.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::env::WorkflowEnvironment;
use crate::options::{
    with_context_propagators, with_data_converter, with_execution_start_to_close_timeout,
    with_workflow_domain, with_workflow_task_list, with_workflow_task_start_to_close_timeout,
};

pub(crate) const WORKFLOW_ENV_CTX_KEY: &str = "workflowEnv";
pub(crate) const WORKFLOW_INTERCEPTOR_CTX_KEY: &str = "workflowInterceptor";
pub(crate) const WORKFLOW_RESULT_CTX_KEY: &str = "workflowResult";
pub(crate) const COROUTINES_CTX_KEY: &str = "coroutines";
pub(crate) const WF_ENV_OPTIONS_CTX_KEY: &str = "wfEnvOptions";
const CANCEL_SCOPE_CTX_KEY: &str = "cancelScope";

struct ContextNode {
    parent: Option<Arc<ContextNode>>,
    key: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

#[derive(Clone)]
pub struct WorkflowContext {
    node: Option<Arc<ContextNode>>,
}

impl WorkflowContext {
    pub(crate) fn background() -> WorkflowContext {
        WorkflowContext { node: None }
    }

    /// Root context for driving a dispatcher against an environment. Installs
    /// the environment and the per-execution option defaults drawn from its
    /// [`crate::WorkflowInfo`].
    pub fn new_root(env: Arc<dyn WorkflowEnvironment>) -> WorkflowContext {
        let info = env.workflow_info();
        let ctx = WorkflowContext::background()
            .with_value(WORKFLOW_ENV_CTX_KEY, EnvValue(env.clone()));
        let ctx = with_workflow_domain(&ctx, info.domain.clone());
        let ctx = with_workflow_task_list(&ctx, info.task_list_name.clone());
        let ctx =
            with_execution_start_to_close_timeout(&ctx, info.execution_start_to_close_timeout);
        let ctx =
            with_workflow_task_start_to_close_timeout(&ctx, info.task_start_to_close_timeout);
        let ctx = with_data_converter(&ctx, env.data_converter());
        with_context_propagators(&ctx, env.context_propagators())
    }

    /// Derives a context carrying `value` under `key`, shadowing any outer
    /// binding of the same key.
    pub fn with_value<T: Any + Send + Sync>(
        &self,
        key: &'static str,
        value: T,
    ) -> WorkflowContext {
        self.with_value_arc(key, Arc::new(value))
    }

    pub(crate) fn with_value_arc(
        &self,
        key: &'static str,
        value: Arc<dyn Any + Send + Sync>,
    ) -> WorkflowContext {
        WorkflowContext {
            node: Some(Arc::new(ContextNode {
                parent: self.node.clone(),
                key,
                value,
            })),
        }
    }

    /// Innermost value stored under `key`, if any binding matches both the
    /// key and the requested type.
    pub fn value<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let mut current = self.node.as_ref();
        while let Some(node) = current {
            if node.key == key {
                return node.value.clone().downcast::<T>().ok();
            }
            current = node.parent.as_ref();
        }
        None
    }
}

pub(crate) struct EnvValue(pub(crate) Arc<dyn WorkflowEnvironment>);

pub(crate) fn get_workflow_environment(ctx: &WorkflowContext) -> Arc<dyn WorkflowEnvironment> {
    ctx.value::<EnvValue>(WORKFLOW_ENV_CTX_KEY)
        .unwrap_or_else(|| panic!("get_workflow_environment: not a workflow context"))
        .0
        .clone()
}

/// Idempotent cancellation trigger returned by [`with_cancel`].
pub type CancelFunc = Arc<dyn Fn() + Send + Sync>;

struct CancelScope {
    cancelled: AtomicBool,
    done: Channel,
    children: Mutex<Vec<CancelFunc>>,
}

/// Wraps `ctx` in a cancel scope.
///
/// Cancellation closes the scope's done channel, so it is observable only at
/// explicit primitive calls (a receive or selector case on the done channel);
/// nothing is preempted. Cancelling a scope cascades to scopes created inside
/// it.
pub fn with_cancel(ctx: &WorkflowContext) -> (WorkflowContext, CancelFunc) {
    let done = Channel::new_named(ctx, "done");
    let scope = Arc::new(CancelScope {
        cancelled: AtomicBool::new(false),
        done,
        children: Mutex::new(Vec::new()),
    });
    let cancel: CancelFunc = {
        let scope = scope.clone();
        Arc::new(move || {
            if !scope.cancelled.swap(true, Ordering::SeqCst) {
                scope.done.close();
                let children: Vec<CancelFunc> = scope.children.lock().drain(..).collect();
                for child in children {
                    child();
                }
            }
        })
    };
    if let Some(parent) = ctx.value::<CancelScope>(CANCEL_SCOPE_CTX_KEY) {
        parent.children.lock().push(cancel.clone());
    }
    (ctx.with_value_arc(CANCEL_SCOPE_CTX_KEY, scope), cancel)
}

/// Channel closed when the nearest enclosing cancel scope is cancelled.
pub fn done_channel(ctx: &WorkflowContext) -> Option<Channel> {
    ctx.value::<CancelScope>(CANCEL_SCOPE_CTX_KEY)
        .map(|scope| scope.done.clone())
}

pub fn is_cancelled(ctx: &WorkflowContext) -> bool {
    ctx.value::<CancelScope>(CANCEL_SCOPE_CTX_KEY)
        .map(|scope| scope.cancelled.load(Ordering::SeqCst))
        .unwrap_or(false)
}
