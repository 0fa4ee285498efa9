//! Workflow definition driver.
//!
//! Binds a user entry point to an environment: builds the root context and
//! interceptor chain, spawns the root coroutine, and wires the environment's
//! cancel/signal/query callbacks. Each decision turn the environment calls
//! [`SyncWorkflowDefinition::on_decision_task_started`], which drives the
//! dispatcher to quiescence and reports completion once the root coroutine
//! produced a result.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::context::{
    get_workflow_environment, with_cancel, CancelFunc, WorkflowContext,
    WORKFLOW_INTERCEPTOR_CTX_KEY, WORKFLOW_RESULT_CTX_KEY,
};
use crate::convert::Payload;
use crate::coroutine::get_state;
use crate::dispatcher::Dispatcher;
use crate::env::{Header, HeaderReader, WorkflowEnvironment, WorkflowInfo, UNHANDLED_SIGNALS_COUNTER};
use crate::error::WorkflowError;
use crate::options::workflow_env_options;

/// A workflow entry point. Workflow code must be deterministic: use the
/// crate's channels, selectors, and [`crate::spawn`] instead of host
/// threading primitives, and never block the thread.
#[async_trait]
pub trait Workflow: Send + Sync {
    async fn execute(
        &self,
        ctx: WorkflowContext,
        input: Option<Payload>,
    ) -> Result<Option<Payload>, WorkflowError>;
}

/// Function wrapper that implements [`Workflow`].
pub struct FnWorkflow<F>(pub F);

#[async_trait]
impl<F, Fut> Workflow for FnWorkflow<F>
where
    F: Fn(WorkflowContext, Option<Payload>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Payload>, WorkflowError>> + Send + 'static,
{
    async fn execute(
        &self,
        ctx: WorkflowContext,
        input: Option<Payload>,
    ) -> Result<Option<Payload>, WorkflowError> {
        (self.0)(ctx, input).await
    }
}

/// Intercepts workflow execution. The chain is built outermost-first from
/// the environment's factories; the innermost link invokes the user
/// workflow.
#[async_trait]
pub trait WorkflowInterceptor: Send + Sync {
    async fn execute_workflow(
        &self,
        ctx: WorkflowContext,
        input: Option<Payload>,
    ) -> Result<Option<Payload>, WorkflowError>;
}

pub trait WorkflowInterceptorFactory: Send + Sync {
    fn new_interceptor(
        &self,
        info: &WorkflowInfo,
        next: Arc<dyn WorkflowInterceptor>,
    ) -> Arc<dyn WorkflowInterceptor>;
}

/// Innermost interceptor: calls the bound workflow function.
pub(crate) struct WorkflowEnvironmentInterceptor {
    workflow: Arc<dyn Workflow>,
}

#[async_trait]
impl WorkflowInterceptor for WorkflowEnvironmentInterceptor {
    async fn execute_workflow(
        &self,
        ctx: WorkflowContext,
        input: Option<Payload>,
    ) -> Result<Option<Payload>, WorkflowError> {
        self.workflow.execute(ctx, input).await
    }
}

pub(crate) struct InterceptorValue(pub(crate) Arc<dyn WorkflowInterceptor>);

pub(crate) fn get_workflow_interceptor(ctx: &WorkflowContext) -> Arc<dyn WorkflowInterceptor> {
    ctx.value::<InterceptorValue>(WORKFLOW_INTERCEPTOR_CTX_KEY)
        .unwrap_or_else(|| panic!("get_workflow_interceptor: not a workflow context"))
        .0
        .clone()
}

fn new_workflow_interceptors(
    env: &dyn WorkflowEnvironment,
    workflow: Arc<dyn Workflow>,
) -> Arc<dyn WorkflowInterceptor> {
    let env_interceptor = Arc::new(WorkflowEnvironmentInterceptor { workflow });
    let mut head: Arc<dyn WorkflowInterceptor> = env_interceptor;
    let info = env.workflow_info();
    for factory in env.workflow_interceptors().iter().rev() {
        head = factory.new_interceptor(&info, head);
    }
    head
}

pub(crate) type WorkflowResultPair = (Option<Payload>, Option<WorkflowError>);

pub(crate) struct ResultSlot(pub(crate) Mutex<Option<WorkflowResultPair>>);

/// Drives one workflow execution over a dispatcher.
pub struct SyncWorkflowDefinition {
    workflow: Arc<dyn Workflow>,
    dispatcher: Option<Dispatcher>,
    root_ctx: Option<WorkflowContext>,
    cancel: Option<CancelFunc>,
}

impl SyncWorkflowDefinition {
    pub fn new(workflow: Arc<dyn Workflow>) -> SyncWorkflowDefinition {
        SyncWorkflowDefinition {
            workflow,
            dispatcher: None,
            root_ctx: None,
            cancel: None,
        }
    }

    /// Prepares the execution: root context, interceptor chain, root
    /// coroutine, header propagation, cancel scope, and the environment's
    /// cancel/signal/query handlers. Nothing runs until the first
    /// [`SyncWorkflowDefinition::on_decision_task_started`].
    pub fn execute(
        &mut self,
        env: Arc<dyn WorkflowEnvironment>,
        header: &Header,
        input: Option<Payload>,
    ) {
        let interceptor_head = new_workflow_interceptors(env.as_ref(), self.workflow.clone());
        let root_ctx = WorkflowContext::new_root(env.clone())
            .with_value(
                WORKFLOW_INTERCEPTOR_CTX_KEY,
                InterceptorValue(interceptor_head),
            )
            .with_value(WORKFLOW_RESULT_CTX_KEY, ResultSlot(Mutex::new(None)));

        // The root coroutine must observe the cancel scope and propagated
        // headers, both of which are layered on after the dispatcher exists,
        // so the final context is bound late.
        let final_ctx: Arc<OnceLock<WorkflowContext>> = Arc::new(OnceLock::new());
        let root = {
            let final_ctx = final_ctx.clone();
            move |ctx: WorkflowContext| async move {
                let run_ctx = final_ctx.get().cloned().unwrap_or(ctx);
                // Everything registered synchronously after creation (signal
                // and query handlers, cancellation) must be visible before
                // user code runs.
                let state = get_state(&run_ctx);
                state
                    .yield_now("yield before executing to setup state")
                    .await;
                let interceptor = get_workflow_interceptor(&run_ctx);
                let (result, error) = match interceptor
                    .execute_workflow(run_ctx.clone(), input)
                    .await
                {
                    Ok(result) => (result, None),
                    Err(err) => (None, Some(err)),
                };
                if let Some(slot) = run_ctx.value::<ResultSlot>(WORKFLOW_RESULT_CTX_KEY) {
                    *slot.0.lock() = Some((result, error));
                }
            }
        };
        let (dispatcher, ctx_with_state) = Dispatcher::new(&root_ctx, root);

        let mut ctx = ctx_with_state;
        for propagator in env.context_propagators() {
            match propagator.extract_to_workflow(ctx.clone(), &HeaderReader::new(header)) {
                Ok(extracted) => ctx = extracted,
                Err(err) => panic!("unable to propagate context: {err}"),
            }
        }
        let (ctx, cancel) = with_cancel(&ctx);
        let _ = final_ctx.set(ctx.clone());

        self.dispatcher = Some(dispatcher);
        self.root_ctx = Some(ctx.clone());
        self.cancel = Some(cancel.clone());

        env.register_cancel_handler(Box::new(move || cancel()));

        {
            let ctx = ctx.clone();
            env.register_signal_handler(Box::new(move |name: &str, payload: Payload| {
                let options =
                    workflow_env_options(&ctx).expect("signal handler: workflow options not set");
                // Never block the host: async send into a large buffer.
                let channel = options.signal_channel(&ctx, name);
                if !channel.send_payload_async(payload) {
                    panic!("exceeded channel buffer size for signal: {name}");
                }
            }));
        }

        {
            let ctx = ctx;
            env.register_query_handler(Box::new(move |query_type: &str, args: &[u8]| {
                let options =
                    workflow_env_options(&ctx).expect("query handler: workflow options not set");
                match options.query_handler(query_type) {
                    Some(handler) => handler(args),
                    None => Err(WorkflowError::message(format!(
                        "unknown query type {query_type}, known types: {:?}",
                        options.known_query_types()
                    ))),
                }
            }));
        }
    }

    /// Runs all coroutines to the next quiescent point and completes the
    /// execution if the root coroutine finished.
    pub fn on_decision_task_started(&self) {
        if let (Some(ctx), Some(dispatcher)) = (&self.root_ctx, &self.dispatcher) {
            execute_dispatcher(ctx, dispatcher);
        }
    }

    pub fn stack_trace(&self) -> String {
        self.dispatcher
            .as_ref()
            .map(Dispatcher::stack_trace)
            .unwrap_or_default()
    }

    pub fn close(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.close();
        }
    }
}

/// Runs coroutines in the calling thread and invokes the environment's
/// completion callback once the root workflow function returned.
pub(crate) fn execute_dispatcher(ctx: &WorkflowContext, dispatcher: &Dispatcher) {
    let env = get_workflow_environment(ctx);
    if let Err(panic_err) = dispatcher.execute_until_all_blocked() {
        env.complete(None, Some(WorkflowError::Panic(panic_err)));
        return;
    }

    let result = ctx
        .value::<ResultSlot>(WORKFLOW_RESULT_CTX_KEY)
        .and_then(|slot| slot.0.lock().clone());
    let Some((result, error)) = result else {
        // Result is not set, so the workflow is still executing.
        return;
    };

    if let Some(options) = workflow_env_options(ctx) {
        let unhandled = options.unhandled_signal_names();
        if !unhandled.is_empty() {
            info!(signal_names = ?unhandled, "workflow has unhandled signals");
            env.metrics_scope().increment_counter(UNHANDLED_SIGNALS_COUNTER);
        }
    }

    env.complete(result, error);
}
