//! Per-execution options, the signal channel registry, and query handlers.
//!
//! Options live in the context under a single slot with copy-on-write
//! semantics: every `with_*` setter clones the current options into a child
//! context. The signal-channel and query-handler registries are shared maps,
//! so a derived context observes the same registrations as its parent.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::channel::Channel;
use crate::context::{get_workflow_environment, WorkflowContext, WF_ENV_OPTIONS_CTX_KEY};
use crate::convert::{
    decode_arg, default_data_converter, encode_arg, DataConverter, Payload,
};
use crate::coroutine::ILLEGAL_ACCESS_FROM_OUTSIDE_WORKFLOW;
use crate::env::ContextPropagator;
use crate::error::{panic_message, WorkflowError};

/// Built-in query type resolved by the host to the dispatcher stack trace.
pub const QUERY_TYPE_STACK_TRACE: &str = "__stack_trace";
/// Built-in query type resolved by the host to the open session list.
pub const QUERY_TYPE_OPEN_SESSIONS: &str = "__open_sessions";

pub(crate) const DEFAULT_SIGNAL_CHANNEL_SIZE: usize = 100_000;
const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) const QUERY_HANDLER_CONTEXT_GUIDANCE: &str =
    "query handler must not use the workflow context to create channels, spawn coroutines, or \
     call blocking operations like Channel::receive or Future::get";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowIdReusePolicy {
    #[default]
    AllowDuplicateFailedOnly,
    AllowDuplicate,
    RejectDuplicate,
    TerminateIfRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParentClosePolicy {
    #[default]
    Terminate,
    RequestCancel,
    Abandon,
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    pub expiration_interval: Duration,
    pub maximum_attempts: i32,
    pub non_retriable_error_reasons: Vec<String>,
}

pub(crate) type QueryHandlerFn =
    Arc<dyn Fn(&[u8]) -> Result<Option<Payload>, WorkflowError> + Send + Sync>;

/// Options of the running execution. Scalars are copied per `with_*` setter;
/// the signal and query registries are shared across all copies.
#[derive(Clone, Default)]
pub struct WorkflowOptions {
    pub task_list_name: Option<String>,
    pub execution_start_to_close_timeout: Option<Duration>,
    pub task_start_to_close_timeout: Option<Duration>,
    pub domain: Option<String>,
    pub workflow_id: Option<String>,
    pub wait_for_cancellation: bool,
    pub workflow_id_reuse_policy: WorkflowIdReusePolicy,
    pub data_converter: Option<Arc<dyn DataConverter>>,
    pub retry_policy: Option<RetryPolicy>,
    pub cron_schedule: Option<String>,
    pub context_propagators: Vec<Arc<dyn ContextPropagator>>,
    pub memo: HashMap<String, serde_json::Value>,
    pub search_attributes: HashMap<String, serde_json::Value>,
    pub parent_close_policy: ParentClosePolicy,
    signal_channels: Arc<Mutex<HashMap<String, Channel>>>,
    query_handlers: Arc<Mutex<HashMap<String, QueryHandlerFn>>>,
}

impl WorkflowOptions {
    /// Channel the named signal is delivered on, created lazily with a large
    /// buffer so signal delivery never blocks the host.
    pub(crate) fn signal_channel(&self, ctx: &WorkflowContext, name: &str) -> Channel {
        let mut channels = self.signal_channels.lock();
        if let Some(channel) = channels.get(name) {
            return channel.clone();
        }
        let channel =
            Channel::new_named_buffered(ctx, format!("signal-{name}"), DEFAULT_SIGNAL_CHANNEL_SIZE);
        channels.insert(name.to_string(), channel.clone());
        channel
    }

    /// Names of signals with undelivered payloads. Peeked values go to the
    /// channel's pre-fetch slot so a later receive still observes them.
    pub(crate) fn unhandled_signal_names(&self) -> Vec<String> {
        let channels = self.signal_channels.lock();
        let mut names = Vec::new();
        for (name, channel) in channels.iter() {
            let (value, ok, _) = channel.receive_async_impl(None);
            if ok {
                names.push(name.clone());
                if let Some(value) = value {
                    channel.set_pre_fetched(value);
                }
            }
        }
        names.sort();
        names
    }

    pub(crate) fn query_handler(&self, query_type: &str) -> Option<QueryHandlerFn> {
        self.query_handlers.lock().get(query_type).cloned()
    }

    pub(crate) fn known_query_types(&self) -> Vec<String> {
        let mut types = vec![
            QUERY_TYPE_STACK_TRACE.to_string(),
            QUERY_TYPE_OPEN_SESSIONS.to_string(),
        ];
        types.extend(self.query_handlers.lock().keys().cloned());
        types.sort();
        types
    }

    fn register_query_handler_fn(&self, query_type: String, handler: QueryHandlerFn) {
        self.query_handlers.lock().insert(query_type, handler);
    }
}

pub(crate) fn workflow_env_options(ctx: &WorkflowContext) -> Option<Arc<WorkflowOptions>> {
    ctx.value::<WorkflowOptions>(WF_ENV_OPTIONS_CTX_KEY)
}

fn modify_options(
    ctx: &WorkflowContext,
    f: impl FnOnce(&mut WorkflowOptions),
) -> WorkflowContext {
    let mut options = match workflow_env_options(ctx) {
        Some(options) => (*options).clone(),
        None => WorkflowOptions::default(),
    };
    if options.data_converter.is_none() {
        options.data_converter = Some(default_data_converter());
    }
    f(&mut options);
    ctx.with_value(WF_ENV_OPTIONS_CTX_KEY, options)
}

pub fn with_workflow_domain(ctx: &WorkflowContext, domain: impl Into<String>) -> WorkflowContext {
    let domain = domain.into();
    modify_options(ctx, |options| options.domain = Some(domain))
}

pub fn with_workflow_task_list(
    ctx: &WorkflowContext,
    task_list: impl Into<String>,
) -> WorkflowContext {
    let task_list = task_list.into();
    modify_options(ctx, |options| options.task_list_name = Some(task_list))
}

pub fn with_execution_start_to_close_timeout(
    ctx: &WorkflowContext,
    timeout: Duration,
) -> WorkflowContext {
    modify_options(ctx, |options| {
        options.execution_start_to_close_timeout = Some(timeout)
    })
}

pub fn with_workflow_task_start_to_close_timeout(
    ctx: &WorkflowContext,
    timeout: Duration,
) -> WorkflowContext {
    modify_options(ctx, |options| {
        options.task_start_to_close_timeout = Some(timeout)
    })
}

pub fn with_workflow_id(ctx: &WorkflowContext, workflow_id: impl Into<String>) -> WorkflowContext {
    let workflow_id = workflow_id.into();
    modify_options(ctx, |options| options.workflow_id = Some(workflow_id))
}

pub fn with_workflow_id_reuse_policy(
    ctx: &WorkflowContext,
    policy: WorkflowIdReusePolicy,
) -> WorkflowContext {
    modify_options(ctx, |options| options.workflow_id_reuse_policy = policy)
}

pub fn with_wait_for_cancellation(ctx: &WorkflowContext, wait: bool) -> WorkflowContext {
    modify_options(ctx, |options| options.wait_for_cancellation = wait)
}

pub fn with_data_converter(
    ctx: &WorkflowContext,
    converter: Arc<dyn DataConverter>,
) -> WorkflowContext {
    modify_options(ctx, |options| options.data_converter = Some(converter))
}

pub fn with_retry_policy(ctx: &WorkflowContext, policy: RetryPolicy) -> WorkflowContext {
    modify_options(ctx, |options| options.retry_policy = Some(policy))
}

pub fn with_cron_schedule(ctx: &WorkflowContext, schedule: impl Into<String>) -> WorkflowContext {
    let schedule = schedule.into();
    modify_options(ctx, |options| options.cron_schedule = Some(schedule))
}

pub fn with_context_propagators(
    ctx: &WorkflowContext,
    propagators: Vec<Arc<dyn ContextPropagator>>,
) -> WorkflowContext {
    modify_options(ctx, |options| options.context_propagators = propagators)
}

pub fn with_memo(
    ctx: &WorkflowContext,
    memo: HashMap<String, serde_json::Value>,
) -> WorkflowContext {
    modify_options(ctx, |options| options.memo = memo)
}

pub fn with_search_attributes(
    ctx: &WorkflowContext,
    attributes: HashMap<String, serde_json::Value>,
) -> WorkflowContext {
    modify_options(ctx, |options| options.search_attributes = attributes)
}

pub fn with_parent_close_policy(
    ctx: &WorkflowContext,
    policy: ParentClosePolicy,
) -> WorkflowContext {
    modify_options(ctx, |options| options.parent_close_policy = policy)
}

/// Converter configured for this execution, falling back to the default.
pub fn data_converter_from_workflow_context(ctx: &WorkflowContext) -> Arc<dyn DataConverter> {
    workflow_env_options(ctx)
        .and_then(|options| options.data_converter.clone())
        .unwrap_or_else(default_data_converter)
}

/// Channel the named signal is delivered on, created lazily on first use.
pub fn signal_channel(ctx: &WorkflowContext, name: &str) -> Channel {
    let Some(options) = workflow_env_options(ctx) else {
        panic!("signal_channel: not a workflow context");
    };
    options.signal_channel(ctx, name)
}

/// Names of signals that still hold undelivered payloads.
pub fn unhandled_signal_names(ctx: &WorkflowContext) -> Vec<String> {
    workflow_env_options(ctx)
        .map(|options| options.unhandled_signal_names())
        .unwrap_or_default()
}

/// Registers a typed query handler. The handler must be read-only with
/// respect to workflow state and must not touch workflow primitives; a
/// violation is caught at invocation and reported with guidance.
pub fn set_query_handler<A, R, F>(
    ctx: &WorkflowContext,
    query_type: &str,
    handler: F,
) -> Result<(), WorkflowError>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Result<R, WorkflowError> + Send + Sync + 'static,
{
    validate_query_type(query_type)?;
    let converter = data_converter_from_workflow_context(ctx);
    let owned_type = query_type.to_string();
    let wrapped: QueryHandlerFn = Arc::new(move |input: &[u8]| {
        let handler = &handler;
        let converter = converter.clone();
        let query_type = owned_type.clone();
        let input = input.to_vec();
        run_query_handler(move || {
            let arg: A = decode_arg(converter.as_ref(), &input).map_err(|e| {
                WorkflowError::message(format!(
                    "unable to decode the input for query type {query_type}: {e}"
                ))
            })?;
            let result = handler(arg)?;
            let payload = encode_arg(converter.as_ref(), &result)?;
            Ok(Some(payload))
        })
    });
    register_query_handler(ctx, query_type, wrapped)
}

/// Registers a query handler that receives the query arguments as raw bytes
/// and returns an already-encoded payload.
pub fn set_query_handler_raw<F>(
    ctx: &WorkflowContext,
    query_type: &str,
    handler: F,
) -> Result<(), WorkflowError>
where
    F: Fn(Vec<u8>) -> Result<Option<Payload>, WorkflowError> + Send + Sync + 'static,
{
    validate_query_type(query_type)?;
    let wrapped: QueryHandlerFn = Arc::new(move |input: &[u8]| {
        let handler = &handler;
        let input = input.to_vec();
        run_query_handler(move || handler(input))
    });
    register_query_handler(ctx, query_type, wrapped)
}

fn register_query_handler(
    ctx: &WorkflowContext,
    query_type: &str,
    handler: QueryHandlerFn,
) -> Result<(), WorkflowError> {
    let Some(options) = workflow_env_options(ctx) else {
        return Err(WorkflowError::message(
            "set_query_handler: not a workflow context",
        ));
    };
    options.register_query_handler_fn(query_type.to_string(), handler);
    Ok(())
}

fn validate_query_type(query_type: &str) -> Result<(), WorkflowError> {
    if query_type.is_empty() {
        return Err(WorkflowError::message("query type must not be empty"));
    }
    if query_type.starts_with("__") {
        return Err(WorkflowError::message(format!(
            "query type {query_type} is reserved for built-in queries"
        )));
    }
    Ok(())
}

fn run_query_handler(
    f: impl FnOnce() -> Result<Option<Payload>, WorkflowError>,
) -> Result<Option<Payload>, WorkflowError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let mut message = panic_message(&payload);
            if message == ILLEGAL_ACCESS_FROM_OUTSIDE_WORKFLOW {
                message = QUERY_HANDLER_CONTEXT_GUIDANCE.to_string();
            }
            Err(WorkflowError::message(format!(
                "query handler panic: {message}, trace: query handler [panic]"
            )))
        }
    }
}

/// Resolves and validates the execution options: defaults domain and task
/// list from the environment, requires a positive execution timeout, maps a
/// zero task timeout to the engine default, and validates retry policy and
/// cron schedule. Returns errors, never panics.
pub fn validated_workflow_options(ctx: &WorkflowContext) -> Result<WorkflowOptions, WorkflowError> {
    let Some(options) = workflow_env_options(ctx) else {
        return Err(WorkflowError::message("missing workflow options"));
    };
    let mut options = (*options).clone();
    let info = get_workflow_environment(ctx).workflow_info();
    if options.domain.as_deref().map_or(true, str::is_empty) {
        options.domain = Some(info.domain.clone());
    }
    if options.task_list_name.as_deref().map_or(true, str::is_empty) {
        options.task_list_name = Some(info.task_list_name.clone());
    }
    match options.task_start_to_close_timeout {
        None => {
            return Err(WorkflowError::message(
                "missing task start to close timeout",
            ))
        }
        Some(timeout) if timeout.is_zero() => {
            options.task_start_to_close_timeout = Some(DEFAULT_TASK_TIMEOUT);
        }
        Some(_) => {}
    }
    match options.execution_start_to_close_timeout {
        None => {
            return Err(WorkflowError::message(
                "missing or invalid execution start to close timeout",
            ))
        }
        Some(timeout) if timeout.is_zero() => {
            return Err(WorkflowError::message(
                "missing or invalid execution start to close timeout",
            ))
        }
        Some(_) => {}
    }
    if let Some(policy) = &options.retry_policy {
        validate_retry_policy(policy)?;
    }
    if let Some(schedule) = &options.cron_schedule {
        validate_cron_schedule(schedule)?;
    }
    Ok(options)
}

pub(crate) fn validate_retry_policy(policy: &RetryPolicy) -> Result<(), WorkflowError> {
    if policy.initial_interval.is_zero() {
        return Err(WorkflowError::message(
            "retry policy initial interval must be positive",
        ));
    }
    if policy.backoff_coefficient < 1.0 {
        return Err(WorkflowError::message(
            "retry policy backoff coefficient cannot be less than 1",
        ));
    }
    if !policy.maximum_interval.is_zero() && policy.maximum_interval < policy.initial_interval {
        return Err(WorkflowError::message(
            "retry policy maximum interval cannot be less than initial interval",
        ));
    }
    if policy.maximum_attempts < 0 {
        return Err(WorkflowError::message(
            "retry policy maximum attempts cannot be negative",
        ));
    }
    Ok(())
}

/// Validates a standard five-field cron expression. Empty means "no cron".
pub fn validate_cron_schedule(schedule: &str) -> Result<(), WorkflowError> {
    if schedule.is_empty() {
        return Ok(());
    }
    // The parser wants a seconds column; standard expressions omit it.
    cron::Schedule::from_str(&format!("0 {schedule}"))
        .map(|_| ())
        .map_err(|e| WorkflowError::message(format!("invalid cron schedule {schedule}: {e}")))
}
