//! Deterministic cooperative coroutine runtime for replay-safe workflow
//! execution.
//!
//! This crate is the in-process executor core of a workflow engine: it runs
//! many logical coroutines to a quiescent state in a single thread of
//! control, so that re-executing the same code against the same inputs
//! observes the same ordering every time. It provides:
//!
//! - A [`Dispatcher`] that drives coroutines in spawn order until all of
//!   them are blocked or done, plus [`spawn`]/[`spawn_named`]
//! - A [`Channel`] with cooperative blocking send/receive, async variants,
//!   and close semantics
//! - A one-shot [`WorkflowFuture`]/[`Settable`] pair with chaining, and a
//!   typed [`DecodeFuture`]
//! - A [`Selector`] for multi-way waits with an optional default case
//! - A [`WaitGroup`] counting barrier
//! - A [`SyncWorkflowDefinition`] driver binding a user [`Workflow`] to a
//!   [`WorkflowEnvironment`], with signal channels, query handlers, and
//!   cancellation
//!
//! Blocking is cooperative: every blocking primitive suspends at an explicit
//! yield point and resumes when the dispatcher gives it the next slice.
//! Nothing here is thread-safe against concurrent user access from multiple
//! workflow threads, and nothing preempts.

mod coroutine;

pub mod channel;
pub mod context;
pub mod convert;
pub mod dispatcher;
pub mod env;
pub mod error;
pub mod future;
pub mod options;
pub mod selector;
pub mod wait_group;
pub mod workflow;

pub use channel::Channel;
pub use context::{done_channel, is_cancelled, with_cancel, CancelFunc, WorkflowContext};
pub use convert::{
    decode_arg, decode_args, default_data_converter, encode_arg, encode_args, DataConverter,
    JsonDataConverter, Payload,
};
pub use dispatcher::{spawn, spawn_named, Dispatcher};
pub use env::{
    headers_from_context, ContextPropagator, Header, HeaderReader, HeaderWriter, MetricsScope,
    NoopMetricsScope, WorkflowEnvironment, WorkflowInfo, CORRUPTED_SIGNALS_COUNTER,
    UNHANDLED_SIGNALS_COUNTER,
};
pub use error::{ConversionError, PanicError, WorkflowError};
pub use future::{new_decode_future, new_future, DecodeFuture, Settable, WorkflowFuture};
pub use options::{
    data_converter_from_workflow_context, set_query_handler, set_query_handler_raw,
    signal_channel, unhandled_signal_names, validate_cron_schedule, validated_workflow_options,
    with_context_propagators, with_cron_schedule, with_data_converter,
    with_execution_start_to_close_timeout, with_memo, with_parent_close_policy, with_retry_policy,
    with_search_attributes, with_wait_for_cancellation, with_workflow_domain, with_workflow_id,
    with_workflow_id_reuse_policy, with_workflow_task_list,
    with_workflow_task_start_to_close_timeout, ParentClosePolicy, RetryPolicy,
    WorkflowIdReusePolicy, WorkflowOptions, QUERY_TYPE_OPEN_SESSIONS, QUERY_TYPE_STACK_TRACE,
};
pub use selector::Selector;
pub use wait_group::WaitGroup;
pub use workflow::{
    FnWorkflow, SyncWorkflowDefinition, Workflow, WorkflowInterceptor, WorkflowInterceptorFactory,
};
