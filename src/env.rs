//! Collaborator capabilities the runtime consumes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::context::WorkflowContext;
use crate::convert::{DataConverter, Payload};
use crate::error::WorkflowError;
use crate::options::workflow_env_options;
use crate::workflow::WorkflowInterceptorFactory;

/// Counter bumped when a channel drops an undecodable payload.
pub const CORRUPTED_SIGNALS_COUNTER: &str = "corrupted-signals";
/// Counter bumped when a workflow completes with unconsumed signals.
pub const UNHANDLED_SIGNALS_COUNTER: &str = "unhandled-signals";

/// Static information about the executing workflow.
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub domain: String,
    pub task_list_name: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub execution_start_to_close_timeout: Duration,
    pub task_start_to_close_timeout: Duration,
}

pub trait MetricsScope: Send + Sync {
    fn increment_counter(&self, name: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsScope;

impl MetricsScope for NoopMetricsScope {
    fn increment_counter(&self, _name: &str) {}
}

/// Header fields propagated into (and out of) a workflow execution.
#[derive(Debug, Clone, Default)]
pub struct Header {
    fields: HashMap<String, Payload>,
}

impl Header {
    pub fn new() -> Header {
        Header::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Payload) {
        self.fields.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Payload> {
        self.fields.get(key)
    }
}

pub struct HeaderReader<'a> {
    header: &'a Header,
}

impl<'a> HeaderReader<'a> {
    pub fn new(header: &'a Header) -> HeaderReader<'a> {
        HeaderReader { header }
    }

    pub fn get(&self, key: &str) -> Option<&Payload> {
        self.header.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Payload)> {
        self.header.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

pub struct HeaderWriter<'a> {
    header: &'a mut Header,
}

impl<'a> HeaderWriter<'a> {
    pub fn new(header: &'a mut Header) -> HeaderWriter<'a> {
        HeaderWriter { header }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Payload) {
        self.header.set(key, value);
    }
}

/// Moves values between headers and the workflow context, once inbound
/// before user code runs and outbound whenever headers are inherited.
pub trait ContextPropagator: Send + Sync {
    fn extract_to_workflow(
        &self,
        ctx: WorkflowContext,
        reader: &HeaderReader<'_>,
    ) -> Result<WorkflowContext, WorkflowError>;

    fn inject_from_workflow(&self, ctx: &WorkflowContext, writer: &mut HeaderWriter<'_>);
}

/// Builds the header a child execution inherits, running every registered
/// propagator's inject step.
pub fn headers_from_context(ctx: &WorkflowContext) -> Header {
    let mut header = Header::new();
    let propagators = workflow_env_options(ctx)
        .map(|options| options.context_propagators.clone())
        .unwrap_or_default();
    {
        let mut writer = HeaderWriter::new(&mut header);
        for propagator in &propagators {
            propagator.inject_from_workflow(ctx, &mut writer);
        }
    }
    header
}

pub type CancelHandler = Box<dyn Fn() + Send + Sync>;
pub type SignalHandler = Box<dyn Fn(&str, Payload) + Send + Sync>;
pub type QueryHandler =
    Box<dyn Fn(&str, &[u8]) -> Result<Option<Payload>, WorkflowError> + Send + Sync>;

/// The host side of a workflow execution: static info, capabilities, and the
/// callbacks through which cancellation, signals, queries, and completion
/// flow.
pub trait WorkflowEnvironment: Send + Sync {
    fn workflow_info(&self) -> WorkflowInfo;

    fn data_converter(&self) -> Arc<dyn DataConverter>;

    fn context_propagators(&self) -> Vec<Arc<dyn ContextPropagator>> {
        Vec::new()
    }

    fn workflow_interceptors(&self) -> Vec<Arc<dyn WorkflowInterceptorFactory>> {
        Vec::new()
    }

    fn metrics_scope(&self) -> Arc<dyn MetricsScope> {
        Arc::new(NoopMetricsScope)
    }

    fn register_cancel_handler(&self, handler: CancelHandler);

    fn register_signal_handler(&self, handler: SignalHandler);

    fn register_query_handler(&self, handler: QueryHandler);

    /// Reports the workflow's terminal state back to the host.
    fn complete(&self, result: Option<Payload>, err: Option<WorkflowError>);
}
