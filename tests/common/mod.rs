#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use coflow::env::{CancelHandler, QueryHandler, SignalHandler};
use coflow::{
    default_data_converter, DataConverter, Dispatcher, MetricsScope, Payload,
    WorkflowContext, WorkflowEnvironment, WorkflowError, WorkflowInfo,
    WorkflowInterceptorFactory,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Default)]
pub struct TestMetrics {
    counters: Mutex<HashMap<String, u64>>,
}

impl TestMetrics {
    pub fn count(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }
}

impl MetricsScope for TestMetrics {
    fn increment_counter(&self, name: &str) {
        *self.counters.lock().entry(name.to_string()).or_insert(0) += 1;
    }
}

/// In-memory environment: records handler registrations and the completion
/// report, and lets tests deliver signals/queries/cancellation like a host
/// would between decision turns.
pub struct TestWorkflowEnvironment {
    info: WorkflowInfo,
    converter: Arc<dyn DataConverter>,
    pub metrics: Arc<TestMetrics>,
    pub interceptors: Mutex<Vec<Arc<dyn WorkflowInterceptorFactory>>>,
    cancel_handler: Mutex<Option<CancelHandler>>,
    signal_handler: Mutex<Option<SignalHandler>>,
    query_handler: Mutex<Option<QueryHandler>>,
    completion: Mutex<Option<(Option<Payload>, Option<WorkflowError>)>>,
}

impl TestWorkflowEnvironment {
    pub fn new() -> Arc<TestWorkflowEnvironment> {
        init_tracing();
        Arc::new(TestWorkflowEnvironment {
            info: WorkflowInfo {
                domain: "test-domain".to_string(),
                task_list_name: "test-tasklist".to_string(),
                workflow_id: "test-workflow-id".to_string(),
                workflow_type: "TestWorkflow".to_string(),
                execution_start_to_close_timeout: Duration::from_secs(60),
                task_start_to_close_timeout: Duration::from_secs(10),
            },
            converter: default_data_converter(),
            metrics: Arc::new(TestMetrics::default()),
            interceptors: Mutex::new(Vec::new()),
            cancel_handler: Mutex::new(None),
            signal_handler: Mutex::new(None),
            query_handler: Mutex::new(None),
            completion: Mutex::new(None),
        })
    }

    pub fn cancel(&self) {
        let handler = self.cancel_handler.lock();
        let handler = handler.as_ref().expect("no cancel handler registered");
        handler();
    }

    pub fn signal(&self, name: &str, payload: Payload) {
        let handler = self.signal_handler.lock();
        let handler = handler.as_ref().expect("no signal handler registered");
        handler(name, payload);
    }

    pub fn query(&self, query_type: &str, args: &[u8]) -> Result<Option<Payload>, WorkflowError> {
        let handler = self.query_handler.lock();
        let handler = handler.as_ref().expect("no query handler registered");
        handler(query_type, args)
    }

    pub fn completion(&self) -> Option<(Option<Payload>, Option<WorkflowError>)> {
        self.completion.lock().clone()
    }
}

impl WorkflowEnvironment for TestWorkflowEnvironment {
    fn workflow_info(&self) -> WorkflowInfo {
        self.info.clone()
    }

    fn data_converter(&self) -> Arc<dyn DataConverter> {
        self.converter.clone()
    }

    fn metrics_scope(&self) -> Arc<dyn MetricsScope> {
        self.metrics.clone()
    }

    fn workflow_interceptors(&self) -> Vec<Arc<dyn WorkflowInterceptorFactory>> {
        self.interceptors.lock().clone()
    }

    fn register_cancel_handler(&self, handler: CancelHandler) {
        *self.cancel_handler.lock() = Some(handler);
    }

    fn register_signal_handler(&self, handler: SignalHandler) {
        *self.signal_handler.lock() = Some(handler);
    }

    fn register_query_handler(&self, handler: QueryHandler) {
        *self.query_handler.lock() = Some(handler);
    }

    fn complete(&self, result: Option<Payload>, err: Option<WorkflowError>) {
        *self.completion.lock() = Some((result, err));
    }
}

/// Dispatcher over a fresh root context, with `root` as the root coroutine.
pub fn new_dispatcher<F, Fut>(
    env: Arc<TestWorkflowEnvironment>,
    root: F,
) -> (Dispatcher, WorkflowContext)
where
    F: FnOnce(WorkflowContext) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let env: Arc<dyn WorkflowEnvironment> = env;
    let root_ctx = WorkflowContext::new_root(env);
    Dispatcher::new(&root_ctx, root)
}
