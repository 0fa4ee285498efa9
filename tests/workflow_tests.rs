use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use coflow::{
    decode_arg, default_data_converter, done_channel, encode_arg, set_query_handler,
    signal_channel, spawn, validate_cron_schedule, validated_workflow_options,
    with_cron_schedule, with_execution_start_to_close_timeout, with_retry_policy,
    with_workflow_task_start_to_close_timeout, FnWorkflow, Header, Payload, RetryPolicy,
    SyncWorkflowDefinition, WorkflowContext, WorkflowEnvironment, WorkflowError, WorkflowInfo,
    WorkflowInterceptor, WorkflowInterceptorFactory, QUERY_TYPE_STACK_TRACE,
    UNHANDLED_SIGNALS_COUNTER,
};

mod common;
use common::TestWorkflowEnvironment;

fn encode<T: serde::Serialize>(value: &T) -> Payload {
    encode_arg(default_data_converter().as_ref(), value).unwrap()
}

fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> T {
    decode_arg(default_data_converter().as_ref(), payload).unwrap()
}

fn start(
    env: &Arc<TestWorkflowEnvironment>,
    workflow: impl coflow::Workflow + 'static,
) -> SyncWorkflowDefinition {
    let mut definition = SyncWorkflowDefinition::new(Arc::new(workflow));
    let env: Arc<dyn WorkflowEnvironment> = env.clone();
    definition.execute(env, &Header::new(), None);
    definition
}

// A signal delivered while the workflow is quiescent unblocks the receiver
// on the next decision turn, and the workflow completes with the payload.
#[test]
fn signal_during_quiescence_completes_workflow() {
    let env = TestWorkflowEnvironment::new();
    let workflow = FnWorkflow(|ctx: WorkflowContext, _input: Option<Payload>| async move {
        let channel = signal_channel(&ctx, "sig");
        let (value, _) = channel.receive::<Vec<u8>>(&ctx).await;
        let payload = encode_arg(default_data_converter().as_ref(), &value.unwrap())?;
        Ok(Some(payload))
    });
    let definition = start(&env, workflow);

    definition.on_decision_task_started();
    assert!(env.completion().is_none(), "workflow must still be blocked");

    env.signal("sig", encode(&vec![1u8, 2, 3]));
    definition.on_decision_task_started();

    let (result, err) = env.completion().expect("workflow must have completed");
    assert!(err.is_none());
    let delivered: Vec<u8> = decode(&result.unwrap());
    assert_eq!(delivered, vec![1, 2, 3]);
}

fn detonate() {
    panic!("boom");
}

// A panicking workflow surfaces the payload through the environment's
// completion callback, with the coroutine trace attached.
#[test]
fn workflow_panic_reaches_completion() {
    let env = TestWorkflowEnvironment::new();
    let workflow = FnWorkflow(|_ctx: WorkflowContext, _input: Option<Payload>| async move {
        detonate();
        Ok(None)
    });
    let definition = start(&env, workflow);
    definition.on_decision_task_started();

    let (result, err) = env.completion().expect("completion with error");
    assert!(result.is_none());
    let err = err.unwrap();
    let text = err.to_string();
    assert!(text.contains("boom"), "got: {text}");
    assert!(text.contains("coroutine"), "got: {text}");
}

// A workflow error (as opposed to a panic) flows through the result slot.
#[test]
fn workflow_error_reaches_completion() {
    let env = TestWorkflowEnvironment::new();
    let workflow = FnWorkflow(|_ctx: WorkflowContext, _input: Option<Payload>| async move {
        Err(WorkflowError::message("bad input"))
    });
    let definition = start(&env, workflow);
    definition.on_decision_task_started();

    let (result, err) = env.completion().expect("completion with error");
    assert!(result.is_none());
    assert_eq!(err.unwrap().to_string(), "bad input");
}

// Queries: known handlers run, unknown types list what is known (including
// the built-ins), and a handler that touches workflow primitives gets the
// guidance message instead of the raw panic.
#[test]
fn query_dispatch_and_validation() {
    let env = TestWorkflowEnvironment::new();
    let workflow = FnWorkflow(|ctx: WorkflowContext, _input: Option<Payload>| async move {
        set_query_handler::<String, String, _>(&ctx, "echo", |arg| Ok(format!("echo:{arg}")))?;
        let trapped = ctx.clone();
        set_query_handler::<String, String, _>(&ctx, "misbehaving", move |_arg| {
            spawn(&trapped, |_ctx| async {});
            Ok("unreachable".to_string())
        })?;
        let channel = signal_channel(&ctx, "never");
        let _ = channel.receive::<i32>(&ctx).await;
        Ok(None)
    });
    let definition = start(&env, workflow);
    definition.on_decision_task_started();

    let reply = env.query("echo", &encode(&"hi".to_string())).unwrap();
    assert_eq!(decode::<String>(&reply.unwrap()), "echo:hi");

    let unknown = env.query("nope", b"").unwrap_err().to_string();
    assert!(unknown.contains("unknown query type nope"), "got: {unknown}");
    assert!(unknown.contains(QUERY_TYPE_STACK_TRACE), "got: {unknown}");
    assert!(unknown.contains("echo"), "got: {unknown}");

    let guidance = env
        .query("misbehaving", &encode(&"x".to_string()))
        .unwrap_err()
        .to_string();
    assert!(guidance.contains("query handler panic"), "got: {guidance}");
    assert!(
        guidance.contains("query handler must not use the workflow context"),
        "got: {guidance}"
    );
}

// Query registration validates the query type synchronously.
#[test]
fn query_registration_rejects_bad_types() {
    let env = TestWorkflowEnvironment::new();
    let env: Arc<dyn WorkflowEnvironment> = env;
    let ctx = WorkflowContext::new_root(env);
    let ok = |arg: String| Ok(arg);
    assert!(set_query_handler::<String, String, _>(&ctx, "", ok).is_err());
    assert!(set_query_handler::<String, String, _>(&ctx, "__stack_trace", ok).is_err());
    assert!(set_query_handler::<String, String, _>(&ctx, "status", ok).is_ok());
}

// Cancellation closes the done channel; the workflow observes it at its
// next receive and completes normally.
#[test]
fn cancel_unblocks_done_channel() {
    let env = TestWorkflowEnvironment::new();
    let workflow = FnWorkflow(|ctx: WorkflowContext, _input: Option<Payload>| async move {
        let done = done_channel(&ctx).expect("root context carries a cancel scope");
        let (_, more) = done.receive::<i32>(&ctx).await;
        assert!(!more);
        let payload = encode_arg(default_data_converter().as_ref(), &"cancelled".to_string())?;
        Ok(Some(payload))
    });
    let definition = start(&env, workflow);
    definition.on_decision_task_started();
    assert!(env.completion().is_none());

    env.cancel();
    env.cancel(); // idempotent
    definition.on_decision_task_started();

    let (result, err) = env.completion().expect("completed after cancel");
    assert!(err.is_none());
    assert_eq!(decode::<String>(&result.unwrap()), "cancelled");
}

// A corrupt signal payload is dropped and counted; the workflow keeps
// waiting and completes once a decodable payload arrives.
#[test]
fn corrupt_signal_is_dropped_and_receive_retries() {
    let env = TestWorkflowEnvironment::new();
    let workflow = FnWorkflow(|ctx: WorkflowContext, _input: Option<Payload>| async move {
        let channel = signal_channel(&ctx, "sig");
        let (value, _) = channel.receive::<i32>(&ctx).await;
        let payload = encode_arg(default_data_converter().as_ref(), &value.unwrap())?;
        Ok(Some(payload))
    });
    let definition = start(&env, workflow);
    definition.on_decision_task_started();

    env.signal("sig", b"junk that is not json".to_vec());
    definition.on_decision_task_started();
    assert!(env.completion().is_none(), "corrupt payload must not complete");
    assert_eq!(env.metrics.count(coflow::CORRUPTED_SIGNALS_COUNTER), 1);

    env.signal("sig", encode(&17));
    definition.on_decision_task_started();
    let (result, err) = env.completion().expect("completed after valid signal");
    assert!(err.is_none());
    assert_eq!(decode::<i32>(&result.unwrap()), 17);
}

// Signals nobody consumed are reported when the workflow completes.
#[test]
fn unhandled_signals_are_counted_on_completion() {
    let env = TestWorkflowEnvironment::new();
    let workflow = FnWorkflow(|_ctx: WorkflowContext, _input: Option<Payload>| async move {
        Ok(None)
    });
    let definition = start(&env, workflow);
    env.signal("ignored", encode(&1));
    definition.on_decision_task_started();

    assert!(env.completion().is_some());
    assert_eq!(env.metrics.count(UNHANDLED_SIGNALS_COUNTER), 1);
}

// The driver's stack trace names the blocked coroutine and its yield point.
#[test]
fn stack_trace_reports_blocked_coroutines() {
    let env = TestWorkflowEnvironment::new();
    let workflow = FnWorkflow(|ctx: WorkflowContext, _input: Option<Payload>| async move {
        let channel = signal_channel(&ctx, "wait");
        let _ = channel.receive::<i32>(&ctx).await;
        Ok(None)
    });
    let definition = start(&env, workflow);
    definition.on_decision_task_started();

    let trace = definition.stack_trace();
    assert!(trace.contains("blocked on"), "got: {trace}");
    definition.close();
}

struct Tagger {
    label: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl WorkflowInterceptorFactory for Tagger {
    fn new_interceptor(
        &self,
        _info: &WorkflowInfo,
        next: Arc<dyn WorkflowInterceptor>,
    ) -> Arc<dyn WorkflowInterceptor> {
        Arc::new(TaggerInterceptor {
            label: self.label,
            log: self.log.clone(),
            next,
        })
    }
}

struct TaggerInterceptor {
    label: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    next: Arc<dyn WorkflowInterceptor>,
}

#[async_trait]
impl WorkflowInterceptor for TaggerInterceptor {
    async fn execute_workflow(
        &self,
        ctx: WorkflowContext,
        input: Option<Payload>,
    ) -> Result<Option<Payload>, WorkflowError> {
        self.log.lock().push(format!("{} enter", self.label));
        let result = self.next.execute_workflow(ctx, input).await;
        self.log.lock().push(format!("{} exit", self.label));
        result
    }
}

// The first factory produces the outermost interceptor.
#[test]
fn interceptor_chain_wraps_outermost_first() {
    let env = TestWorkflowEnvironment::new();
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    env.interceptors.lock().push(Arc::new(Tagger {
        label: "outer",
        log: log.clone(),
    }));
    env.interceptors.lock().push(Arc::new(Tagger {
        label: "inner",
        log: log.clone(),
    }));

    let run_log = log.clone();
    let workflow = FnWorkflow(move |_ctx: WorkflowContext, _input: Option<Payload>| {
        let run_log = run_log.clone();
        async move {
            run_log.lock().push("workflow".to_string());
            Ok(None)
        }
    });
    let definition = start(&env, workflow);
    definition.on_decision_task_started();

    assert!(env.completion().is_some());
    assert_eq!(
        *log.lock(),
        vec!["outer enter", "inner enter", "workflow", "inner exit", "outer exit"]
    );
}

// Option resolution: defaults flow in from the environment, zero execution
// timeouts are rejected, zero task timeouts map to the engine default.
#[test]
fn options_validation() {
    let env = TestWorkflowEnvironment::new();
    let env: Arc<dyn WorkflowEnvironment> = env;
    let ctx = WorkflowContext::new_root(env);

    let options = validated_workflow_options(&ctx).unwrap();
    assert_eq!(options.domain.as_deref(), Some("test-domain"));
    assert_eq!(options.task_list_name.as_deref(), Some("test-tasklist"));

    let zero_exec = with_execution_start_to_close_timeout(&ctx, Duration::ZERO);
    assert!(validated_workflow_options(&zero_exec).is_err());

    let zero_task = with_workflow_task_start_to_close_timeout(&ctx, Duration::ZERO);
    let resolved = validated_workflow_options(&zero_task).unwrap();
    assert_eq!(
        resolved.task_start_to_close_timeout,
        Some(Duration::from_secs(10))
    );

    let bad_retry = with_retry_policy(
        &ctx,
        RetryPolicy {
            initial_interval: Duration::ZERO,
            backoff_coefficient: 2.0,
            ..RetryPolicy::default()
        },
    );
    assert!(validated_workflow_options(&bad_retry).is_err());

    let good_retry = with_retry_policy(
        &ctx,
        RetryPolicy {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(10),
            expiration_interval: Duration::from_secs(60),
            maximum_attempts: 3,
            non_retriable_error_reasons: Vec::new(),
        },
    );
    assert!(validated_workflow_options(&good_retry).is_ok());

    let bad_cron = with_cron_schedule(&ctx, "not a cron");
    assert!(validated_workflow_options(&bad_cron).is_err());
    let good_cron = with_cron_schedule(&ctx, "*/5 * * * *");
    assert!(validated_workflow_options(&good_cron).is_ok());
}

#[test]
fn cron_validation() {
    assert!(validate_cron_schedule("").is_ok());
    assert!(validate_cron_schedule("0 12 * * *").is_ok());
    assert!(validate_cron_schedule("definitely not cron").is_err());
}
