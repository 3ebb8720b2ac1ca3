// src/runtime/flows.rs
//! Built-in flows
//!
//! The `flowrun` binary ships with a handful of flows so batches can be run
//! and the failure paths exercised without any user code:
//!
//! | name    | behaviour                                              |
//! |---------|--------------------------------------------------------|
//! | `echo`  | returns its inputs                                     |
//! | `greet` | class-style; greeting set at init, optional connection |
//! | `chat`  | calls the `llm.chat` hook                              |
//! | `sleep` | async; sleeps `seconds` then returns                   |
//! | `fail`  | returns a user error                                   |
//! | `panic` | panics inside the flow                                 |
//! | `crash` | aborts the worker process when `crash` is true         |

use crate::interception::{CallError, FnCall, HookConfig, HookRegistry};
use crate::recording::span::{span_types, SpanStatus};
use crate::runtime::connections::{ConnectionResolver, ConnectionSource};
use crate::runtime::invocable::{
    AsyncFn, FlowError, FlowFactory, FlowRegistry, Invocable, InvokeFuture, LineContext, SyncFn,
};
use crate::runtime::worker::WorkerEnvironment;
use crate::utils::errors::{EngineError, Result};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Hook point used by the `chat` flow
pub const CHAT_HOOK: &str = "llm.chat";

/// Every built-in flow
pub fn builtin_flows() -> FlowRegistry {
    let mut flows = FlowRegistry::new();
    flows.register("echo", Arc::new(SyncFn::new(|_ctx, inputs| Ok(Value::Object(inputs.clone())))));
    flows.register_class("greet", Arc::new(GreeterFactory));
    flows.register("chat", Arc::new(AsyncFn(chat)));
    flows.register("sleep", Arc::new(AsyncFn(sleep)));
    flows.register(
        "fail",
        Arc::new(SyncFn::new(|_ctx, inputs| {
            let message = inputs
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("line failed");
            Err(FlowError::user("ValueError", message))
        })),
    );
    flows.register(
        "panic",
        Arc::new(SyncFn::new(|_ctx, inputs| {
            let message = inputs
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("flow panicked");
            panic!("{}", message)
        })),
    );
    flows.register(
        "crash",
        Arc::new(SyncFn::new(|_ctx, inputs| {
            if inputs.get("crash").and_then(Value::as_bool).unwrap_or(false) {
                std::process::abort();
            }
            Ok(Value::Object(inputs.clone()))
        })),
    );
    flows
}

/// Hooks with their real implementations registered
pub fn builtin_hooks() -> HookRegistry {
    let mut hooks = HookRegistry::new();
    hooks.register(CHAT_HOOK, Arc::new(FnCall::new(local_chat_model)));
    hooks
}

/// Worker environment for the built-in flows
///
/// Hook substitution is applied here, so both launch strategies run with
/// the same hooks.
pub fn builtin_environment(
    hooks: &HookConfig,
    connections: &ConnectionSource,
    collection: &str,
) -> Result<WorkerEnvironment> {
    let mut registry = builtin_hooks();
    registry.apply(hooks)?;

    let resolver = connections
        .resolver()
        .map_err(|e| EngineError::ConfigError(e.to_string()))?;

    Ok(WorkerEnvironment {
        flows: builtin_flows(),
        connections: resolver,
        hooks: Arc::new(registry),
        collection: collection.to_string(),
    })
}

/// Stand-in model: echoes the prompt back and reports word counts as usage
fn local_chat_model(request: &Value) -> std::result::Result<Value, CallError> {
    let prompt = request
        .get("prompt")
        .and_then(Value::as_str)
        .ok_or_else(|| CallError::Failed("request has no prompt".to_string()))?;

    let prompt_tokens = prompt.split_whitespace().count() as u64;
    let completion_tokens = prompt_tokens + 1;
    Ok(json!({
        "content": format!("echo: {}", prompt),
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        }
    }))
}

fn chat<'a>(ctx: &'a LineContext, inputs: &'a Map<String, Value>) -> InvokeFuture<'a> {
    Box::pin(async move {
        let prompt = inputs
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| FlowError::InvalidInput("missing string input `prompt`".to_string()))?;

        let response = ctx.call(CHAT_HOOK, &json!({ "prompt": prompt })).await?;
        Ok::<_, FlowError>(response.get("content").cloned().unwrap_or(Value::Null))
    })
}

fn sleep<'a>(_ctx: &'a LineContext, inputs: &'a Map<String, Value>) -> InvokeFuture<'a> {
    Box::pin(async move {
        let seconds = inputs.get("seconds").and_then(Value::as_f64).unwrap_or(1.0);
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(FlowError::InvalidInput(format!("invalid seconds: {}", seconds)));
        }
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        Ok(json!({ "slept": seconds }))
    })
}

struct GreeterFactory;

impl FlowFactory for GreeterFactory {
    fn init(
        &self,
        args: &Value,
        _connections: &dyn ConnectionResolver,
    ) -> std::result::Result<Arc<dyn Invocable>, FlowError> {
        let greeting = match args.get("greeting") {
            None => "Hello".to_string(),
            Some(Value::String(greeting)) => greeting.clone(),
            Some(other) => {
                return Err(FlowError::InvalidInput(format!(
                    "greeting must be a string, got {}",
                    other
                )))
            }
        };
        Ok(Arc::new(Greeter { greeting }))
    }
}

struct Greeter {
    greeting: String,
}

impl Invocable for Greeter {
    fn invoke<'a>(&'a self, ctx: &'a LineContext, inputs: &'a Map<String, Value>) -> InvokeFuture<'a> {
        let result = self.greet(ctx, inputs);
        Box::pin(async move { result })
    }
}

impl Greeter {
    fn greet(&self, ctx: &LineContext, inputs: &Map<String, Value>) -> std::result::Result<Value, FlowError> {
        let name = inputs
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| FlowError::InvalidInput("missing string input `name`".to_string()))?;

        let mut span = ctx.start_span("format_greeting", span_types::FUNCTION);
        // A bound `signature` connection appends its text
        let text = match inputs.get("signature") {
            Some(_) => {
                let connection = ctx.connection("signature")?;
                let signature = connection.config_str("text").unwrap_or(connection.name.as_str());
                format!("{}, {}! -- {}", self.greeting, name, signature)
            }
            None => format!("{}, {}!", self.greeting, name),
        };
        span.set_attribute("greeting", self.greeting.clone());
        span.end(SpanStatus::ok());

        Ok(json!(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interception::HookMode;
    use crate::runtime::connections::Connection;
    use crate::runtime::job::{FlowReference, Job, LineStatus};
    use crate::runtime::worker::WorkerRuntime;

    fn runtime(connections: ConnectionSource) -> WorkerRuntime {
        let env = builtin_environment(&HookConfig::default(), &connections, "tests").unwrap();
        WorkerRuntime::new(Arc::new(env), 0)
    }

    fn job(flow: FlowReference, inputs: Value) -> Job {
        let Value::Object(inputs) = inputs else {
            panic!("inputs must be an object");
        };
        Job::new("run", 0, flow, inputs)
    }

    #[test]
    fn test_builtin_names() {
        let names = builtin_flows().names();
        for name in ["chat", "crash", "echo", "fail", "greet", "panic", "sleep"] {
            assert!(names.contains(&name.to_string()), "missing {}", name);
        }
    }

    #[tokio::test]
    async fn test_chat_records_token_usage() {
        let mut runtime = runtime(ConnectionSource::None);
        let envelope = runtime
            .execute(job(FlowReference::new("chat"), json!({"prompt": "two words"})))
            .await;

        assert_eq!(envelope.status, LineStatus::Success);
        assert_eq!(envelope.output, Some(json!("echo: two words")));
        // LLM span plus root
        assert_eq!(envelope.spans.len(), 2);
        let root = envelope.spans.last().unwrap();
        assert_eq!(
            root.attribute("__computed__.cumulative_token_count.total"),
            Some(&json!(5))
        );
    }

    #[tokio::test]
    async fn test_greet_with_init_and_connection() {
        let connections = ConnectionSource::Inline {
            connections: vec![Connection::new("team", "custom").with_config("text", "the team")],
        };
        let mut runtime = runtime(connections);

        let flow = FlowReference::new("greet").with_init(json!({"greeting": "Hi"}));
        let mut job = job(flow, json!({"name": "Ada", "signature": true}));
        job.connection_bindings
            .insert("signature".to_string(), "team".to_string());

        let envelope = runtime.execute(job).await;
        assert_eq!(envelope.status, LineStatus::Success);
        assert_eq!(envelope.output, Some(json!("Hi, Ada! -- the team")));
    }

    #[tokio::test]
    async fn test_greet_rejects_bad_init() {
        let mut runtime = runtime(ConnectionSource::None);
        let flow = FlowReference::new("greet").with_init(json!({"greeting": 3}));
        let envelope = runtime.execute(job(flow, json!({"name": "Ada"}))).await;

        assert_eq!(envelope.status, LineStatus::UserError);
        assert_eq!(envelope.error.unwrap().kind, "InvalidInput");
    }

    #[tokio::test]
    async fn test_fail_and_panic_are_user_errors() {
        let mut runtime = runtime(ConnectionSource::None);

        let failed = runtime
            .execute(job(FlowReference::new("fail"), json!({"message": "bad row"})))
            .await;
        assert_eq!(failed.status, LineStatus::UserError);
        assert_eq!(failed.error.unwrap().kind, "ValueError");

        let panicked = runtime
            .execute(job(FlowReference::new("panic"), json!({"message": "boom"})))
            .await;
        assert_eq!(panicked.status, LineStatus::UserError);
        let error = panicked.error.unwrap();
        assert_eq!(error.kind, "Panic");
        assert_eq!(error.message, "boom");
    }

    #[tokio::test]
    async fn test_sleep_flow() {
        let mut runtime = runtime(ConnectionSource::None);
        let envelope = runtime
            .execute(job(FlowReference::new("sleep"), json!({"seconds": 0.01})))
            .await;
        assert_eq!(envelope.status, LineStatus::Success);
        assert_eq!(envelope.output, Some(json!({"slept": 0.01})));
    }

    #[test]
    fn test_replay_mode_requires_recording() {
        let hooks = HookConfig {
            mode: HookMode::Replay,
            recording_path: None,
        };
        let result = builtin_environment(&hooks, &ConnectionSource::None, "tests");
        assert!(result.is_err());
    }
}
