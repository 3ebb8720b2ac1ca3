// src/runtime/invocable.rs
//! Uniform flow invocation
//!
//! Sync functions, async functions and class-style flows all end up behind
//! the [`Invocable`] trait. Class-style flows register a [`FlowFactory`]
//! whose `init` runs once per worker before the first job.

use crate::interception::{CallError, HookRegistry};
use crate::recording::recorder::{ActiveSpan, SpanRecorder, TokenUsage};
use crate::recording::span::{events, span_types, SpanStatus};
use crate::runtime::connections::{Connection, ConnectionError, ConnectionResolver};
use crate::runtime::job::FlowReference;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Failure raised by flow code
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FlowError {
    #[error("{kind}: {message}")]
    User { kind: String, message: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("flow {0} is not registered")]
    NotRegistered(String),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl FlowError {
    pub fn user(kind: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::User {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Error class reported in the envelope
    pub fn kind(&self) -> &str {
        match self {
            FlowError::User { kind, .. } => kind.as_str(),
            FlowError::InvalidInput(_) => "InvalidInput",
            FlowError::NotRegistered(_) => "FlowNotFound",
            FlowError::Call(_) => "CallFailed",
            FlowError::Connection(ConnectionError::NotFound(_)) => "ConnectionNotFound",
            FlowError::Connection(_) => "ConnectionError",
        }
    }

    pub fn message(&self) -> String {
        match self {
            FlowError::User { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type InvokeFuture<'a> = BoxFuture<'a, Result<Value, FlowError>>;

/// A flow entry point
pub trait Invocable: Send + Sync {
    fn invoke<'a>(&'a self, ctx: &'a LineContext, inputs: &'a Map<String, Value>) -> InvokeFuture<'a>;
}

/// Adapts a synchronous function
pub struct SyncFn<F>(F);

impl<F> SyncFn<F>
where
    F: Fn(&LineContext, &Map<String, Value>) -> Result<Value, FlowError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Invocable for SyncFn<F>
where
    F: Fn(&LineContext, &Map<String, Value>) -> Result<Value, FlowError> + Send + Sync,
{
    fn invoke<'a>(&'a self, ctx: &'a LineContext, inputs: &'a Map<String, Value>) -> InvokeFuture<'a> {
        let result = (self.0)(ctx, inputs);
        Box::pin(async move { result })
    }
}

/// Adapts an async function; the worker drives it to completion
pub struct AsyncFn(pub for<'a> fn(&'a LineContext, &'a Map<String, Value>) -> InvokeFuture<'a>);

impl Invocable for AsyncFn {
    fn invoke<'a>(&'a self, ctx: &'a LineContext, inputs: &'a Map<String, Value>) -> InvokeFuture<'a> {
        (self.0)(ctx, inputs)
    }
}

/// Constructor step of a class-style flow
pub trait FlowFactory: Send + Sync {
    fn init(
        &self,
        args: &Value,
        connections: &dyn ConnectionResolver,
    ) -> Result<Arc<dyn Invocable>, FlowError>;
}

#[derive(Clone)]
enum FlowEntry {
    Function(Arc<dyn Invocable>),
    Class(Arc<dyn FlowFactory>),
}

/// Flows known to a worker, by name
#[derive(Clone, Default)]
pub struct FlowRegistry {
    flows: HashMap<String, FlowEntry>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, flow: Arc<dyn Invocable>) {
        self.flows.insert(name.into(), FlowEntry::Function(flow));
    }

    pub fn register_class(&mut self, name: impl Into<String>, factory: Arc<dyn FlowFactory>) {
        self.flows.insert(name.into(), FlowEntry::Class(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flows.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.flows.keys().cloned().collect();
        names.sort();
        names
    }

    /// Produce the invocable for `flow`, running a class-style init
    pub fn instantiate(
        &self,
        flow: &FlowReference,
        connections: &dyn ConnectionResolver,
    ) -> Result<Arc<dyn Invocable>, FlowError> {
        match self.flows.get(&flow.name) {
            None => Err(FlowError::NotRegistered(flow.name.clone())),
            Some(FlowEntry::Function(invocable)) => Ok(invocable.clone()),
            Some(FlowEntry::Class(factory)) => {
                debug!("Initializing class-style flow {}", flow.name);
                let args = flow.init.clone().unwrap_or(Value::Object(Map::new()));
                factory.init(&args, connections)
            }
        }
    }
}

/// What a flow can reach while it runs one line
pub struct LineContext {
    recorder: SpanRecorder,
    root_span_id: String,
    connections: BTreeMap<String, Connection>,
    hooks: Arc<HookRegistry>,
}

impl LineContext {
    pub fn new(
        recorder: SpanRecorder,
        root_span_id: String,
        connections: BTreeMap<String, Connection>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            recorder,
            root_span_id,
            connections,
            hooks,
        }
    }

    /// Connection bound to a flow input
    pub fn connection(&self, input: &str) -> Result<&Connection, FlowError> {
        self.connections
            .get(input)
            .ok_or_else(|| FlowError::Connection(ConnectionError::NotFound(input.to_string())))
    }

    /// Open a span under the line's root
    pub fn start_span(&self, name: &str, span_type: &str) -> ActiveSpan {
        self.recorder
            .start_span(name, Some(&self.root_span_id), span_type)
    }

    /// Call a hook point inside its own span, accounting token usage
    pub async fn call(&self, hook: &str, request: &Value) -> Result<Value, FlowError> {
        let mut span = self.start_span(hook, span_types::LLM);
        span.record_payload(events::INPUTS, request);

        match self.hooks.call(hook, request).await {
            Ok(response) => {
                if let Some(usage) = TokenUsage::from_response(&response) {
                    self.recorder.add_token_usage(usage);
                    let mut attributes = Map::new();
                    usage.apply_to(&mut attributes);
                    for (key, value) in attributes {
                        span.set_attribute(key, value);
                    }
                }
                span.record_payload(events::OUTPUT, &response);
                span.end(SpanStatus::ok());
                Ok(response)
            }
            Err(e) => {
                span.end(SpanStatus::error(e.to_string()));
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interception::FnCall;
    use crate::runtime::connections::InMemoryConnections;
    use serde_json::json;

    fn context(hooks: HookRegistry) -> (SpanRecorder, LineContext) {
        let recorder = SpanRecorder::new(Map::new());
        let ctx = LineContext::new(recorder.clone(), "root".to_string(), BTreeMap::new(), Arc::new(hooks));
        (recorder, ctx)
    }

    fn double<'a>(_ctx: &'a LineContext, inputs: &'a Map<String, Value>) -> InvokeFuture<'a> {
        Box::pin(async move {
            let n = inputs
                .get("n")
                .and_then(Value::as_i64)
                .ok_or_else(|| FlowError::InvalidInput("n".to_string()))?;
            Ok::<_, FlowError>(json!(n * 2))
        })
    }

    struct Prefixer {
        prefix: String,
    }

    impl Invocable for Prefixer {
        fn invoke<'a>(&'a self, _ctx: &'a LineContext, inputs: &'a Map<String, Value>) -> InvokeFuture<'a> {
            let text = inputs.get("text").and_then(Value::as_str).unwrap_or_default();
            let output = json!(format!("{}{}", self.prefix, text));
            Box::pin(async move { Ok(output) })
        }
    }

    struct PrefixerFactory;

    impl FlowFactory for PrefixerFactory {
        fn init(&self, args: &Value, _connections: &dyn ConnectionResolver) -> Result<Arc<dyn Invocable>, FlowError> {
            let prefix = args
                .get("prefix")
                .and_then(Value::as_str)
                .ok_or_else(|| FlowError::InvalidInput("prefix".to_string()))?;
            Ok(Arc::new(Prefixer {
                prefix: prefix.to_string(),
            }))
        }
    }

    #[tokio::test]
    async fn test_sync_and_async_are_uniform() {
        let mut registry = FlowRegistry::new();
        registry.register(
            "len",
            Arc::new(SyncFn::new(|_, inputs| Ok(json!(inputs.len())))),
        );
        registry.register("double", Arc::new(AsyncFn(double)));

        let connections = InMemoryConnections::new();
        let (_recorder, ctx) = context(HookRegistry::new());
        let mut inputs = Map::new();
        inputs.insert("n".to_string(), json!(21));

        let len = registry.instantiate(&FlowReference::new("len"), &connections).unwrap();
        assert_eq!(len.invoke(&ctx, &inputs).await.unwrap(), json!(1));

        let double = registry.instantiate(&FlowReference::new("double"), &connections).unwrap();
        assert_eq!(double.invoke(&ctx, &inputs).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_class_style_init() {
        let mut registry = FlowRegistry::new();
        registry.register_class("prefix", Arc::new(PrefixerFactory));
        let connections = InMemoryConnections::new();

        let flow = FlowReference::new("prefix").with_init(json!({"prefix": ">> "}));
        let invocable = registry.instantiate(&flow, &connections).unwrap();

        let (_recorder, ctx) = context(HookRegistry::new());
        let mut inputs = Map::new();
        inputs.insert("text".to_string(), json!("hi"));
        assert_eq!(invocable.invoke(&ctx, &inputs).await.unwrap(), json!(">> hi"));

        let missing_args = registry.instantiate(&FlowReference::new("prefix"), &connections);
        assert!(matches!(missing_args, Err(FlowError::InvalidInput(_))));
    }

    #[test]
    fn test_unregistered_flow() {
        let registry = FlowRegistry::new();
        let err = registry
            .instantiate(&FlowReference::new("nope"), &InMemoryConnections::new())
            .err()
            .unwrap();
        assert_eq!(err.kind(), "FlowNotFound");
    }

    #[tokio::test]
    async fn test_call_records_llm_span_and_tokens() {
        let mut hooks = HookRegistry::new();
        hooks.register(
            "llm.chat",
            Arc::new(FnCall::new(|_| {
                Ok(json!({"content": "ok", "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}}))
            })),
        );
        let (recorder, ctx) = context(hooks);

        ctx.call("llm.chat", &json!({"prompt": "hi"})).await.unwrap();

        let spans = recorder.take_finished();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].parent_id.as_deref(), Some("root"));
        assert_eq!(spans[0].events.len(), 2);
        assert_eq!(recorder.token_usage().total, 7);
    }

    #[tokio::test]
    async fn test_failed_call_is_error_span() {
        let (recorder, ctx) = context(HookRegistry::new());
        let err = ctx.call("llm.chat", &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "CallFailed");

        let spans = recorder.take_finished();
        assert_eq!(spans[0].status.code, crate::recording::span::StatusCode::Error);
    }

    #[test]
    fn test_unbound_connection() {
        let (_recorder, ctx) = context(HookRegistry::new());
        assert_eq!(ctx.connection("conn").unwrap_err().kind(), "ConnectionNotFound");
    }
}
