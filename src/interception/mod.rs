// src/interception/mod.rs
//! Outbound-call interception
//!
//! Flows reach external capabilities (model endpoints, tools) through named
//! hook points. A run can leave them live, record every response, or replay
//! a previous recording without touching the network.
//!
//! ```text
//! Flow → LineContext::call("llm.chat") → HookRegistry
//!                                          ├─ Live   → real call
//!                                          ├─ Record → real call → RecordingStore (append)
//!                                          └─ Replay → RecordingStore (lookup)
//! ```

pub mod hook_registry;
pub mod recording_store;

pub use hook_registry::{
    CallError, CallFuture, FnCall, HookConfig, HookMode, HookRegistry, OutboundCall,
};
pub use recording_store::{call_key, RecordingCall, RecordingStore, ReplayCall};
