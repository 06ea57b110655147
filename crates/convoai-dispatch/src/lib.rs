//! Per-turn tool dispatch — the MCP bridge.
//!
//! Phase 1 (discovery): probe every active tool server a user has
//! registered, aggregate advertised tools into a `ToolCatalog` the model can
//! call into. Phase 2 (invocation): route the model's chosen call back to
//! the owning server. Tool servers are untrusted; nothing they return may
//! abort the pipeline or mutate process state.

pub mod catalog;
pub mod dispatcher;
pub mod rpc;

pub use catalog::{ToolCatalog, ToolDescriptor};
pub use dispatcher::{HttpDispatcher, ToolDispatcher};
pub use rpc::{FailureKind, ToolFailure};
