//! Fire-and-forget analytics fabric.
//!
//! Emitters never wait for, retry, or observe the outcome of a write; the
//! ingestor owns the rollup table and serializes per-conversation updates so
//! weighted averages never drift. The analytics store is an append-only
//! audit log — conversations may be deleted while their metrics remain.

pub mod db;
pub mod emitter;
pub mod error;
pub mod events;
pub mod ingest;
pub mod query;

pub use emitter::AnalyticsEmitter;
pub use error::AnalyticsError;
pub use events::{Activity, ApiCall, ConversationLifecycle, MessageMetric};
pub use ingest::AnalyticsManager;
