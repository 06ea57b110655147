//! The model completion loop.
//!
//! One turn: append the user message, build this turn's tool catalog,
//! invoke the model, execute any tool it elects through the dispatcher,
//! re-invoke until a terminal assistant message appears, persist it, and
//! emit accounting — in that order, so nothing is ever streamed before it
//! is durable.

pub mod openai;
pub mod provider;
pub mod turn;

pub use openai::OpenAiProvider;
pub use provider::{ChatProvider, ChatRequest, Completion, ProviderError};
pub use turn::{ModelPipeline, TurnError};
