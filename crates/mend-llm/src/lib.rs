//! LLM service contract, Anthropic adapter, and the conversation engine.
//!
//! The conversation engine is provider-agnostic: it speaks in terms of
//! [`ContentBlock`]s and a [`LlmService`] trait. Adapters own the wire
//! format and transient-error retries.

pub mod anthropic;
pub mod content;
pub mod conversation;
pub mod service;
pub mod tool;

pub use anthropic::AnthropicService;
pub use content::{ChatMessage, ContentBlock, Role, StopReason, Usage};
pub use conversation::{Conversation, ToolEvent, ToolEventSink};
pub use service::{LlmService, MockService, Request, Response, ToolChoice, ToolDescriptor};
pub use tool::{Tool, ToolContext, ToolRunner};
