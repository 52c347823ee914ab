//! Tool descriptor: name, schema, and a runner function value.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use futures::Future;
use mend_core::Result;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::content::ContentBlock;
use crate::conversation::Conversation;
use crate::service::ToolDescriptor;

/// Context handed to a tool runner for one invocation.
#[derive(Clone)]
pub struct ToolContext {
    /// Working directory for any processes the tool spawns. Tools never
    /// trust caller-supplied paths for their own files.
    pub working_dir: PathBuf,
    /// Cancelled when this tool use, the turn, or the process shuts down.
    pub cancel: CancellationToken,
    /// The enclosing conversation, for tools that spawn sub-conversations.
    pub convo: Option<Arc<Conversation>>,
}

impl ToolContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            cancel: CancellationToken::new(),
            convo: None,
        }
    }
}

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Vec<ContentBlock>>> + Send>>;
pub type ToolRunner = Arc<dyn Fn(ToolContext, Value) -> ToolFuture + Send + Sync>;

/// A tool the model may invoke: a name, a human description, a JSON
/// schema for its input, and a runner.
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub runner: ToolRunner,
}

impl Tool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        runner: F,
    ) -> Self
    where
        F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ContentBlock>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            runner: Arc::new(move |ctx, input| Box::pin(runner(ctx, input))),
        }
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.name).finish()
    }
}
