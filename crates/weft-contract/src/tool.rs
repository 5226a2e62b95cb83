//! Tool contract: a named, schema-described unit of side-effecting work the
//! turn loop can invoke.
//!
//! Parameter validation against the JSON Schema happens on the model side;
//! the loop hands tools the raw JSON input string exactly as accumulated
//! from the stream.

use crate::provider::ToolSchema;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Static description of a tool: name, human description, JSON-Schema
/// parameters object, and optional required field names.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub required: Option<Vec<String>>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
            required: None,
        }
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }

    pub fn with_required<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Snapshot into the schema shape advertised to providers.
    pub fn to_schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
            required: self.required.clone(),
        }
    }
}

/// What a tool returns.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
    pub metadata: Option<Value>,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            metadata: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Tool execution errors. The loop converts these into error outcomes; they
/// never abort a run.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Canceled")]
    Canceled,
}

/// Execution context handed to every tool call.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub agent_name: String,
    /// The run's internal cancellation token; tools are expected to honor it.
    pub cancellation: CancellationToken,
    pub working_dir: Option<PathBuf>,
    /// Identifier of the originating invocation.
    pub call_id: String,
}

/// A tool invocable by the turn loop.
///
/// `input` is the full raw JSON serialization of the arguments.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    async fn execute(&self, input: &str, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;
}

/// Strongly-typed variant of [`Tool`] with serde-deserialized arguments.
///
/// A blanket impl provides [`Tool`]; deserialization failures surface as
/// [`ToolError::InvalidArguments`].
#[async_trait]
pub trait TypedTool: Send + Sync {
    type Args: DeserializeOwned + Send;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-Schema parameters object advertised to the model.
    fn parameters(&self) -> Value;

    fn required(&self) -> Option<Vec<String>> {
        None
    }

    async fn run(&self, args: Self::Args, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;
}

#[async_trait]
impl<T: TypedTool> Tool for T {
    fn descriptor(&self) -> ToolDescriptor {
        let mut descriptor = ToolDescriptor::new(self.name(), self.description())
            .with_parameters(self.parameters());
        descriptor.required = self.required();
        descriptor
    }

    async fn execute(&self, input: &str, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: T::Args = serde_json::from_str(input)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        self.run(args, ctx).await
    }
}

/// Index tools by their descriptor name.
pub fn tool_map<I>(tools: I) -> HashMap<String, Arc<dyn Tool>>
where
    I: IntoIterator<Item = Arc<dyn Tool>>,
{
    tools
        .into_iter()
        .map(|t| (t.descriptor().name, t))
        .collect()
}
