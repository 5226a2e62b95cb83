//! Expose a whole agent as a tool.
//!
//! Executing the tool runs the wrapped agent on a fresh session, drains its
//! stream, and returns the final assistant text. The parent run's
//! cancellation token is propagated into the child run.

use crate::runtime::loop_runner::{Agent, RunInput};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use weft_contract::{
    AgentEvent, Role, Tool, ToolContext, ToolDescriptor, ToolError, ToolOutput,
};

pub struct AgentTool {
    agent: Arc<Agent>,
    name: String,
    description: String,
}

impl Agent {
    /// Wrap this agent as a `{prompt: string}` tool.
    pub fn as_tool(
        self: &Arc<Self>,
        name: Option<String>,
        description: Option<String>,
    ) -> Arc<dyn Tool> {
        let agent_name = self.name().to_string();
        Arc::new(AgentTool {
            agent: self.clone(),
            name: name.unwrap_or_else(|| agent_name.clone()),
            description: description
                .unwrap_or_else(|| format!("Run the '{agent_name}' agent on a prompt")),
        })
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(&self.name, &self.description)
            .with_parameters(serde_json::json!({
                "type": "object",
                "properties": {
                    "prompt": { "type": "string", "description": "Prompt for the agent" }
                }
            }))
            .with_required(["prompt"])
    }

    async fn execute(&self, input: &str, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: serde_json::Value = serde_json::from_str(input)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let prompt = args
            .get("prompt")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing 'prompt'".to_string()))?;

        let mut stream = self.agent.run(
            RunInput::new(prompt).with_cancellation(ctx.cancellation.clone()),
        );

        let mut last_content: Option<String> = None;
        while let Some(event) = stream.next().await {
            if let AgentEvent::Message { message } = event {
                if message.role == Role::Assistant && !message.content.is_empty() {
                    last_content = Some(message.content);
                }
            }
        }

        Ok(ToolOutput::success(
            last_content.unwrap_or_else(|| "(no response)".to_string()),
        ))
    }
}
