//! Accumulates provider stream events into the assistant message of one turn.

use crate::logging;
use crate::message::{
    ABORTED_RESULT, Message, MessageError, Part, StreamEvent, ToolInvocation, ToolMeta, Usage,
    now_ms,
};
use crate::provider::ModelInfo;

pub struct Turn {
    message: Message,
    /// Text part receiving deltas in the current step
    text_part: Option<usize>,
}

impl Turn {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            text_part: None,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    /// Open a new model step; later text deltas go into a fresh text part
    pub fn start_step(&mut self) -> usize {
        self.text_part = None;
        self.message.parts.push(Part::StepStart);
        self.message.parts.len() - 1
    }

    /// Apply one stream event. Returns the index of the part it changed.
    pub fn apply(&mut self, event: &StreamEvent) -> Option<usize> {
        match event {
            StreamEvent::TextDelta(delta) => {
                if let Some(index) = self.text_part {
                    if let Some(Part::Text { text }) = self.message.parts.get_mut(index) {
                        text.push_str(delta);
                        return Some(index);
                    }
                }
                self.message.parts.push(Part::text(delta.clone()));
                let index = self.message.parts.len() - 1;
                self.text_part = Some(index);
                Some(index)
            }
            StreamEvent::ToolCallStreamingStart {
                tool_call_id,
                tool_name,
            } => {
                if let Some(index) = self.find_tool(tool_call_id) {
                    return Some(index);
                }
                self.message.parts.push(Part::ToolInvocation {
                    tool_invocation: ToolInvocation::PartialCall {
                        tool_call_id: tool_call_id.clone(),
                        tool_name: tool_name.clone(),
                        args: serde_json::Value::Null,
                    },
                });
                Some(self.message.parts.len() - 1)
            }
            StreamEvent::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } => {
                let call = ToolInvocation::Call {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    args: args.clone(),
                };
                match self.find_tool(tool_call_id) {
                    Some(index) => {
                        self.message.parts[index] = Part::ToolInvocation {
                            tool_invocation: call,
                        };
                        Some(index)
                    }
                    None => {
                        self.message.parts.push(Part::ToolInvocation {
                            tool_invocation: call,
                        });
                        Some(self.message.parts.len() - 1)
                    }
                }
            }
            StreamEvent::ToolResult {
                tool_call_id,
                result,
            } => {
                let Some(index) = self.find_tool(tool_call_id) else {
                    logging::warn(&format!(
                        "tool result for unknown call {} dropped",
                        tool_call_id
                    ));
                    return None;
                };
                if let Part::ToolInvocation { tool_invocation } = &mut self.message.parts[index] {
                    *tool_invocation = tool_invocation.with_result(result.clone());
                }
                Some(index)
            }
            StreamEvent::StepFinish { .. } => None,
        }
    }

    pub fn record_tool(&mut self, tool_call_id: &str, meta: ToolMeta) {
        self.message
            .metadata
            .tool
            .insert(tool_call_id.to_string(), meta);
    }

    /// Cost accumulates across steps; tokens reflect the latest step
    pub fn add_usage(&mut self, info: &ModelInfo, usage: &Usage) {
        if let Some(assistant) = self.message.metadata.assistant.as_mut() {
            assistant.cost += info.cost_of(usage);
            assistant.tokens.input = usage.input_tokens;
            assistant.tokens.output = usage.output_tokens;
            assistant.tokens.reasoning = usage.reasoning_tokens;
        }
    }

    pub fn set_error(&mut self, error: MessageError) {
        if let Some(assistant) = self.message.metadata.assistant.as_mut() {
            assistant.error = Some(error);
        }
    }

    /// Resolve every unfinished tool invocation and stamp completion. Safe to call
    /// more than once.
    pub fn finalize(&mut self) {
        for part in &mut self.message.parts {
            if let Part::ToolInvocation { tool_invocation } = part {
                if !tool_invocation.is_result() {
                    *tool_invocation = tool_invocation.with_result(ABORTED_RESULT);
                }
            }
        }
        if self.message.metadata.time.completed.is_none() {
            self.message.metadata.time.completed = Some(now_ms());
        }
    }

    fn find_tool(&self, tool_call_id: &str) -> Option<usize> {
        self.message.parts.iter().position(|part| {
            part.tool_invocation()
                .map(|invocation| invocation.tool_call_id() == tool_call_id)
                .unwrap_or(false)
        })
    }
}
