use serde::Deserialize;
use serde_json::Value;

use super::AgentOutcome;
use crate::errors::AgentError;

/// Events from Claude CLI's stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        num_turns: Option<u32>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        model: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// Folds stream-json lines into the attempt's outcome.
#[derive(Debug, Default)]
pub struct StreamCollector {
    text: String,
    result: Option<String>,
    is_error: bool,
    saw_result: bool,
    result_subtype: String,
    cost_usd: Option<f64>,
    num_turns: Option<u32>,
    duration_ms: Option<u64>,
    model: Option<String>,
    tool_uses: u32,
}

impl StreamCollector {
    pub fn ingest(&mut self, agent: &str, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        match serde_json::from_str::<StreamEvent>(line) {
            Ok(StreamEvent::Assistant { message }) => {
                for block in message.content {
                    match block {
                        ContentBlock::ToolUse { name, input } => {
                            self.tool_uses += 1;
                            tracing::debug!(agent, tool = %describe_tool_use(&name, &input));
                        }
                        ContentBlock::Text { text } => {
                            self.text.push_str(&text);
                            self.text.push('\n');
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            Ok(StreamEvent::Result {
                subtype,
                result,
                is_error,
                total_cost_usd,
                num_turns,
                duration_ms,
            }) => {
                self.saw_result = true;
                self.result_subtype = subtype;
                self.result = result;
                self.is_error = is_error;
                self.cost_usd = total_cost_usd;
                self.num_turns = num_turns;
                self.duration_ms = duration_ms;
            }
            Ok(StreamEvent::System { subtype, model }) => {
                if subtype == "init" && model.is_some() {
                    self.model = model;
                }
            }
            Ok(StreamEvent::User {}) => {}
            Err(_) => {
                // Not stream-json; keep it as plain output.
                self.text.push_str(line);
                self.text.push('\n');
            }
        }
    }

    /// Everything the agent said, preferring the final result text.
    pub fn output(&self) -> String {
        self.result.clone().unwrap_or_else(|| self.text.clone())
    }

    pub fn tool_uses(&self) -> u32 {
        self.tool_uses
    }

    /// Turn the collected stream plus the process exit into the attempt result.
    pub fn finish(
        self,
        exit_code: i32,
        stderr: &str,
        elapsed_ms: u64,
    ) -> Result<AgentOutcome, AgentError> {
        let output = self.output();

        if self.is_error {
            let message = if output.trim().is_empty() {
                format!("agent reported {}", self.result_subtype)
            } else {
                output
            };
            return Err(AgentError::Execution(message));
        }

        if exit_code != 0 {
            let detail = if stderr.trim().is_empty() {
                output.lines().last().unwrap_or_default().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(AgentError::NonZeroExit {
                exit_code,
                stderr: detail,
            });
        }

        if !self.saw_result {
            return Err(AgentError::Execution(
                "agent exited without a result event".to_string(),
            ));
        }

        Ok(AgentOutcome {
            output,
            duration_ms: self.duration_ms.unwrap_or(elapsed_ms),
            cost_usd: self.cost_usd,
            num_turns: self.num_turns,
            model: self.model,
        })
    }
}

/// Extract a human-readable description from a tool use event
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str());
    match name {
        "Read" => format!("Reading: {}", field("file_path").unwrap_or("file")),
        "Write" => format!("Creating: {}", field("file_path").unwrap_or("file")),
        "Edit" => format!("Editing: {}", field("file_path").unwrap_or("file")),
        "Bash" => format!(
            "Running: {}",
            truncate_str(field("command").unwrap_or("command"), 60)
        ),
        "Grep" | "Glob" => format!("Searching: {}", field("pattern").unwrap_or("*")),
        "Task" => format!("Agent: {}", field("description").unwrap_or("subagent")),
        _ => name.to_string(),
    }
}

fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
