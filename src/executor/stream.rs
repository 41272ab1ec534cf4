//! Decoding the agent's stdout when line streaming is requested: JSON event
//! lines interleaved with free text.

use serde::Deserialize;
use serde_json::Value;

/// One decoded line of agent stdout, when `stream` is requested. Unlike the
/// narrower event set a single-purpose CLI wrapper might assume, this widens
/// to the full shape an agent's line-oriented event protocol can produce;
/// the executor only acts on `Assistant` and `Result`, and falls back to
/// treating anything else — including a non-JSON line — as literal output.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

/// Decode one line of streamed stdout. Returns `None` for a line that isn't
/// valid JSON — the caller treats it as a literal output line instead.
pub fn decode_line(line: &str) -> Option<AgentEvent> {
    serde_json::from_str(line).ok()
}
