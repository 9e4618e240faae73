use serde::Deserialize;
use serde_json::Value;

/// One line of a host transcript. Only `user` and `assistant` lines become
/// turns; everything else (`progress`, `file-history-snapshot`, queue
/// bookkeeping, ...) is skipped by the parser.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "kebab-case")]
pub(crate) enum TranscriptRecord {
    User(MessageRecord),
    Assistant(MessageRecord),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessageRecord {
    pub message: Message,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub is_sidechain: bool,
    #[serde(default)]
    pub is_meta: bool,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct Message {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Content,
}

/// `message.content` is either a bare string or an array of typed blocks.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub(crate) enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
    Other(Value),
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ContentBlock {
    Text { text: String },
    ToolUse { name: String, #[serde(default)] input: Value },
    ToolResult { #[serde(default)] content: Value },
    Thinking { #[serde(default)] thinking: String },
    #[serde(other)]
    Unknown,
}

impl Content {
    /// Concatenate every text-typed block; bare strings pass through.
    pub fn flattened_text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Blocks(blocks) => {
                let mut parts = Vec::new();
                for block in blocks {
                    if let ContentBlock::Text { text } = block {
                        parts.push(text.as_str());
                    }
                }
                parts.join("\n")
            }
            Content::Other(_) => String::new(),
        }
    }

    /// First tool invocation in the content, if any.
    pub fn first_tool_input(&self) -> Option<Value> {
        match self {
            Content::Blocks(blocks) => blocks.iter().find_map(|block| match block {
                ContentBlock::ToolUse { name, input } => Some(serde_json::json!({
                    "tool": name,
                    "input": input,
                })),
                _ => None,
            }),
            _ => None,
        }
    }
}
