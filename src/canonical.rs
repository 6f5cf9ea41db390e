//! Canonical (provider-agnostic) request and response types.
//!
//! The wire shape follows the OpenAI chat completion format so the boundary
//! layer can deserialize client payloads directly into these types.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize};

use crate::adapter::Feature;

/// Chat completion request in the gateway's canonical shape.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CanonicalRequest {
    /// Caller-facing alias, resolved by the router.
    #[serde(rename = "model")]
    pub model_alias: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_settings: Option<Vec<SafetySetting>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: MessageContent::Text(content.into()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Assistant messages carrying only tool calls send `"content": null`.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Message content: plain text or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn has_image(&self) -> bool {
        matches!(self, MessageContent::Parts(parts)
            if parts.iter().any(|p| matches!(p, ContentPart::ImageUrl { .. })))
    }
}

/// One part of a multi-part message.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionSpec>,
}

impl ToolSpec {
    /// Tool kinds that ask the provider to ground answers in search results.
    const GROUNDING_KINDS: &'static [&'static str] = &["google_search", "retrieval"];

    pub fn function(name: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            kind: "function".to_string(),
            function: Some(FunctionSpec {
                name: name.into(),
                description: None,
                parameters: Some(parameters),
            }),
        }
    }

    pub fn is_grounding(&self) -> bool {
        Self::GROUNDING_KINDS.contains(&self.kind.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// How the model should choose between tools.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(ToolChoiceMode),
    Named(NamedToolChoice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoiceMode {
    None,
    Auto,
    Required,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NamedToolChoice {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolChoiceFunction,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolChoiceFunction {
    pub name: String,
}

/// A tool call emitted by the model.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "default_tool_call_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn default_tool_call_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments.
    #[serde(default)]
    pub arguments: String,
}

/// Requested output format.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: ResponseFormatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    /// When set, a non-conforming structured output fails the dispatch.
    #[serde(default)]
    pub enforce_validation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormatKind {
    Text,
    JsonObject,
    JsonSchema,
}

/// Provider safety filter threshold for one harm category.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

/// Stop sequence can be a string or array of strings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StopSequence {
    Single(String),
    Multiple(Vec<String>),
}

impl CanonicalRequest {
    pub fn new(model_alias: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model_alias: model_alias.into(),
            messages,
            ..Default::default()
        }
    }

    /// Features an adapter must declare to serve this request.
    pub fn required_features(&self) -> BTreeSet<Feature> {
        let mut features = BTreeSet::new();

        let tools = self.tools.as_deref().unwrap_or_default();
        if tools.iter().any(|t| !t.is_grounding()) || self.tool_choice.is_some() {
            features.insert(Feature::Tools);
        }
        if tools.iter().any(ToolSpec::is_grounding) {
            features.insert(Feature::Grounding);
        }
        if self.messages.iter().any(|m| m.content.has_image()) {
            features.insert(Feature::Vision);
        }
        if self.stream {
            features.insert(Feature::Streaming);
        }
        if matches!(
            &self.response_format,
            Some(ResponseFormat {
                kind: ResponseFormatKind::JsonSchema,
                ..
            })
        ) {
            features.insert(Feature::JsonSchema);
        }
        if self
            .safety_settings
            .as_ref()
            .is_some_and(|s| !s.is_empty())
        {
            features.insert(Feature::SafetySettings);
        }

        features
    }

    /// The schema to enforce, if the caller asked for enforcement.
    pub fn enforced_schema(&self) -> Option<&serde_json::Value> {
        self.response_format
            .as_ref()
            .filter(|f| f.enforce_validation)
            .and_then(|f| f.schema.as_ref())
    }
}

/// Chat completion response in the gateway's canonical shape.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CanonicalResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
    /// Provider-specific metadata that has no canonical field.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hidden_params: BTreeMap<String, serde_json::Value>,
}

/// A completion choice.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: Message,
    pub finish_reason: Option<String>,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

impl CanonicalResponse {
    /// The structured-output payload of the first choice.
    ///
    /// Uses the first tool call's arguments when present, otherwise the
    /// message content parsed as JSON. Returns `None` when neither parses.
    pub fn structured_payload(&self) -> Option<serde_json::Value> {
        let message = &self.choices.first()?.message;
        if let Some(call) = message.tool_calls.as_ref().and_then(|c| c.first()) {
            return serde_json::from_str(&call.function.arguments).ok();
        }
        serde_json::from_str(message.content.text().trim()).ok()
    }
}

/// One increment of a streaming response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CanonicalResponseChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    /// Usage, typically only on the final chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// A streaming choice delta.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Delta content in streaming response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Folds streamed chunks back into a complete response.
#[derive(Debug, Default)]
pub struct ChunkAggregator {
    id: String,
    model: String,
    choices: BTreeMap<u32, (String, String, Option<String>)>,
    usage: Usage,
}

impl ChunkAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &CanonicalResponseChunk) {
        if self.id.is_empty() {
            self.id = chunk.id.clone();
        }
        if self.model.is_empty() {
            self.model = chunk.model.clone();
        }
        for choice in &chunk.choices {
            let slot = self
                .choices
                .entry(choice.index)
                .or_insert_with(|| ("assistant".to_string(), String::new(), None));
            if let Some(role) = &choice.delta.role {
                slot.0 = role.clone();
            }
            if let Some(content) = &choice.delta.content {
                slot.1.push_str(content);
            }
            if choice.finish_reason.is_some() {
                slot.2 = choice.finish_reason.clone();
            }
        }
        if let Some(usage) = chunk.usage {
            self.usage = usage;
        }
    }

    pub fn finish(self) -> CanonicalResponse {
        CanonicalResponse {
            id: self.id,
            model: self.model,
            choices: self
                .choices
                .into_iter()
                .map(|(index, (role, content, finish_reason))| Choice {
                    index,
                    message: Message::new(role, content),
                    finish_reason,
                })
                .collect(),
            usage: self.usage,
            hidden_params: BTreeMap::new(),
        }
    }
}
