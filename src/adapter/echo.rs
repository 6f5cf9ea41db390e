//! No-op adapter that echoes the last message back.
//!
//! Useful for smoke-testing a configuration end to end without calling a
//! real provider.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{Capabilities, ChunkStream, InvokeContext, ProviderAdapter};
use crate::canonical::{
    CanonicalRequest, CanonicalResponse, CanonicalResponseChunk, Choice, ChunkChoice, Delta,
    Message, Usage,
};
use crate::error::ProviderError;

/// Echo adapter.
#[derive(Debug, Clone)]
pub struct EchoAdapter {
    provider_id: String,
    capabilities: Capabilities,
    delay: Option<Duration>,
}

impl EchoAdapter {
    /// Echo adapter declaring every capability.
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            capabilities: Capabilities::all(),
            delay: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Sleep before answering (simulates a slow provider).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn echoed(request: &CanonicalRequest) -> Message {
        let content = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Message {
            role: "assistant".to_string(),
            content,
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Rough whitespace token count, good enough for usage bookkeeping.
fn word_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

#[async_trait]
impl ProviderAdapter for EchoAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn invoke(
        &self,
        request: &CanonicalRequest,
        ctx: InvokeContext<'_>,
    ) -> Result<CanonicalResponse, ProviderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let message = Self::echoed(request);
        let prompt_tokens = request
            .messages
            .iter()
            .map(|m| word_count(&m.content.text()))
            .sum();
        let completion_tokens = word_count(&message.content.text());

        let mut response = CanonicalResponse {
            id: format!("echo-{}", uuid::Uuid::new_v4()),
            model: ctx.target_model.to_string(),
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason: Some("stop".to_string()),
            }],
            usage: Usage {
                prompt_tokens,
                completion_tokens,
            },
            ..Default::default()
        };
        response
            .hidden_params
            .insert("echo_provider".to_string(), self.provider_id.clone().into());
        Ok(response)
    }

    async fn invoke_stream(
        &self,
        request: &CanonicalRequest,
        ctx: InvokeContext<'_>,
    ) -> Result<ChunkStream, ProviderError> {
        let text = Self::echoed(request).content.text();
        let model = ctx.target_model.to_string();
        let delay = self.delay;
        let (tx, rx) = mpsc::channel(4);

        // Producer stops as soon as the consumer drops the stream
        tokio::spawn(async move {
            let id = format!("echo-{}", uuid::Uuid::new_v4());
            let words: Vec<&str> = text.split_inclusive(' ').collect();
            let total = words.len();
            for (i, word) in words.into_iter().enumerate() {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let chunk = CanonicalResponseChunk {
                    id: id.clone(),
                    model: model.clone(),
                    choices: vec![ChunkChoice {
                        index: 0,
                        delta: Delta {
                            role: (i == 0).then(|| "assistant".to_string()),
                            content: Some(word.to_string()),
                        },
                        finish_reason: (i + 1 == total).then(|| "stop".to_string()),
                    }],
                    usage: None,
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    tracing::debug!("Echo stream consumer went away");
                    return;
                }
            }
            let _ = tx
                .send(Ok(CanonicalResponseChunk {
                    id,
                    model,
                    choices: vec![],
                    usage: Some(Usage {
                        prompt_tokens: 0,
                        completion_tokens: total as u32,
                    }),
                }))
                .await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::ChunkAggregator;
    use crate::credentials::{ApiKey, AuthContext, CredentialRef};
    use crate::registry::ModelEntry;
    use futures::StreamExt;

    fn entry() -> ModelEntry {
        ModelEntry::new(
            "echo-model",
            "echo",
            "echo-1",
            CredentialRef::Inline(ApiKey::from("unused")),
        )
    }

    #[tokio::test]
    async fn test_invoke_echoes_last_message() {
        let adapter = EchoAdapter::new("echo");
        let entry = entry();
        let auth = AuthContext::ApiKey(ApiKey::from("unused"));
        let request = CanonicalRequest::new(
            "echo-model",
            vec![Message::user("first"), Message::user("say this back")],
        );

        let response = adapter
            .invoke(
                &request,
                InvokeContext {
                    entry: &entry,
                    target_model: "echo-1",
                    auth: &auth,
                },
            )
            .await
            .unwrap();

        assert_eq!(response.model, "echo-1");
        assert_eq!(response.choices[0].message.content.text(), "say this back");
        assert_eq!(response.usage.completion_tokens, 3);
    }

    #[tokio::test]
    async fn test_stream_reassembles_to_same_text() {
        let adapter = EchoAdapter::new("echo");
        let entry = entry();
        let auth = AuthContext::ApiKey(ApiKey::from("unused"));
        let request = CanonicalRequest::new("echo-model", vec![Message::user("one two three")]);

        let mut stream = adapter
            .invoke_stream(
                &request,
                InvokeContext {
                    entry: &entry,
                    target_model: "echo-1",
                    auth: &auth,
                },
            )
            .await
            .unwrap();

        let mut agg = ChunkAggregator::new();
        while let Some(chunk) = stream.next().await {
            agg.push(&chunk.unwrap());
        }
        let response = agg.finish();
        assert_eq!(response.choices[0].message.content.text(), "one two three");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
    }
}
