//! Scripted collaborators for tests.

use async_trait::async_trait;
use codeward_core::{
    Capabilities, Completion, CompletionProvider, CompletionRequest, MessageToolCall,
    ProviderError, StreamChunk, Usage,
};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// A provider that replays a fixed script of replies.
///
/// Each completion pops the next entry. Once the script runs out,
/// calls fail with an `ApiError` so a runaway loop shows up as an error
/// rather than a hang. Every request is recorded for later inspection.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<Completion, ProviderError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    capabilities: Capabilities,
    delay: Option<Duration>,
    chunk_chars: Option<usize>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<Completion, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            capabilities: Capabilities::default(),
            delay: None,
            chunk_chars: None,
        }
    }

    /// A script made only of successful replies.
    pub fn replies(replies: Vec<Completion>) -> Self {
        Self::new(replies.into_iter().map(Ok).collect())
    }

    /// Wait this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Stream each reply's text in pieces of at most `chars` characters.
    pub fn streaming(mut self, chars: usize) -> Self {
        self.chunk_chars = Some(chars.max(1));
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.script).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        let call = {
            let mut requests = lock(&self.requests);
            requests.push(request);
            requests.len()
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.script).pop_front().unwrap_or_else(|| {
            Err(ProviderError::ApiError {
                status_code: 500,
                message: format!("script exhausted at call #{call}"),
            })
        })
    }

    async fn stream(
        &self,
        request: CompletionRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        let completion = self.complete(request).await?;
        let chars: Vec<char> = completion.text.chars().collect();
        let pieces: Vec<String> = match self.chunk_chars {
            Some(size) => chars.chunks(size).map(|c| c.iter().collect()).collect(),
            None => vec![completion.text.clone()],
        };

        let (tx, rx) = tokio::sync::mpsc::channel(pieces.len() + 1);
        for piece in pieces {
            let _ = tx.try_send(Ok(StreamChunk {
                content: Some(piece),
                ..Default::default()
            }));
        }
        let _ = tx.try_send(Ok(StreamChunk {
            content: None,
            tool_calls: completion.tool_calls,
            done: true,
            usage: completion.usage,
        }));
        Ok(rx)
    }
}

/// A final text reply with nominal usage.
pub fn answer(text: &str) -> Completion {
    Completion {
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        ..Completion::text(text)
    }
}

/// A reply that calls one tool.
pub fn call(id: &str, tool: &str, arguments: serde_json::Value) -> Completion {
    calls("", vec![(id, tool, arguments)])
}

/// A reply with accompanying text and several tool calls.
pub fn calls(text: &str, calls: Vec<(&str, &str, serde_json::Value)>) -> Completion {
    let calls = calls
        .into_iter()
        .map(|(id, tool, arguments)| MessageToolCall::new(id, tool, arguments))
        .collect();
    Completion {
        usage: Some(Usage {
            prompt_tokens: 20,
            completion_tokens: 8,
            total_tokens: 28,
        }),
        ..Completion::with_tool_calls(text, calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn streams_text_in_pieces() {
        let provider = ScriptedProvider::replies(vec![answer("abcdefg")]).streaming(3);
        let request = CompletionRequest::shaped(vec![], vec![], &Capabilities::default(), 0.2);
        let mut rx = provider.stream(request).await.unwrap();

        let mut pieces = Vec::new();
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk.unwrap();
            if let Some(text) = chunk.content {
                pieces.push(text);
            }
            if chunk.done {
                assert_eq!(chunk.usage.unwrap().prompt_tokens, 10);
            }
        }
        assert_eq!(pieces, vec!["abc", "def", "g"]);
    }

    #[tokio::test]
    async fn replays_then_fails() {
        let provider = ScriptedProvider::replies(vec![answer("one")]);
        let request = CompletionRequest::shaped(vec![], vec![], &Capabilities::default(), 0.2);

        let first = provider.complete(request.clone()).await.unwrap();
        assert_eq!(first.text, "one");
        assert!(matches!(
            provider.complete(request).await,
            Err(ProviderError::ApiError { .. })
        ));
        assert_eq!(provider.call_count(), 2);
        assert_eq!(provider.remaining(), 0);
    }
}
