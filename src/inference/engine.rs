//! Incremental text generation.
//!
//! The text engine is an external collaborator: given a prompt, sampling
//! parameters and a request id it produces a stream of partial outputs, each
//! carrying the *full* text generated so far. Consumers turn those into deltas.
//!
//! [`StubTextEngine`] is an in-process implementation used when no real engine
//! is attached, and by the tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::inference::request_id::RequestId;
use crate::inference::sampling::SamplingParameters;

pub type TokenId = i32;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Engine load failed: {0}")]
    LoadFailed(String),

    #[error("Chat template failed: {0}")]
    Template(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Engine produced no output")]
    NoOutput,
}

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// One candidate sequence inside a partial output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOutput {
    /// Full text generated so far (not a delta).
    pub text: String,
    pub token_ids: Vec<TokenId>,
    pub finish_reason: Option<String>,
}

/// A partial (or final) output for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutput {
    pub request_id: RequestId,
    pub prompt_token_ids: Vec<TokenId>,
    pub outputs: Vec<CompletionOutput>,
    pub finished: bool,
}

impl RequestOutput {
    /// Text of the first candidate, if the engine produced one.
    pub fn text(&self) -> Option<&str> {
        self.outputs.first().map(|o| o.text.as_str())
    }

    pub fn prompt_tokens(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Tokens in the first candidate, 0 when there is none.
    pub fn completion_tokens(&self) -> usize {
        self.outputs.first().map_or(0, |o| o.token_ids.len())
    }
}

/// Receiving half of a generation. Dropping it cancels the generation.
pub type OutputStream = mpsc::Receiver<Result<RequestOutput, EngineError>>;

/// Token generation engine shared by all in-flight requests.
///
/// Implementations must tolerate concurrent `generate` calls; the request id
/// is the multiplexing key.
#[async_trait]
pub trait TextEngine: Send + Sync {
    /// Render chat messages into a single model-ready prompt.
    async fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String, EngineError>;

    /// Start generating. Partial outputs arrive on the returned receiver in
    /// production order; the channel closes when generation ends.
    async fn generate(
        &self,
        prompt: String,
        params: SamplingParameters,
        request_id: RequestId,
    ) -> Result<OutputStream, EngineError>;
}

/// What the stub emits.
#[derive(Debug, Clone)]
enum Script {
    /// `token_0 token_1 …` up to `max_tokens`, honouring stop sequences.
    Counting,
    /// Fixed cumulative partial outputs.
    Partials(Vec<String>),
}

/// In-process engine that fakes generation.
pub struct StubTextEngine {
    script: Script,
    channel_capacity: usize,
    fail_after: Option<usize>,
    generate_calls: AtomicUsize,
    produced: Arc<AtomicUsize>,
}

impl Default for StubTextEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StubTextEngine {
    pub fn new() -> Self {
        Self {
            script: Script::Counting,
            channel_capacity: 32,
            fail_after: None,
            generate_calls: AtomicUsize::new(0),
            produced: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Emit exactly these cumulative texts, one token each.
    pub fn scripted<I, S>(partials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Script::Partials(partials.into_iter().map(Into::into).collect()),
            ..Self::new()
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Send an error after `n` partial outputs.
    pub fn with_failure_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Number of times `generate` was called.
    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Partial outputs delivered to consumers so far, across all requests.
    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }

    fn partials(&self, params: &SamplingParameters) -> Partials {
        match &self.script {
            Script::Partials(p) => Partials::Fixed(p.clone().into_iter()),
            Script::Counting => Partials::Counting {
                next: 0,
                max_tokens: params.max_tokens,
                stop: params.stop.iter().filter(|s| !s.is_empty()).cloned().collect(),
                text: String::new(),
                stopped: false,
            },
        }
    }
}

/// Cumulative texts, produced one at a time by the generation task.
enum Partials {
    Fixed(std::vec::IntoIter<String>),
    Counting {
        next: usize,
        max_tokens: usize,
        stop: Vec<String>,
        text: String,
        stopped: bool,
    },
}

impl Iterator for Partials {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        match self {
            Partials::Fixed(iter) => iter.next(),
            Partials::Counting {
                next,
                max_tokens,
                stop,
                text,
                stopped,
            } => {
                if *stopped || *next >= *max_tokens {
                    return None;
                }
                if *next > 0 {
                    text.push(' ');
                }
                text.push_str(&format!("token_{next}"));
                *next += 1;

                if let Some(pos) = stop.iter().filter_map(|s| text.find(s.as_str())).min() {
                    text.truncate(pos);
                    *stopped = true;
                }
                Some(text.clone())
            }
        }
    }
}

#[async_trait]
impl TextEngine for StubTextEngine {
    async fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String, EngineError> {
        let mut prompt = String::new();
        for m in messages {
            prompt.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", m.role, m.content));
        }
        prompt.push_str("<|im_start|>assistant\n");
        Ok(prompt)
    }

    async fn generate(
        &self,
        prompt: String,
        params: SamplingParameters,
        request_id: RequestId,
    ) -> Result<OutputStream, EngineError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(self.channel_capacity);

        // Stub tokenization: ~1 token per 4 chars.
        let prompt_token_ids: Vec<TokenId> = (0..(prompt.len() / 4).max(1) as TokenId).collect();
        let partials = self.partials(&params);
        let fail_after = self.fail_after;
        let produced = self.produced.clone();

        tokio::spawn(async move {
            info!(
                request_id = %request_id,
                prompt_tokens = prompt_token_ids.len(),
                max_tokens = params.max_tokens,
                "Starting generation"
            );

            let mut partials = partials.peekable();
            let mut sent = 0;
            while let Some(text) = partials.next() {
                if fail_after == Some(sent) {
                    let _ = tx
                        .send(Err(EngineError::Generation("stub failure".to_string())))
                        .await;
                    return;
                }

                let finished = partials.peek().is_none();
                let output = RequestOutput {
                    request_id: request_id.clone(),
                    prompt_token_ids: prompt_token_ids.clone(),
                    outputs: vec![CompletionOutput {
                        text,
                        token_ids: (0..=sent as TokenId).map(|t| t % 100).collect(),
                        finish_reason: finished.then(|| "stop".to_string()),
                    }],
                    finished,
                };

                if tx.send(Ok(output)).await.is_err() {
                    // Receiver dropped, stop generating.
                    debug!(request_id = %request_id, sent, "Consumer went away");
                    return;
                }
                sent += 1;
                produced.fetch_add(1, Ordering::SeqCst);
            }

            info!(request_id = %request_id, sent, "Generation complete");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut rx: OutputStream) -> Vec<RequestOutput> {
        let mut outs = Vec::new();
        while let Some(item) = rx.recv().await {
            outs.push(item.unwrap());
        }
        outs
    }

    #[tokio::test]
    async fn test_counting_produces_cumulative_text() {
        let engine = StubTextEngine::new();
        let params = SamplingParameters {
            max_tokens: 3,
            ..Default::default()
        };
        let rx = engine
            .generate("hello".into(), params, RequestId::from("t-1"))
            .await
            .unwrap();

        let outs = drain(rx).await;
        let texts: Vec<_> = outs.iter().map(|o| o.text().unwrap()).collect();
        assert_eq!(texts, vec!["token_0", "token_0 token_1", "token_0 token_1 token_2"]);
        assert!(outs.last().unwrap().finished);
        assert_eq!(outs.last().unwrap().completion_tokens(), 3);
        assert_eq!(engine.generate_calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_sequence_truncates() {
        let engine = StubTextEngine::new();
        let params = SamplingParameters {
            max_tokens: 100,
            stop: vec!["token_3".to_string()],
            ..Default::default()
        };
        let rx = engine
            .generate("p".into(), params, RequestId::from("t-2"))
            .await
            .unwrap();

        let outs = drain(rx).await;
        assert_eq!(outs.len(), 4);
        assert_eq!(outs.last().unwrap().text(), Some("token_0 token_1 token_2 "));
    }

    #[tokio::test]
    async fn test_counting_is_produced_on_demand() {
        let engine = StubTextEngine::new().with_channel_capacity(1);
        let params = SamplingParameters {
            max_tokens: 1_000_000,
            ..Default::default()
        };
        let mut rx = engine
            .generate("p".into(), params, RequestId::from("t-4"))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().unwrap().text(), Some("token_0"));
        assert_eq!(
            rx.recv().await.unwrap().unwrap().text(),
            Some("token_0 token_1")
        );
        drop(rx);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(engine.produced() < 10);
    }

    #[tokio::test]
    async fn test_chat_template_ends_with_assistant_turn() {
        let engine = StubTextEngine::new();
        let prompt = engine
            .apply_chat_template(&[ChatMessage {
                role: "user".into(),
                content: "hi".into(),
            }])
            .await
            .unwrap();
        assert!(prompt.contains("<|im_start|>user\nhi<|im_end|>"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[tokio::test]
    async fn test_failure_is_delivered_in_band() {
        let engine = StubTextEngine::scripted(["a", "ab", "abc"]).with_failure_after(1);
        let mut rx = engine
            .generate("p".into(), SamplingParameters::default(), RequestId::from("t-3"))
            .await
            .unwrap();

        assert!(rx.recv().await.unwrap().is_ok());
        assert!(matches!(
            rx.recv().await,
            Some(Err(EngineError::Generation(_)))
        ));
        assert!(rx.recv().await.is_none());
    }
}
