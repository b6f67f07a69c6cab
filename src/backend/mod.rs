pub mod candle;

use crate::registry::ModelProfile;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub type TokenId = u32;

/// Fractional load progress, 0.0..=1.0.
pub type ProgressCallback = Box<dyn Fn(f32) + Send + Sync>;

/// Errors that can surface from an inference backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("model fetch failed: {0}")]
    Fetch(String),

    #[error("model load failed: {0}")]
    Load(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

/// Per-request sampling configuration.
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub temperature: f32,
    pub seed: u64,
}

/// A live sequence of sampled token ids.
///
/// `next_token` produces the next id or signals exhaustion; the caller owns
/// every stopping decision (EOS detection, token budget, cancellation), the
/// stream only samples.
pub trait TokenStream: Send {
    fn next_token(&mut self) -> Result<Option<TokenId>, BackendError>;
}

/// A loaded model able to open token streams over a prompt.
pub trait LanguageModel: Send + Sync {
    fn stream(
        &self,
        prompt_tokens: &[TokenId],
        params: &SamplingParams,
    ) -> Result<Box<dyn TokenStream>, BackendError>;
}

/// Tokenizer surface the generation loop relies on.
///
/// `decode` always receives the full accumulated sequence rather than a
/// suffix: merge and multi-byte artifacts make many tokenizers unsafe to
/// decode token-by-token.
pub trait PromptTokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, BackendError>;
    fn decode(&self, tokens: &[TokenId]) -> Result<String, BackendError>;
    fn unknown_token_id(&self) -> Option<TokenId>;
    fn eos_token_id(&self) -> Option<TokenId>;
}

/// A model/tokenizer pair returned by a successful load.
#[derive(Clone)]
pub struct LoadedModel {
    pub model: Arc<dyn LanguageModel>,
    pub tokenizer: Arc<dyn PromptTokenizer>,
}

/// An engine that can materialize a [`ModelProfile`] into a usable pair.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Fetch and initialize the model and tokenizer for a profile,
    /// reporting fractional progress along the way.
    async fn load(
        &self,
        profile: &ModelProfile,
        progress: ProgressCallback,
    ) -> Result<LoadedModel, BackendError>;

    /// Upper bound on memory the backend may keep for cached intermediate
    /// state. Configured once before the first load; advisory for backends
    /// without a hard cap.
    fn set_working_set_ceiling(&self, bytes: u64);

    /// Bytes currently held by loaded weights.
    fn resident_bytes(&self) -> u64;
}
