use super::{
    BackendError, InferenceBackend, LanguageModel, LoadedModel, ProgressCallback, PromptTokenizer,
    SamplingParams, TokenId, TokenStream,
};
use crate::fetch::ModelFetcher;
use crate::logger::{info, Component};
use crate::registry::ModelProfile;
use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaEosToks};
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokenizers::Tokenizer;

/// Constants needed to instantiate a llama-family model from bare
/// safetensors, keyed off the profile id.
#[derive(Debug)]
struct Family {
    config: Config,
    eos_token: &'static str,
    unknown_token: &'static str,
}

fn family_for(id: &str) -> Result<Family, BackendError> {
    let lower = id.to_ascii_lowercase();
    if lower.contains("tinyllama") {
        Ok(Family {
            config: tinyllama_config(),
            eos_token: "</s>",
            unknown_token: "<unk>",
        })
    } else if lower.contains("llama-3") {
        Ok(Family {
            config: llama3_8b_config(),
            eos_token: "<|eot_id|>",
            unknown_token: "<unk>",
        })
    } else {
        Err(BackendError::Load(format!(
            "no built-in configuration for model '{id}'"
        )))
    }
}

fn tinyllama_config() -> Config {
    Config {
        hidden_size: 2048,
        intermediate_size: 5632,
        vocab_size: 32000,
        num_hidden_layers: 22,
        num_attention_heads: 32,
        num_key_value_heads: 4,
        max_position_embeddings: 2048,
        rms_norm_eps: 1e-5,
        rope_theta: 10000.0,
        bos_token_id: Some(1),
        eos_token_id: Some(LlamaEosToks::Single(2)),
        rope_scaling: None,
        tie_word_embeddings: false,
        use_flash_attn: false,
    }
}

fn llama3_8b_config() -> Config {
    Config {
        hidden_size: 4096,
        intermediate_size: 14336,
        vocab_size: 128256,
        num_hidden_layers: 32,
        num_attention_heads: 32,
        num_key_value_heads: 8,
        max_position_embeddings: 8192,
        rms_norm_eps: 1e-5,
        rope_theta: 500_000.0,
        bos_token_id: Some(128_000),
        eos_token_id: Some(LlamaEosToks::Single(128_009)),
        rope_scaling: None,
        tie_word_embeddings: false,
        use_flash_attn: false,
    }
}

/// Candle-backed inference engine for llama-family safetensors checkpoints.
pub struct CandleBackend {
    fetcher: ModelFetcher,
    device: Device,
    working_set_ceiling: AtomicU64,
    resident: AtomicU64,
}

impl CandleBackend {
    pub fn new(fetcher: ModelFetcher) -> Self {
        // CPU for now; the stream/load paths are device-agnostic
        let device = Device::Cpu;
        info(
            Component::Backend,
            &format!("Initialized candle with device: {device:?}"),
        );
        Self {
            fetcher,
            device,
            working_set_ceiling: AtomicU64::new(0),
            resident: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl InferenceBackend for CandleBackend {
    async fn load(
        &self,
        profile: &ModelProfile,
        progress: ProgressCallback,
    ) -> Result<LoadedModel, BackendError> {
        let family = family_for(&profile.id)?;
        let paths = self.fetcher.ensure_downloaded(profile, &*progress).await?;

        let tokenizer = Tokenizer::from_file(&paths.tokenizer)
            .map_err(|e| BackendError::Tokenizer(format!("failed to load tokenizer: {e}")))?;
        if let Some(override_name) = &profile.tokenizer_override {
            info(
                Component::Backend,
                &format!("Tokenizer override '{override_name}' requested for {}", profile.id),
            );
        }

        let config_eos = match family.config.eos_token_id {
            Some(LlamaEosToks::Single(id)) => Some(id),
            Some(LlamaEosToks::Multiple(ref ids)) => ids.first().copied(),
            None => None,
        };
        let eos_id = tokenizer.token_to_id(family.eos_token).or(config_eos);
        let unknown_id = tokenizer.token_to_id(family.unknown_token);

        let weight_bytes: u64 = paths
            .weights
            .iter()
            .filter_map(|p| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        info(
            Component::Backend,
            &format!(
                "Loading {} ({} MB of weights, ceiling {} MB)",
                profile.id,
                weight_bytes / (1024 * 1024),
                self.working_set_ceiling.load(Ordering::SeqCst) / (1024 * 1024)
            ),
        );

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&paths.weights, DType::F16, &self.device)
        }
        .map_err(|e| BackendError::Load(e.to_string()))?;
        let model = Llama::load(vb, &family.config).map_err(|e| BackendError::Load(e.to_string()))?;

        self.resident.store(weight_bytes, Ordering::SeqCst);
        info(Component::Backend, &format!("{} loaded", profile.id));

        Ok(LoadedModel {
            model: Arc::new(CandleModel {
                parts: Arc::new(ModelParts {
                    model,
                    config: family.config,
                    device: self.device.clone(),
                }),
            }),
            tokenizer: Arc::new(CandleTokenizer {
                inner: tokenizer,
                eos_id,
                unknown_id,
            }),
        })
    }

    fn set_working_set_ceiling(&self, bytes: u64) {
        self.working_set_ceiling.store(bytes, Ordering::SeqCst);
        info(
            Component::Backend,
            &format!("Working-set ceiling set to {} MB", bytes / (1024 * 1024)),
        );
    }

    fn resident_bytes(&self) -> u64 {
        self.resident.load(Ordering::SeqCst)
    }
}

struct ModelParts {
    model: Llama,
    config: Config,
    device: Device,
}

pub struct CandleModel {
    parts: Arc<ModelParts>,
}

impl LanguageModel for CandleModel {
    fn stream(
        &self,
        prompt_tokens: &[TokenId],
        params: &SamplingParams,
    ) -> Result<Box<dyn TokenStream>, BackendError> {
        let cache = Cache::new(true, DType::F16, &self.parts.config, &self.parts.device)
            .map_err(|e| BackendError::Inference(e.to_string()))?;
        Ok(Box::new(CandleStream {
            parts: self.parts.clone(),
            cache,
            sampler: LogitsProcessor::new(params.seed, Some(params.temperature as f64), None),
            tokens: prompt_tokens.to_vec(),
            generated: 0,
        }))
    }
}

struct CandleStream {
    parts: Arc<ModelParts>,
    cache: Cache,
    sampler: LogitsProcessor,
    tokens: Vec<TokenId>,
    generated: usize,
}

impl TokenStream for CandleStream {
    fn next_token(&mut self) -> Result<Option<TokenId>, BackendError> {
        // First step prefills the whole prompt; afterwards the KV cache
        // lets us feed only the newest token at its sequence position.
        let (context, index_pos) = if self.generated == 0 {
            (self.tokens.as_slice(), 0)
        } else {
            (&self.tokens[self.tokens.len() - 1..], self.tokens.len() - 1)
        };
        let input = Tensor::new(context, &self.parts.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(|e| BackendError::Inference(e.to_string()))?;

        let parts = self.parts.clone();
        let logits = parts
            .model
            .forward(&input, index_pos, &mut self.cache)
            .and_then(|logits| logits.squeeze(0))
            .map_err(|e| BackendError::Inference(e.to_string()))?;
        let next = self
            .sampler
            .sample(&logits)
            .map_err(|e| BackendError::Inference(e.to_string()))?;

        self.tokens.push(next);
        self.generated += 1;
        Ok(Some(next))
    }
}

pub struct CandleTokenizer {
    inner: Tokenizer,
    eos_id: Option<TokenId>,
    unknown_id: Option<TokenId>,
}

impl PromptTokenizer for CandleTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, BackendError> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| BackendError::Tokenizer(format!("tokenization failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String, BackendError> {
        self.inner
            .decode(tokens, true)
            .map_err(|e| BackendError::Tokenizer(format!("decoding failed: {e}")))
    }

    fn unknown_token_id(&self) -> Option<TokenId> {
        self.unknown_id
    }

    fn eos_token_id(&self) -> Option<TokenId> {
        self.eos_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tinyllama_family_matches_its_checkpoint_shape() {
        let family = family_for("TinyLlama/TinyLlama-1.1B-Chat-v1.0").unwrap();
        assert_eq!(family.config.vocab_size, 32000);
        assert_eq!(family.config.num_hidden_layers, 22);
        assert_eq!(family.config.num_key_value_heads, 4);
        assert_eq!(family.eos_token, "</s>");
    }

    #[test]
    fn llama3_family_uses_header_style_terminators() {
        let family = family_for("meta-llama/Meta-Llama-3-8B-Instruct").unwrap();
        assert_eq!(family.config.vocab_size, 128256);
        assert_eq!(family.eos_token, "<|eot_id|>");
    }

    #[test]
    fn unknown_families_are_rejected_at_load_time() {
        let err = family_for("acme/chatty-7b").unwrap_err();
        assert!(matches!(err, BackendError::Load(_)));
    }
}
