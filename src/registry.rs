use crate::logger::{info, Component};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Placeholder substituted with the raw prompt when a template renders.
const PROMPT_SLOT: &str = "{prompt}";

/// Named bundle of model identity, tokenizer selection and prompt framing.
///
/// Profiles are immutable once constructed; the registry hands out clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Hub repository path, e.g. `TinyLlama/TinyLlama-1.1B-Chat-v1.0`.
    pub id: String,
    /// Tokenizer variant for models where it cannot be inferred from `id`.
    pub tokenizer_override: Option<String>,
    /// Prompt framing with a `{prompt}` slot; `None` passes prompts through
    /// unchanged.
    pub template: Option<String>,
}

impl ModelProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tokenizer_override: None,
            template: None,
        }
    }

    /// Wrap the raw prompt in this profile's framing.
    pub fn prepare(&self, prompt: &str) -> String {
        match &self.template {
            Some(template) => template.replace(PROMPT_SLOT, prompt),
            None => prompt.to_string(),
        }
    }
}

// The backend tokenizer is sensitive to the exact framing bytes, newlines
// included; do not reformat these literals.
const LLAMA3_CHAT_TEMPLATE: &str = concat!(
    "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n",
    "You are a friend of the user. Pretend to be a humand and use ",
    "the entire conversation provided to you along with the last reply",
    "and respond to it in the context of the ",
    "conversation <|eot_id|><|start_header_id|>user<|end_header_id|>\n",
    "{prompt}<|eot_id|><|start_header_id|>assistant<|end_header_id|>",
);

pub const LLAMA3_INSTRUCT_ID: &str = "meta-llama/Meta-Llama-3-8B-Instruct";
pub const MINICPM_ID: &str = "openbmb/MiniCPM-2B-sft-bf16";

fn builtin_profiles() -> Vec<ModelProfile> {
    vec![
        ModelProfile {
            id: LLAMA3_INSTRUCT_ID.to_string(),
            tokenizer_override: Some("PreTrainedTokenizer".to_string()),
            template: Some(LLAMA3_CHAT_TEMPLATE.to_string()),
        },
        ModelProfile {
            id: MINICPM_ID.to_string(),
            tokenizer_override: Some("Pretrained".to_string()),
            template: None,
        },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootstrapState {
    Idle,
    Bootstrapping,
    Bootstrapped,
}

struct RegistryInner {
    profiles: HashMap<String, ModelProfile>,
    bootstrap: BootstrapState,
}

/// Catalogue of model profiles, lazily seeded with the built-ins on first
/// use.
///
/// The whole catalogue lives behind one mutex, so the first caller to
/// observe `Idle` performs the bootstrap while everyone else blocks and then
/// sees `Bootstrapped`; the built-ins register exactly once no matter how
/// many threads race the first access. Lookups never fail: unknown ids
/// resolve to a synthesized pass-through profile.
pub struct ModelRegistry {
    inner: Mutex<RegistryInner>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                profiles: HashMap::new(),
                bootstrap: BootstrapState::Idle,
            }),
        }
    }

    /// Upsert profiles by id; the last writer wins for duplicate ids.
    pub fn register(&self, profiles: Vec<ModelProfile>) {
        let mut inner = self.lock();
        Self::bootstrap(&mut inner);
        for profile in profiles {
            inner.profiles.insert(profile.id.clone(), profile);
        }
    }

    /// Look up a profile, synthesizing a default for unknown ids.
    pub fn resolve(&self, id: &str) -> ModelProfile {
        let mut inner = self.lock();
        Self::bootstrap(&mut inner);
        inner
            .profiles
            .get(id)
            .cloned()
            .unwrap_or_else(|| ModelProfile::new(id))
    }

    /// All registered profiles, ordered by id.
    pub fn profiles(&self) -> Vec<ModelProfile> {
        let mut inner = self.lock();
        Self::bootstrap(&mut inner);
        let mut profiles: Vec<ModelProfile> = inner.profiles.values().cloned().collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bootstrap(inner: &mut RegistryInner) {
        match inner.bootstrap {
            BootstrapState::Idle => {
                inner.bootstrap = BootstrapState::Bootstrapping;
                for profile in builtin_profiles() {
                    inner.profiles.insert(profile.id.clone(), profile);
                }
                inner.bootstrap = BootstrapState::Bootstrapped;
                info(Component::Models, "Registered built-in model profiles");
            }
            BootstrapState::Bootstrapping | BootstrapState::Bootstrapped => {}
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
