// Core generation engine
pub mod controller;
pub mod progress;
pub mod registry;

// Inference backend seam
pub mod backend;
pub mod fetch;

// Cross-cutting support
pub mod logger;
pub mod settings;

// Re-export the types most callers need
pub use backend::{
    BackendError, InferenceBackend, LanguageModel, LoadedModel, PromptTokenizer, SamplingParams,
    TokenId, TokenStream,
};
pub use controller::{GenerationController, GenerationError, GenerationOptions, GenerationStats};
pub use progress::{CancelToken, ControllerState, StateTracker};
pub use registry::{ModelProfile, ModelRegistry};
