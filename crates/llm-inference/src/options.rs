use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_TOP_K: usize = 40;
pub const DEFAULT_MAX_TOKENS: usize = 512;
pub const DEFAULT_TEMPERATURE: f64 = 0.8;
pub const DEFAULT_RANDOM_SEED: u64 = 0;

/// Options an engine is created with
#[derive(Debug, Clone, PartialEq)]
pub struct LlmInferenceOptions {
    pub model_path: PathBuf,
    /// Only sample among the top K tokens
    pub max_top_k: usize,
    /// Upper bound on generated tokens (prompt excluded)
    pub max_tokens: usize,
    pub temperature: f64,
    pub random_seed: u64,
}

impl LlmInferenceOptions {
    pub fn builder(model_path: impl Into<PathBuf>) -> LlmInferenceOptionsBuilder {
        LlmInferenceOptionsBuilder {
            options: LlmInferenceOptions {
                model_path: model_path.into(),
                max_top_k: DEFAULT_MAX_TOP_K,
                max_tokens: DEFAULT_MAX_TOKENS,
                temperature: DEFAULT_TEMPERATURE,
                random_seed: DEFAULT_RANDOM_SEED,
            },
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

#[derive(Debug, Clone)]
pub struct LlmInferenceOptionsBuilder {
    options: LlmInferenceOptions,
}

impl LlmInferenceOptionsBuilder {
    pub fn max_top_k(mut self, k: usize) -> Self {
        self.options.max_top_k = k;
        self
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.options.max_tokens = max_tokens;
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.options.temperature = temperature;
        self
    }

    pub fn random_seed(mut self, seed: u64) -> Self {
        self.options.random_seed = seed;
        self
    }

    pub fn build(self) -> LlmInferenceOptions {
        self.options
    }
}
