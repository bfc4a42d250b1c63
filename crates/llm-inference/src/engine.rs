use anyhow::Result;

use crate::context::EngineContext;
use crate::options::LlmInferenceOptions;

/// LlmEngine is a loaded model that can answer prompts
///
/// One instance owns the model weights and tokenizer it was created with. The
/// caller decides when to release it; releasing is done through [`LlmEngine::close`].
pub trait LlmEngine: Send {
    /// Run a single-shot generation for `prompt`
    ///
    /// Blocks until the full response has been produced. `Ok(None)` means the
    /// engine ran but has nothing to return.
    fn generate_response(&mut self, prompt: &str) -> Result<Option<String>>;

    /// Release whatever the engine holds
    ///
    /// Calling this more than once must be harmless.
    fn close(&mut self) {}

    /// Short name of the backend, used in log lines
    fn engine_type(&self) -> &'static str {
        "unknown"
    }
}

/// EngineFactory builds engines from a context and a set of options
///
/// Creation may block (weights are read from disk) and may fail for a bad path,
/// a corrupt artifact or lack of resources.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        context: &EngineContext,
        options: &LlmInferenceOptions,
    ) -> Result<Box<dyn LlmEngine>>;
}

impl<F> EngineFactory for F
where
    F: Fn(&EngineContext, &LlmInferenceOptions) -> Result<Box<dyn LlmEngine>> + Send + Sync,
{
    fn create(
        &self,
        context: &EngineContext,
        options: &LlmInferenceOptions,
    ) -> Result<Box<dyn LlmEngine>> {
        self(context, options)
    }
}
