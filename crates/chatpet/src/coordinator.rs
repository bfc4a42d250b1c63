use anyhow::{anyhow, bail, Result};
use llm_inference::{EngineContext, EngineFactory, LlmEngine, LlmInferenceOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::ui_state::UiState;

pub const MAX_TOP_K: usize = 64;
pub const NO_RESULT_MESSAGE: &str = "LLM returned no result.";
pub const UNKNOWN_ERROR_MESSAGE: &str = "An unknown error occurred";

type EngineSlot = Arc<Mutex<Option<Box<dyn LlmEngine>>>>;

/// Runs one prompt at a time against an on-device engine and publishes the
/// resulting [`UiState`] for a view to render.
///
/// Every admitted request creates its own engine, uses it for a single
/// generation and closes it again. While a request is in flight further
/// requests are dropped.
pub struct ChatCoordinator {
    factory: Arc<dyn EngineFactory>,
    state: Arc<watch::Sender<UiState>>,
    engine: EngineSlot,
    runtime: Handle,
}

impl ChatCoordinator {
    /// Must be called from within a tokio runtime.
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self::with_runtime(factory, Handle::current())
    }

    pub fn with_runtime(factory: Arc<dyn EngineFactory>, runtime: Handle) -> Self {
        let (state, _) = watch::channel(UiState::Idle);
        Self {
            factory,
            state: Arc::new(state),
            engine: Arc::new(Mutex::new(None)),
            runtime,
        }
    }

    pub fn state(&self) -> UiState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UiState> {
        self.state.subscribe()
    }

    /// Start generating a response for `prompt`.
    ///
    /// The state is `Loading` by the time this returns. Returns `None` when a
    /// request is already in flight; the call is then ignored. The returned
    /// task publishes `Success` or `Error` when it finishes and cannot be
    /// cancelled.
    pub fn generate_response(
        &self,
        context: EngineContext,
        model_path: impl Into<PathBuf>,
        prompt: impl Into<String>,
    ) -> Option<JoinHandle<()>> {
        let admitted = self.state.send_if_modified(|state| {
            if state.is_loading() {
                false
            } else {
                *state = UiState::Loading;
                true
            }
        });
        if !admitted {
            tracing::debug!("Already loading, request ignored.");
            return None;
        }

        let prompt = prompt.into();
        tracing::info!("Starting LLM response generation for prompt: {}", prompt);

        let options = LlmInferenceOptions::builder(model_path)
            .max_top_k(MAX_TOP_K)
            .build();
        let factory = self.factory.clone();
        let engine = self.engine.clone();
        let state = self.state.clone();

        Some(self.runtime.spawn(async move {
            let next = match run_request(factory, engine.clone(), context, options, prompt).await {
                Ok(Some(text)) if !text.is_empty() => {
                    tracing::info!("LLM Result: {}", text);
                    UiState::Success(text)
                }
                Ok(_) => {
                    tracing::error!("LLM result was empty");
                    UiState::Error(NO_RESULT_MESSAGE.to_string())
                }
                Err(e) => {
                    tracing::error!("Error generating LLM response: {:#}", e);
                    UiState::Error(error_message(&e))
                }
            };

            // The slot is emptied before the terminal state goes out, so an
            // observer reacting to it can start the next request right away.
            release_engine(engine).await;
            tracing::debug!("LlmInference instance closed.");
            state.send_replace(next);
        }))
    }

    /// Close any engine still held, on a background task.
    ///
    /// Leaves the published state alone. Safe to call at any time, including
    /// while a request is running; the engine is closed at most once.
    pub fn dispose(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        self.runtime.spawn(async move {
            release_engine(engine).await;
            tracing::debug!("LlmInference instance closed in dispose.");
        })
    }
}

impl Drop for ChatCoordinator {
    fn drop(&mut self) {
        let _ = self.dispose();
    }
}

async fn run_request(
    factory: Arc<dyn EngineFactory>,
    engine: EngineSlot,
    context: EngineContext,
    options: LlmInferenceOptions,
    prompt: String,
) -> Result<Option<String>> {
    let slot = engine.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let created = factory.create(&context, &options)?;
        tracing::debug!("LlmInference instance created ({}).", created.engine_type());
        *slot.blocking_lock() = Some(created);
        Ok(())
    })
    .await
    .map_err(|e| anyhow!("Engine creation task failed: {}", e))??;

    tokio::task::spawn_blocking(move || {
        let mut guard = engine.blocking_lock();
        match guard.as_mut() {
            Some(llm) => llm.generate_response(&prompt),
            None => bail!("LlmInference instance was closed before inference"),
        }
    })
    .await
    .map_err(|e| anyhow!("Inference task failed: {}", e))?
}

async fn release_engine(engine: EngineSlot) {
    let released = tokio::task::spawn_blocking(move || match engine.blocking_lock().take() {
        Some(mut llm) => {
            llm.close();
            true
        }
        None => false,
    })
    .await;

    match released {
        Ok(true) => {}
        Ok(false) => tracing::trace!("No LlmInference instance to close"),
        Err(e) => tracing::error!("Failed to close LlmInference instance: {}", e),
    }
}

fn error_message(e: &anyhow::Error) -> String {
    let message = format!("{:#}", e);
    if message.trim().is_empty() {
        UNKNOWN_ERROR_MESSAGE.to_string()
    } else {
        message
    }
}
