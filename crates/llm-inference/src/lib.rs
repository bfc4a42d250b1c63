// On-device LLM engines behind a small create/generate/close seam
pub mod candle_engine;
pub mod context;
pub mod engine;
pub mod options;

pub use candle_engine::{CandleEngine, CandleEngineFactory, Family};
pub use context::EngineContext;
pub use engine::{EngineFactory, LlmEngine};
pub use options::{LlmInferenceOptions, LlmInferenceOptionsBuilder};
