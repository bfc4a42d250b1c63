use anyhow::{bail, Context, Error as E, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::gemma::{Config as Config1, Model as Model1};
use candle_transformers::models::gemma2::{Config as Config2, Model as Model2};
use candle_transformers::models::gemma3::{Config as Config3, Model as Model3};
use candle_transformers::models::llama::{self, Llama, LlamaConfig, LlamaEosToks};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

use crate::context::EngineContext;
use crate::engine::{EngineFactory, LlmEngine};
use crate::options::LlmInferenceOptions;

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    Llama,
    GemmaV1,
    GemmaV2,
    GemmaV3,
}

impl Family {
    /// Map the `model_type` field of a Hugging Face config.json
    pub fn from_model_type(model_type: &str) -> Result<Self> {
        match model_type {
            "llama" => Ok(Self::Llama),
            "gemma" => Ok(Self::GemmaV1),
            "gemma2" => Ok(Self::GemmaV2),
            "gemma3" | "gemma3_text" => Ok(Self::GemmaV3),
            other => bail!("unsupported model_type {other:?}"),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Llama => "Llama",
            Self::GemmaV1 => "Gemma",
            Self::GemmaV2 => "Gemma2",
            Self::GemmaV3 => "Gemma3",
        }
    }
}

enum Model {
    Llama {
        model: Llama,
        config: llama::Config,
        dtype: DType,
    },
    V1(Model1),
    V2(Model2),
    V3(Model3),
}

/// Files that make up a local model directory
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    pub fn locate(model_path: &Path) -> Result<Self> {
        if !model_path.exists() {
            bail!("model path {} does not exist", model_path.display());
        }
        if !model_path.is_dir() {
            bail!("model path {} is not a directory", model_path.display());
        }

        let config = required_file(model_path, CONFIG_FILE)?;
        let tokenizer = required_file(model_path, TOKENIZER_FILE)?;

        let single = model_path.join(WEIGHTS_FILE);
        let weights = if single.is_file() {
            vec![single]
        } else {
            let index = model_path.join(WEIGHTS_INDEX_FILE);
            if !index.is_file() {
                bail!(
                    "no {WEIGHTS_FILE} or {WEIGHTS_INDEX_FILE} in {}",
                    model_path.display()
                );
            }
            load_safetensors_index(model_path, &index)?
        };

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }
}

fn required_file(dir: &Path, name: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    if !path.is_file() {
        bail!("missing {name} in {}", dir.display());
    }
    Ok(path)
}

/// Resolve the shard list of a sharded safetensors checkpoint
pub fn load_safetensors_index(dir: &Path, index: &Path) -> Result<Vec<PathBuf>> {
    let json_file = std::fs::File::open(index)
        .with_context(|| format!("failed to open {}", index.display()))?;
    let json: serde_json::Value = serde_json::from_reader(&json_file)
        .with_context(|| format!("failed to parse {}", index.display()))?;
    let weight_map = match json.get("weight_map") {
        None => bail!("no weight map in {index:?}"),
        Some(serde_json::Value::Object(map)) => map,
        Some(_) => bail!("weight map in {index:?} is not a map"),
    };
    let mut safetensors_files = HashSet::new();
    for value in weight_map.values() {
        if let Some(file) = value.as_str() {
            safetensors_files.insert(file.to_string());
        }
    }
    let mut files: Vec<PathBuf> = safetensors_files.iter().map(|f| dir.join(f)).collect();
    files.sort();
    for file in files.iter() {
        if !file.is_file() {
            bail!("missing weight shard {}", file.display());
        }
    }
    Ok(files)
}

fn read_model_type(config: &Path) -> Result<String> {
    let bytes =
        std::fs::read(config).with_context(|| format!("failed to read {}", config.display()))?;
    let json: serde_json::Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse {}", config.display()))?;
    match json.get("model_type").and_then(|v| v.as_str()) {
        Some(model_type) => Ok(model_type.to_string()),
        None => bail!("no model_type in {}", config.display()),
    }
}

fn eos_tokens(model: &Model, tokenizer: &Tokenizer) -> Vec<u32> {
    match model {
        Model::Llama { config, .. } => match &config.eos_token_id {
            Some(LlamaEosToks::Single(id)) => vec![*id],
            Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
            None => tokenizer.token_to_id("</s>").into_iter().collect(),
        },
        _ => ["<eos>", "<end_of_turn>"]
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect(),
    }
}

/// On-device engine backed by candle
pub struct CandleEngine {
    model: Option<Model>,
    tokenizer: Option<Tokenizer>,
    family: Family,
    device: Device,
    options: LlmInferenceOptions,
}

impl CandleEngine {
    pub fn load(context: &EngineContext, options: &LlmInferenceOptions) -> Result<Self> {
        if context.use_flash_attn && !cfg!(feature = "flash-attn") {
            bail!(
                "flash attention requested but llm-inference was built without the flash-attn feature"
            );
        }
        let files = ModelFiles::locate(options.model_path())?;
        let family = Family::from_model_type(&read_model_type(&files.config)?)?;

        let device = context.device()?;
        let dtype = context.dtype(&device)?;
        tracing::debug!(
            "Loading {} model from {} on {:?} ({:?})",
            family.name(),
            options.model_path().display(),
            device,
            dtype
        );

        let start = std::time::Instant::now();
        let tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(E::msg)?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let config_file = std::fs::File::open(&files.config)?;

        let model = match family {
            Family::Llama => {
                let config: LlamaConfig = serde_json::from_reader(config_file)?;
                let config = config.into_config(context.use_flash_attn);
                let model = Llama::load(vb, &config)?;
                Model::Llama {
                    model,
                    config,
                    dtype,
                }
            }
            Family::GemmaV1 => {
                let config: Config1 = serde_json::from_reader(config_file)?;
                Model::V1(Model1::new(context.use_flash_attn, &config, vb)?)
            }
            Family::GemmaV2 => {
                let config: Config2 = serde_json::from_reader(config_file)?;
                Model::V2(Model2::new(context.use_flash_attn, &config, vb)?)
            }
            Family::GemmaV3 => {
                let config: Config3 = serde_json::from_reader(config_file)?;
                Model::V3(Model3::new(context.use_flash_attn, &config, vb)?)
            }
        };
        tracing::info!("Loaded {} model in {:?}", family.name(), start.elapsed());

        Ok(Self::new(model, tokenizer, family, device, options.clone()))
    }

    fn new(
        model: Model,
        tokenizer: Tokenizer,
        family: Family,
        device: Device,
        options: LlmInferenceOptions,
    ) -> Self {
        Self {
            model: Some(model),
            tokenizer: Some(tokenizer),
            family,
            device,
            options,
        }
    }

    fn logits_processor(&self) -> LogitsProcessor {
        let temperature = self.options.temperature;
        let sampling = if temperature <= 0. {
            Sampling::ArgMax
        } else {
            Sampling::TopK {
                k: self.options.max_top_k,
                temperature,
            }
        };
        LogitsProcessor::from_sampling(self.options.random_seed, sampling)
    }

    /// Run the sampling loop and return the generated ids, EOS excluded
    fn generate_tokens(&mut self, prompt: &str) -> Result<Vec<u32>> {
        let mut logits_processor = self.logits_processor();
        let (Some(model), Some(tokenizer)) = (self.model.as_mut(), self.tokenizer.as_ref()) else {
            bail!("engine is closed");
        };
        let device = &self.device;

        let mut tokens = tokenizer
            .encode(prompt, true)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();
        if tokens.is_empty() {
            bail!("prompt encodes to no tokens");
        }

        let eos_tokens = eos_tokens(&*model, tokenizer);

        let mut llama_cache = match &mut *model {
            Model::Llama { config, dtype, .. } => {
                Some(llama::Cache::new(true, *dtype, config, device)?)
            }
            Model::V1(m) => {
                m.clear_kv_cache();
                None
            }
            Model::V2(m) => {
                m.clear_kv_cache();
                None
            }
            Model::V3(m) => {
                m.clear_kv_cache();
                None
            }
        };

        let start_gen = std::time::Instant::now();
        let prompt_len = tokens.len();
        let mut generated: Vec<u32> = Vec::new();

        for index in 0..self.options.max_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let start_pos = tokens.len().saturating_sub(context_size);
            let input = Tensor::new(&tokens[start_pos..], device)?.unsqueeze(0)?;

            let logits = match (&mut *model, llama_cache.as_mut()) {
                (Model::Llama { model, .. }, Some(cache)) => {
                    model.forward(&input, start_pos, cache)?.squeeze(0)?
                }
                (Model::V1(m), _) => m.forward(&input, start_pos)?.squeeze(0)?.squeeze(0)?,
                (Model::V2(m), _) => m.forward(&input, start_pos)?.squeeze(0)?.squeeze(0)?,
                (Model::V3(m), _) => m.forward(&input, start_pos)?.squeeze(0)?.squeeze(0)?,
                (Model::Llama { .. }, None) => bail!("llama cache missing"),
            };
            let logits = logits.to_dtype(DType::F32)?;

            let next_token = logits_processor.sample(&logits)?;
            tokens.push(next_token);
            if eos_tokens.contains(&next_token) {
                break;
            }
            generated.push(next_token);
        }

        let dt = start_gen.elapsed();
        tracing::debug!(
            "{} prompt tokens, {} tokens generated ({:.2} tokens/s)",
            prompt_len,
            generated.len(),
            generated.len() as f64 / dt.as_secs_f64().max(f64::EPSILON),
        );

        Ok(generated)
    }
}

impl LlmEngine for CandleEngine {
    fn generate_response(&mut self, prompt: &str) -> Result<Option<String>> {
        let generated = self.generate_tokens(prompt)?;
        let Some(tokenizer) = self.tokenizer.as_ref() else {
            bail!("engine is closed");
        };
        let text = tokenizer.decode(&generated, true).map_err(E::msg)?;
        Ok(Some(text))
    }

    fn close(&mut self) {
        if self.model.take().is_some() {
            tracing::debug!("Released {} model weights", self.family.name());
        }
        self.tokenizer = None;
    }

    fn engine_type(&self) -> &'static str {
        self.family.name()
    }
}

/// Factory that loads a [`CandleEngine`] from a local model directory
#[derive(Debug, Clone, Copy, Default)]
pub struct CandleEngineFactory;

impl EngineFactory for CandleEngineFactory {
    fn create(
        &self,
        context: &EngineContext,
        options: &LlmInferenceOptions,
    ) -> Result<Box<dyn LlmEngine>> {
        Ok(Box::new(CandleEngine::load(context, options)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const VOCAB_SIZE: usize = 8;

    // whitespace-split word-level vocabulary with no "</s>" entry
    fn tiny_tokenizer() -> Tokenizer {
        let tokenizer = json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {
                    "<unk>": 0, "a": 1, "b": 2, "c": 3,
                    "d": 4, "e": 5, "f": 6, "g": 7
                },
                "unk_token": "<unk>"
            }
        });
        Tokenizer::from_bytes(tokenizer.to_string()).unwrap()
    }

    // zero weights make every logit equal, so the sampled ids depend only on the sampler
    fn tiny_engine(eos_token_id: serde_json::Value, options: LlmInferenceOptions) -> CandleEngine {
        let config: LlamaConfig = serde_json::from_value(json!({
            "hidden_size": 8,
            "intermediate_size": 16,
            "vocab_size": VOCAB_SIZE,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "num_key_value_heads": 2,
            "rms_norm_eps": 1e-5,
            "rope_theta": 10000.0,
            "max_position_embeddings": 64,
            "bos_token_id": null,
            "eos_token_id": eos_token_id,
            "tie_word_embeddings": false
        }))
        .unwrap();
        let config = config.into_config(false);
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = Llama::load(vb, &config).unwrap();
        let model = Model::Llama {
            model,
            config,
            dtype: DType::F32,
        };
        CandleEngine::new(model, tiny_tokenizer(), Family::Llama, device, options)
    }

    fn greedy_options(max_tokens: usize, random_seed: u64) -> LlmInferenceOptions {
        LlmInferenceOptions::builder("/models/tiny")
            .max_tokens(max_tokens)
            .temperature(0.)
            .random_seed(random_seed)
            .build()
    }

    #[test]
    fn test_generation_stops_at_eos() -> Result<()> {
        let every_id: Vec<u32> = (0..VOCAB_SIZE as u32).collect();
        let mut engine = tiny_engine(json!(every_id), greedy_options(16, 0));
        assert!(engine.generate_tokens("a b")?.is_empty());
        assert_eq!(engine.generate_response("a b")?, Some(String::new()));
        Ok(())
    }

    #[test]
    fn test_generation_respects_max_tokens() -> Result<()> {
        let mut engine = tiny_engine(json!(null), greedy_options(5, 0));
        assert_eq!(engine.generate_tokens("a b c")?.len(), 5);

        let mut engine = tiny_engine(json!(null), greedy_options(0, 0));
        assert!(engine.generate_tokens("a")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_zero_temperature_is_greedy() -> Result<()> {
        let first = tiny_engine(json!(null), greedy_options(4, 1)).generate_tokens("a b")?;
        let second = tiny_engine(json!(null), greedy_options(4, 2)).generate_tokens("a b")?;
        assert_eq!(first, second);
        assert!(first.iter().all(|id| *id == first[0]));
        Ok(())
    }

    #[test]
    fn test_empty_prompt() {
        let mut engine = tiny_engine(json!(null), greedy_options(4, 0));
        let err = engine.generate_response("").unwrap_err();
        assert_eq!(err.to_string(), "prompt encodes to no tokens");
    }

    #[test]
    fn test_closed_engine_errors() -> Result<()> {
        let mut engine = tiny_engine(json!(null), greedy_options(2, 0));
        assert_eq!(engine.engine_type(), "Llama");
        assert!(engine.generate_response("a")?.is_some());

        engine.close();
        let err = engine.generate_response("a").unwrap_err();
        assert_eq!(err.to_string(), "engine is closed");

        engine.close();
        let err = engine.generate_response("a").unwrap_err();
        assert_eq!(err.to_string(), "engine is closed");
        Ok(())
    }

    #[cfg(not(feature = "flash-attn"))]
    #[test]
    fn test_flash_attn_requires_feature() {
        let context = EngineContext {
            cpu: true,
            use_flash_attn: true,
            ..Default::default()
        };
        let options = LlmInferenceOptions::builder("/models/tiny").build();
        let err = CandleEngine::load(&context, &options).err().unwrap();
        assert_eq!(
            err.to_string(),
            "flash attention requested but llm-inference was built without the flash-attn feature"
        );
    }

    #[test]
    fn test_family_from_model_type() -> Result<()> {
        assert_eq!(Family::from_model_type("llama")?, Family::Llama);
        assert_eq!(Family::from_model_type("gemma")?, Family::GemmaV1);
        assert_eq!(Family::from_model_type("gemma2")?, Family::GemmaV2);
        assert_eq!(Family::from_model_type("gemma3")?, Family::GemmaV3);
        assert_eq!(Family::from_model_type("gemma3_text")?, Family::GemmaV3);
        Ok(())
    }

    #[test]
    fn test_unknown_model_type() {
        let err = Family::from_model_type("mamba").unwrap_err();
        assert_eq!(err.to_string(), "unsupported model_type \"mamba\"");
    }

    #[test]
    fn test_locate_missing_path() {
        let err = ModelFiles::locate(Path::new("/nonexistent/model.bin")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "model path /nonexistent/model.bin does not exist"
        );
    }
}
