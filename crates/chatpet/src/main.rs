use anyhow::{anyhow, Result};
use chatpet::view::observe_request;
use chatpet::{init_tracing, ChatConfig, ChatCoordinator, UiState};
use clap::Parser;
use llm_inference::{CandleEngineFactory, EngineContext};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about = "Chat with an on-device model", long_about = None)]
struct Args {
    /// Local model directory (config.json, tokenizer.json, safetensors weights)
    #[arg(long)]
    model_path: Option<String>,

    /// Run on CPU rather than GPU
    #[arg(long)]
    cpu: bool,

    /// Use different dtype than the device default
    #[arg(long)]
    dtype: Option<String>,

    /// Ask a single question and exit
    #[arg(short, long)]
    prompt: Option<String>,
}

impl Args {
    fn apply(&self, mut config: ChatConfig) -> ChatConfig {
        if let Some(model_path) = &self.model_path {
            config.model_path = Some(model_path.clone());
        }
        if self.cpu {
            config.cpu = true;
        }
        if let Some(dtype) = &self.dtype {
            config.dtype = Some(dtype.clone());
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = args.apply(ChatConfig::from_env());
    let model_path = config.model_path.clone().ok_or_else(|| {
        anyhow!("no model path: pass --model-path or set modelPath in CHATPET_CONFIG")
    })?;
    let context = config.engine_context();

    let coordinator = ChatCoordinator::new(Arc::new(CandleEngineFactory));

    let outcome = match args.prompt {
        Some(prompt) => one_shot(&coordinator, context, &model_path, prompt).await,
        None => repl(&coordinator, context, &model_path).await,
    };

    coordinator.dispose().await?;
    outcome
}

async fn one_shot(
    coordinator: &ChatCoordinator,
    context: EngineContext,
    model_path: &str,
    prompt: String,
) -> Result<()> {
    let mut states = coordinator.subscribe();
    let mut stdout = std::io::stdout();

    if coordinator
        .generate_response(context, model_path, prompt)
        .is_none()
    {
        return Err(anyhow!("a request is already in flight"));
    }
    let state = observe_request(&mut states, &mut stdout).await?;

    match state {
        UiState::Error(message) => Err(anyhow!(message)),
        _ => Ok(()),
    }
}

async fn repl(coordinator: &ChatCoordinator, context: EngineContext, model_path: &str) -> Result<()> {
    let mut states = coordinator.subscribe();
    let mut stdout = std::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Type a message, /quit to leave.");
    while let Some(line) = lines.next_line().await? {
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if prompt == "/quit" {
            break;
        }

        if coordinator
            .generate_response(context.clone(), model_path, prompt)
            .is_none()
        {
            continue;
        }
        observe_request(&mut states, &mut stdout).await?;
    }
    Ok(())
}
