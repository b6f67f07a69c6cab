use anyhow::{anyhow, Context, Result};
use clap::Parser;
use quill::backend::candle::CandleBackend;
use quill::fetch::ModelFetcher;
use quill::logger::{info, Component};
use quill::settings::SettingsManager;
use quill::{GenerationController, GenerationOptions, ModelRegistry};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "quill")]
#[command(about = "Local-first interactive text generation")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Prompt to run once; reads prompts interactively when omitted
    prompt: Option<String>,

    /// Model profile id (defaults to the configured active profile)
    #[arg(long, short)]
    model: Option<String>,

    /// Directory for downloaded weights
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Hard cap on generated tokens
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Fixed sampler seed (wall-clock seeded when omitted)
    #[arg(long)]
    seed: Option<u64>,

    /// Configuration directory override
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// List registered model profiles and exit
    #[arg(long)]
    list_models: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let registry = Arc::new(ModelRegistry::new());

    if args.list_models {
        for profile in registry.profiles() {
            let framing = if profile.template.is_some() {
                "  (chat framing)"
            } else {
                ""
            };
            println!("{}{framing}", profile.id);
        }
        return Ok(());
    }

    let config_dir = match args.config_dir.clone() {
        Some(dir) => dir,
        None => dirs::config_dir()
            .ok_or_else(|| anyhow!("no config directory on this platform"))?
            .join("quill"),
    };
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("cannot create config dir {config_dir:?}"))?;
    let manager = SettingsManager::new(&config_dir).map_err(|e| anyhow!(e))?;
    let settings = manager.get().clone();

    let options = GenerationOptions {
        temperature: args.temperature.unwrap_or(settings.generation.temperature),
        max_tokens: args.max_tokens.unwrap_or(settings.generation.max_tokens),
        display_every_n_tokens: settings.generation.display_every_n_tokens,
        seed: args.seed.or(settings.generation.seed),
        working_set_ceiling_bytes: settings.backend.working_set_ceiling_bytes,
    };

    let models_dir = args
        .models_dir
        .or(settings.models.models_dir)
        .unwrap_or_else(ModelFetcher::default_models_dir);
    let profile_id = args
        .model
        .unwrap_or(settings.models.active_profile_id);

    let backend = Arc::new(CandleBackend::new(ModelFetcher::new(models_dir)));
    let controller = Arc::new(GenerationController::new(
        backend,
        registry,
        profile_id,
        options,
    ));

    // Ctrl-C cancels the in-flight generation instead of killing the process
    let signal_controller = controller.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info(Component::Cli, "Cancelling current generation");
            signal_controller.cancel();
        }
    });

    // Print streamed output as the controller publishes it
    let mut rx = controller.subscribe();
    tokio::spawn(async move {
        let mut printed = String::new();
        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            if snapshot.output_text == printed {
                continue;
            }
            match snapshot.output_text.strip_prefix(&printed) {
                Some(suffix) => print!("{suffix}"),
                None => print!("\n{}", snapshot.output_text),
            }
            printed = snapshot.output_text;
            io::stdout().flush().ok();
        }
    });

    controller
        .ensure_loaded()
        .await
        .context("failed to load model")?;
    info(Component::Cli, &controller.snapshot().load_status);

    match args.prompt {
        Some(prompt) => {
            run_prompt(&controller, &prompt).await;
        }
        None => {
            info(Component::Cli, "Interactive mode; empty line or Ctrl-D exits");
            loop {
                print!("> ");
                io::stdout().flush().ok();
                let Some(line) = tokio::task::spawn_blocking(read_line).await?? else {
                    break;
                };
                let prompt = line.trim().to_string();
                if prompt.is_empty() {
                    break;
                }
                run_prompt(&controller, &prompt).await;
            }
        }
    }

    Ok(())
}

async fn run_prompt(controller: &GenerationController, prompt: &str) {
    controller.generate(prompt).await;
    let snapshot = controller.snapshot();
    println!();
    println!("{}", snapshot.stats_text);
}

fn read_line() -> io::Result<Option<String>> {
    let mut line = String::new();
    if io::stdin().read_line(&mut line)? == 0 {
        Ok(None)
    } else {
        Ok(Some(line))
    }
}
