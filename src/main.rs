// Switchboard - multi-backend LLM provider runtime
// Demonstration CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

use switchboard::config::{load_config, BackendKind};
use switchboard::content::ContentBlock;
use switchboard::errors::TurnError;
use switchboard::settings::{validate_provider, Validation};
use switchboard::{
    run_turn, CompletionRequest, ContentRecord, HistoryService, ProviderError, ProviderManager,
    RuntimeContext,
};

#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(about = "Talk to OpenAI, Anthropic, Gemini, Qwen or a local model through one runtime", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List backends and whether their settings validate
    Providers,
    /// List models offered by a backend
    Models {
        /// Backend name (defaults to the active provider)
        #[arg(long)]
        provider: Option<String>,
    },
    /// Make a backend the default provider
    Use {
        provider: String,
    },
    /// Set one provider setting (value is parsed as JSON, else taken as a string)
    Set {
        provider: String,
        key: String,
        value: String,
    },
    /// Send a single prompt and stream the reply
    Chat {
        prompt: String,
        /// Backend name (defaults to the active provider)
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        system: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config()?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let ctx = RuntimeContext::initialize(config).await?;
    let manager = ProviderManager::new(&ctx);

    let result = match args.command {
        Command::Providers => list_providers(&ctx, &manager).await,
        Command::Models { provider } => list_models(&manager, provider.as_deref()).await,
        Command::Use { provider } => use_provider(&manager, &provider).await,
        Command::Set {
            provider,
            key,
            value,
        } => set_value(&ctx, &provider, &key, &value).await,
        Command::Chat {
            prompt,
            provider,
            model,
            system,
        } => chat(&manager, provider.as_deref(), prompt, model, system).await,
    };

    if let Err(e) = &result {
        if let Some(hint) = hint_for(e) {
            eprintln!("hint: {}", hint);
        }
    }
    result
}

fn hint_for(error: &anyhow::Error) -> Option<String> {
    let provider_error = match error.downcast_ref::<TurnError>() {
        Some(TurnError::Provider(e)) => Some(e),
        Some(TurnError::History(_)) => None,
        None => error.downcast_ref::<ProviderError>(),
    };
    provider_error.and_then(ProviderError::user_hint)
}

async fn list_providers(ctx: &RuntimeContext, manager: &ProviderManager) -> Result<()> {
    let snapshot = ctx.settings.snapshot().await;
    let active = manager.active().await.ok().map(|p| p.kind());

    for kind in BackendKind::ALL {
        let settings = snapshot.providers.get(kind.name()).cloned().unwrap_or_default();
        let marker = if active == Some(kind) { "*" } else { " " };
        let state = match validate_provider(kind.name(), &settings) {
            Validation::Valid => "ok".to_string(),
            Validation::Invalid(issues) => format!("{} issue(s)", issues.len()),
        };
        println!(
            "{} {:<10} {:<22} enabled={:<5} settings={}",
            marker,
            kind.name(),
            kind.display_name(),
            settings.enabled,
            state
        );
    }
    Ok(())
}

async fn list_models(manager: &ProviderManager, provider: Option<&str>) -> Result<()> {
    let provider = match provider {
        Some(name) => manager.get_by_name(name)?,
        None => manager.active().await?,
    };

    let models = provider
        .list_models()
        .await
        .with_context(|| format!("Failed to list models for {}", provider.name()))?;
    if models.is_empty() {
        println!("{} reported no models", provider.name());
    }
    for model in models {
        match model.display_name {
            Some(display) => println!("{}  ({})", model.id, display),
            None => println!("{}", model.id),
        }
    }
    Ok(())
}

async fn use_provider(manager: &ProviderManager, name: &str) -> Result<()> {
    let provider = manager
        .switch_provider(name)
        .await
        .with_context(|| format!("Failed to switch to {}", name))?;
    println!("Now using {}", provider.name());
    Ok(())
}

async fn set_value(ctx: &RuntimeContext, provider: &str, key: &str, raw: &str) -> Result<()> {
    let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    ctx.settings
        .set(provider, key, value)
        .await
        .with_context(|| format!("Failed to set {}.{}", provider, key))?;
    println!("Updated {}.{}", provider, key);
    Ok(())
}

async fn chat(
    manager: &ProviderManager,
    provider: Option<&str>,
    prompt: String,
    model: Option<String>,
    system: Option<String>,
) -> Result<()> {
    let provider = match provider {
        Some(name) => manager.get_by_name(name)?,
        None => manager.active().await?,
    };

    let history = HistoryService::new();
    history.append(ContentRecord::human(prompt))?;

    let mut request = CompletionRequest::default();
    if let Some(model) = model {
        request = request.with_model(model);
    }
    if let Some(system) = system {
        request = request.with_system_prompt(system);
    }

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let outcome = run_turn(&history, provider.as_ref(), request, cancel, |delta| {
        let mut stdout = std::io::stdout();
        for block in &delta.blocks {
            if let ContentBlock::Text { text } = block {
                let _ = write!(stdout, "{}", text);
            }
        }
        let _ = stdout.flush();
    })
    .await?;
    println!();

    if outcome.cancelled {
        eprintln!("(cancelled)");
    }
    if let Some(record) = outcome.record {
        for call in record.tool_calls() {
            if let ContentBlock::ToolCall { name, parameters, .. } = call {
                eprintln!("tool call: {} {}", name, parameters);
            }
        }
        if let Some(usage) = record.metadata.usage {
            tracing::info!(
                input = usage.input_tokens,
                output = usage.output_tokens,
                "token usage"
            );
        }
    }
    Ok(())
}
