use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::Receiver;
use llama_chat::{EngineConfig, SessionController, StreamEvent};
use llama_cli::{demo_runtime, Overrides, ReplCommand, REPL_HELP};
use llama_runtime::LogTelemetry;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Streaming multi-turn chat over a local model.
#[derive(Parser)]
#[command(name = "llama-cli", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Chat interactively with a model.
    Chat {
        #[command(flatten)]
        common: CommonArgs,

        /// Maximum tokens generated per reply.
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Sampling temperature (must be > 0).
        #[arg(short, long)]
        temperature: Option<f32>,

        /// Seed of the final distribution draw.
        #[arg(long)]
        seed: Option<u32>,
    },

    /// Load a model and print its summary as JSON.
    Info {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Path to the model file.
    #[arg(short, long, env = "LLAMA_CHAT_MODEL")]
    model: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Context window in tokens.
    #[arg(long)]
    n_ctx: Option<u32>,

    /// Use the scripted mock runtime instead of llama.cpp.
    #[arg(long)]
    mock: bool,
}

fn main() -> Result<()> {
    // stdout carries the streamed reply, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Chat {
            common,
            max_tokens,
            temperature,
            seed,
        } => {
            if let Some(t) = temperature {
                if !(t > 0.0) {
                    bail!("temperature must be positive (got {t})");
                }
            }
            let overrides = Overrides {
                n_ctx: common.n_ctx,
                max_tokens,
                temperature,
                seed,
            };
            let config = load_config(&common, &overrides)?;
            chat(spawn_session(common.mock, config)?, common.model)
        }
        Command::Info { common } => {
            let overrides = Overrides {
                n_ctx: common.n_ctx,
                ..Overrides::default()
            };
            let config = load_config(&common, &overrides)?;
            let model = common.model.context("--model is required")?;
            show_info(spawn_session(common.mock, config)?, model)
        }
    }
}

fn load_config(common: &CommonArgs, overrides: &Overrides) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(common.config.as_deref())?;
    overrides.apply(&mut config);
    config.validate()?;
    debug!(?config, "configuration loaded");
    Ok(config)
}

/// Start a session over the runtime selected by `--mock` and the build features.
fn spawn_session(mock: bool, config: EngineConfig) -> Result<SessionController> {
    let hook = Box::new(LogTelemetry::new());
    if mock {
        return Ok(SessionController::spawn_with_hook(demo_runtime(), config, hook)?);
    }
    #[cfg(feature = "llama-cpp")]
    {
        Ok(SessionController::spawn_with_hook(
            llama_runtime::LlamaCppRuntime::new(),
            config,
            hook,
        )?)
    }
    #[cfg(not(feature = "llama-cpp"))]
    {
        drop((config, hook));
        bail!("built without the `llama-cpp` feature; pass --mock to use the scripted runtime")
    }
}

fn show_info(session: SessionController, model: PathBuf) -> Result<()> {
    let summary = session
        .load_model(&model)
        .with_context(|| format!("loading {}", model.display()))?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn chat(session: SessionController, model: Option<PathBuf>) -> Result<()> {
    if let Some(path) = &model {
        let summary = session
            .load_model(path)
            .with_context(|| format!("loading {}", path.display()))?;
        info!(
            model = %summary.file_name,
            params = %summary.params_human,
            n_ctx = summary.n_ctx,
            "ready"
        );
    } else {
        eprintln!("no model loaded; use /load <path>");
    }
    let events = session.subscribe();
    eprintln!("{REPL_HELP}");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    print_prompt(&mut stdout)?;
    for line in stdin.lock().lines() {
        match ReplCommand::parse(&line?) {
            ReplCommand::Empty => {}
            ReplCommand::Quit => break,
            ReplCommand::Help => eprintln!("{REPL_HELP}"),
            ReplCommand::Invalid(msg) => eprintln!("{msg}"),
            ReplCommand::Reset => match session.clear_context() {
                Ok(()) => eprintln!("conversation cleared"),
                Err(e) => eprintln!("error: {e}"),
            },
            ReplCommand::Stats => {
                println!("{}", serde_json::to_string_pretty(&session.telemetry())?);
            }
            ReplCommand::Load(path) => match session.load_model(&path) {
                Ok(summary) => eprintln!(
                    "loaded {} ({}, {})",
                    summary.file_name, summary.params_human, summary.quantization
                ),
                Err(e) => eprintln!("error: {e}"),
            },
            ReplCommand::Unload => match session.unload_model() {
                Ok(()) => eprintln!("model unloaded"),
                Err(e) => eprintln!("error: {e}"),
            },
            ReplCommand::Say(text) => match session.send_message(&text) {
                Ok(_) => stream_reply(&events, &mut stdout)?,
                Err(e) => eprintln!("error: {e}"),
            },
        }
        print_prompt(&mut stdout)?;
    }
    Ok(())
}

fn print_prompt(out: &mut impl Write) -> Result<()> {
    write!(out, "> ")?;
    out.flush()?;
    Ok(())
}

/// Print fragments as they arrive until the request ends.
fn stream_reply(events: &Receiver<StreamEvent>, out: &mut impl Write) -> Result<()> {
    for event in events.iter() {
        match event {
            StreamEvent::Started { prompt_tokens, .. } => debug!(prompt_tokens, "prompt decoded"),
            StreamEvent::TokenFragment(text) => {
                write!(out, "{text}")?;
                out.flush()?;
            }
            StreamEvent::Finished {
                token_count,
                duration_ms,
                ..
            }
            | StreamEvent::Stopped {
                token_count,
                duration_ms,
                ..
            } => {
                writeln!(out)?;
                debug!(token_count, duration_ms, "reply complete");
                return Ok(());
            }
            StreamEvent::Error(reason) => {
                eprintln!("error: {reason}");
                return Ok(());
            }
        }
    }
    Ok(())
}
