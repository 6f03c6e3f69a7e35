//! clude CLI — a thin wrapper around one orchestrator turn.
//!
//! Reads an instruction, runs the loop, prints the final answer, and maps
//! the stop reason to an exit code. Confirmation requests are answered on
//! stdin in supervised mode, or auto-approved otherwise.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use clude_core::agent::{EventKind, TurnEvent, TurnInput};
use clude_core::{build_session, CoreConfig};

#[derive(Parser, Debug)]
#[command(name = "clude", about = "A local-first code agent", version)]
struct Args {
    /// The instruction to run. Reads stdin when omitted.
    instruction: Vec<String>,

    /// Workspace root (defaults to WORKSPACE_ROOT or the current directory).
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Chat-completion endpoint.
    #[arg(long)]
    base_url: Option<String>,

    /// Model id sent with every request.
    #[arg(long)]
    model: Option<String>,

    /// Ask on stdin before side-effecting tools run (default: auto-approve).
    #[arg(long)]
    supervised: bool,

    /// Print every event to stderr.
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let args = Args::parse();

    let default_level = if CoreConfig::debug_enabled() || args.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with_writer(std::io::stderr)
        .init();

    let instruction = if args.instruction.is_empty() {
        let mut buffer = String::new();
        std::io::stdin().lock().read_line(&mut buffer)?;
        buffer.trim().to_string()
    } else {
        args.instruction.join(" ")
    };
    if instruction.is_empty() {
        anyhow::bail!("no instruction given");
    }

    let mut config = CoreConfig::from_env();
    if let Some(workspace) = args.workspace {
        config.workspace_root = workspace.canonicalize()?;
    }
    if let Some(base_url) = args.base_url {
        config.llm_base_url = base_url;
    }
    if let Some(model) = args.model {
        config.model = model;
    }

    let session_id = format!("cli-{}", std::process::id());
    let session = build_session(config, session_id)?;
    let mut orchestrator = session.orchestrator;

    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<TurnInput>();
    let cancel = CancellationToken::new();

    // Ctrl-C cancels the turn.
    {
        let cancel = cancel.clone();
        let input_tx = input_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ncancelling...");
                cancel.cancel();
                let _ = input_tx.send(TurnInput::Cancel);
            }
        });
    }

    // Event consumer: progress lines + confirmation prompts.
    let events = orchestrator.bus().subscribe();
    let supervised = args.supervised;
    let verbose = args.verbose;
    let consumer = tokio::spawn(consume_events(events, input_tx, supervised, verbose));

    let outcome = orchestrator.run_turn(&instruction, &mut input_rx, cancel).await;

    println!("{}", outcome.final_text);
    consumer.abort();
    drop(session.recorders);

    Ok(outcome.stop_reason.exit_code())
}

async fn consume_events(
    mut events: mpsc::UnboundedReceiver<TurnEvent>,
    input_tx: mpsc::UnboundedSender<TurnInput>,
    supervised: bool,
    verbose: bool,
) {
    while let Some(event) = events.recv().await {
        if verbose {
            eprintln!(
                "[{}] {}",
                serde_json::to_string(&event.kind).unwrap_or_default(),
                event.payload
            );
        }
        match event.kind {
            EventKind::ToolConfirm => {
                let call_id = event.payload["call_id"].as_str().unwrap_or("").to_string();
                let tool = event.payload["tool"].as_str().unwrap_or("?");
                let approved = if supervised {
                    prompt_yes_no(&format!(
                        "allow {} with args {}? [y/N] ",
                        tool, event.payload["args"]
                    ))
                } else {
                    eprintln!("auto-approving {}", tool);
                    true
                };
                let _ = input_tx.send(TurnInput::Confirmation { call_id, approved });
            }
            EventKind::PolicyDeny => {
                eprintln!("policy denied: {}", event.payload["reason"]);
            }
            EventKind::PlanGenerated => {
                eprintln!(
                    "plan: {} ({} steps)",
                    event.payload["title"], event.payload["steps"]
                );
            }
            EventKind::PlanStepStart => {
                if let Some(step) = event.step_id.as_deref() {
                    eprintln!("step {}: {}", step, event.payload["description"]);
                }
            }
            _ => {}
        }
    }
}

fn prompt_yes_no(question: &str) -> bool {
    eprint!("{}", question);
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
