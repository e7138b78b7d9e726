use clap::{Parser, Subcommand};
use bpmnflow::compiler::core::Compiler;
use bpmnflow::compiler::loader::load_process_from_yaml;
use bpmnflow::handlers::HandlerRegistry;
use bpmnflow::runtime::event::ProcessEvent;
use bpmnflow::runtime::graph::NodeKind;
use bpmnflow::runtime::replay::ReplayJournal;
use bpmnflow::runtime::{EngineConfig, ExecutionSession, SessionStatus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context as _, Result, bail};
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a process definition to completion and print its events
    Run {
        /// Path to the process YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// Initial variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, serde_json::Value)>,

        /// Engine configuration YAML (retry policy, timeouts)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Broadcast a signal after a delay (name@delay_ms)
        #[arg(long, value_parser = parse_signal)]
        signal: Vec<(String, u64)>,

        /// Event log (JSON lines) of an earlier run to resume from
        #[arg(long)]
        replay: Option<PathBuf>,
    },

    /// Compile a process definition and check its handlers
    Validate {
        #[arg(long, short)]
        file: PathBuf,
    },
}

fn parse_key_val(s: &str) -> Result<(String, serde_json::Value), String> {
    let pos = s.find('=').ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // Try parsing as JSON, otherwise treat as string
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| serde_json::Value::String(val_str.to_string()));
    Ok((key, val))
}

fn parse_signal(s: &str) -> Result<(String, u64), String> {
    match s.split_once('@') {
        Some((name, delay)) => {
            let delay = delay.parse().map_err(|_| format!("invalid delay in `{}`", s))?;
            Ok((name.to_string(), delay))
        }
        None => Ok((s.to_string(), 0)),
    }
}

fn read_event_log(path: &Path) -> Result<Vec<ProcessEvent>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read event log: {}", path.display()))?;
    content.lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(n, line)| serde_json::from_str::<ProcessEvent>(line).with_context(|| format!("Bad event on line {}", n + 1)))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let cli = Cli::parse();
    let registry = Arc::new(HandlerRegistry::with_builtins());

    match cli.command {
        Commands::Run { file, vars, config, signal, replay } => {
            let config = match config {
                Some(path) => EngineConfig::from_yaml_file(path)?,
                None => EngineConfig::default(),
            };
            let process = load_process_from_yaml(&file)?;
            let mut session = ExecutionSession::from_process(process, registry, config)?
                .with_variables(vars.into_iter().collect::<HashMap<_, _>>());
            if let Some(path) = replay {
                let journal = ReplayJournal::from_events(&read_event_log(&path)?);
                session = session.with_replay(journal);
            }

            let handle = session.handle();
            for (name, delay_ms) in signal {
                let handle = handle.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    match handle.broadcast_signal(&name).await {
                        Ok(fired) => info!(signal = %name, fired, "Signal sent"),
                        Err(e) => warn!(signal = %name, error = %e, "Signal not delivered"),
                    }
                });
            }

            info!(session_id = %session.id(), file = %file.display(), "Running process");
            let report = session.run().await;
            for event in &report.events {
                println!("{}", serde_json::to_string(event)?);
            }
            info!(status = ?report.status, events = report.events.len(), "Process finished");
            if report.status == SessionStatus::Failed {
                bail!("process failed");
            }
        }

        Commands::Validate { file } => {
            let process = load_process_from_yaml(&file)?;
            let graph = Arc::new(Compiler::new().compile(process)?);
            let tasks = graph.nodes().filter(|n| matches!(n.kind, NodeKind::Task(_))).count();
            let boundaries = graph.nodes().filter(|n| matches!(n.kind, NodeKind::Boundary(_))).count();
            ExecutionSession::new(graph.clone(), registry, EngineConfig::default())?;
            println!(
                "{}: ok ({} nodes, {} flows, {} tasks, {} boundaries)",
                graph.id, graph.node_count(), graph.edge_count(), tasks, boundaries,
            );
        }
    }

    Ok(())
}
