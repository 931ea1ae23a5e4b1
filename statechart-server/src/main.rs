use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use statechart_core::mailbox::Capacity;
use statechart_core::orchestrator::{Orchestrator, RegisterPolicy};
use statechart_core::registry::ActionGuardRegistry;
use statechart_core::{parse_definition, Event, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const DEFAULT_MAILBOX_CAPACITY: Capacity = Capacity::Unbounded;
const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 256;

/// A registry with the handful of actions/guards demo definitions commonly
/// reference. Real deployments link their own handlers in; this binary's job
/// is driving the bus interactively, not authoring business logic.
fn demo_registry() -> ActionGuardRegistry {
    ActionGuardRegistry::new()
        .with_action("log", |ctx, event| {
            tracing::info!(event = %event.name, ?event.payload, context = ?ctx.flags(), "action: log");
            Ok(())
        })
        .with_guard("always", |_ctx, _event| true)
        .with_guard("never", |_ctx, _event| false)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let mut args = std::env::args().skip(1);
    let mut bind: Option<String> = None;
    let mut definition_paths = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--bind" => {
                bind = args.next();
            }
            other => definition_paths.push(PathBuf::from(other)),
        }
    }
    if bind.is_some() {
        tracing::warn!("--bind is reserved for a future wire transport; this binary only drives the bus via stdin");
    }
    if definition_paths.is_empty() {
        return Err(anyhow!("usage: statechart-server <definition.json> [more.json ...]"));
    }

    let orchestrator = Orchestrator::new();
    let registry = Arc::new(demo_registry());

    for path in &definition_paths {
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("could not derive a machine id from {}", path.display()))?
            .to_string();
        let json = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let definition = Arc::new(parse_definition(&json).with_context(|| format!("parsing {}", path.display()))?);
        let interpreter = orchestrator
            .register(id.clone(), definition, registry.clone(), RegisterPolicy::RejectDuplicate, DEFAULT_MAILBOX_CAPACITY, DEFAULT_DIAGNOSTICS_CAPACITY)
            .await
            .map_err(|e| anyhow!("registering {id}: {e}"))?;
        let state = interpreter.start().await.map_err(|e| anyhow!("starting {id}: {e}"))?;
        tracing::info!(machine = %id, %state, "registered and started");
    }

    println!("statechart-server ready. Commands: send <machine> <event> [json-payload] | state <machine> | quit");

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match run_command(&orchestrator, line).await {
            Ok(Some(output)) => println!("{output}"),
            Ok(None) => break,
            Err(e) => eprintln!("error: {e}"),
        }
    }

    orchestrator.shutdown_all().await;
    Ok(())
}

/// Runs one REPL line. `Ok(None)` signals the caller should exit the loop.
async fn run_command(orchestrator: &Orchestrator, line: &str) -> Result<Option<String>> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim();

    match verb {
        "quit" | "exit" => Ok(None),
        "state" => {
            let id = rest;
            if id.is_empty() {
                return Err(anyhow!("usage: state <machine>"));
            }
            let interpreter = orchestrator.interpreter(id).await.ok_or_else(|| anyhow!("no machine registered under id: {id}"))?;
            let snapshot = interpreter.query_snapshot().await.map_err(|e| anyhow!("{e}"))?;
            Ok(Some(format!("{} context={:?}", snapshot.state_string, snapshot.context_data)))
        }
        "send" => {
            let mut tokens = rest.splitn(3, char::is_whitespace);
            let machine = tokens.next().unwrap_or_default();
            let event_name = tokens.next().unwrap_or_default();
            let payload_json = tokens.next().unwrap_or("null");
            if machine.is_empty() || event_name.is_empty() {
                return Err(anyhow!("usage: send <machine> <event> [json-payload]"));
            }
            let payload: serde_json::Value = serde_json::from_str(payload_json).context("parsing json-payload")?;
            orchestrator.publish(machine, Event::new(event_name, Value::from(payload))).await.map_err(|e| anyhow!("{e}"))?;
            Ok(Some(format!("sent {event_name} to {machine}")))
        }
        other => Err(anyhow!("unknown command: {other}")),
    }
}
