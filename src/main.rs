//! Vigil CLI entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::{mpsc, watch};

use vigil::agents::{
    AnalystAgent, CommanderAgent, ExecutorAgent, InvestigatorAgent, SentinelAgent,
    ThreatHunterAgent, TriageAgent, VerifierAgent,
};
use vigil::application::{AlertProcessor, AlertWatcher, Coordinator};
use vigil::domain::indices::agents;
use vigil::domain::ports::{Embedder, NullEmbedder, Store};
use vigil::infrastructure::config::{ConfigLoader, VigilConfig};
use vigil::infrastructure::store::MemoryStore;
use vigil::infrastructure::logging;
use vigil::services::bus::{AgentBus, AgentHandler, FnHandler};
use vigil::services::state_machine::{IncidentStateMachine, StateMachineConfig};
use vigil::services::tools::{ToolRegistry, ToolRegistryConfig};

#[derive(Parser)]
#[command(name = "vigil", about = "Autonomous incident-response orchestrator", version)]
struct Cli {
    /// Path to a configuration file (defaults to vigil.yaml + VIGIL_* env)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator: alert watcher, agents, analyst schedules
    Run,
    /// Tool catalog commands
    Tools {
        #[command(subcommand)]
        command: ToolCommands,
    },
    /// Validate the effective configuration and exit
    Check,
}

#[derive(Subcommand)]
enum ToolCommands {
    /// Load the tool directory and list tool ids
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };

    match cli.command {
        Commands::Check => {
            println!("configuration ok");
            Ok(())
        }
        Commands::Tools { command: ToolCommands::List } => {
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            let embedder: Arc<dyn Embedder> = Arc::new(NullEmbedder::default());
            let registry = ToolRegistry::from_dir(
                store,
                embedder,
                &config.tools.dir,
                ToolRegistryConfig::default(),
            )
            .context("failed to load tool definitions")?;
            for id in registry.ids() {
                println!("{id}");
            }
            Ok(())
        }
        Commands::Run => run(config).await,
    }
}

async fn run(config: VigilConfig) -> Result<()> {
    logging::init(&config.logging)?;

    // Demo/local backend; production deployments plug a real document
    // database into the Store port.
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let embedder: Arc<dyn Embedder> = Arc::new(NullEmbedder::default());
    let bus = Arc::new(AgentBus::new());

    let tools = Arc::new(
        ToolRegistry::from_dir(
            Arc::clone(&store),
            Arc::clone(&embedder),
            &config.tools.dir,
            ToolRegistryConfig {
                timeout: std::time::Duration::from_millis(config.tools.timeout_ms),
                retry: config.retry.policy(),
            },
        )
        .context("failed to load tool definitions")?,
    );

    let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();
    let state_machine = Arc::new(
        IncidentStateMachine::new(
            Arc::clone(&store),
            StateMachineConfig {
                suppress_threshold: config.triage.suppress_threshold,
                max_reflection_loops: config.coordinator.max_reflection_loops,
                occ_retries: 3,
            },
        )
        .with_terminal_hook(terminal_tx),
    );

    // Workers.
    bus.register(
        agents::TRIAGE,
        Arc::new(TriageAgent::new(
            Arc::clone(&tools),
            Arc::clone(&store),
            config.triage.clone(),
        )),
    )
    .await;
    bus.register(
        agents::INVESTIGATOR,
        Arc::new(InvestigatorAgent::new(
            Arc::clone(&tools),
            Arc::clone(&store),
            config.investigation.clone(),
        )),
    )
    .await;
    bus.register(
        agents::THREAT_HUNTER,
        Arc::new(ThreatHunterAgent::new(
            Arc::clone(&tools),
            config.sweep.clone(),
        )),
    )
    .await;
    bus.register(
        agents::COMMANDER,
        Arc::new(CommanderAgent::new(
            Arc::clone(&tools),
            config.planning.clone(),
        )),
    )
    .await;
    bus.register(
        agents::EXECUTOR,
        Arc::new(ExecutorAgent::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            config.executor.clone(),
        )),
    )
    .await;
    bus.register(
        agents::VERIFIER,
        Arc::new(VerifierAgent::new(
            Arc::clone(&bus),
            Arc::clone(&tools),
            config.verifier.clone(),
        )),
    )
    .await;
    bus.register(
        agents::SENTINEL,
        Arc::new(SentinelAgent::new(
            Arc::clone(&tools),
            Arc::clone(&store),
            Arc::clone(&bus),
            config.sentinel.clone(),
        )),
    )
    .await;

    // Effector endpoints are external; until they are bridged in, log and
    // acknowledge so local runs can exercise the full pipeline.
    for workflow in [
        agents::WF_CONTAINMENT,
        agents::WF_REMEDIATION,
        agents::WF_NOTIFY,
        agents::WF_TICKETING,
        agents::WF_APPROVAL,
        agents::WF_REPORTING,
    ] {
        bus.register(
            workflow,
            Arc::new(FnHandler(move |payload: serde_json::Value| async move {
                tracing::info!(workflow, payload = %payload, "effector invoked");
                Ok(json!({"status": "ok", "summary": "acknowledged"}))
            })),
        )
        .await;
    }

    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&state_machine),
        config.clone(),
    ));
    bus.register(
        agents::COORDINATOR,
        Arc::clone(&coordinator) as Arc<dyn AgentHandler>,
    )
    .await;

    // Analyst: terminal-event listener plus batch schedule.
    let analyst = Arc::new(AnalystAgent::new(
        Arc::clone(&store),
        Arc::clone(&embedder),
        config.analyst.clone(),
    ));
    bus.register(agents::ANALYST, Arc::clone(&analyst) as Arc<dyn AgentHandler>).await;
    let (stop_tx, stop_rx) = watch::channel(false);
    let listener = Arc::clone(&analyst).spawn_listener(terminal_rx, stop_rx.clone());
    let batch = Arc::clone(&analyst)
        .spawn_batch_schedule(stop_rx)
        .context("invalid analyst batch schedule")?;

    // Alert watcher.
    let watcher = Arc::new(AlertWatcher::new(
        Arc::clone(&store),
        Arc::clone(&coordinator) as Arc<dyn AlertProcessor>,
        config.watcher.clone(),
    ));
    let watcher_handle = Arc::clone(&watcher).start();

    tracing::info!("vigil running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal wait failed")?;
    tracing::info!("shutdown requested");

    watcher.stop();
    let _ = stop_tx.send(true);
    let _ = watcher_handle.await;
    listener.abort();
    batch.abort();
    Ok(())
}
