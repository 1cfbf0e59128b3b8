use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use stepflow::engine::{FileRunStore, HandlerRegistry};
use stepflow::prelude::*;
use stepflow::workflow::{CatalogBuilder, DefinitionLoader, StoreConfig};
#[cfg(feature = "otel")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(feature = "otel")]
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_STORE_DIR: &str = ".stepflow/runs";

#[derive(Parser)]
#[command(name = "stepflow")]
#[command(about = "Drive durable step workflows", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to engine.yaml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding persisted runs (overrides config)
    #[arg(short, long, global = true)]
    store_dir: Option<PathBuf>,

    /// Directory of extra workflow definitions, merged over the built-ins
    #[arg(short, long, global = true)]
    definitions: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List known workflow definitions
    Definitions,

    /// Validate workflow definition files without running them
    Validate {
        /// Path to a definition file or directory
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// Start a run and drive it until it finishes or pauses
    Start {
        /// Workflow type, e.g. ad_production or revision
        #[arg(value_name = "TYPE")]
        workflow_type: String,

        /// Owning project id
        #[arg(short, long)]
        project: String,

        /// Initial input as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Webhook URL notified on status changes
        #[arg(short, long)]
        webhook: Option<String>,
    },

    /// Show a run
    Status {
        #[arg(value_name = "RUN_ID")]
        run_id: String,
    },

    /// Show a run's log
    Logs {
        #[arg(value_name = "RUN_ID")]
        run_id: String,
    },

    /// List runs of a project
    List {
        /// Project id
        #[arg(short, long)]
        project: String,
    },

    /// Resume a run paused for human input
    Resume {
        #[arg(value_name = "RUN_ID")]
        run_id: String,

        /// Decision payload as a JSON object
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Retry a failed step
    Retry {
        #[arg(value_name = "RUN_ID")]
        run_id: String,

        #[arg(value_name = "STEP_ID")]
        step_id: String,
    },

    /// Cancel a run
    Cancel {
        #[arg(value_name = "RUN_ID")]
        run_id: String,
    },

    /// Re-drive runs left running by a previous process
    Recover,
}

#[cfg(feature = "otel")]
fn init_otel_tracing(verbose: bool) {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::runtime::Tokio;
    use opentelemetry_sdk::trace::TracerProvider;

    let filter = if verbose { "stepflow=debug" } else { "stepflow=info" };

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()
        .expect("Failed to create OTLP exporter");

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .build();

    let tracer = provider.tracer("stepflow");
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(otel_layer)
        .init();

    opentelemetry::global::set_tracer_provider(provider);
}

#[cfg(not(feature = "otel"))]
fn init_tracing(verbose: bool) {
    let filter = if verbose { "stepflow=debug" } else { "stepflow=info" };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    #[cfg(feature = "otel")]
    init_otel_tracing(cli.verbose);

    #[cfg(not(feature = "otel"))]
    init_tracing(cli.verbose);

    let result = run(cli).await;

    #[cfg(feature = "otel")]
    opentelemetry::global::shutdown_tracer_provider();

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    match &cli.command {
        Commands::Definitions => list_definitions(&cli),
        Commands::Validate { path } => validate(path),
        Commands::Start {
            workflow_type,
            project,
            input,
            webhook,
        } => {
            let engine = build_engine(&cli).await?;
            let input = parse_payload(input.as_deref())?;
            let run = engine
                .start_run(workflow_type, project, input, webhook.clone())
                .await?;
            settle(&engine, &run.id).await
        }
        Commands::Status { run_id } => {
            let engine = build_engine(&cli).await?;
            match engine.get_run(run_id).await? {
                Some(run) => {
                    print_json(&run)?;
                    Ok(true)
                }
                None => bail!("Run not found: {}", run_id),
            }
        }
        Commands::Logs { run_id } => {
            let engine = build_engine(&cli).await?;
            for entry in engine.run_logs(run_id).await? {
                println!(
                    "{} {:<5} {}",
                    entry.timestamp.to_rfc3339(),
                    format!("{:?}", entry.level).to_uppercase(),
                    entry.message
                );
            }
            Ok(true)
        }
        Commands::List { project } => {
            let engine = build_engine(&cli).await?;
            let runs = engine.list_runs(project).await?;
            if runs.is_empty() {
                println!("No runs for project {}", project);
            }
            for run in runs {
                println!(
                    "{}  {:<14} {:<14} {}",
                    run.id, run.workflow_type, run.status, run.current_state
                );
            }
            Ok(true)
        }
        Commands::Resume { run_id, output } => {
            let engine = build_engine(&cli).await?;
            let output = parse_payload(output.as_deref())?;
            engine.resume_run(run_id, output).await?;
            settle(&engine, run_id).await
        }
        Commands::Retry { run_id, step_id } => {
            let engine = build_engine(&cli).await?;
            engine.retry_step(run_id, step_id).await?;
            settle(&engine, run_id).await
        }
        Commands::Cancel { run_id } => {
            let engine = build_engine(&cli).await?;
            let run = engine.cancel_run(run_id).await?;
            engine.flush_notifications().await;
            print_json(&run)?;
            Ok(true)
        }
        Commands::Recover => {
            let engine = build_engine(&cli).await?;
            let ids = engine.recover().await?;
            println!("Recovering {} run(s)", ids.len());

            let mut all_ok = true;
            for id in &ids {
                engine.join(id).await;
                if let Some(run) = engine.get_run(id).await? {
                    println!("  {}  {}", run.id, run.status);
                    all_ok &= !matches!(run.status, RunStatus::Failed | RunStatus::Cancelled);
                }
            }
            engine.flush_notifications().await;
            Ok(all_ok)
        }
    }
}

fn load_catalog(cli: &Cli) -> anyhow::Result<WorkflowCatalog> {
    let mut builder = CatalogBuilder::new().with_builtin();
    if let Some(dir) = &cli.definitions {
        for definition in DefinitionLoader::load_directory(dir)? {
            builder = builder.replace(definition)?;
        }
    }
    Ok(builder.build())
}

async fn build_engine(cli: &Cli) -> anyhow::Result<Engine> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let store_dir = match (&cli.store_dir, &config.store) {
        (Some(dir), _) => dir.clone(),
        (None, StoreConfig::File { dir }) => dir.clone(),
        (None, StoreConfig::Memory) => PathBuf::from(DEFAULT_STORE_DIR),
    };
    let store = FileRunStore::open(&store_dir)
        .await
        .with_context(|| format!("opening run store {}", store_dir.display()))?;

    let engine = Engine::builder()
        .catalog(load_catalog(cli)?)
        .handlers(HandlerRegistry::with_builtin_handlers())
        .store(Arc::new(store))
        .config(config)
        .build()
        .await?;
    Ok(engine)
}

/// Wait for the driver, print the run, report whether it ended well
async fn settle(engine: &Engine, run_id: &str) -> anyhow::Result<bool> {
    engine.join(run_id).await;
    engine.flush_notifications().await;
    let run = engine
        .get_run(run_id)
        .await?
        .with_context(|| format!("run {} disappeared from the store", run_id))?;
    print_json(&run)?;
    Ok(!matches!(run.status, RunStatus::Failed | RunStatus::Cancelled))
}

fn parse_payload(raw: Option<&str>) -> anyhow::Result<Payload> {
    let Some(raw) = raw else {
        return Ok(Payload::new());
    };
    match serde_json::from_str(raw).context("parsing JSON payload")? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("payload must be a JSON object, got {}", other),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn list_definitions(cli: &Cli) -> anyhow::Result<bool> {
    let catalog = load_catalog(cli)?;
    for definition in catalog.definitions() {
        println!("{} ({} steps)", definition.workflow_type, definition.steps.len());
        for (idx, step) in definition.steps.iter().enumerate() {
            let deps = if step.depends_on.is_empty() {
                String::new()
            } else {
                format!(" <- {}", step.depends_on.join(", "))
            };
            println!(
                "  {}. {} [{} / {}]{}",
                idx + 1,
                step.name,
                step.step_type,
                step.handler_name,
                deps
            );
        }
    }
    Ok(true)
}

fn validate(path: &Path) -> anyhow::Result<bool> {
    let definitions = if path.is_dir() {
        DefinitionLoader::load_directory(path)?
    } else {
        vec![DefinitionLoader::load_file(path)?]
    };

    let handlers = HandlerRegistry::with_builtin_handlers();
    let mut all_valid = true;

    for definition in &definitions {
        match definition.validate() {
            Ok(()) => {
                println!("✓ {} ({} steps)", definition.workflow_type, definition.steps.len());
                for name in definition.handler_names() {
                    if !handlers.contains(name) {
                        println!("  ! handler '{}' is not built in; register it before running", name);
                    }
                }
            }
            Err(e) => {
                println!("✗ {}: {}", definition.workflow_type, e);
                all_valid = false;
            }
        }
    }

    if definitions.is_empty() {
        println!("No workflow definitions found in {}", path.display());
    }
    Ok(all_valid)
}
