//! # docflow CLI
//!
//! The `docflow` binary serves the HTTP entry points and runs each pipeline
//! stage by hand.
//!
//! ## Usage
//!
//! ```bash
//! docflow --config ./config/docflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docflow serve` | Validate configuration and start the HTTP server |
//! | `docflow dispatch <project>` | Expand a trigger and publish work items |
//! | `docflow process <FILE\|->` | Process one work item |
//! | `docflow finalize <project>` | Run the completion check once |
//! | `docflow status <project>` | Show finalization state and missing documents |
//! | `docflow run <project>` | Process a whole project locally |
//! | `docflow completions <shell>` | Print a shell completion script |
//!
//! ## Examples
//!
//! ```bash
//! # Preview the work items for two documents
//! docflow dispatch P1 --document a.pdf --document b.pdf --dry-run
//!
//! # Process a project end to end on this machine
//! docflow run P1 --concurrency 8
//! ```

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};

use docflow::config::{self, Config};
use docflow::finalize::{FinalizationState, FinalizeOutcome, StatusReport};
use docflow::models::{TriggerMessage, TriggerType, WorkItem};
use docflow::observability::{init_logging, LogFormat};
use docflow::pipeline::Pipeline;
use docflow::runner::LocalRunner;
use docflow::server;

/// docflow: queue-driven document analysis with completion tracking.
///
/// Every command reads a TOML file (`--config`) and then the environment,
/// which overrides file values.
#[derive(Parser)]
#[command(name = "docflow", version, about = "Queue-driven document analysis coordinator")]
struct Cli {
    /// Path to the configuration file (TOML). Optional; the environment can
    /// supply every value.
    #[arg(long, global = true, default_value = "./config/docflow.toml")]
    config: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server on `server.bind`.
    Serve,

    /// Expand a trigger and publish its work items to the process queue.
    ///
    /// Without `--document` every raw document of the project is dispatched.
    Dispatch {
        project: String,

        /// Document to dispatch (repeatable). Bare names, partial paths and
        /// full paths are accepted.
        #[arg(long = "document")]
        documents: Vec<String>,

        /// Model override.
        #[arg(long)]
        model: Option<String>,

        /// Print the work items instead of publishing them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Process one work item read from a file, or stdin with `-`.
    Process { input: String },

    /// Run the completion check once.
    Finalize { project: String },

    /// Show finalization state and missing documents.
    Status { project: String },

    /// Dispatch and process a whole project in this process.
    Run {
        project: String,

        /// Maximum concurrent work items (defaults to `runner.concurrency`).
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Print a shell completion script.
    Completions { shell: clap_complete::Shell },
}

fn build_trigger(
    project: &str,
    documents: Vec<String>,
    model: Option<String>,
) -> anyhow::Result<TriggerMessage> {
    let trigger_type = if documents.is_empty() {
        TriggerType::Project
    } else {
        TriggerType::Document
    };
    let mut trigger = TriggerMessage::new(project, trigger_type)?.with_documents(documents);
    trigger.model = model.filter(|m| !m.trim().is_empty());
    Ok(trigger)
}

fn read_input(input: &str) -> anyhow::Result<Vec<u8>> {
    if input == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("failed to read work item from stdin")?;
        Ok(buf)
    } else {
        std::fs::read(input).with_context(|| format!("failed to read work item file {}", input))
    }
}

fn print_status(report: &StatusReport) {
    let state = match &report.state {
        FinalizationState::NotReady => "not_ready".to_string(),
        FinalizationState::Done => "done".to_string(),
        FinalizationState::InProgress { owner, .. } => format!(
            "in_progress (owner: {}, age: {})",
            owner.as_deref().unwrap_or("unknown"),
            report
                .lock_age_secs
                .map(|s| format!("{}s", s))
                .unwrap_or_else(|| "unknown".into())
        ),
    };
    println!("project:   {}", report.project_id);
    println!("state:     {}", state);
    println!("raw:       {}", report.raw_documents);
    println!("results:   {}", report.results);
    if report.missing.is_empty() {
        println!("missing:   none");
    } else {
        println!("missing:   {}", report.missing.len());
        for stem in &report.missing {
            println!("  - {}", stem);
        }
    }
}

fn print_outcome(project: &str, outcome: &FinalizeOutcome) {
    println!("project: {}", project);
    println!("outcome: {}", outcome.as_str());
    match outcome {
        FinalizeOutcome::Pending { missing, requeued } => {
            println!("missing: {} (requeued {})", missing.join(", "), requeued);
        }
        FinalizeOutcome::AggregationFailed(error) => println!("error:   {}", error),
        _ => {}
    }
}

fn pipeline(cfg: Config) -> anyhow::Result<Pipeline> {
    Pipeline::from_config(cfg).context("failed to initialize pipeline")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "docflow", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)
        .with_context(|| format!("invalid configuration ({})", cli.config.display()))?;

    match cli.command {
        Commands::Serve => {
            let pipeline = Arc::new(pipeline(cfg)?);
            server::run_server(pipeline).await?;
        }
        Commands::Dispatch {
            project,
            documents,
            model,
            dry_run,
        } => {
            let pipeline = pipeline(cfg)?;
            let trigger = build_trigger(&project, documents, model)?;
            if dry_run {
                let items = pipeline.plan(&trigger).await?;
                println!("dry-run: {} work item(s)", items.len());
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                let summary = pipeline.handle_trigger(&trigger).await?;
                println!(
                    "dispatched {} work item(s) for project {} to {}",
                    summary.tasks_sent,
                    summary.project_id,
                    pipeline.config().queue.process_queue
                );
            }
        }
        Commands::Process { input } => {
            let pipeline = pipeline(cfg)?;
            let item = WorkItem::from_json(&read_input(&input)?)?;
            let result = pipeline.handle_work_item(&item).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Finalize { project } => {
            let pipeline = pipeline(cfg)?;
            let outcome = pipeline.finalize(&project).await?;
            print_outcome(&project, &outcome);
        }
        Commands::Status { project } => {
            let pipeline = pipeline(cfg)?;
            print_status(&pipeline.status(&project).await?);
        }
        Commands::Run {
            project,
            concurrency,
        } => {
            let concurrency = concurrency.unwrap_or(cfg.runner.concurrency);
            let runner = LocalRunner::from_config(cfg)
                .context("failed to initialize local runner")?
                .with_concurrency(concurrency);
            let trigger = build_trigger(&project, Vec::new(), None)?;
            let summary = runner.run(&trigger).await?;
            println!("dispatched: {}", summary.dispatched);
            println!("processed:  {}", summary.processed);
            println!("rounds:     {}", summary.rounds);
            if !summary.failed.is_empty() {
                println!("failed:     {}", summary.failed.len());
                for (document, error) in &summary.failed {
                    println!("  - {}: {}", document, error);
                }
            }
            print_status(&summary.status);
        }
        Commands::Completions { .. } => unreachable!(),
    }

    Ok(())
}
