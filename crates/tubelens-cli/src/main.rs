//! tubelens - stream AI metadata and analytics reports from the terminal

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crossterm::style::Stylize;
use serde_json::Value;
use std::io::{IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tubelens_core::{AnalysisKind, AnalysisRequest, Config, SessionOutcome, StreamConsumer};

mod render;

use render::ProgressRenderer;

const EXIT_FAILED: u8 = 1;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "tubelens")]
#[command(about = "Stream AI analysis of your videos and channel analytics", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one analysis and stream its progress
    Analyze(AnalyzeArgs),
    /// List the pipeline stages of an analysis kind
    Stages {
        #[arg(long, default_value = "metadata")]
        kind: AnalysisKind,
    },
}

#[derive(Args)]
struct AnalyzeArgs {
    /// metadata or insights
    #[arg(long, default_value = "metadata")]
    kind: AnalysisKind,

    /// Sets `modelType` in the request body
    #[arg(long)]
    model: Option<String>,

    /// JSON request body, `-` for stdin (default: empty object)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Overrides the configured server URL
    #[arg(long)]
    base_url: Option<String>,

    /// Config file (default: ~/.config/tubelens/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the full result as JSON
    #[arg(long)]
    json: bool,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tubelens=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Analyze(args) => analyze(args).await,
        Commands::Stages { kind } => {
            print_stages(kind);
            Ok(ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn analyze(args: AnalyzeArgs) -> Result<ExitCode> {
    let mut config = Config::load(args.config.as_deref())?;
    config.apply_base_url_override(args.base_url);

    let mut request = AnalysisRequest::from_value(read_payload(args.input.as_deref())?);
    if let Some(model) = args.model {
        request = request.with_field("modelType", model);
    }

    let mut consumer = StreamConsumer::from_config(&config, args.kind)
        .with_context(|| format!("Cannot set up {} analysis", args.kind))?;
    info!("Starting {} analysis against {}", args.kind, config.base_url);

    let mut handle = consumer.start(request);
    let cancellation = handle.cancellation();

    let color = std::io::stderr().is_terminal();
    let mut updates = WatchStream::new(handle.subscribe());
    let render_task = tokio::spawn(async move {
        let mut renderer = ProgressRenderer::new(std::io::stderr(), color);
        while let Some(state) = updates.next().await {
            if let Err(e) = renderer.render(&state) {
                debug!("Progress output failed: {}", e);
                break;
            }
        }
    });

    let outcome = tokio::select! {
        outcome = handle.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            cancellation.cancel();
            SessionOutcome::Cancelled
        }
    };

    // Closing the state channel ends the render task once it has drawn the last snapshot
    drop(consumer);
    drop(cancellation);
    drop(handle);
    let _ = render_task.await;

    match outcome {
        SessionOutcome::Completed(result) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", result.text);
            }
            Ok(ExitCode::SUCCESS)
        }
        SessionOutcome::Failed(message) => {
            let label = if color {
                "Analysis failed:".red().to_string()
            } else {
                "Analysis failed:".to_string()
            };
            eprintln!("{} {}", label, message);
            Ok(ExitCode::from(EXIT_FAILED))
        }
        SessionOutcome::Cancelled => {
            info!("Analysis cancelled");
            Ok(ExitCode::from(EXIT_CANCELLED))
        }
    }
}

/// Request body from a file, stdin (`-`), or an empty object
fn read_payload(input: Option<&Path>) -> Result<Value> {
    let Some(path) = input else {
        return Ok(Value::Object(Default::default()));
    };

    let content = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read request body from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
    };

    serde_json::from_str(&content).context("Request body is not valid JSON")
}

fn print_stages(kind: AnalysisKind) {
    println!("{} stages:", kind);
    for (idx, stage) in kind.stages().iter().enumerate() {
        println!(
            "  {}. {:<8} {:<22} {}",
            idx + 1,
            stage.id,
            stage.label,
            stage.description
        );
    }
}
