use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use mrb_core::{DateRange, ReportModel};
use mrb_sync::{enrichment_envelope, report_markdown, Briefing, FetchOutcome, FetchSummary};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "mrb-cli")]
#[command(about = "Make-ready operations briefing")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one fetch cycle and print its summary.
    Fetch,
    /// Print the enrichment envelope as JSON.
    Enrich {
        #[arg(long)]
        pretty: bool,
    },
    /// Write a Markdown briefing for a month range.
    Brief {
        /// First month index of the timeline.
        #[arg(long)]
        start: Option<usize>,
        /// Last month index of the timeline.
        #[arg(long)]
        end: Option<usize>,
        /// Include every month.
        #[arg(long, conflicts_with_all = ["start", "end"])]
        all: bool,
        #[arg(long, short, default_value = "briefing.md")]
        output: PathBuf,
    },
    Serve,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "mrb=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Fetch => {
            let summary = mrb_sync::run_fetch_once_from_env().await?;
            print_summary(&summary);
        }
        Commands::Enrich { pretty } => {
            let briefing = Briefing::from_env()?;
            let Some(strategy) = &briefing.enrichment else {
                bail!("no upstream configured; set MRB_API_BASE_URL or MRB_FIXTURE_PATH");
            };
            let envelope = enrichment_envelope(strategy.as_ref()).await;
            let text = if pretty {
                serde_json::to_string_pretty(&envelope)?
            } else {
                serde_json::to_string(&envelope)?
            };
            println!("{text}");
        }
        Commands::Brief {
            start,
            end,
            all,
            output,
        } => {
            let briefing = Briefing::from_env()?;
            let started_at = Utc::now();
            let outcome = briefing.orchestrator().run_cycle().await;
            print_summary(&FetchSummary::from_outcome(&outcome, started_at));

            let model = ReportModel::new(outcome.tasks().to_vec());
            let window = if all {
                model.reset_window()
            } else {
                match (start, end, model.default_window(Local::now().date_naive())) {
                    (None, None, default) => default,
                    (start, end, default) => {
                        let base = default.or_else(|| model.reset_window());
                        base.and_then(|base| {
                            model.set_window(DateRange {
                                start: start.unwrap_or(base.start),
                                end: end.unwrap_or(base.end),
                            })
                        })
                    }
                }
            };
            let notice = match &outcome {
                FetchOutcome::Success { .. } => None,
                FetchOutcome::Degraded { .. } => Some(format!(
                    "Live data unavailable; showing the last known good briefing from {}.",
                    outcome.last_known_good().unwrap_or_default()
                )),
                FetchOutcome::Failed { error } => Some(format!("Briefing unavailable: {error}")),
            };
            let markdown = report_markdown(
                &model.window_view(window),
                Utc::now(),
                notice.as_deref(),
                &briefing.config,
            );
            std::fs::write(&output, markdown)
                .with_context(|| format!("writing {}", output.display()))?;
            info!(path = %output.display(), "briefing written");
            println!("briefing written: {}", output.display());
        }
        Commands::Serve => {
            mrb_web::serve_from_env().await?;
        }
    }

    Ok(())
}

fn print_summary(summary: &FetchSummary) {
    println!(
        "fetch {}: tasks={} strategy={} cached_at={}",
        summary.phase.as_str(),
        summary.tasks,
        summary.strategy.as_deref().unwrap_or("-"),
        summary.cached_at.as_deref().unwrap_or("-"),
    );
    if let Some(error) = &summary.error {
        eprintln!("error: {error}");
    }
}
