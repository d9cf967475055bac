#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use grouping_grader::dataset::load_responses;
use grouping_grader::gateway::completions::CompletionsAdapter;
use grouping_grader::gateway::{
    ChatModel, GatewayConfig, Provider, ProviderGateway, TracingUsageSink,
};
use grouping_grader::grading::{
    grade_batch_with_trace, interpret_reply, validate_batch, GradedTask, GradingOptions,
    GroupingTask, JsonlTraceSink, TraceSink, GRADING_TEMPERATURE,
};
use grouping_grader::prompts::render_batch;

#[derive(Parser)]
#[command(name = "grader", version, about = "Grade numeric feature groupings with an LLM")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the system instruction and user prompt for a tasks file (no network)
    Prompt {
        #[arg(long)]
        tasks: PathBuf,
    },
    /// Parse a saved reply against a tasks file and print the graded tasks as JSON
    Parse {
        #[arg(long)]
        reply: PathBuf,
        #[arg(long)]
        tasks: PathBuf,
    },
    /// Grade one batch per tasks file with a live completion call
    Grade {
        /// JSON array of tasks; each file is one batch
        #[arg(long, required = true, num_args = 1..)]
        tasks: Vec<PathBuf>,
        #[arg(long, value_parser = parse_provider, default_value = "openai")]
        provider: Provider,
        /// Model id; defaults to the provider's default model
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        out: PathBuf,
        /// Batches in flight at once
        #[arg(long, default_value_t = 1)]
        parallel: usize,
        #[arg(long)]
        trace: Option<PathBuf>,
        #[arg(long, default_value_t = GRADING_TEMPERATURE)]
        temperature: f32,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long, default_value_t = 2)]
        max_retries: u32,
    },
    /// Inter-rater agreement and model-vs-respondent comparison
    Agreement {
        /// CSV: index column, respondent id, one column per question
        #[arg(long)]
        responses: PathBuf,
        /// Model grades as name=g1,g2,...; repeatable
        #[arg(long, value_parser = parse_ranking)]
        ranking: Vec<(String, Vec<f64>)>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn parse_provider(s: &str) -> Result<Provider, String> {
    Provider::parse(s).ok_or_else(|| format!("unknown provider {s:?} (openai, perplexity, openrouter)"))
}

fn parse_ranking(s: &str) -> Result<(String, Vec<f64>), String> {
    let (name, values) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=g1,g2,..., got {s:?}"))?;
    let grades = values
        .split(',')
        .map(|v| {
            v.trim()
                .parse::<f64>()
                .map_err(|e| format!("ranking {name:?}: {v:?}: {e}"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if grades.is_empty() {
        return Err(format!("ranking {name:?} is empty"));
    }
    Ok((name.trim().to_string(), grades))
}

fn load_tasks(path: &Path) -> Result<Vec<GroupingTask>, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    let tasks: Vec<GroupingTask> = serde_json::from_str(&raw)
        .map_err(|e| format!("{}: {e}", path.display()))?;
    Ok(tasks)
}

#[derive(Serialize)]
struct GradeLine<'a> {
    source: String,
    task_number: usize,
    #[serde(flatten)]
    graded: &'a GradedTask,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Prompt { tasks } => {
            let tasks = load_tasks(&tasks)?;
            validate_batch(&tasks)?;
            let prompt = render_batch(&tasks);
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{}\n\n{}", prompt.system, prompt.user)?;
        }
        Commands::Parse { reply, tasks } => {
            let tasks = load_tasks(&tasks)?;
            let raw = std::fs::read_to_string(reply)?;
            let graded = interpret_reply(&tasks, &raw)?;
            println!("{}", serde_json::to_string_pretty(&graded)?);
        }
        Commands::Grade {
            tasks,
            provider,
            model,
            out,
            parallel,
            trace,
            temperature,
            max_tokens,
            max_retries,
        } => {
            if parallel == 0 {
                return Err("--parallel must be >= 1".into());
            }

            let batches = tasks
                .iter()
                .map(|path| load_tasks(path).map(|t| (path.display().to_string(), t)))
                .collect::<Result<Vec<_>, _>>()?;

            let config = GatewayConfig {
                max_retries,
                ..GatewayConfig::default()
            };
            let gateway = ProviderGateway::with_config(
                CompletionsAdapter::from_env(provider)?,
                Arc::new(TracingUsageSink),
                config,
            );

            let model = model
                .map(|id| ChatModel::new(provider, id))
                .unwrap_or_else(|| ChatModel::default_for(provider));
            let mut options = GradingOptions::for_model(model).with_temperature(temperature);
            if let Some(max) = max_tokens {
                options = options.with_max_output_tokens(max);
            }

            let (trace_sink, trace_worker) = match trace {
                Some(path) => {
                    let (sink, worker) = JsonlTraceSink::new(path)?;
                    (Some(sink), Some(worker))
                }
                None => (None, None),
            };

            let outcomes = {
                let gateway = &gateway;
                let options = &options;
                let trace_ref = trace_sink.as_ref().map(|s| s as &dyn TraceSink);
                stream::iter(batches)
                    .map(|(source, batch)| async move {
                        let outcome =
                            grade_batch_with_trace(gateway, &batch, options, trace_ref).await;
                        (source, outcome)
                    })
                    .buffered(parallel)
                    .collect::<Vec<_>>()
                    .await
            };

            drop(trace_sink);
            if let Some(worker) = trace_worker {
                worker.join()?;
            }

            let mut writer = BufWriter::new(File::create(out)?);
            let mut failed = 0usize;
            for (source, outcome) in outcomes {
                match outcome {
                    Ok(batch) => {
                        for (idx, graded) in batch.results.iter().enumerate() {
                            let line = GradeLine {
                                source: source.clone(),
                                task_number: idx + 1,
                                graded,
                            };
                            writeln!(writer, "{}", serde_json::to_string(&line)?)?;
                        }
                    }
                    Err(err) => {
                        failed += 1;
                        eprintln!("{source}: [{}] {err}", err.code());
                    }
                }
            }
            writer.flush()?;

            if failed > 0 {
                return Err(format!("{failed} batch(es) failed").into());
            }
        }
        Commands::Agreement {
            responses,
            ranking,
            out,
        } => {
            let table = load_responses(&responses)?;
            let report = table.agreement(&ranking)?;
            let json = serde_json::to_string_pretty(&report)?;
            match out {
                Some(path) => std::fs::write(path, json)?,
                None => println!("{json}"),
            }
        }
    }

    Ok(())
}
