//! Forgeflow CLI entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration**: load `.forgeflow/config.toml` and validate it.
//! 2. **Wire observability**: JSON or pretty `tracing` output on stderr, plus
//!    an optional OpenTelemetry OTLP exporter.
//! 3. **Construct infrastructure**: the Anthropic completion provider and the
//!    generation client, injected into the engine's `Orchestrator`.
//! 4. **Run requests**: a single request (`run`) or JSON lines from stdin
//!    (`batch`). Ctrl-C times out every pending request and stops reading
//!    new ones; the runs still commit what they cost.

mod config;
mod telemetry;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use engine::Orchestrator;
use llm::{AnthropicConfig, AnthropicProvider, GenerationClientConfig, HttpGenerationClient};
use pipeline::{ModelName, PipelineRequest, PriceTable, RequestOutcome};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "forgeflow", version, about = "Run prompts through the Forgeflow agent pipeline")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, short, env = "FORGEFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single request and print its outcome as JSON.
    Run {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        caller: String,
        /// Spend cap for this request's admission, in USD.
        #[arg(long)]
        budget_usd: Option<f64>,
        /// Deadline for this request, in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Read one JSON request per line from stdin and print one outcome per line.
    Batch {
        /// Requests run at the same time.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let telemetry = telemetry::init(&config.telemetry)?;

    let orchestrator = Arc::new(build_orchestrator(&config)?);
    let interrupt = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling pending requests");
                orchestrator.shutdown();
            }
        })
    };

    let succeeded = match cli.command {
        Command::Run {
            prompt,
            caller,
            budget_usd,
            timeout_secs,
        } => {
            let request = PipelineRequest {
                prompt,
                caller_id: caller,
                budget_override: budget_usd,
                timeout_override_ms: timeout_secs.map(|s| s.saturating_mul(1_000)),
            };
            let outcome = orchestrator.handle(request).await;
            println!("{}", render(&outcome)?);
            outcome.is_ok()
        }
        Command::Batch { concurrency } => {
            let stdin = BufReader::new(tokio::io::stdin());
            run_batch(Arc::clone(&orchestrator), concurrency.max(1), stdin, |line| {
                println!("{line}")
            })
            .await?
        }
    };

    interrupt.abort();
    if orchestrator.is_shutting_down() {
        // A stdin read may still be parked on a blocking thread, which would
        // hold up runtime teardown.
        drop(telemetry);
        std::io::stdout().flush()?;
        std::process::exit(if succeeded { 0 } else { 1 });
    }
    drop(telemetry);
    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn build_orchestrator(config: &Config) -> anyhow::Result<Orchestrator> {
    let api_key = std::env::var(&config.completion.api_key_env).with_context(|| {
        format!(
            "completion API key not set (expected in ${})",
            config.completion.api_key_env
        )
    })?;
    let model = ModelName::new(config.completion.model.as_str())
        .context("completion.model must not be empty")?;
    let provider = AnthropicProvider::new(AnthropicConfig {
        api_key,
        model,
        base_url: config.completion.base_url.clone(),
        max_tokens: config.completion.max_tokens,
        request_timeout: Duration::from_secs(config.completion.request_timeout_secs),
    })?;
    let generator = HttpGenerationClient::new(GenerationClientConfig {
        base_url: config.generation.base_url.clone(),
        api_key: std::env::var(&config.generation.api_key_env).ok(),
        request_timeout: Duration::from_secs(config.generation.request_timeout_secs),
    })?;

    info!(
        model = %config.completion.model,
        generation = %config.generation.base_url,
        "providers ready"
    );
    Ok(Orchestrator::new(
        config.orchestrator()?,
        Arc::new(provider),
        Arc::new(generator),
        Arc::new(PriceTable::standard()),
    ))
}

/// Runs every request read from `input`, emitting each outcome as soon as its
/// request finishes. Reading stops at EOF or when shutdown begins. Returns
/// whether every request succeeded.
async fn run_batch<R, E>(
    orchestrator: Arc<Orchestrator>,
    concurrency: usize,
    input: R,
    mut emit: E,
) -> anyhow::Result<bool>
where
    R: AsyncBufRead + Unpin,
    E: FnMut(&str),
{
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut lines = input.lines();
    let mut tasks = JoinSet::new();
    let mut all_ok = true;
    let mut reading = true;

    while reading || !tasks.is_empty() {
        tokio::select! {
            _ = orchestrator.closed(), if reading => {
                info!(in_flight = tasks.len(), "shutdown requested; no further requests read");
                reading = false;
            }
            line = lines.next_line(), if reading => {
                let Some(line) = line? else {
                    reading = false;
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<PipelineRequest>(&line) {
                    Ok(request) => {
                        let orchestrator = Arc::clone(&orchestrator);
                        let permits = Arc::clone(&permits);
                        tasks.spawn(async move {
                            let _permit = permits.acquire_owned().await?;
                            Ok::<_, anyhow::Error>(orchestrator.handle(request).await)
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "skipping undecodable request line");
                        let error = json!({ "code": "VALIDATION_ERROR", "message": e.to_string() });
                        emit(&json!({ "status": "error", "error": error }).to_string());
                        all_ok = false;
                    }
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                let outcome = joined??;
                emit(&render(&outcome)?);
                all_ok &= outcome.is_ok();
            }
        }
    }
    Ok(all_ok)
}

fn render(outcome: &RequestOutcome) -> serde_json::Result<String> {
    let value = match outcome {
        Ok(response) => json!({ "status": "ok", "response": response }),
        Err(failure) => json!({ "status": "error", "error": failure }),
    };
    serde_json::to_string(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::mock::{
        happy_path_replies, mock_prices, sample_generation, MockCompletionProvider,
        MockGeneration, MockGenerationProvider,
    };
    use engine::OrchestratorConfig;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    fn orchestrator() -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(MockCompletionProvider::new(happy_path_replies())),
            Arc::new(MockGenerationProvider::new(vec![MockGeneration::Ok(
                sample_generation(0.05),
            )])),
            Arc::new(mock_prices()),
        ))
    }

    #[tokio::test]
    async fn batch_emits_each_outcome_before_input_ends() {
        let orchestrator = orchestrator();
        let (mut writer, reader) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let batch = tokio::spawn(run_batch(
            Arc::clone(&orchestrator),
            2,
            BufReader::new(reader),
            move |line| {
                let _ = tx.send(line.to_string());
            },
        ));

        writer
            .write_all(b"{\"prompt\":\"todo app\",\"callerId\":\"caller\"}\n")
            .await
            .unwrap();
        let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["status"], "ok");

        drop(writer);
        assert!(batch.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn batch_stops_reading_at_shutdown() {
        let orchestrator = orchestrator();
        let (_writer, reader) = tokio::io::duplex(1024);
        let batch = tokio::spawn(run_batch(
            Arc::clone(&orchestrator),
            2,
            BufReader::new(reader),
            |_| {},
        ));

        tokio::task::yield_now().await;
        orchestrator.shutdown();

        let finished = tokio::time::timeout(Duration::from_secs(5), batch).await;
        assert!(finished.unwrap().unwrap().unwrap());
    }
}
