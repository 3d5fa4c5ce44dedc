use std::sync::Arc;

use anyhow::Context;
use docmirror_core::DocsClient;
use docmirrord::config::{PerformanceMode, SyncConfig};
use docmirrord::sync::store::MirrorStore;
use docmirrord::sync::{SyncOptions, SyncOrchestrator};
use docmirrord::token_provider::TokenProvider;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const DEFAULT_HISTORY_LIMIT: u32 = 20;

const USAGE: &str = "\
Usage:
  docmirrord full <project-id> [--max-depth N] [--no-attrs] [--performance-mode MODE]
  docmirrord incremental <project-id> [--max-depth N] [--no-attrs] [--performance-mode MODE]
  docmirrord status <task-uuid>
  docmirrord history <project-id> [--limit N]
  docmirrord --help

MODE is one of standard, high_performance, memory_optimized.";

#[derive(Debug, Clone, PartialEq, Eq)]
struct RunArgs {
    project_id: String,
    options: SyncOptions,
    performance_mode: Option<PerformanceMode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliCommand {
    Full(RunArgs),
    Incremental(RunArgs),
    Status { task_uuid: Uuid },
    History { project_id: String, limit: u32 },
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(CliCommand::Help);
    };
    match command.as_str() {
        "--help" | "-h" | "help" => Ok(CliCommand::Help),
        "full" | "incremental" => {
            let project_id = args.next().context("missing <project-id>")?;
            let mut run = RunArgs {
                project_id,
                options: SyncOptions::default(),
                performance_mode: None,
            };
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--max-depth" => {
                        let value = args.next().context("--max-depth needs a value")?;
                        run.options.max_depth = Some(
                            value
                                .parse()
                                .with_context(|| format!("invalid --max-depth: {value}"))?,
                        );
                    }
                    "--no-attrs" => run.options.include_attrs = Some(false),
                    "--performance-mode" => {
                        let value = args.next().context("--performance-mode needs a value")?;
                        run.performance_mode = Some(
                            PerformanceMode::parse(&value)
                                .with_context(|| format!("invalid --performance-mode: {value}"))?,
                        );
                    }
                    other => anyhow::bail!("unknown argument: {other}"),
                }
            }
            Ok(if command == "full" {
                CliCommand::Full(run)
            } else {
                CliCommand::Incremental(run)
            })
        }
        "status" => {
            let raw = args.next().context("missing <task-uuid>")?;
            let task_uuid =
                Uuid::parse_str(&raw).with_context(|| format!("invalid task uuid: {raw}"))?;
            if let Some(extra) = args.next() {
                anyhow::bail!("unknown argument: {extra}");
            }
            Ok(CliCommand::Status { task_uuid })
        }
        "history" => {
            let project_id = args.next().context("missing <project-id>")?;
            let mut limit = DEFAULT_HISTORY_LIMIT;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--limit" => {
                        let value = args.next().context("--limit needs a value")?;
                        limit = value
                            .parse()
                            .with_context(|| format!("invalid --limit: {value}"))?;
                    }
                    other => anyhow::bail!("unknown argument: {other}"),
                }
            }
            Ok(CliCommand::History { project_id, limit })
        }
        other => anyhow::bail!("unknown command: {other}"),
    }
}

fn init_tracing(config: &SyncConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_store(config: &SyncConfig) -> anyhow::Result<MirrorStore> {
    let store = match config.database_url.as_deref() {
        Some(url) => MirrorStore::new(url).await,
        None => MirrorStore::new_default().await,
    };
    store.context("failed to open the mirror database")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let command = parse_cli_mode(std::env::args())?;
    if command == CliCommand::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let mut config = SyncConfig::from_env();
    if let CliCommand::Full(run) | CliCommand::Incremental(run) = &command {
        if let Some(mode) = run.performance_mode {
            config = config.with_performance_mode(mode);
        }
    }
    init_tracing(&config);
    let store = open_store(&config).await?;
    let tokens = TokenProvider::from_env(&config).context("invalid OAuth client settings")?;
    let client = DocsClient::with_timeouts(
        &config.api_base_url,
        String::new(),
        config.connect_timeout,
        config.read_timeout,
    )
    .context("invalid API base url")?;
    let orchestrator = SyncOrchestrator::new(config, store, Arc::new(tokens), client);

    let output = match command {
        CliCommand::Full(run) => {
            let result = orchestrator
                .start_full_sync(&run.project_id, run.options)
                .await?;
            serde_json::to_string_pretty(&result)?
        }
        CliCommand::Incremental(run) => {
            let result = orchestrator
                .start_incremental_sync(&run.project_id, run.options)
                .await?;
            serde_json::to_string_pretty(&result)?
        }
        CliCommand::Status { task_uuid } => match orchestrator.get_sync_status(task_uuid).await? {
            Some(record) => serde_json::to_string_pretty(&record)?,
            None => anyhow::bail!("no task {task_uuid}"),
        },
        CliCommand::History { project_id, limit } => {
            let history = orchestrator.get_sync_history(&project_id, limit).await?;
            serde_json::to_string_pretty(&history)?
        }
        CliCommand::Help => USAGE.to_string(),
    };
    println!("{output}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("docmirrord")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_help() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliCommand::Help);
        assert_eq!(parse_cli_mode(args(&["--help"])).unwrap(), CliCommand::Help);
    }

    #[test]
    fn parse_cli_mode_reads_sync_options() {
        let command = parse_cli_mode(args(&[
            "full",
            "b.proj",
            "--max-depth",
            "3",
            "--no-attrs",
            "--performance-mode",
            "memory_optimized",
        ]))
        .unwrap();
        assert_eq!(
            command,
            CliCommand::Full(RunArgs {
                project_id: "b.proj".into(),
                options: SyncOptions {
                    max_depth: Some(3),
                    include_attrs: Some(false),
                },
                performance_mode: Some(PerformanceMode::MemoryOptimized),
            })
        );

        let command = parse_cli_mode(args(&["incremental", "b.proj"])).unwrap();
        assert_eq!(
            command,
            CliCommand::Incremental(RunArgs {
                project_id: "b.proj".into(),
                options: SyncOptions::default(),
                performance_mode: None,
            })
        );
    }

    #[test]
    fn parse_cli_mode_supports_status_and_history() {
        let uuid = Uuid::new_v4();
        assert_eq!(
            parse_cli_mode(args(&["status", &uuid.to_string()])).unwrap(),
            CliCommand::Status { task_uuid: uuid }
        );
        assert_eq!(
            parse_cli_mode(args(&["history", "b.proj", "--limit", "5"])).unwrap(),
            CliCommand::History { project_id: "b.proj".into(), limit: 5 }
        );
    }

    #[test]
    fn parse_cli_mode_rejects_bad_input() {
        assert!(parse_cli_mode(args(&["sync"])).is_err());
        assert!(parse_cli_mode(args(&["full"])).is_err());
        assert!(parse_cli_mode(args(&["full", "b.proj", "--max-depth", "deep"])).is_err());
        assert!(parse_cli_mode(args(&["full", "b.proj", "--performance-mode", "turbo"])).is_err());
        assert!(parse_cli_mode(args(&["status", "not-a-uuid"])).is_err());
        assert!(parse_cli_mode(args(&["history", "b.proj", "--verbose"])).is_err());
    }
}
