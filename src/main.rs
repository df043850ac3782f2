//! edrr 命令行
//!
//! 入口：加载配置、初始化日志、装配编排器并执行子命令。
//! 退出码：0 成功，1 内部错误，2 Blocked（需要人工决策），3 Abandoned。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use edrr::config::load_config;
use edrr::core::{AbandonOutcome, ExitStatus, Orchestrator, OrchestratorBuilder};
use edrr::observability;
use edrr::workflow::WorkUnit;
use serde::Serialize;

#[derive(Parser)]
#[command(name = "edrr", version, about = "EDRR multi-agent development orchestrator")]
struct Cli {
    /// Extra configuration file (overrides config/default.toml)
    #[arg(long, global = true, env = "EDRR_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a work unit from a requirement description
    Create {
        description: String,
        /// Drive the new unit until it completes, blocks or is abandoned
        #[arg(long)]
        run: bool,
    },
    /// Run the current phase of a work unit and commit one transition
    Advance {
        id: String,
        /// Keep advancing until the unit leaves the active state
        #[arg(long)]
        until_settled: bool,
    },
    /// Drive every active work unit found in the store
    Resume,
    /// Show the full report of a work unit
    Status { id: String },
    /// List all work units
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show token usage per work unit
    Tokens,
    /// Abandon a work unit
    Abandon { id: String },
    /// Start a new EDRR cycle for a blocked work unit
    Reopen {
        id: String,
        /// Guidance added to the unit's context
        #[arg(long)]
        guidance: Option<String>,
        /// Raise the unit's token ceiling by this many tokens
        #[arg(long)]
        extra_budget: Option<u64>,
        /// Zero the unit's recorded token usage
        #[arg(long)]
        reset_usage: bool,
        /// Drive the reopened unit right away
        #[arg(long)]
        run: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}

fn settled(unit: &WorkUnit) -> ExitStatus {
    println!("{} {} ({})", unit.id, unit.status.as_str(), unit.phase);
    ExitStatus::from_unit(unit.status)
}

async fn execute(orchestrator: Arc<Orchestrator>, command: Command) -> anyhow::Result<ExitStatus> {
    let status = match command {
        Command::Create { description, run } => {
            let unit = orchestrator
                .create_work_unit(&description)
                .await
                .context("Failed to create work unit")?;
            if run {
                settled(&orchestrator.run(&unit.id).await.context("Run failed")?)
            } else {
                println!("{}", unit.id);
                ExitStatus::Success
            }
        }
        Command::Advance { id, until_settled } => {
            if until_settled {
                settled(&orchestrator.run(&id).await.context("Run failed")?)
            } else {
                let (unit, record) = orchestrator.advance(&id).await.context("Advance failed")?;
                print_json(&record)?;
                ExitStatus::from_unit(unit.status)
            }
        }
        Command::Resume => {
            let units = orchestrator.resume_all().await.context("Resume failed")?;
            for unit in &units {
                settled(unit);
            }
            ExitStatus::worst(units.iter().map(|u| u.status))
        }
        Command::Status { id } => {
            let report = orchestrator.status(&id).await.context("Status failed")?;
            print_json(&report)?;
            ExitStatus::from_unit(report.status)
        }
        Command::List { json } => {
            let units = orchestrator.list().await.context("List failed")?;
            if json {
                print_json(&units)?;
            } else {
                for unit in &units {
                    println!("{}", unit.line());
                }
            }
            ExitStatus::Success
        }
        Command::Tokens => {
            print_json(&orchestrator.token_report().await.context("Token report failed")?)?;
            ExitStatus::Success
        }
        Command::Abandon { id } => match orchestrator.abandon(&id).await.context("Abandon failed")? {
            AbandonOutcome::Signalled => {
                println!("{id} abandon signalled");
                ExitStatus::Abandoned
            }
            AbandonOutcome::Recorded(unit) => settled(&unit),
        },
        Command::Reopen {
            id,
            guidance,
            extra_budget,
            reset_usage,
            run,
        } => {
            let unit = orchestrator
                .reopen(&id, guidance, extra_budget, reset_usage)
                .await
                .context("Reopen failed")?;
            if run {
                settled(&orchestrator.run(&unit.id).await.context("Run failed")?)
            } else {
                settled(&unit)
            }
        }
    };
    Ok(status)
}

async fn run(cli: Cli) -> anyhow::Result<ExitStatus> {
    let config = load_config(cli.config.clone()).context("Failed to load configuration")?;
    observability::init(&config.logging.level, cli.json_logs || config.logging.json);

    let orchestrator = Arc::new(
        OrchestratorBuilder::new(config)
            .build()
            .await
            .context("Failed to assemble orchestrator")?,
    );

    // Ctrl+C：停止运行，在途 WorkUnit 不提交当前阶段，保持 Active 等待 resume
    let on_signal = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.shutdown();
        }
    });

    execute(orchestrator, cli.command).await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(status) => status.code(),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitStatus::InternalError.code()
        }
    };
    std::process::exit(code);
}
