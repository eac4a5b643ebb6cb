//! PromptLab CLI entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use promptlab_engine::{BatchAggregator, ConcurrentExecutor, EngineConfig, Plan, TaskResult};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "promptlab", version, about = "Run task plans and aggregate batch outputs")]
struct Cli {
    /// Engine config file (YAML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a task plan
    Run {
        plan: PathBuf,

        #[arg(long)]
        max_workers: Option<usize>,

        /// Stop after the first batch with a failed required task
        #[arg(long)]
        fail_fast: bool,

        /// Print the execution summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Aggregate a JSON array of items
    Aggregate {
        items: PathBuf,

        #[arg(long, short)]
        strategy: String,

        /// Strategy options as a JSON object
        #[arg(long)]
        options: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            plan,
            max_workers,
            fail_fast,
            json,
        } => {
            if let Some(n) = max_workers {
                config.max_workers = n;
            }
            config.fail_fast |= fail_fast;
            config.validate()?;

            let ok = run_plan(&config, &plan, json).await?;
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Aggregate {
            items,
            strategy,
            options,
        } => aggregate(&config, &items, &strategy, options.as_deref()).await?,
    }

    Ok(())
}

async fn run_plan(config: &EngineConfig, path: &Path, json: bool) -> Result<bool> {
    log::info!("Loading plan from: {}", path.display());
    let plan = Plan::from_file(path)?;
    if let Some(name) = &plan.name {
        log::info!("Plan {} with {} tasks", name, plan.tasks.len());
    }

    let executor = ConcurrentExecutor::from_config(config);
    let results = executor
        .execute_with_dependencies(plan.into_tasks(), None, None)
        .await?;
    let summary = executor.get_execution_summary(&results);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for result in &results {
            println!("{}", outcome_line(result));
        }
        println!(
            "\n{} succeeded, {} failed, {} skipped ({:.2}s)",
            summary.succeeded,
            summary.failed,
            summary.skipped,
            summary.wall_time.unwrap_or_default().as_secs_f64()
        );
    }

    Ok(summary.is_successful())
}

fn outcome_line(result: &TaskResult<Value>) -> String {
    let status = if result.success {
        "ok"
    } else if result.skipped {
        "skipped"
    } else {
        "failed"
    };
    let detail = match (&result.result, &result.error) {
        (Some(Value::String(s)), _) => s.clone(),
        (Some(value), _) => value.to_string(),
        (None, Some(err)) => err.clone(),
        (None, None) => String::new(),
    };
    format!("{:<8} {} {}", status, result.task_id, detail).trim_end().to_string()
}

async fn aggregate(config: &EngineConfig, path: &Path, strategy: &str, options: Option<&str>) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read items {}", path.display()))?;
    let items: Vec<Value> = serde_json::from_str(&content)
        .with_context(|| format!("{} must hold a JSON array", path.display()))?;
    let options: Value = match options {
        Some(raw) => serde_json::from_str(raw).context("--options must be valid JSON")?,
        None => Value::Null,
    };

    let result = BatchAggregator::new(config)
        .aggregate(&items, strategy, &options)
        .await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
