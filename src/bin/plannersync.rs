use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use plannersync::{Config, DeltaCallback, MergeCallback, PartialRecord, PlannerSync, Task};
use serde_json::json;

#[derive(Parser)]
#[command(name = "plannersync", about = "Keep a local mirror of a Planner board in sync")]
struct Cli {
    /// Config file path (default: ~/.plannersync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync a board and print every change as a JSON line until Ctrl-C
    Watch {
        /// Board id or Planner URL
        board: String,
        /// Refetch the whole board every cycle instead of polling the delta feed
        #[arg(long)]
        full: bool,
    },
    /// List the tasks of a board
    Tasks {
        /// Board id or Planner URL
        board: String,
        /// Only tasks in this bucket
        #[arg(long)]
        bucket: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the buckets of a board
    Buckets {
        /// Board id or Planner URL
        board: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a board with its members and owners
    Board {
        /// Board id or Planner URL
        board: String,
    },
    /// Print the effective configuration
    Config,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    Ok(match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    })
}

fn print_line(value: serde_json::Value) {
    println!("{value}");
}

async fn handle_watch(sync: &PlannerSync, board: &str, full: bool) -> anyhow::Result<()> {
    let on_merge: MergeCallback = Arc::new(|tasks: Vec<Task>| {
        print_line(json!({"event": "merge", "tasks": tasks}));
    });
    let on_delta: Option<DeltaCallback> = if full {
        None
    } else {
        Some(Arc::new(|changes: Vec<PartialRecord>| {
            print_line(json!({"event": "delta", "changes": changes}));
        }))
    };

    let board_id = sync.watch(board, on_merge, on_delta).await?;
    eprintln!("Watching board {board_id}. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;
    sync.stop();
    eprintln!("Stopped.");
    Ok(())
}

fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks.");
        return;
    }
    for task in tasks {
        let check = if task.completed { "x" } else { " " };
        let due = task
            .due_date
            .map(|d| format!("  due {}", d.format("%Y-%m-%d")))
            .unwrap_or_default();
        println!("[{check}] {}  {}{due}", task.id, task.name);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Config => {
            if let Some(path) = cli.config.or_else(|| Config::default_path().ok()) {
                println!("# {}", path.display());
            }
            print!("{}", config.to_toml()?);
        }
        Commands::Watch { board, full } => {
            let sync = PlannerSync::from_env(config)?;
            handle_watch(&sync, &board, full).await?;
        }
        Commands::Tasks { board, bucket, json } => {
            let sync = PlannerSync::from_env(config)?;
            let tasks = sync.tasks(&board, bucket.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else {
                print_tasks(&tasks);
            }
        }
        Commands::Buckets { board, json } => {
            let sync = PlannerSync::from_env(config)?;
            let buckets = sync.buckets(&board).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&buckets)?);
            } else if buckets.is_empty() {
                println!("No buckets.");
            } else {
                for bucket in &buckets {
                    println!("{}  {}", bucket.id, bucket.name.as_deref().unwrap_or("(unnamed)"));
                }
            }
        }
        Commands::Board { board } => {
            let sync = PlannerSync::from_env(config)?;
            let info = sync.board(&board).await?;
            let people = sync.members(&board).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({"board": info, "people": people}))?
            );
        }
    }

    Ok(())
}
