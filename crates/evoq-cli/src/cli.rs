//! Command-line definitions. Every flag can also come from an `EVOQ_*`
//! environment variable, which is how spawned workers are usually configured.

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "evoq")]
#[command(about = "Capability-routed task queue with one-shot workers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(short, long, default_value = "info", global = true, env = "EVOQ_LOG_LEVEL")]
    pub log_level: String,
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Redis URL of the broker.
    #[arg(long, global = true, env = "EVOQ_BROKER_URL", default_value = "redis://127.0.0.1:6379")]
    pub broker_url: String,

    /// Key namespace; one per capability class.
    #[arg(long, global = true, env = "EVOQ_NAMESPACE", default_value = "evoq")]
    pub namespace: String,

    /// Reclaims tolerated before a task is dead-lettered.
    #[arg(long, global = true, env = "EVOQ_MAX_RETRY", default_value_t = 3)]
    pub max_retry: u32,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one one-shot worker until it completes its tasks or goes idle.
    Worker(WorkerArgs),

    /// Keep workers warm for one capability class.
    Spawner(SpawnerArgs),

    /// Periodically requeue orphaned claims.
    Reaper(ReaperArgs),

    /// Submit a task.
    Enqueue(EnqueueArgs),

    /// Print the result of a task.
    Result(ResultArgs),

    /// Copy results from the broker into a directory of JSON files.
    Export(ExportArgs),

    /// Print queue depth.
    Status,

    /// Inspect and manage dead-lettered tasks.
    #[command(subcommand)]
    DeadLetter(DeadLetterCommand),
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Comma-separated capability tags this worker advertises.
    #[arg(long, env = "EVOQ_CAPS", default_value = "")]
    pub caps: String,

    /// Comma-separated handler names allowed to run. Empty allows all.
    #[arg(long, env = "EVOQ_HANDLERS")]
    pub handlers: Option<String>,

    #[arg(long, env = "EVOQ_TASKS_PER_PROCESS", default_value_t = 1)]
    pub tasks_per_process: usize,

    /// Exit after this many seconds without work.
    #[arg(long, env = "EVOQ_IDLE_TIMEOUT_SECS", default_value_t = 60)]
    pub idle_timeout_secs: u64,

    /// Stop taking tasks after this many seconds.
    #[arg(long, env = "EVOQ_MAX_UPTIME_SECS")]
    pub max_uptime_secs: Option<u64>,

    /// Set by the spawner; generated when absent.
    #[arg(long)]
    pub worker_id: Option<String>,

    /// Interpreter used by the `execute` handler.
    #[arg(long, env = "EVOQ_SANDBOX_PROGRAM", default_value = "python3")]
    pub sandbox_program: String,

    /// Extra interpreter arguments, placed before the source file.
    #[arg(long = "sandbox-arg", env = "EVOQ_SANDBOX_ARGS", value_delimiter = ',')]
    pub sandbox_args: Vec<String>,

    /// Capabilities the `execute` handler requires of the worker.
    #[arg(long, env = "EVOQ_SANDBOX_PROVIDES", default_value = "")]
    pub sandbox_provides: String,

    #[arg(long, env = "EVOQ_SANDBOX_TIMEOUT_SECS", default_value_t = 30)]
    pub sandbox_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct SpawnerArgs {
    /// Label for logs.
    #[arg(long, env = "EVOQ_CLASS", default_value = "default")]
    pub class: String,

    #[arg(long, env = "EVOQ_POLL_INTERVAL_MS", default_value_t = 2000)]
    pub poll_interval_ms: u64,

    /// Idle workers to keep around on top of demand.
    #[arg(long, env = "EVOQ_DESIRED_IDLE", default_value_t = 0)]
    pub desired_idle: usize,

    #[arg(long, env = "EVOQ_MAX_PARALLEL_LAUNCH", default_value_t = 4)]
    pub max_parallel_launch: usize,

    /// Leave reclaim to a separate `evoq reaper`.
    #[arg(long)]
    pub no_reclaim: bool,

    #[command(flatten)]
    pub reclaim: ReclaimArgs,

    /// Arguments passed to each `evoq worker` (after `--`).
    #[arg(last = true)]
    pub worker_args: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ReclaimArgs {
    /// Claims older than this many seconds are requeued.
    #[arg(long, env = "EVOQ_RECLAIM_IDLE_SECS", default_value_t = 300)]
    pub reclaim_idle_secs: u64,

    #[arg(long, env = "EVOQ_RECLAIM_BATCH", default_value_t = 100)]
    pub reclaim_batch: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ReaperArgs {
    #[arg(long, env = "EVOQ_REAPER_INTERVAL_SECS", default_value_t = 30)]
    pub interval_secs: u64,

    #[command(flatten)]
    pub reclaim: ReclaimArgs,
}

#[derive(Args, Debug, Clone)]
pub struct EnqueueArgs {
    /// render, mutate, execute or evaluate.
    #[arg(long)]
    pub kind: String,

    /// Payload as a JSON object.
    #[arg(long, conflicts_with = "payload_file")]
    pub payload: Option<String>,

    /// Read the payload JSON object from a file.
    #[arg(long)]
    pub payload_file: Option<std::path::PathBuf>,

    /// Comma-separated capability tags the task requires.
    #[arg(long, default_value = "")]
    pub requires: String,

    /// Task id; a ULID-based id is generated when absent.
    #[arg(long)]
    pub id: Option<String>,

    /// Wait this many seconds for the result and print it.
    #[arg(long)]
    pub wait_secs: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct ResultArgs {
    pub task_id: String,

    /// Seconds to wait for the result to appear.
    #[arg(long, default_value_t = 0)]
    pub wait_secs: u64,

    /// Read from an exported directory instead of the broker.
    #[arg(long)]
    pub dir: Option<std::path::PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    pub dir: std::path::PathBuf,

    /// Only results of this task kind.
    #[arg(long)]
    pub kind: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum DeadLetterCommand {
    /// Newest first.
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Put a task back into pending. Its attempt count is kept.
    Replay { task_id: String },
    /// Drop a task for good.
    Discard { task_id: String },
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_flags_parse() {
        let cli = Cli::try_parse_from([
            "evoq",
            "--namespace",
            "gpu",
            "worker",
            "--caps",
            "gpu,cuda12",
            "--idle-timeout-secs",
            "5",
            "--worker-id",
            "worker-1",
        ])
        .unwrap();
        assert_eq!(cli.broker.namespace, "gpu");
        let Commands::Worker(args) = cli.command else {
            panic!("expected worker");
        };
        assert_eq!(args.caps, "gpu,cuda12");
        assert_eq!(args.tasks_per_process, 1);
        assert_eq!(args.worker_id.as_deref(), Some("worker-1"));
    }

    #[test]
    fn spawner_forwards_worker_args() {
        let cli = Cli::try_parse_from([
            "evoq", "spawner", "--desired-idle", "2", "--", "--caps", "cpu",
        ])
        .unwrap();
        let Commands::Spawner(args) = cli.command else {
            panic!("expected spawner");
        };
        assert_eq!(args.desired_idle, 2);
        assert_eq!(args.worker_args, vec!["--caps".to_string(), "cpu".to_string()]);
    }

    #[test]
    fn dead_letter_subcommands() {
        let cli = Cli::try_parse_from(["evoq", "dead-letter", "replay", "task-1"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::DeadLetter(DeadLetterCommand::Replay { task_id }) if task_id == "task-1"
        ));
    }
}
