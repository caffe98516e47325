//! Subcommand implementations. Each returns the process exit status.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use evoq_core::app::{
    ReaperConfig, ReaperLoop, ReclaimConfig, SpawnerConfig, WarmSpawner, WorkerBuilder,
    WorkerConfig,
};
use evoq_core::domain::{CapabilitySet, Payload, RetryPolicy, Task, TaskId, TaskKind, WorkerId};
use evoq_core::impls::{FileResultStore, ProcessLauncher, RedisQueue, RedisQueueConfig};
use evoq_core::ports::{
    IdGenerator, ResultStore, SandboxRequest, SystemClock, TaskQueue, UlidGenerator,
};
use evoq_core::typed::ExecuteHandler;
use futures::StreamExt;
use tokio::sync::watch;

use crate::cli::{
    BrokerArgs, Cli, Commands, DeadLetterCommand, EnqueueArgs, ExportArgs, ReaperArgs,
    ReclaimArgs, ResultArgs, SpawnerArgs, WorkerArgs,
};
use crate::sandbox::CommandSandbox;

pub async fn run(cli: Cli) -> Result<i32> {
    let broker = cli.broker;
    match cli.command {
        Commands::Worker(args) => worker(&broker, args).await,
        Commands::Spawner(args) => spawner(&broker, args).await,
        Commands::Reaper(args) => reaper(&broker, args).await,
        Commands::Enqueue(args) => enqueue(&broker, args).await,
        Commands::Result(args) => result(&broker, args).await,
        Commands::Export(args) => export(&broker, args).await,
        Commands::Status => status(&broker).await,
        Commands::DeadLetter(cmd) => dead_letter(&broker, cmd).await,
    }
}

fn ids() -> Arc<dyn IdGenerator> {
    Arc::new(UlidGenerator::new(SystemClock))
}

async fn connect(broker: &BrokerArgs, consumer: Option<&str>) -> Result<RedisQueue> {
    let mut config = RedisQueueConfig::default()
        .with_url(broker.broker_url.as_str())
        .with_namespace(broker.namespace.as_str())
        .with_retry_policy(RetryPolicy::new(broker.max_retry));
    if let Some(consumer) = consumer {
        config = config.with_consumer(consumer);
    }
    RedisQueue::connect(config)
        .await
        .with_context(|| format!("failed to connect to broker at {}", broker.broker_url))
}

/// Flips to `true` on the first Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            tx.send_replace(true);
        }
    });
    rx
}

fn reclaim_config(args: &ReclaimArgs) -> ReclaimConfig {
    ReclaimConfig {
        idle_threshold: Duration::from_secs(args.reclaim_idle_secs),
        max_batch: args.reclaim_batch,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn worker(broker: &BrokerArgs, args: WorkerArgs) -> Result<i32> {
    let worker_id = args
        .worker_id
        .map(WorkerId::new)
        .unwrap_or_else(|| ids().generate_worker_id());
    let redis = Arc::new(connect(broker, Some(worker_id.as_str())).await?);
    let queue: Arc<dyn TaskQueue> = redis.clone();

    let mut config = WorkerConfig::default()
        .with_capabilities(CapabilitySet::parse(&args.caps))
        .with_tasks_per_process(args.tasks_per_process)
        .with_idle_timeout(Duration::from_secs(args.idle_timeout_secs))
        .with_max_uptime(args.max_uptime_secs.map(Duration::from_secs));
    if let Some(handlers) = args.handlers.as_deref().filter(|h| !h.trim().is_empty()) {
        config = config.with_handler_allow_list(
            handlers.split(',').map(str::trim).filter(|h| !h.is_empty()),
        );
    }

    let sandbox = CommandSandbox::new(
        args.sandbox_program,
        args.sandbox_args,
        Duration::from_secs(args.sandbox_timeout_secs),
    );
    let template = WorkerBuilder::new()
        .register::<SandboxRequest, _>(
            "execute",
            CapabilitySet::parse(&args.sandbox_provides),
            ExecuteHandler::new(sandbox),
        )?
        .with_config(config)
        .expect_kinds(&[TaskKind::Execute])
        .build()?;

    let worker = template
        .worker(queue, worker_id.clone())
        .with_shutdown(shutdown_on_ctrl_c());
    let code = match worker.run().await {
        Ok(exit) => {
            tracing::info!(worker_id = %worker_id, reason = ?exit.reason, completed = exit.completed, "worker exited");
            0
        }
        Err(err) => {
            tracing::error!(worker_id = %worker_id, error = %err, "worker failed");
            err.exit_code()
        }
    };

    // Claims left unacked keep the consumer alive for reclaim; the reaper
    // prunes it once they are gone.
    if let Err(err) = redis.retire_consumer().await {
        tracing::warn!(worker_id = %worker_id, error = %err, "failed to retire consumer");
    }
    Ok(code)
}

async fn spawner(broker: &BrokerArgs, args: SpawnerArgs) -> Result<i32> {
    let queue = Arc::new(connect(broker, None).await?);

    let mut worker_args = vec![
        "--broker-url".to_string(),
        broker.broker_url.clone(),
        "--namespace".to_string(),
        broker.namespace.clone(),
        "--max-retry".to_string(),
        broker.max_retry.to_string(),
        "worker".to_string(),
    ];
    worker_args.extend(args.worker_args);
    let launcher = Arc::new(ProcessLauncher::current_exe(worker_args, ids())?);

    let reclaim = (!args.no_reclaim).then(|| reclaim_config(&args.reclaim));
    let config = SpawnerConfig::default()
        .with_class(args.class)
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms))
        .with_desired_idle(args.desired_idle)
        .with_max_parallel_launch(args.max_parallel_launch)
        .with_reclaim(reclaim);

    WarmSpawner::new(queue, launcher, config)
        .run(shutdown_on_ctrl_c())
        .await;
    Ok(0)
}

async fn reaper(broker: &BrokerArgs, args: ReaperArgs) -> Result<i32> {
    let queue = Arc::new(connect(broker, None).await?);
    let config = ReaperConfig::default()
        .with_poll_interval(Duration::from_secs(args.interval_secs))
        .with_reclaim(reclaim_config(&args.reclaim));
    ReaperLoop::new(queue, config).run(shutdown_on_ctrl_c()).await;
    Ok(0)
}

fn read_payload(args: &EnqueueArgs) -> Result<Payload> {
    let raw = match (&args.payload, &args.payload_file) {
        (Some(inline), _) => inline.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => return Ok(Payload::new()),
    };
    serde_json::from_str(&raw).context("payload must be a JSON object")
}

async fn enqueue(broker: &BrokerArgs, args: EnqueueArgs) -> Result<i32> {
    let kind: TaskKind = args.kind.parse()?;
    let payload = read_payload(&args)?;
    let id = args
        .id
        .clone()
        .map(TaskId::new)
        .unwrap_or_else(|| ids().generate_task_id());

    let task = Task::new(id.clone(), kind, Utc::now())
        .with_payload(payload)
        .with_requires(CapabilitySet::parse(&args.requires));
    let queue = connect(broker, None).await?;
    queue.enqueue(task).await?;
    tracing::info!(task_id = %id, kind = %kind, "task enqueued");

    let Some(wait) = args.wait_secs else {
        println!("{id}");
        return Ok(0);
    };
    match queue.wait_for_result(&id, Duration::from_secs(wait)).await? {
        Some(result) => {
            print_json(&result)?;
            Ok(0)
        }
        None => {
            eprintln!("no result for {id} after {wait}s");
            Ok(1)
        }
    }
}

async fn result(broker: &BrokerArgs, args: ResultArgs) -> Result<i32> {
    let id = TaskId::new(args.task_id);
    let found = if let Some(dir) = &args.dir {
        FileResultStore::open(dir)?.get(&id).await?
    } else {
        let queue = connect(broker, None).await?;
        if args.wait_secs > 0 {
            queue
                .wait_for_result(&id, Duration::from_secs(args.wait_secs))
                .await?
        } else {
            ResultStore::get(&queue, &id).await?
        }
    };

    match found {
        Some(result) => {
            print_json(&result)?;
            Ok(0)
        }
        None => {
            eprintln!("no result for {id}");
            Ok(1)
        }
    }
}

async fn export(broker: &BrokerArgs, args: ExportArgs) -> Result<i32> {
    let kind = args.kind.as_deref().map(str::parse::<TaskKind>).transpose()?;
    let store = FileResultStore::open(&args.dir)?;
    let queue = connect(broker, None).await?;

    let mut exported = 0usize;
    let mut corrupt = 0usize;
    let mut results = ResultStore::iterate(&queue, kind).await?;
    while let Some(item) = results.next().await {
        match item {
            Ok(result) => {
                store.save(&result).await?;
                exported += 1;
            }
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable result");
                corrupt += 1;
            }
        }
    }
    tracing::info!(exported, corrupt, dir = %store.root().display(), "export finished");
    Ok(0)
}

async fn status(broker: &BrokerArgs) -> Result<i32> {
    let queue = connect(broker, None).await?;
    print_json(&queue.counts().await?)?;
    Ok(0)
}

async fn dead_letter(broker: &BrokerArgs, cmd: DeadLetterCommand) -> Result<i32> {
    let queue = connect(broker, None).await?;
    match cmd {
        DeadLetterCommand::List { limit } => {
            print_json(&queue.dead_letters(limit).await?)?;
        }
        DeadLetterCommand::Replay { task_id } => {
            let id = TaskId::new(task_id);
            if !queue.replay_dead_letter(&id).await? {
                bail!("no dead-lettered task {id}");
            }
            tracing::info!(task_id = %id, "task replayed");
        }
        DeadLetterCommand::Discard { task_id } => {
            let id = TaskId::new(task_id);
            if !queue.discard_dead_letter(&id).await? {
                bail!("no dead-lettered task {id}");
            }
            tracing::info!(task_id = %id, "task discarded");
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue_args(payload: Option<&str>) -> EnqueueArgs {
        EnqueueArgs {
            kind: "execute".into(),
            payload: payload.map(str::to_string),
            payload_file: None,
            requires: String::new(),
            id: None,
            wait_secs: None,
        }
    }

    #[test]
    fn payload_defaults_to_empty_object() {
        assert!(read_payload(&enqueue_args(None)).unwrap().is_empty());
    }

    #[test]
    fn payload_must_be_an_object() {
        let payload = read_payload(&enqueue_args(Some(r#"{"source": "x"}"#))).unwrap();
        assert_eq!(payload["source"], "x");
        assert!(read_payload(&enqueue_args(Some("[1, 2]"))).is_err());
    }

    #[test]
    fn payload_file_is_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, br#"{"entry_point": "main"}"#).unwrap();
        let mut args = enqueue_args(None);
        args.payload_file = Some(file.path().to_path_buf());
        assert_eq!(read_payload(&args).unwrap()["entry_point"], "main");
    }
}
