//! RedisQueue - durable TaskQueue on Redis Streams with a consumer group.
//!
//! # Key layout (all under one namespace)
//! - `{ns}:stream`: append-only stream; each entry has one `task` field.
//! - `{ns}:claims`: hash `task_id -> "<entry id> <consumer>"` for entries
//!   handed out; `ack` and `release` only touch claims their consumer owns.
//! - `{ns}:results`: hash `task_id -> result JSON`.
//! - `{ns}:dead`: list of dead-letter JSON, newest at the head.
//! - `{ns}:malformed`: list of raw entries that failed to decode.
//!
//! # Reliability
//! A claim is an entry in the consumer group's pending entries list, so it
//! survives a crashed worker. `requeue_orphans` uses `XAUTOCLAIM` to take over
//! idle entries, then re-appends a copy with `attempts + 1` and acks the
//! stolen entry inside one `MULTI`. Two reclaimers racing on the same entry
//! is harmless: `XAUTOCLAIM` resets its idle time, so only one of them sees it.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, future, stream};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Value};
use tokio::time::Instant;

use crate::domain::{Decision, RetryPolicy, Task, TaskId, TaskKind, TaskResult};
use crate::ports::result_store::kind_matches;
use crate::ports::{
    Clock, DeadLetter, QueueCounts, QueueError, ResultStore, ResultStream, StoreError, SystemClock,
    TaskQueue,
};
use crate::typed::{WireError, decode_result, decode_task, encode_result, encode_task};

const TASK_FIELD: &str = "task";

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            QueueError::Transport(err.to_string())
        } else {
            QueueError::Protocol(err.to_string())
        }
    }
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    pub url: String,
    /// Key prefix. One namespace per capability class.
    pub namespace: String,
    pub group: String,
    /// Consumer name inside the group; unique per process.
    pub consumer: String,
    pub retry: RetryPolicy,
    pub result_poll_interval: Duration,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            namespace: "evoq".to_string(),
            group: "workers".to_string(),
            consumer: format!("evoq-{}", std::process::id()),
            retry: RetryPolicy::default(),
            result_poll_interval: Duration::from_millis(100),
        }
    }
}

impl RedisQueueConfig {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_result_poll_interval(mut self, interval: Duration) -> Self {
        self.result_poll_interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
struct Keys {
    stream: String,
    claims: String,
    results: String,
    dead: String,
    malformed: String,
}

impl Keys {
    fn new(namespace: &str) -> Self {
        Self {
            stream: format!("{namespace}:stream"),
            claims: format!("{namespace}:claims"),
            results: format!("{namespace}:results"),
            dead: format!("{namespace}:dead"),
            malformed: format!("{namespace}:malformed"),
        }
    }
}

pub struct RedisQueue {
    /// Short commands.
    conn: ConnectionManager,
    /// `XREADGROUP BLOCK` only, so a blocked pop never stalls other calls.
    blocking: ConnectionManager,
    keys: Keys,
    config: RedisQueueConfig,
    clock: Box<dyn Clock>,
}

impl RedisQueue {
    /// Connects and makes sure the stream and consumer group exist.
    pub async fn connect(config: RedisQueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        let blocking = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;

        let queue = Self {
            conn,
            blocking,
            keys: Keys::new(&config.namespace),
            config,
            clock: Box::new(SystemClock),
        };
        queue.ensure_group().await?;
        tracing::info!(
            namespace = %queue.config.namespace,
            group = %queue.config.group,
            consumer = %queue.config.consumer,
            "connected to redis"
        );
        Ok(queue)
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RedisQueueConfig {
        &self.config
    }

    async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.keys.stream)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async::<_, ()>(&mut conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn append(&self, body: &[u8]) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("XADD")
            .arg(&self.keys.stream)
            .arg("*")
            .arg(TASK_FIELD)
            .arg(body)
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }

    /// Acks and deletes a stream entry, dropping the claim of `task_id`.
    async fn retire(&self, entry_id: &str, task_id: Option<&TaskId>) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("XACK")
            .arg(&self.keys.stream)
            .arg(&self.config.group)
            .arg(entry_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.keys.stream)
            .arg(entry_id)
            .ignore();
        if let Some(task_id) = task_id {
            pipe.hdel(&self.keys.claims, task_id.as_str()).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Parks an undecodable entry for operators and removes it from the stream.
    async fn quarantine(&self, entry: &StreamEntry, err: &WireError) -> Result<(), QueueError> {
        tracing::warn!(entry_id = %entry.id, error = %err, "quarantined malformed entry");
        let raw = entry.body.clone().unwrap_or_default();
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(&self.keys.malformed, raw)
            .ignore()
            .cmd("XACK")
            .arg(&self.keys.stream)
            .arg(&self.config.group)
            .arg(&entry.id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.keys.stream)
            .arg(&entry.id)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn read_one(&self, block: Option<Duration>) -> Result<Option<StreamEntry>, QueueError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg("COUNT")
            .arg(1);
        let mut conn = match block {
            Some(wait) => {
                // BLOCK 0 would wait forever.
                let ms = wait.as_millis().clamp(1, u128::from(u32::MAX)) as u64;
                cmd.arg("BLOCK").arg(ms);
                self.blocking.clone()
            }
            None => self.conn.clone(),
        };
        cmd.arg("STREAMS").arg(&self.keys.stream).arg(">");

        let reply: Value = cmd.query_async(&mut conn).await?;
        Ok(parse_read_reply(&reply)?.into_iter().next())
    }

    async fn entry_body(&self, entry_id: &str) -> Result<Option<Vec<u8>>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XRANGE")
            .arg(&self.keys.stream)
            .arg(entry_id)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(parse_entries(&reply)?
            .into_iter()
            .next()
            .and_then(|entry| entry.body))
    }

    async fn dead_letter_entries(&self) -> Result<Vec<(String, DeadLetter)>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(&self.keys.dead, 0, -1).await?;
        Ok(decode_dead_letters(raw))
    }

    /// Removes one dead letter for `task_id`, returning it if this call won.
    async fn take_dead_letter(&self, task_id: &TaskId) -> Result<Option<DeadLetter>, QueueError> {
        let Some((raw, dead)) = self
            .dead_letter_entries()
            .await?
            .into_iter()
            .find(|(_, d)| &d.task.id == task_id)
        else {
            return Ok(None);
        };
        let mut conn = self.conn.clone();
        let removed: usize = conn.lrem(&self.keys.dead, 1, raw).await?;
        Ok((removed > 0).then_some(dead))
    }

    /// Entry id of `task_id` when this consumer holds the claim.
    ///
    /// A claim that was reclaimed and popped again belongs to another
    /// consumer by now, so a late ack or release from the first one is a no-op.
    async fn own_claim(&self, task_id: &TaskId) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(&self.keys.claims, task_id.as_str()).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match parse_claim(&raw) {
            Some((entry_id, owner)) if owner == self.config.consumer => {
                Ok(Some(entry_id.to_string()))
            }
            Some((_, owner)) => {
                tracing::debug!(task_id = %task_id, owner, "claim held by another consumer");
                Ok(None)
            }
            None => Err(QueueError::Protocol(format!("unreadable claim for {task_id}: {raw}"))),
        }
    }

    /// Removes this consumer from the group when it holds no claims.
    ///
    /// One-shot workers each join under a fresh name, so a worker calls this
    /// on its way out. Returns `false` while claims are still pending; those
    /// stay visible to reclaim.
    pub async fn retire_consumer(&self) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let pending: Value = redis::cmd("XPENDING")
            .arg(&self.keys.stream)
            .arg(&self.config.group)
            .arg("-")
            .arg("+")
            .arg(1)
            .arg(&self.config.consumer)
            .query_async(&mut conn)
            .await?;
        if !matches!(&pending, Value::Bulk(items) if items.is_empty()) {
            tracing::debug!(consumer = %self.config.consumer, "consumer still holds claims");
            return Ok(false);
        }
        self.delete_consumer(&self.config.consumer).await?;
        tracing::debug!(consumer = %self.config.consumer, "consumer retired");
        Ok(true)
    }

    async fn delete_consumer(&self, consumer: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("XGROUP")
            .arg("DELCONSUMER")
            .arg(&self.keys.stream)
            .arg(&self.config.group)
            .arg(consumer)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let body = encode_task(&task)?;
        self.append(&body).await?;
        tracing::debug!(task_id = %task.id, kind = %task.kind, "enqueued");
        Ok(())
    }

    async fn pop(&self, block: bool, timeout: Duration) -> Result<Option<Task>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = if block {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                Some(remaining)
            } else {
                None
            };

            let Some(entry) = self.read_one(wait).await? else {
                return Ok(None);
            };
            match entry.decode() {
                Ok(task) => {
                    let mut conn = self.conn.clone();
                    let claim = claim_value(&entry.id, &self.config.consumer);
                    conn.hset::<_, _, _, ()>(&self.keys.claims, task.id.as_str(), claim)
                        .await?;
                    tracing::debug!(task_id = %task.id, entry_id = %entry.id, "claimed");
                    return Ok(Some(task));
                }
                Err(err) => match err.task_id().cloned() {
                    // Newer schema with a readable id: answer it, then drop it.
                    Some(task_id) => {
                        tracing::warn!(task_id = %task_id, error = %err, "refusing task");
                        let refused = TaskResult::refused(task_id.clone(), err.to_string())
                            .at(self.clock.now());
                        self.push_result(refused).await?;
                        self.retire(&entry.id, None).await?;
                    }
                    None => self.quarantine(&entry, &err).await?,
                },
            }
        }
    }

    async fn ack(&self, task_id: &TaskId) -> Result<(), QueueError> {
        if let Some(entry_id) = self.own_claim(task_id).await? {
            self.retire(&entry_id, Some(task_id)).await?;
            tracing::debug!(task_id = %task_id, "acked");
        }
        Ok(())
    }

    async fn release(&self, task_id: &TaskId) -> Result<(), QueueError> {
        let Some(entry_id) = self.own_claim(task_id).await? else {
            return Ok(());
        };
        let mut conn = self.conn.clone();

        let Some(body) = self.entry_body(&entry_id).await? else {
            // Entry already gone (reclaimed elsewhere); only the claim is stale.
            conn.hdel::<_, _, ()>(&self.keys.claims, task_id.as_str())
                .await?;
            return Ok(());
        };

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("XADD")
            .arg(&self.keys.stream)
            .arg("*")
            .arg(TASK_FIELD)
            .arg(body)
            .ignore()
            .cmd("XACK")
            .arg(&self.keys.stream)
            .arg(&self.config.group)
            .arg(&entry_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.keys.stream)
            .arg(&entry_id)
            .ignore()
            .hdel(&self.keys.claims, task_id.as_str())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        tracing::debug!(task_id = %task_id, "released");
        Ok(())
    }

    async fn push_result(&self, result: TaskResult) -> Result<(), QueueError> {
        self.save(&result).await?;
        Ok(())
    }

    async fn wait_for_result(
        &self,
        task_id: &TaskId,
        timeout: Duration,
    ) -> Result<Option<TaskResult>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self.get(task_id).await? {
                return Ok(Some(result));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(self.config.result_poll_interval)).await;
        }
    }

    async fn requeue_orphans(
        &self,
        idle_threshold: Duration,
        max_batch: usize,
    ) -> Result<usize, QueueError> {
        if max_batch == 0 {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let min_idle_ms = idle_threshold.as_millis().min(u128::from(u64::MAX)) as u64;
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.keys.stream)
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(max_batch)
            .query_async(&mut conn)
            .await?;

        let mut requeued = 0;
        for entry in parse_autoclaim_reply(&reply)? {
            let mut task = match entry.decode() {
                Ok(task) => task,
                Err(err) => {
                    self.quarantine(&entry, &err).await?;
                    continue;
                }
            };
            task.bump_attempts();

            let mut pipe = redis::pipe();
            pipe.atomic();
            match self.config.retry.decide(task.attempts()) {
                Decision::Retry => {
                    tracing::info!(task_id = %task.id, attempts = task.attempts(), "reclaimed orphan");
                    pipe.cmd("XADD")
                        .arg(&self.keys.stream)
                        .arg("*")
                        .arg(TASK_FIELD)
                        .arg(encode_task(&task)?)
                        .ignore();
                    requeued += 1;
                }
                Decision::DeadLetter => {
                    tracing::warn!(task_id = %task.id, attempts = task.attempts(), "dead-lettered");
                    let dead = DeadLetter {
                        reason: format!(
                            "attempts {} exceeded max_retry {}",
                            task.attempts(),
                            self.config.retry.max_retry
                        ),
                        task: task.clone(),
                        moved_at: self.clock.now(),
                    };
                    let raw = serde_json::to_string(&dead).map_err(WireError::from)?;
                    pipe.lpush(&self.keys.dead, raw).ignore();
                }
            }
            pipe.cmd("XACK")
                .arg(&self.keys.stream)
                .arg(&self.config.group)
                .arg(&entry.id)
                .ignore()
                .cmd("XDEL")
                .arg(&self.keys.stream)
                .arg(&entry.id)
                .ignore()
                .hdel(&self.keys.claims, task.id.as_str())
                .ignore();
            pipe.query_async::<_, ()>(&mut conn).await?;
        }
        Ok(requeued)
    }

    async fn prune_idle_consumers(&self, idle: Duration) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XINFO")
            .arg("CONSUMERS")
            .arg(&self.keys.stream)
            .arg(&self.config.group)
            .query_async(&mut conn)
            .await?;
        let idle_ms = idle.as_millis().min(u128::from(u64::MAX)) as u64;

        let mut pruned = 0;
        for consumer in parse_consumers(&reply)? {
            if consumer.pending > 0
                || consumer.idle_ms < idle_ms
                || consumer.name == self.config.consumer
            {
                continue;
            }
            self.delete_consumer(&consumer.name).await?;
            tracing::debug!(consumer = %consumer.name, idle_ms = consumer.idle_ms, "pruned idle consumer");
            pruned += 1;
        }
        Ok(pruned)
    }

    /// `oldest_pending_secs` is not tracked for streams.
    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut conn = self.conn.clone();
        let (stream_len, pending_summary, dead): (usize, Value, usize) = redis::pipe()
            .cmd("XLEN")
            .arg(&self.keys.stream)
            .cmd("XPENDING")
            .arg(&self.keys.stream)
            .arg(&self.config.group)
            .llen(&self.keys.dead)
            .query_async(&mut conn)
            .await?;
        let in_flight = parse_pending_count(&pending_summary)?;

        Ok(QueueCounts {
            // Acked entries are deleted, so the stream holds pending + claimed.
            pending: stream_len.saturating_sub(in_flight),
            in_flight,
            dead,
            oldest_pending_secs: None,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let raw: Vec<String> = conn.lrange(&self.keys.dead, 0, stop).await?;
        Ok(decode_dead_letters(raw).into_iter().map(|(_, dead)| dead).collect())
    }

    async fn replay_dead_letter(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        let Some(dead) = self.take_dead_letter(task_id).await? else {
            return Ok(false);
        };
        let task = dead.task;
        self.append(&encode_task(&task)?).await?;
        tracing::info!(task_id = %task.id, attempts = task.attempts(), "replayed dead letter");
        Ok(true)
    }

    async fn discard_dead_letter(&self, task_id: &TaskId) -> Result<bool, QueueError> {
        let discarded = self.take_dead_letter(task_id).await?.is_some();
        if discarded {
            tracing::info!(task_id = %task_id, "discarded dead letter");
        }
        Ok(discarded)
    }
}

#[async_trait]
impl ResultStore for RedisQueue {
    /// `HSET` replaces the whole field value in one step.
    async fn save(&self, result: &TaskResult) -> Result<(), StoreError> {
        let body = encode_result(result).map_err(wire_to_store)?;
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(&self.keys.results, result.task_id.as_str(), body)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskResult>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn
            .hget(&self.keys.results, task_id.as_str())
            .await
            .map_err(backend)?;
        raw.map(|bytes| decode_result(&bytes).map_err(wire_to_store))
            .transpose()
    }

    /// Pages through the result hash with `HSCAN` as the stream is polled.
    /// Fields reported twice by the scan are yielded once.
    async fn iterate(&self, kind: Option<TaskKind>) -> Result<ResultStream, StoreError> {
        let scan = ResultScan {
            conn: self.conn.clone(),
            key: self.keys.results.clone(),
            cursor: Some(0),
            page: VecDeque::new(),
            seen: HashSet::new(),
        };
        let results = stream::unfold(scan, |mut scan| async move {
            let item = scan.next().await?;
            Some((item, scan))
        })
        .filter(move |item| {
            future::ready(match item {
                Ok(result) => kind_matches(result, kind),
                Err(_) => true,
            })
        });
        Ok(Box::pin(results))
    }
}

const SCAN_PAGE: usize = 100;

/// Cursor state behind `RedisQueue::iterate`.
struct ResultScan {
    conn: ConnectionManager,
    key: String,
    /// `None` once the scan has wrapped around to cursor 0.
    cursor: Option<u64>,
    page: VecDeque<Vec<u8>>,
    seen: HashSet<String>,
}

impl ResultScan {
    async fn next(&mut self) -> Option<Result<TaskResult, StoreError>> {
        loop {
            if let Some(bytes) = self.page.pop_front() {
                return Some(decode_result(&bytes).map_err(wire_to_store));
            }
            let cursor = self.cursor?;
            let reply: Result<(u64, Vec<(String, Vec<u8>)>), _> = redis::cmd("HSCAN")
                .arg(&self.key)
                .arg(cursor)
                .arg("COUNT")
                .arg(SCAN_PAGE)
                .query_async(&mut self.conn)
                .await;
            match reply {
                Ok((next, fields)) => {
                    self.cursor = (next != 0).then_some(next);
                    for (task_id, body) in fields {
                        if self.seen.insert(task_id) {
                            self.page.push_back(body);
                        }
                    }
                }
                Err(err) => {
                    self.cursor = None;
                    return Some(Err(backend(err)));
                }
            }
        }
    }
}

fn wire_to_store(err: WireError) -> StoreError {
    match err {
        WireError::Malformed(e) => StoreError::Corrupt(e),
        other => StoreError::Backend(other.to_string()),
    }
}

// Reply parsing. Kept free of I/O so it can be tested with hand-built values.

#[derive(Debug, Clone, PartialEq)]
struct StreamEntry {
    id: String,
    /// `None` when the entry has no `task` field or was deleted.
    body: Option<Vec<u8>>,
}

impl StreamEntry {
    fn decode(&self) -> Result<Task, WireError> {
        match &self.body {
            Some(body) => decode_task(body),
            None => Err(WireError::Malformed(serde::de::Error::missing_field(
                TASK_FIELD,
            ))),
        }
    }
}

fn protocol(what: &str, value: &Value) -> QueueError {
    QueueError::Protocol(format!("unexpected {what}: {value:?}"))
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

fn parse_entry(value: &Value) -> Result<Option<StreamEntry>, QueueError> {
    match value {
        // XAUTOCLAIM on Redis 6.2 reports deleted entries as nil.
        Value::Nil => Ok(None),
        Value::Bulk(parts) if parts.len() == 2 => {
            let id = as_string(&parts[0]).ok_or_else(|| protocol("entry id", &parts[0]))?;
            let body = match &parts[1] {
                Value::Bulk(fields) => fields.chunks(2).find_map(|pair| match pair {
                    [Value::Data(key), Value::Data(val)] if key.as_slice() == TASK_FIELD.as_bytes() => {
                        Some(val.clone())
                    }
                    _ => None,
                }),
                Value::Nil => None,
                other => return Err(protocol("entry fields", other)),
            };
            Ok(Some(StreamEntry { id, body }))
        }
        other => Err(protocol("stream entry", other)),
    }
}

fn parse_entries(value: &Value) -> Result<Vec<StreamEntry>, QueueError> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Bulk(items) => {
            let mut entries = Vec::with_capacity(items.len());
            for item in items {
                if let Some(entry) = parse_entry(item)? {
                    entries.push(entry);
                }
            }
            Ok(entries)
        }
        other => Err(protocol("entry list", other)),
    }
}

/// `XREADGROUP` reply: nil on timeout, else `[[stream, [entry...]]...]`.
fn parse_read_reply(value: &Value) -> Result<Vec<StreamEntry>, QueueError> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Bulk(streams) => {
            let mut entries = Vec::new();
            for stream in streams {
                match stream {
                    Value::Bulk(pair) if pair.len() == 2 => entries.extend(parse_entries(&pair[1])?),
                    other => return Err(protocol("stream reply", other)),
                }
            }
            Ok(entries)
        }
        other => Err(protocol("XREADGROUP reply", other)),
    }
}

/// `XAUTOCLAIM` reply: `[next_cursor, [entry...], [deleted ids...]]`; the
/// third element only exists on Redis 7.
fn parse_autoclaim_reply(value: &Value) -> Result<Vec<StreamEntry>, QueueError> {
    match value {
        Value::Bulk(parts) if parts.len() >= 2 => parse_entries(&parts[1]),
        other => Err(protocol("XAUTOCLAIM reply", other)),
    }
}

/// Summary form of `XPENDING`: `[count, min_id, max_id, consumers]`.
fn parse_pending_count(value: &Value) -> Result<usize, QueueError> {
    match value {
        Value::Bulk(parts) => match parts.first() {
            Some(Value::Int(n)) => Ok(usize::try_from(*n).unwrap_or(0)),
            _ => Err(protocol("XPENDING summary", value)),
        },
        other => Err(protocol("XPENDING summary", other)),
    }
}

/// Decodes dead-letter list items, keeping the raw text for `LREM`.
/// Unreadable items are skipped with a warning and stay in the list.
fn decode_dead_letters(raw: Vec<String>) -> Vec<(String, DeadLetter)> {
    let mut entries = Vec::with_capacity(raw.len());
    for item in raw {
        match serde_json::from_str::<DeadLetter>(&item) {
            Ok(dead) => entries.push((item, dead)),
            Err(err) => tracing::warn!(error = %err, "skipping unreadable dead letter"),
        }
    }
    entries
}

fn claim_value(entry_id: &str, consumer: &str) -> String {
    format!("{entry_id} {consumer}")
}

/// Splits a claim into entry id and owning consumer.
fn parse_claim(raw: &str) -> Option<(&str, &str)> {
    raw.split_once(' ')
        .filter(|(entry_id, owner)| !entry_id.is_empty() && !owner.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConsumerInfo {
    name: String,
    pending: u64,
    idle_ms: u64,
}

/// `XINFO CONSUMERS` reply: one flat `[field, value, ...]` list per consumer.
fn parse_consumers(value: &Value) -> Result<Vec<ConsumerInfo>, QueueError> {
    let Value::Bulk(items) = value else {
        return Err(protocol("XINFO CONSUMERS reply", value));
    };
    let mut consumers = Vec::with_capacity(items.len());
    for item in items {
        let Value::Bulk(fields) = item else {
            return Err(protocol("consumer info", item));
        };
        let mut name = None;
        let mut pending = 0;
        let mut idle_ms = 0;
        for pair in fields.chunks(2) {
            let [key, val] = pair else { continue };
            match (as_string(key).as_deref(), val) {
                (Some("name"), val) => name = as_string(val),
                (Some("pending"), Value::Int(n)) => pending = u64::try_from(*n).unwrap_or(0),
                (Some("idle"), Value::Int(n)) => idle_ms = u64::try_from(*n).unwrap_or(0),
                _ => {}
            }
        }
        let name = name.ok_or_else(|| protocol("consumer info", item))?;
        consumers.push(ConsumerInfo {
            name,
            pending,
            idle_ms,
        });
    }
    Ok(consumers)
}
