//! Redis-backed task queue.
//!
//! Per routing key `rk`:
//! - `fleet:queue:{rk}:ready`: sorted set of task ids scored by [`QueuedTask::score`]
//! - `fleet:queue:{rk}:delayed`: sorted set of `"{score}|{id}"` scored by eligibility (ms)
//! - `fleet:queue:{rk}:tasks`: hash id -> task JSON for queued tasks
//! - `fleet:queue:{rk}:processing`: hash id -> task JSON for claimed tasks
//! - `fleet:queue:{rk}:dead`: capped list of dead-letter JSON, newest first
//! - `fleet:queue:{rk}:dedup:{key}`: dedup marker with TTL

use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, warn};

use super::types::{
    DeadLetterEntry, FailOutcome, NewTask, QueueConfig, QueueStats, QueuedTask, RetryPolicy,
    TaskId, chrono_delay,
};
use super::{QueueError, TaskQueue};

const ROUTING_KEYS: &str = "fleet:queue:routing_keys";

/// Promote due delayed tasks, then pop the best ready one into processing.
const DEQUEUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, member in ipairs(due) do
    local sep = string.find(member, '|', 1, true)
    redis.call('ZADD', KEYS[1], tonumber(string.sub(member, 1, sep - 1)), string.sub(member, sep + 1))
    redis.call('ZREM', KEYS[2], member)
end
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
    return false
end
local id = popped[1]
local body = redis.call('HGET', KEYS[3], id)
if not body then
    return false
end
redis.call('HDEL', KEYS[3], id)
redis.call('HSET', KEYS[4], id, body)
return body
"#;

pub struct RedisTaskQueue {
    connection: MultiplexedConnection,
    dequeue: Script,
    config: QueueConfig,
    policy: RetryPolicy,
}

struct Keys {
    ready: String,
    delayed: String,
    tasks: String,
    processing: String,
    dead: String,
    prefix: String,
}

impl Keys {
    fn new(routing_key: &str) -> Self {
        let prefix = format!("fleet:queue:{routing_key}");
        Self {
            ready: format!("{prefix}:ready"),
            delayed: format!("{prefix}:delayed"),
            tasks: format!("{prefix}:tasks"),
            processing: format!("{prefix}:processing"),
            dead: format!("{prefix}:dead"),
            prefix,
        }
    }

    fn dedup(&self, key: &str) -> String {
        format!("{}:dedup:{key}", self.prefix)
    }
}

impl RedisTaskQueue {
    pub async fn connect(redis_url: &str, config: QueueConfig) -> Result<Self, QueueError> {
        let client = Client::open(redis_url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self::with_connection(connection, config))
    }

    pub fn with_connection(connection: MultiplexedConnection, config: QueueConfig) -> Self {
        Self {
            connection,
            dequeue: Script::new(DEQUEUE_SCRIPT),
            policy: config.retry_policy(),
            config,
        }
    }

    /// Put `task` on the ready set, or on the delayed set if not yet eligible.
    fn push_pipe(pipe: &mut redis::Pipeline, keys: &Keys, task: &QueuedTask, body: &str) {
        let id = task.id.to_string();
        pipe.hset(&keys.tasks, &id, body).ignore();
        let available_ms = task.available_at.timestamp_millis();
        if available_ms <= Utc::now().timestamp_millis() {
            pipe.zadd(&keys.ready, &id, task.score()).ignore();
        } else {
            let member = format!("{}|{}", task.score(), id);
            pipe.zadd(&keys.delayed, member, available_ms).ignore();
        }
    }
}

#[async_trait::async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: NewTask) -> Result<Option<TaskId>, QueueError> {
        let mut conn = self.connection.clone();
        let keys = Keys::new(&task.routing_key);

        if task.deduplicate {
            let fresh: Option<String> = redis::cmd("SET")
                .arg(keys.dedup(&task.dedup_key()))
                .arg(1)
                .arg("NX")
                .arg("EX")
                .arg(self.config.dedup_ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await?;
            if fresh.is_none() {
                debug!(routing_key = %task.routing_key, "duplicate task dropped");
                return Ok(None);
            }
        }

        let queued = QueuedTask::from_new(task, self.config.max_retries);
        let body = serde_json::to_string(&queued)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.sadd(ROUTING_KEYS, &queued.routing_key).ignore();
        Self::push_pipe(&mut pipe, &keys, &queued, &body);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(Some(queued.id))
    }

    async fn dequeue(&self, routing_key: &str) -> Result<Option<QueuedTask>, QueueError> {
        let mut conn = self.connection.clone();
        let keys = Keys::new(routing_key);
        let body: Option<String> = self
            .dequeue
            .key(&keys.ready)
            .key(&keys.delayed)
            .key(&keys.tasks)
            .key(&keys.processing)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        body.map(|b| serde_json::from_str(&b).map_err(QueueError::from))
            .transpose()
    }

    async fn complete(&self, task: &QueuedTask) -> Result<(), QueueError> {
        let mut conn = self.connection.clone();
        let keys = Keys::new(&task.routing_key);
        conn.hdel::<_, _, ()>(&keys.processing, task.id.to_string())
            .await?;
        Ok(())
    }

    async fn fail(&self, task: &QueuedTask, error: &str) -> Result<FailOutcome, QueueError> {
        let mut conn = self.connection.clone();
        let keys = Keys::new(&task.routing_key);
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hdel(&keys.processing, task.id.to_string()).ignore();

        let outcome = if task.retry_count < task.max_retries {
            let retry_count = task.retry_count + 1;
            let delay = self.policy.delay_for_retry(retry_count);
            let mut retried = task.clone();
            retried.retry_count = retry_count;
            retried.available_at = Utc::now() + chrono_delay(delay);
            retried.last_error = Some(error.to_string());
            let body = serde_json::to_string(&retried)?;
            Self::push_pipe(&mut pipe, &keys, &retried, &body);
            debug!(task_id = %task.id, retry_count, delay_secs = delay.as_secs(), "task scheduled for retry");
            FailOutcome::Retried { retry_count, delay }
        } else {
            let entry = DeadLetterEntry::new(task.clone(), error.to_string());
            pipe.lpush(&keys.dead, serde_json::to_string(&entry)?).ignore();
            pipe.ltrim(&keys.dead, 0, self.config.dead_letter_cap as isize - 1)
                .ignore();
            warn!(task_id = %task.id, kind = task.kind.type_name(), error, "task dead-lettered");
            FailOutcome::DeadLettered
        };

        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(outcome)
    }

    async fn stats(&self, routing_key: &str) -> Result<QueueStats, QueueError> {
        let mut conn = self.connection.clone();
        let keys = Keys::new(routing_key);
        let (ready, delayed, processing, dead): (usize, usize, usize, usize) = redis::pipe()
            .zcard(&keys.ready)
            .zcard(&keys.delayed)
            .hlen(&keys.processing)
            .llen(&keys.dead)
            .query_async(&mut conn)
            .await?;
        Ok(QueueStats {
            queued: ready + delayed,
            processing,
            dead,
        })
    }

    async fn dead_letters(
        &self,
        routing_key: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let keys = Keys::new(routing_key);
        let raw: Vec<String> = conn.lrange(&keys.dead, 0, limit as isize - 1).await?;
        raw.iter()
            .map(|b| serde_json::from_str(b).map_err(QueueError::from))
            .collect()
    }

    async fn recover_processing(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection.clone();
        let routing_keys: Vec<String> = conn.smembers(ROUTING_KEYS).await?;
        let mut recovered = 0;
        for routing_key in routing_keys {
            let keys = Keys::new(&routing_key);
            let stranded: Vec<(String, String)> = conn.hgetall(&keys.processing).await?;
            if stranded.is_empty() {
                continue;
            }
            let mut pipe = redis::pipe();
            pipe.atomic();
            for (id, body) in &stranded {
                let task: QueuedTask = serde_json::from_str(body)?;
                pipe.hdel(&keys.processing, id).ignore();
                pipe.hset(&keys.tasks, id, body).ignore();
                pipe.zadd(&keys.ready, id, task.score()).ignore();
            }
            pipe.query_async::<_, ()>(&mut conn).await?;
            recovered += stranded.len();
        }
        Ok(recovered)
    }
}
