use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::str::FromStr;

use super::{decode_payload, validate_request, JobBroker, QueueError, QueueSettings};
use crate::models::job::{
    EnqueueOutcome, FailOutcome, Job, JobRequest, JobStatus, Priority, QueueName, QueueStats,
};
use crate::services::retry::{backoff_delay, should_retry};

// Every script takes the queue's base key as KEYS[1] and derives the rest:
//   {base}:job:{id}    hash with the job record
//   {base}:waiting     zset, score = priority * 1e13 + sequence
//   {base}:delayed     zset, score = ready-at (ms)
//   {base}:active      zset, score = lease deadline (ms)
//   {base}:completed   zset, score = finished-at (ms)
//   {base}:failed      zset, score = finished-at (ms)
//   {base}:limiter:{s} dequeue counter for one wall-clock second
// Time always comes from the Redis server so replicas agree on it.

const PRELUDE: &str = r#"
local base = KEYS[1]
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local function job_key(id) return base .. ':job:' .. id end
local function push_waiting(id)
  local seq = redis.call('INCR', base .. ':seq')
  local priority = tonumber(redis.call('HGET', job_key(id), 'priority') or '5')
  redis.call('HSET', job_key(id), 'status', 'waiting')
  redis.call('ZADD', base .. ':waiting', priority * 10000000000000 + seq, id)
end
local function purge(set, retention)
  local cutoff = now - retention
  for _, id in ipairs(redis.call('ZRANGEBYSCORE', base .. ':' .. set, '-inf', cutoff)) do
    redis.call('DEL', job_key(id))
  end
  redis.call('ZREMRANGEBYSCORE', base .. ':' .. set, '-inf', cutoff)
end
local function holds_lease(id, token)
  return redis.call('HGET', job_key(id), 'status') == 'active'
    and redis.call('HGET', job_key(id), 'lease') == token
end
"#;

// ARGV: id, payload, priority, max_attempts, retention_ms
const ENQUEUE: &str = r#"
local id = ARGV[1]
purge('completed', tonumber(ARGV[5]))
purge('failed', tonumber(ARGV[5]))
local status = redis.call('HGET', job_key(id), 'status')
if status == 'waiting' or status == 'delayed' or status == 'active' or status == 'completed' then
  return 0
end
if status then
  redis.call('ZREM', base .. ':failed', id)
  redis.call('DEL', job_key(id))
end
redis.call('HSET', job_key(id), 'id', id, 'payload', ARGV[2], 'priority', ARGV[3],
  'attempts', 0, 'max_attempts', ARGV[4], 'created_at', now)
push_waiting(id)
return 1
"#;

// ARGV: lease_ms, rate_limit, lease_token
const DEQUEUE: &str = r#"
for _, id in ipairs(redis.call('ZRANGEBYSCORE', base .. ':delayed', '-inf', now)) do
  redis.call('ZREM', base .. ':delayed', id)
  push_waiting(id)
end
for _, id in ipairs(redis.call('ZRANGEBYSCORE', base .. ':active', '-inf', now)) do
  redis.call('ZREM', base .. ':active', id)
  redis.call('HDEL', job_key(id), 'lease')
  local attempts = tonumber(redis.call('HGET', job_key(id), 'attempts') or '0')
  local max_attempts = tonumber(redis.call('HGET', job_key(id), 'max_attempts') or '1')
  if attempts >= max_attempts then
    redis.call('HSET', job_key(id), 'status', 'failed', 'finished_at', now, 'last_error', 'lease expired')
    redis.call('ZADD', base .. ':failed', now, id)
  else
    push_waiting(id)
  end
end
local window = base .. ':limiter:' .. math.floor(now / 1000)
if tonumber(redis.call('GET', window) or '0') >= tonumber(ARGV[2]) then
  return {'limited'}
end
local popped = redis.call('ZPOPMIN', base .. ':waiting')
if #popped == 0 then
  return {}
end
local id = popped[1]
if redis.call('EXISTS', job_key(id)) == 0 then
  return {}
end
redis.call('INCR', window)
redis.call('PEXPIRE', window, 2000)
redis.call('HINCRBY', job_key(id), 'attempts', 1)
redis.call('HSET', job_key(id), 'status', 'active', 'started_at', now, 'lease', ARGV[3])
redis.call('ZADD', base .. ':active', now + tonumber(ARGV[1]), id)
return redis.call('HGETALL', job_key(id))
"#;

// ARGV: id, lease_token, retention_ms
const ACK: &str = r#"
local id = ARGV[1]
if not holds_lease(id, ARGV[2]) then
  return 0
end
redis.call('ZREM', base .. ':active', id)
redis.call('HDEL', job_key(id), 'lease')
redis.call('HSET', job_key(id), 'status', 'completed', 'finished_at', now)
redis.call('ZADD', base .. ':completed', now, id)
purge('completed', tonumber(ARGV[3]))
purge('failed', tonumber(ARGV[3]))
return 1
"#;

// ARGV: id, lease_token, error, retention_ms, retry_delay_ms (negative = terminal)
const FAIL: &str = r#"
local id = ARGV[1]
if not holds_lease(id, ARGV[2]) then
  return 0
end
redis.call('ZREM', base .. ':active', id)
redis.call('HDEL', job_key(id), 'lease')
redis.call('HSET', job_key(id), 'last_error', ARGV[3])
local delay = tonumber(ARGV[5])
if delay >= 0 then
  redis.call('HSET', job_key(id), 'status', 'delayed')
  redis.call('ZADD', base .. ':delayed', now + delay, id)
  return 1
end
redis.call('HSET', job_key(id), 'status', 'failed', 'finished_at', now)
redis.call('ZADD', base .. ':failed', now, id)
purge('completed', tonumber(ARGV[4]))
purge('failed', tonumber(ARGV[4]))
return 2
"#;

// ARGV: id, lease_token, lease_ms
const EXTEND: &str = r#"
local id = ARGV[1]
if not holds_lease(id, ARGV[2]) then
  return 0
end
redis.call('ZADD', base .. ':active', 'XX', now + tonumber(ARGV[3]), id)
return 1
"#;

// ARGV: id
const RETRY_FAILED: &str = r#"
local id = ARGV[1]
if redis.call('HGET', job_key(id), 'status') ~= 'failed' then
  return 0
end
redis.call('ZREM', base .. ':failed', id)
redis.call('HSET', job_key(id), 'attempts', 0)
redis.call('HDEL', job_key(id), 'finished_at', 'started_at', 'last_error')
push_waiting(id)
return 1
"#;

struct Scripts {
    enqueue: Script,
    dequeue: Script,
    ack: Script,
    fail: Script,
    extend: Script,
    retry_failed: Script,
}

impl Scripts {
    fn load() -> Self {
        let build = |body: &str| Script::new(&format!("{PRELUDE}{body}"));
        Self {
            enqueue: build(ENQUEUE),
            dequeue: build(DEQUEUE),
            ack: build(ACK),
            fail: build(FAIL),
            extend: build(EXTEND),
            retry_failed: build(RETRY_FAILED),
        }
    }
}

/// Redis-backed job broker shared by every worker replica.
pub struct JobQueue {
    conn: ConnectionManager,
    prefix: String,
    settings: QueueSettings,
    scripts: Scripts,
}

impl JobQueue {
    pub async fn connect(
        redis_url: &str,
        prefix: &str,
        settings: QueueSettings,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        let conn = ConnectionManager::new(client).await.map_err(QueueError::Redis)?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            settings,
            scripts: Scripts::load(),
        })
    }

    fn base_key(&self, queue: QueueName) -> String {
        format!("{}:{}", self.prefix, queue)
    }

    fn lease_token(job: &Job) -> Result<&str, QueueError> {
        job.lease_token.as_deref().ok_or_else(|| QueueError::LeaseLost {
            id: job.id.clone(),
        })
    }
}

#[async_trait]
impl JobBroker for JobQueue {
    async fn enqueue(&self, request: JobRequest) -> Result<EnqueueOutcome, QueueError> {
        validate_request(&request)?;
        let queue = request.queue();
        let payload = request.payload.to_json()?;
        let mut conn = self.conn.clone();

        let created: i64 = self
            .scripts
            .enqueue
            .key(self.base_key(queue))
            .arg(&request.id)
            .arg(payload)
            .arg(u32::from(request.priority.value()))
            .arg(queue.max_attempts())
            .arg(self.settings.retention.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        if created == 1 {
            tracing::debug!(job_id = %request.id, queue = %queue, "Job enqueued");
            Ok(EnqueueOutcome::Accepted(request.id))
        } else {
            tracing::debug!(job_id = %request.id, queue = %queue, "Job already outstanding or completed");
            Ok(EnqueueOutcome::Deduplicated(request.id))
        }
    }

    async fn dequeue(&self, queue: QueueName) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let token = uuid::Uuid::new_v4().to_string();

        let reply: Vec<String> = self
            .scripts
            .dequeue
            .key(self.base_key(queue))
            .arg(self.settings.lease.as_millis() as u64)
            .arg(self.settings.rate_limit_per_sec)
            .arg(&token)
            .invoke_async(&mut conn)
            .await?;

        match reply.len() {
            0 => Ok(None),
            1 => {
                tracing::trace!(queue = %queue, "Dequeue rate limit reached");
                Ok(None)
            }
            _ => job_from_reply(queue, reply).map(Some),
        }
    }

    async fn ack(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let acked: i64 = self
            .scripts
            .ack
            .key(self.base_key(job.queue))
            .arg(&job.id)
            .arg(Self::lease_token(job)?)
            .arg(self.settings.retention.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        if acked == 1 {
            Ok(())
        } else {
            Err(QueueError::LeaseLost { id: job.id.clone() })
        }
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<FailOutcome, QueueError> {
        let retry = should_retry(job.attempts, job.max_attempts);
        let delay = backoff_delay(job.attempts);
        let delay_arg: i64 = if retry { delay.as_millis() as i64 } else { -1 };

        let mut conn = self.conn.clone();
        let result: i64 = self
            .scripts
            .fail
            .key(self.base_key(job.queue))
            .arg(&job.id)
            .arg(Self::lease_token(job)?)
            .arg(error)
            .arg(self.settings.retention.as_millis() as u64)
            .arg(delay_arg)
            .invoke_async(&mut conn)
            .await?;

        match result {
            1 => Ok(FailOutcome::Retrying {
                attempt: job.attempts,
                delay,
            }),
            2 => Ok(FailOutcome::Terminal {
                attempts: job.attempts,
            }),
            _ => Err(QueueError::LeaseLost { id: job.id.clone() }),
        }
    }

    async fn extend_lease(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .scripts
            .extend
            .key(self.base_key(job.queue))
            .arg(&job.id)
            .arg(Self::lease_token(job)?)
            .arg(self.settings.lease.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        if extended == 1 {
            Ok(())
        } else {
            Err(QueueError::LeaseLost { id: job.id.clone() })
        }
    }

    async fn stats(&self, queue: QueueName) -> Result<QueueStats, QueueError> {
        let base = self.base_key(queue);
        let mut conn = self.conn.clone();
        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .zcard(format!("{base}:waiting"))
                .zcard(format!("{base}:delayed"))
                .zcard(format!("{base}:active"))
                .zcard(format!("{base}:completed"))
                .zcard(format!("{base}:failed"))
                .query_async(&mut conn)
                .await?;

        Ok(QueueStats {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn get_job(&self, queue: QueueName, id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(format!("{}:job:{}", self.base_key(queue), id))
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(queue, fields).map(Some)
    }

    async fn retry_failed(&self, queue: QueueName, id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .scripts
            .retry_failed
            .key(self.base_key(queue))
            .arg(id)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    /// Check Redis connectivity (for health checks).
    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

fn job_from_reply(queue: QueueName, reply: Vec<String>) -> Result<Job, QueueError> {
    let mut fields = HashMap::with_capacity(reply.len() / 2);
    let mut iter = reply.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        fields.insert(key, value);
    }
    job_from_fields(queue, fields)
}

fn job_from_fields(queue: QueueName, mut fields: HashMap<String, String>) -> Result<Job, QueueError> {
    let id = fields.remove("id").unwrap_or_default();
    let corrupt = |reason: &str| QueueError::Corrupt {
        id: id.clone(),
        reason: reason.to_string(),
    };

    let payload = fields.remove("payload").ok_or_else(|| corrupt("missing payload"))?;
    let status = fields
        .get("status")
        .and_then(|s| JobStatus::from_str(s).ok())
        .ok_or_else(|| corrupt("missing or unknown status"))?;
    let number = |name: &str| -> u32 {
        fields
            .get(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    };
    let timestamp = |name: &str| -> Option<DateTime<Utc>> {
        fields
            .get(name)
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
    };

    Ok(Job {
        payload: decode_payload(queue, &payload)?,
        queue,
        priority: Priority::from_value(number("priority") as u8),
        attempts: number("attempts"),
        max_attempts: number("max_attempts"),
        status,
        created_at: timestamp("created_at").ok_or_else(|| corrupt("missing created_at"))?,
        started_at: timestamp("started_at"),
        finished_at: timestamp("finished_at"),
        last_error: fields.get("last_error").cloned(),
        lease_token: fields.get("lease").cloned(),
        id,
    })
}
