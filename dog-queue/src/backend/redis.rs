//! Redis backend.
//!
//! Layout under a namespace `ns`:
//!
//! | key | type | content |
//! |---|---|---|
//! | `ns:seq` | string | enqueue counter |
//! | `ns:queues` | set | known queue names |
//! | `ns:job:{id}` | hash | job state, message JSON under `message` |
//! | `ns:queue:{q}:pending` | zset | `{seq:020}:{id}` scored by `visible_at` (ms) |
//! | `ns:queue:{q}:running` | zset | job ids scored by `lease_until` (ms) |
//! | `ns:queue:{q}:dead` | list | dead-lettered job ids, oldest first |
//!
//! Every state transition is one Lua script, so a job moves between
//! pending, running and dead atomically. Pending members lead with the
//! zero-padded enqueue sequence, so the zset's lexical tie-break between equal
//! scores is enqueue order across every producer process.
//!
//! Scripts derive queue keys from the namespace, so the backend expects a
//! single Redis instance rather than a cluster.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    QueueResult, QueueError, JobId, JobMessage, JobRecord, JobStatus, LeasedJob, JobEvent,
    backend::{BoxStream, FailDisposition, QueueBackend},
    types::{later_by, LeaseToken, WorkerId},
};

/// Default key namespace
pub const DEFAULT_NAMESPACE: &str = "dog-queue";

/// Helpers prepended to every script.
///
/// `check_lease` returns 'unknown' (missing or not running), 'expired' (token
/// mismatch or lapsed) or 'ok'. `pending_member` builds the pending zset member
/// of a job; the id starts at character 22.
const HELPERS: &str = r#"
local function check_lease(key, token, now)
  local f = redis.call('HMGET', key, 'status', 'lease_token', 'lease_until')
  if not f[1] or f[1] ~= 'running' then return 'unknown' end
  if f[2] ~= token or tonumber(f[3]) < tonumber(now) then return 'expired' end
  return 'ok'
end
local function pending_member(key, id)
  return string.format('%020d', tonumber(redis.call('HGET', key, 'seq'))) .. ':' .. id
end
"#;

// KEYS: job, pending, queues, seq
// ARGV: id, queue, message, now, visible_at, max_retries
const ENQUEUE: &str = r#"
local seq = redis.call('INCR', KEYS[4])
redis.call('HSET', KEYS[1],
  'job_id', ARGV[1], 'queue', ARGV[2], 'message', ARGV[3], 'seq', seq,
  'status', 'queued', 'attempts', 0, 'max_retries', ARGV[6],
  'created_at', ARGV[4], 'updated_at', ARGV[4], 'visible_at', ARGV[5])
redis.call('ZADD', KEYS[2], ARGV[5], pending_member(KEYS[1], ARGV[1]))
redis.call('SADD', KEYS[3], ARGV[2])
return seq
"#;

// KEYS: pending, running
// ARGV: now, lease_until, token, worker, job key prefix
const LEASE: &str = r#"
local members = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #members == 0 then return false end
local id = string.sub(members[1], 22)
local key = ARGV[5] .. id
redis.call('ZREM', KEYS[1], members[1])
redis.call('ZADD', KEYS[2], ARGV[2], id)
redis.call('HINCRBY', key, 'attempts', 1)
redis.call('HSET', key, 'status', 'running', 'lease_token', ARGV[3],
  'lease_until', ARGV[2], 'leased_by', ARGV[4], 'updated_at', ARGV[1])
return redis.call('HGETALL', key)
"#;

// KEYS: job
// ARGV: ns, id, token, now
const ACKNOWLEDGE: &str = r#"
local state = check_lease(KEYS[1], ARGV[3], ARGV[4])
if state ~= 'ok' then return state end
local queue = redis.call('HGET', KEYS[1], 'queue')
redis.call('HSET', KEYS[1], 'status', 'finished', 'updated_at', ARGV[4])
redis.call('HDEL', KEYS[1], 'lease_token', 'lease_until', 'leased_by')
redis.call('ZREM', ARGV[1] .. ':queue:' .. queue .. ':running', ARGV[2])
return 'ok'
"#;

// KEYS: job
// ARGV: ns, id, token, now, mode ('retry' | 'dead'), visible_at, error
const FAIL: &str = r#"
local state = check_lease(KEYS[1], ARGV[3], ARGV[4])
if state ~= 'ok' then return state end
local queue = redis.call('HGET', KEYS[1], 'queue')
local prefix = ARGV[1] .. ':queue:' .. queue
redis.call('HDEL', KEYS[1], 'lease_token', 'lease_until', 'leased_by')
redis.call('ZREM', prefix .. ':running', ARGV[2])
if ARGV[5] == 'retry' then
  redis.call('HSET', KEYS[1], 'status', 'failed', 'visible_at', ARGV[6],
    'last_error', ARGV[7], 'updated_at', ARGV[4])
  redis.call('ZADD', prefix .. ':pending', ARGV[6], pending_member(KEYS[1], ARGV[2]))
  return 'failed'
end
redis.call('HSET', KEYS[1], 'status', 'dead_lettered', 'last_error', ARGV[7], 'updated_at', ARGV[4])
redis.call('RPUSH', prefix .. ':dead', ARGV[2])
return 'dead_lettered'
"#;

// KEYS: job
// ARGV: ns, id, token, now, extra, latest
const HEARTBEAT: &str = r#"
local state = check_lease(KEYS[1], ARGV[3], ARGV[4])
if state ~= 'ok' then return state end
local queue = redis.call('HGET', KEYS[1], 'queue')
local until_ms = tonumber(redis.call('HGET', KEYS[1], 'lease_until')) + tonumber(ARGV[5])
until_ms = string.format('%d', math.min(until_ms, tonumber(ARGV[6])))
redis.call('HSET', KEYS[1], 'lease_until', until_ms, 'updated_at', ARGV[4])
redis.call('ZADD', ARGV[1] .. ':queue:' .. queue .. ':running', until_ms, ARGV[2])
return until_ms
"#;

// KEYS: job
// ARGV: ns, id, now
const CANCEL: &str = r#"
local f = redis.call('HMGET', KEYS[1], 'status', 'queue')
if not f[1] then return 'unknown' end
if f[1] ~= 'queued' and f[1] ~= 'failed' then return 'busy' end
redis.call('HSET', KEYS[1], 'status', 'cancelled', 'updated_at', ARGV[3])
redis.call('ZREM', ARGV[1] .. ':queue:' .. f[2] .. ':pending', pending_member(KEYS[1], ARGV[2]))
return 'ok'
"#;

// KEYS: job
// ARGV: ns, id, now
const REQUEUE_DEAD: &str = r#"
local f = redis.call('HMGET', KEYS[1], 'status', 'queue')
if not f[1] then return 'unknown' end
if f[1] ~= 'dead_lettered' then return f[1] end
local prefix = ARGV[1] .. ':queue:' .. f[2]
redis.call('HSET', KEYS[1], 'status', 'queued', 'attempts', 0, 'visible_at', ARGV[3], 'updated_at', ARGV[3])
redis.call('LREM', prefix .. ':dead', 0, ARGV[2])
redis.call('ZADD', prefix .. ':pending', ARGV[3], pending_member(KEYS[1], ARGV[2]))
return 'ok'
"#;

// ARGV: ns, queue, now
// Returns a flat list of id, outcome ('retry' | 'dead') pairs
const RECLAIM: &str = r#"
local prefix = ARGV[1] .. ':queue:' .. ARGV[2]
local running = prefix .. ':running'
local ids = redis.call('ZRANGEBYSCORE', running, '-inf', '(' .. ARGV[3])
local out = {}
for _, id in ipairs(ids) do
  local key = ARGV[1] .. ':job:' .. id
  local f = redis.call('HMGET', key, 'attempts', 'max_retries')
  local attempts = tonumber(f[1]) or 0
  local max_retries = tonumber(f[2]) or 0
  redis.call('ZREM', running, id)
  redis.call('HDEL', key, 'lease_token', 'lease_until', 'leased_by')
  if attempts <= max_retries then
    redis.call('HSET', key, 'status', 'failed', 'visible_at', ARGV[3],
      'last_error', 'Lease expired', 'updated_at', ARGV[3])
    redis.call('ZADD', prefix .. ':pending', ARGV[3], pending_member(key, id))
    table.insert(out, id)
    table.insert(out, 'retry')
  else
    redis.call('HSET', key, 'status', 'dead_lettered',
      'last_error', 'Lease expired after ' .. attempts .. ' attempts', 'updated_at', ARGV[3])
    redis.call('RPUSH', prefix .. ':dead', id)
    table.insert(out, id)
    table.insert(out, 'dead')
  end
end
return out
"#;

struct Scripts {
    enqueue: Script,
    lease: Script,
    acknowledge: Script,
    fail: Script,
    heartbeat: Script,
    cancel: Script,
    requeue_dead: Script,
    reclaim: Script,
}

impl Scripts {
    fn load() -> Self {
        let script = |body: &str| Script::new(&format!("{}{}", HELPERS, body));
        Self {
            enqueue: script(ENQUEUE),
            lease: script(LEASE),
            acknowledge: script(ACKNOWLEDGE),
            fail: script(FAIL),
            heartbeat: script(HEARTBEAT),
            cancel: script(CANCEL),
            requeue_dead: script(REQUEUE_DEAD),
            reclaim: script(RECLAIM),
        }
    }
}

/// Redis-backed queue store shared by any number of worker processes
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    namespace: String,
    scripts: Arc<Scripts>,

    /// Events raised by operations of this process
    event_broadcaster: broadcast::Sender<JobEvent>,
}

impl RedisBackend {
    /// Connect to `url` (`redis://host:port/db`) under the default namespace
    pub async fn connect(url: &str) -> QueueResult<Self> {
        Self::connect_with_namespace(url, DEFAULT_NAMESPACE).await
    }

    pub async fn connect_with_namespace(url: &str, namespace: impl Into<String>) -> QueueResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        let namespace = namespace.into();
        info!(namespace = %namespace, "Connected to redis queue store");
        Ok(Self::from_connection(conn, namespace))
    }

    pub fn from_connection(conn: ConnectionManager, namespace: impl Into<String>) -> Self {
        let (event_broadcaster, _) = broadcast::channel(1000);
        Self {
            conn,
            namespace: namespace.into(),
            scripts: Arc::new(Scripts::load()),
            event_broadcaster,
        }
    }

    fn job_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.namespace, job_id)
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.namespace)
    }

    fn queue_key(&self, queue: &str, index: &str) -> String {
        format!("{}:queue:{}:{}", self.namespace, queue, index)
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.event_broadcaster.send(event);
    }

    async fn load_record(&self, job_id: &JobId) -> QueueResult<JobRecord> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(job_id)).await?;
        if fields.is_empty() {
            return Err(QueueError::UnknownJob(job_id.clone()));
        }
        record_from_fields(&fields)
    }
}

/// Map a lease-check script reply onto the queue error it stands for
fn lease_reply(reply: &str, job_id: &JobId) -> QueueResult<()> {
    match reply {
        "unknown" => Err(QueueError::UnknownJob(job_id.clone())),
        "expired" => Err(QueueError::LeaseExpired(job_id.clone())),
        _ => Ok(()),
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Whole milliseconds, saturating; the scripts clamp sums to the latest instant
fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Decode the reclaim script's flat `id, outcome, id, outcome, ...` reply.
/// `true` marks a job that was dead-lettered rather than returned to pending.
fn reclaim_outcomes(reply: redis::Value) -> QueueResult<Vec<(JobId, bool)>> {
    let items: Vec<String> = redis::from_redis_value(&reply)?;
    if items.len() % 2 != 0 {
        return Err(QueueError::Internal(format!(
            "reclaim reply has an odd number of items ({})",
            items.len()
        )));
    }

    items
        .chunks(2)
        .map(|pair| match pair[1].as_str() {
            "retry" => Ok((JobId::from(pair[0].as_str()), false)),
            "dead" => Ok((JobId::from(pair[0].as_str()), true)),
            other => Err(QueueError::Internal(format!("unknown reclaim outcome '{}'", other))),
        })
        .collect()
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> QueueResult<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| QueueError::Internal(format!("job hash is missing field '{}'", name)))
}

fn parse_field<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> QueueResult<T> {
    field(fields, name)?
        .parse()
        .map_err(|_| QueueError::Internal(format!("job hash field '{}' is malformed", name)))
}

fn parse_time(fields: &HashMap<String, String>, name: &str) -> QueueResult<DateTime<Utc>> {
    let ms: i64 = parse_field(fields, name)?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Internal(format!("job hash field '{}' is out of range", name)))
}

fn parse_status(value: &str) -> QueueResult<JobStatus> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| QueueError::Internal(format!("unknown job status '{}'", value)))
}

/// Rebuild a [`JobRecord`] from its hash fields
fn record_from_fields(fields: &HashMap<String, String>) -> QueueResult<JobRecord> {
    let message: JobMessage = serde_json::from_str(field(fields, "message")?)?;
    let lease_until = match fields.get("lease_until") {
        Some(_) => Some(parse_time(fields, "lease_until")?),
        None => None,
    };

    Ok(JobRecord {
        job_id: JobId::from(field(fields, "job_id")?),
        seq: parse_field(fields, "seq")?,
        message,
        status: parse_status(field(fields, "status")?)?,
        attempts: parse_field(fields, "attempts")?,
        created_at: parse_time(fields, "created_at")?,
        updated_at: parse_time(fields, "updated_at")?,
        visible_at: parse_time(fields, "visible_at")?,
        last_error: fields.get("last_error").cloned(),
        lease_token: fields.get("lease_token").map(|t| LeaseToken::from(t.as_str())),
        lease_until,
        leased_by: fields.get("leased_by").map(|w| WorkerId::from(w.as_str())),
    })
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn enqueue(&self, message: JobMessage) -> QueueResult<JobId> {
        let now = Utc::now();
        let job_id = JobId::new();
        let visible_at = message.visible_at(now);
        let payload = serde_json::to_string(&message)?;
        let mut conn = self.conn.clone();

        let _seq: u64 = self
            .scripts
            .enqueue
            .key(self.job_key(&job_id))
            .key(self.queue_key(&message.queue, "pending"))
            .key(format!("{}:queues", self.namespace))
            .key(format!("{}:seq", self.namespace))
            .arg(job_id.as_str())
            .arg(&message.queue)
            .arg(payload)
            .arg(millis(now))
            .arg(millis(visible_at))
            .arg(message.max_retries)
            .invoke_async(&mut conn)
            .await?;

        self.emit(JobEvent::Enqueued {
            job_id: job_id.clone(),
            queue: message.queue,
            handler: message.handler,
            at: now,
        });
        Ok(job_id)
    }

    async fn lease(
        &self,
        queue: &str,
        worker: &WorkerId,
        lease_duration: Duration,
    ) -> QueueResult<Option<LeasedJob>> {
        let now = Utc::now();
        let lease_until = later_by(now, lease_duration);
        let lease_token = LeaseToken::new();
        let mut conn = self.conn.clone();

        let fields: Option<HashMap<String, String>> = self
            .scripts
            .lease
            .key(self.queue_key(queue, "pending"))
            .key(self.queue_key(queue, "running"))
            .arg(millis(now))
            .arg(millis(lease_until))
            .arg(lease_token.as_str())
            .arg(worker.as_str())
            .arg(self.job_prefix())
            .invoke_async(&mut conn)
            .await?;

        let Some(fields) = fields.filter(|f| !f.is_empty()) else {
            return Ok(None);
        };
        let record = record_from_fields(&fields)?;
        // Stored with millisecond precision; hand back the stored instant
        let lease_until = record.lease_until.unwrap_or(lease_until);
        let leased = LeasedJob::new(record, lease_token, lease_until);

        self.emit(JobEvent::Leased {
            job_id: leased.job_id().clone(),
            worker: worker.clone(),
            attempt: leased.attempt(),
            lease_until,
            at: now,
        });
        Ok(Some(leased))
    }

    async fn acknowledge(&self, job_id: &JobId, lease_token: &LeaseToken) -> QueueResult<()> {
        let now = Utc::now();
        let mut conn = self.conn.clone();

        let reply: String = self
            .scripts
            .acknowledge
            .key(self.job_key(job_id))
            .arg(&self.namespace)
            .arg(job_id.as_str())
            .arg(lease_token.as_str())
            .arg(millis(now))
            .invoke_async(&mut conn)
            .await?;
        lease_reply(&reply, job_id)?;

        self.emit(JobEvent::Finished {
            job_id: job_id.clone(),
            at: now,
        });
        Ok(())
    }

    async fn fail(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        error: String,
        disposition: FailDisposition,
    ) -> QueueResult<JobStatus> {
        let now = Utc::now();
        let (mode, visible_at) = match disposition {
            FailDisposition::Retry { visible_at } => ("retry", visible_at),
            FailDisposition::DeadLetter => ("dead", now),
        };
        let mut conn = self.conn.clone();

        let reply: String = self
            .scripts
            .fail
            .key(self.job_key(job_id))
            .arg(&self.namespace)
            .arg(job_id.as_str())
            .arg(lease_token.as_str())
            .arg(millis(now))
            .arg(mode)
            .arg(millis(visible_at))
            .arg(&error)
            .invoke_async(&mut conn)
            .await?;
        lease_reply(&reply, job_id)?;

        let status = parse_status(&reply)?;
        let event = match disposition {
            FailDisposition::Retry { visible_at } => JobEvent::Retrying {
                job_id: job_id.clone(),
                retry_at: visible_at,
                error,
                at: now,
            },
            FailDisposition::DeadLetter => JobEvent::DeadLettered {
                job_id: job_id.clone(),
                error,
                at: now,
            },
        };
        self.emit(event);
        Ok(status)
    }

    async fn heartbeat(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        extra_time: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        let now = Utc::now();
        let mut conn = self.conn.clone();

        let reply: String = self
            .scripts
            .heartbeat
            .key(self.job_key(job_id))
            .arg(&self.namespace)
            .arg(job_id.as_str())
            .arg(lease_token.as_str())
            .arg(millis(now))
            .arg(duration_millis(extra_time))
            .arg(millis(DateTime::<Utc>::MAX_UTC))
            .invoke_async(&mut conn)
            .await?;
        lease_reply(&reply, job_id)?;

        reply
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| QueueError::Internal(format!("unexpected heartbeat reply '{}'", reply)))
    }

    async fn cancel(&self, job_id: &JobId) -> QueueResult<bool> {
        let now = Utc::now();
        let mut conn = self.conn.clone();

        let reply: String = self
            .scripts
            .cancel
            .key(self.job_key(job_id))
            .arg(&self.namespace)
            .arg(job_id.as_str())
            .arg(millis(now))
            .invoke_async(&mut conn)
            .await?;

        match reply.as_str() {
            "unknown" => Err(QueueError::UnknownJob(job_id.clone())),
            "ok" => {
                self.emit(JobEvent::Cancelled {
                    job_id: job_id.clone(),
                    at: now,
                });
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_record(&self, job_id: &JobId) -> QueueResult<JobRecord> {
        self.load_record(job_id).await
    }

    async fn pending_count(&self, queue: &str) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(self.queue_key(queue, "pending")).await?)
    }

    async fn running_count(&self, queue: &str) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(self.queue_key(queue, "running")).await?)
    }

    async fn dead_letters(&self, queue: &str) -> QueueResult<Vec<JobRecord>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.lrange(self.queue_key(queue, "dead"), 0, -1).await?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_record(&JobId::from(id)).await {
                Ok(record) => records.push(record),
                Err(QueueError::UnknownJob(job_id)) => debug!(job_id = %job_id, "Dead-letter entry without record"),
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn requeue_dead(&self, job_id: &JobId) -> QueueResult<()> {
        let now = Utc::now();
        let mut conn = self.conn.clone();

        let reply: String = self
            .scripts
            .requeue_dead
            .key(self.job_key(job_id))
            .arg(&self.namespace)
            .arg(job_id.as_str())
            .arg(millis(now))
            .invoke_async(&mut conn)
            .await?;

        match reply.as_str() {
            "ok" => {}
            "unknown" => return Err(QueueError::UnknownJob(job_id.clone())),
            status => {
                return Err(QueueError::InvalidJob(format!(
                    "job {} is {}, not dead-lettered",
                    job_id, status
                )))
            }
        }

        let record = self.load_record(job_id).await?;
        self.emit(JobEvent::Enqueued {
            job_id: job_id.clone(),
            queue: record.message.queue,
            handler: record.message.handler,
            at: now,
        });
        Ok(())
    }

    async fn reclaim_expired(&self) -> QueueResult<usize> {
        let now = Utc::now();
        let mut conn = self.conn.clone();
        let queues: Vec<String> = conn.smembers(format!("{}:queues", self.namespace)).await?;

        let mut reclaimed = 0;
        for queue in queues {
            let reply: redis::Value = self
                .scripts
                .reclaim
                .arg(&self.namespace)
                .arg(&queue)
                .arg(millis(now))
                .invoke_async(&mut conn)
                .await?;

            for (job_id, dead_lettered) in reclaim_outcomes(reply)? {
                debug!(job_id = %job_id, queue = %queue, "Reclaimed expired lease");
                self.emit(JobEvent::Reclaimed {
                    job_id: job_id.clone(),
                    at: now,
                });
                if dead_lettered {
                    self.emit(JobEvent::DeadLettered {
                        job_id,
                        error: "Lease expired".to_string(),
                        at: now,
                    });
                }
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    fn event_stream(&self) -> BoxStream<JobEvent> {
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};
        let stream = BroadcastStream::new(self.event_broadcaster.subscribe())
            .filter_map(|result| result.ok());
        Box::pin(stream)
    }
}
