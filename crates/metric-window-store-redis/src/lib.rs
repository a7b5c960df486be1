#![allow(clippy::missing_errors_doc)]

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use metric_window_core::{
    decode_member, encode_member, SharedStoreProvider, StoreError, TimestampedValue, WindowResult,
    WindowStore,
};
use redis::{Client, Connection, RedisError};

/// Window buffers kept in Redis sorted sets, one set per entity key.
///
/// Appends go through a `MULTI`/`EXEC` pipeline (`ZADD`, `ZREMRANGEBYRANK`,
/// `ZRANGE ... WITHSCORES`), so Redis serializes concurrent writers on the
/// same key.
pub struct RedisWindowStore {
    client: Client,
    idle: Mutex<Vec<Connection>>,
    trim_slack: usize,
}

impl RedisWindowStore {
    pub fn open(redis_url: &str, trim_slack: usize) -> Result<Self> {
        let client = Client::open(redis_url)
            .with_context(|| format!("invalid redis url {redis_url}"))?;
        Ok(Self {
            client,
            idle: Mutex::new(Vec::new()),
            trim_slack,
        })
    }

    /// Opens one connection up front so an unreachable server is reported
    /// at startup rather than on the first record.
    pub fn ping(&self) -> std::result::Result<(), StoreError> {
        self.with_connection(|conn| redis::cmd("PING").query::<String>(conn).map(|_| ()))
    }

    fn checkout(&self) -> std::result::Result<Connection, StoreError> {
        let pooled = self
            .idle
            .lock()
            .map_err(|_| StoreError::Backend("redis connection pool lock poisoned".to_string()))?
            .pop();

        match pooled {
            Some(conn) => Ok(conn),
            None => {
                tracing::debug!("opening redis connection");
                self.client.get_connection().map_err(|err| classify(&err))
            }
        }
    }

    fn checkin(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> std::result::Result<T, RedisError>,
    ) -> std::result::Result<T, StoreError> {
        let mut conn = self.checkout()?;
        match op(&mut conn) {
            Ok(value) => {
                self.checkin(conn);
                Ok(value)
            }
            Err(err) => {
                let classified = classify(&err);
                if classified.is_connection() {
                    tracing::debug!(error = %err, "discarding broken redis connection");
                } else {
                    self.checkin(conn);
                }
                Err(classified)
            }
        }
    }
}

impl WindowStore for RedisWindowStore {
    fn append(
        &self,
        key: &str,
        entry: TimestampedValue,
        window_size: usize,
        buffer_size: usize,
    ) -> std::result::Result<WindowResult, StoreError> {
        let ranks = RankBounds::new(window_size, buffer_size, self.trim_slack)?;
        let member = encode_member(entry.value, entry.timestamp);
        let pipeline = window_pipeline(key, &member, entry.timestamp, ranks);

        let reply: AppendReply = self.with_connection(|conn| pipeline.query(conn))?;
        window_from_reply(reply)
    }

    fn buffer_len(&self, key: &str) -> std::result::Result<usize, StoreError> {
        let len: i64 = self.with_connection(|conn| redis::cmd("ZCARD").arg(key).query(conn))?;
        usize::try_from(len)
            .map_err(|_| StoreError::Decode(format!("invalid buffer length: {len}")))
    }
}

/// Negative sorted-set ranks used by one append.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct RankBounds {
    trim_start: isize,
    trim_end: isize,
    window_start: isize,
}

impl RankBounds {
    fn new(
        window_size: usize,
        buffer_size: usize,
        trim_slack: usize,
    ) -> std::result::Result<Self, StoreError> {
        let rank = |value: usize| {
            isize::try_from(value)
                .map(|value| -value)
                .map_err(|_| StoreError::Backend(format!("rank {value} exceeds isize range")))
        };

        Ok(Self {
            trim_start: rank(buffer_size.saturating_add(trim_slack))?,
            trim_end: rank(buffer_size.saturating_add(1))?,
            window_start: rank(window_size)?,
        })
    }
}

/// `EXEC` reply of [`window_pipeline`]: members added, members evicted and
/// the flat `WITHSCORES` window.
type AppendReply = (i64, i64, Vec<(String, i64)>);

/// Insert, evict and read as one `MULTI`/`EXEC` transaction.
fn window_pipeline(key: &str, member: &str, timestamp: i64, ranks: RankBounds) -> redis::Pipeline {
    let mut pipeline = redis::pipe();
    pipeline
        .atomic()
        .zadd(key, member, timestamp)
        .zremrangebyrank(key, ranks.trim_start, ranks.trim_end)
        .zrange_withscores(key, ranks.window_start, -1);
    pipeline
}

fn window_from_reply(
    (added, _evicted, members): AppendReply,
) -> std::result::Result<WindowResult, StoreError> {
    if added != 1 {
        return Ok(WindowResult::Duplicate);
    }

    let window = members
        .iter()
        .map(|(member, score)| decode_member(member, *score))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(WindowResult::Window(window))
}

/// Opens a store behind a trait object, for use as a provider factory.
pub fn connect(
    redis_url: &str,
    trim_slack: usize,
) -> std::result::Result<Arc<dyn WindowStore>, StoreError> {
    let store = RedisWindowStore::open(redis_url, trim_slack)
        .map_err(|err| StoreError::Connection(format!("{err:#}")))?;
    store.ping()?;
    Ok(Arc::new(store))
}

/// Provider that reconnects to `redis_url` on every recreate.
#[must_use]
pub fn provider(redis_url: &str, trim_slack: usize) -> SharedStoreProvider {
    let redis_url = redis_url.to_string();
    SharedStoreProvider::new(move || connect(&redis_url, trim_slack))
}

fn classify(err: &RedisError) -> StoreError {
    if err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_io_error()
        || err.is_timeout()
    {
        StoreError::Connection(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}
