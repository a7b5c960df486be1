use std::collections::{BTreeSet, HashMap};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::{TimestampedValue, WindowResult};

/// Extra entries tolerated above the buffer size so eviction is batched.
pub const DEFAULT_TRIM_SLACK: usize = 10;

/// Separates value and timestamp inside a buffer member.
pub const MEMBER_SEPARATOR: &str = "::";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store decode error: {0}")]
    Decode(String),
}

impl StoreError {
    /// Transport-level failures are the only ones worth a reconnect.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Atomic append/trim/read against the sorted buffer of one entity key.
///
/// Implementations must run the three steps as a single transaction so that
/// concurrent appends on the same key are serialized by the backend:
/// 1. insert `encode_member(value, timestamp)` with the timestamp as score,
/// 2. evict the ranks returned by [`trim_bounds`],
/// 3. read the `window_size` highest-ranked entries, oldest first.
pub trait WindowStore: Send + Sync {
    /// # Errors
    /// Returns [`StoreError::Connection`] for transport failures and
    /// [`StoreError::Backend`] or [`StoreError::Decode`] otherwise.
    fn append(
        &self,
        key: &str,
        entry: TimestampedValue,
        window_size: usize,
        buffer_size: usize,
    ) -> Result<WindowResult, StoreError>;

    /// Number of entries currently buffered under `key`.
    ///
    /// # Errors
    /// Same classification as [`WindowStore::append`].
    fn buffer_len(&self, key: &str) -> Result<usize, StoreError>;
}

#[must_use]
pub fn encode_member(value: f64, timestamp: i64) -> String {
    format!("{value:?}{MEMBER_SEPARATOR}{timestamp}")
}

/// Recovers the buffered value from a member; the score is the timestamp.
///
/// # Errors
/// Returns [`StoreError::Decode`] when the member does not start with a
/// float followed by [`MEMBER_SEPARATOR`].
pub fn decode_member(member: &str, score: i64) -> Result<TimestampedValue, StoreError> {
    let Some((value, _)) = member.split_once(MEMBER_SEPARATOR) else {
        return Err(StoreError::Decode(format!(
            "member {member:?} has no {MEMBER_SEPARATOR} separator"
        )));
    };
    let value = value
        .parse::<f64>()
        .map_err(|err| StoreError::Decode(format!("member {member:?} has bad value: {err}")))?;
    Ok(TimestampedValue {
        value,
        timestamp: score,
    })
}

/// Inclusive ascending rank range to evict from a buffer of `len` entries.
///
/// Mirrors a rank removal from `-(buffer_size + trim_slack)` to
/// `-(buffer_size + 1)`: the `buffer_size` most recent entries always
/// survive, and at most `trim_slack` older ones are evicted per call.
#[must_use]
pub fn trim_bounds(len: usize, buffer_size: usize, trim_slack: usize) -> Option<(usize, usize)> {
    let end = len.checked_sub(buffer_size.saturating_add(1))?;
    let start = len.saturating_sub(buffer_size.saturating_add(trim_slack));
    (start <= end).then_some((start, end))
}

/// A store together with the provider generation it was created in.
#[derive(Clone)]
pub struct StoreHandle {
    pub generation: u64,
    pub store: Arc<dyn WindowStore>,
}

impl Debug for StoreHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Hands out the process-wide store connection and replaces it on failure.
pub trait ConnectionProvider: Send + Sync {
    /// # Errors
    /// Returns a [`StoreError`] when no connection can be established.
    fn connection(&self) -> Result<StoreHandle, StoreError>;

    /// Replaces the connection of `stale_generation`.
    ///
    /// When another caller already replaced it, the newer handle is returned
    /// and no new connection is opened.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the replacement cannot be established.
    fn recreate(&self, stale_generation: u64) -> Result<StoreHandle, StoreError>;
}

type StoreFactory = dyn Fn() -> Result<Arc<dyn WindowStore>, StoreError> + Send + Sync;

/// Lazily connecting provider backed by a factory closure.
pub struct SharedStoreProvider {
    factory: Box<StoreFactory>,
    current: RwLock<Option<StoreHandle>>,
    issued: AtomicU64,
}

impl SharedStoreProvider {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn WindowStore>, StoreError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            current: RwLock::new(None),
            issued: AtomicU64::new(0),
        }
    }

    /// Provider that always hands out the same store instance.
    pub fn from_store(store: Arc<dyn WindowStore>) -> Self {
        Self::new(move || Ok(Arc::clone(&store)))
    }

    fn next_generation(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Generation of the live connection, if one was opened.
    #[must_use]
    pub fn generation(&self) -> Option<u64> {
        self.current
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|handle| handle.generation))
    }
}

impl Debug for SharedStoreProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStoreProvider")
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl ConnectionProvider for SharedStoreProvider {
    fn connection(&self) -> Result<StoreHandle, StoreError> {
        {
            let guard = self.current.read().map_err(|_| poisoned())?;
            if let Some(handle) = guard.as_ref() {
                return Ok(handle.clone());
            }
        }

        let mut guard = self.current.write().map_err(|_| poisoned())?;
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.clone());
        }

        let handle = StoreHandle {
            generation: self.next_generation(),
            store: (self.factory)()?,
        };
        *guard = Some(handle.clone());
        Ok(handle)
    }

    fn recreate(&self, stale_generation: u64) -> Result<StoreHandle, StoreError> {
        let mut guard = self.current.write().map_err(|_| poisoned())?;
        if let Some(handle) = guard.as_ref() {
            if handle.generation != stale_generation {
                return Ok(handle.clone());
            }
        }

        // A failed reconnect leaves no handle, so the next caller retries lazily.
        *guard = None;
        let generation = self.next_generation();
        let handle = StoreHandle {
            generation,
            store: (self.factory)()?,
        };
        *guard = Some(handle.clone());
        tracing::debug!(generation, "store connection recreated");
        Ok(handle)
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("store provider lock poisoned".to_string())
}

/// Process-local window store ordered by `(timestamp, member)`.
#[derive(Debug)]
pub struct InMemoryWindowStore {
    trim_slack: usize,
    buffers: Mutex<HashMap<String, BTreeSet<(i64, String)>>>,
}

impl Default for InMemoryWindowStore {
    fn default() -> Self {
        Self::new(DEFAULT_TRIM_SLACK)
    }
}

impl InMemoryWindowStore {
    #[must_use]
    pub fn new(trim_slack: usize) -> Self {
        Self {
            trim_slack,
            buffers: Mutex::new(HashMap::new()),
        }
    }
}

impl WindowStore for InMemoryWindowStore {
    fn append(
        &self,
        key: &str,
        entry: TimestampedValue,
        window_size: usize,
        buffer_size: usize,
    ) -> Result<WindowResult, StoreError> {
        let mut buffers = self
            .buffers
            .lock()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))?;
        let buffer = buffers.entry(key.to_string()).or_default();

        let is_new = buffer.insert((
            entry.timestamp,
            encode_member(entry.value, entry.timestamp),
        ));

        if let Some((start, end)) = trim_bounds(buffer.len(), buffer_size, self.trim_slack) {
            let evicted: Vec<(i64, String)> = buffer
                .iter()
                .skip(start)
                .take(end - start + 1)
                .cloned()
                .collect();
            for item in &evicted {
                buffer.remove(item);
            }
        }

        let mut window = buffer
            .iter()
            .rev()
            .take(window_size)
            .map(|(score, member)| decode_member(member, *score))
            .collect::<Result<Vec<_>, _>>()?;
        window.reverse();

        if !is_new {
            return Ok(WindowResult::Duplicate);
        }
        Ok(WindowResult::Window(window))
    }

    fn buffer_len(&self, key: &str) -> Result<usize, StoreError> {
        let buffers = self
            .buffers
            .lock()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))?;
        Ok(buffers.get(key).map_or(0, BTreeSet::len))
    }
}
