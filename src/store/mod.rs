//! Key-value substrate and the typed record adapter on top of it.
//!
//! Rounds and sessions are each stored as one JSON blob under a prefixed key
//! with a fixed TTL that is reset on every save. There are no partial
//! updates: callers load the whole record, mutate a local copy and save the
//! whole record back.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::{spawn_expiry_sweeper, MemoryStore};
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{StoreError, StoreResult};
use crate::types::{Round, Session};

/// Point in time by which a store call must have completed.
///
/// Computed once per request and passed down explicitly.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    /// Run `fut`, failing with `StoreError::Timeout` once the deadline passes
    pub async fn run<T, F>(self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout_at(self.at, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.budget)),
        }
    }
}

/// Minimal contract of the backing store: atomic get/set of single blobs
/// with per-key expiry, plus an existence check.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set `key` to `value`, (re)setting its expiry to `ttl` from now
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Name used in logs
    fn name(&self) -> &str;
}

/// A record stored as one blob under `<PREFIX>:<id>`
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const PREFIX: &'static str;

    fn record_id(&self) -> &str;
}

impl Record for Round {
    const PREFIX: &'static str = "round";

    fn record_id(&self) -> &str {
        &self.join_code
    }
}

impl Record for Session {
    const PREFIX: &'static str = "session";

    fn record_id(&self) -> &str {
        &self.token
    }
}

/// Typed load/save/exists over a `KeyValueStore`
pub struct RecordStore<T> {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for RecordStore<T> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            ttl: self.ttl,
            _record: PhantomData,
        }
    }
}

impl<T: Record> RecordStore<T> {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self {
            kv,
            ttl,
            _record: PhantomData,
        }
    }

    pub fn key(id: &str) -> String {
        format!("{}:{}", T::PREFIX, id)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn load(&self, id: &str, deadline: Deadline) -> StoreResult<Option<T>> {
        let key = Self::key(id);
        match deadline.run(self.kv.get(&key)).await? {
            Some(blob) => Ok(Some(serde_json::from_str(&blob)?)),
            None => Ok(None),
        }
    }

    /// Serialize the full record and write it back, refreshing the TTL
    pub async fn save(&self, record: &T, deadline: Deadline) -> StoreResult<()> {
        let key = Self::key(record.record_id());
        let blob = serde_json::to_string(record)?;
        deadline.run(self.kv.set_ex(&key, blob, self.ttl)).await
    }

    pub async fn exists(&self, id: &str, deadline: Deadline) -> StoreResult<bool> {
        let key = Self::key(id);
        deadline.run(self.kv.exists(&key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    fn round(code: &str) -> Round {
        Round {
            id: "round_1".to_string(),
            name: "Jam".to_string(),
            mode: RoundMode::Sample,
            join_code: code.to_string(),
            state: RoundState::Waiting,
            host_id: "host".to_string(),
            participants: BTreeMap::new(),
            submissions: BTreeMap::new(),
            allow_guest_download: false,
            created_at: Utc::now(),
            sample_file_id: None,
        }
    }

    /// Never answers
    struct StalledStore;

    #[async_trait]
    impl KeyValueStore for StalledStore {
        async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
            std::future::pending().await
        }
        async fn set_ex(&self, _key: &str, _value: String, _ttl: Duration) -> StoreResult<()> {
            std::future::pending().await
        }
        async fn exists(&self, _key: &str) -> StoreResult<bool> {
            std::future::pending().await
        }
        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(RecordStore::<Round>::key("ABC123"), "round:ABC123");
        assert_eq!(RecordStore::<Session>::key("tok"), "session:tok");
    }

    #[tokio::test]
    async fn test_round_save_and_load() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let rounds = RecordStore::<Round>::new(kv.clone(), Duration::from_secs(60));

        let original = round("ABC123");
        assert!(!rounds.exists("ABC123", deadline()).await.unwrap());
        rounds.save(&original, deadline()).await.unwrap();
        assert!(rounds.exists("ABC123", deadline()).await.unwrap());

        let loaded = rounds.load("ABC123", deadline()).await.unwrap().unwrap();
        assert_eq!(loaded, original);

        // Raw blob lives under the prefixed key
        assert!(kv.get("round:ABC123").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_record_is_none() {
        let rounds =
            RecordStore::<Round>::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        assert!(rounds.load("NOPE00", deadline()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_serialization_error() {
        let kv = Arc::new(MemoryStore::new());
        kv.set_ex("round:BAD000", "{not json".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        let rounds = RecordStore::<Round>::new(kv, Duration::from_secs(60));
        let err = rounds.load("BAD000", deadline()).await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_deadline_expiry_is_timeout() {
        let rounds = RecordStore::<Round>::new(Arc::new(StalledStore), Duration::from_secs(60));
        let err = rounds
            .load("ABC123", Deadline::after(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
    }
}
