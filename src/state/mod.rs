mod export;
mod participant;
mod round;
mod session;
mod submission;

pub use export::{Download, ExportArchive};
pub use participant::{generate_join_code, JOIN_CODE_LEN, MAX_DISPLAY_NAME_CHARS};
pub use round::MAX_JOIN_CODE_ATTEMPTS;
pub use session::generate_token;
pub use submission::{route_submission, Routing};

use crate::config::AppConfig;
use crate::error::RoundError;
use crate::files::UploadDir;
use crate::store::{Deadline, KeyValueStore, RecordStore};
use crate::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub rounds: RecordStore<Round>,
    pub sessions: RecordStore<Session>,
    pub uploads: UploadDir,
    pub config: Arc<AppConfig>,
    locks: RoundLocks,
}

impl AppState {
    pub fn new(kv: Arc<dyn KeyValueStore>, config: AppConfig) -> Self {
        Self {
            rounds: RecordStore::new(kv.clone(), config.round_ttl),
            sessions: RecordStore::new(kv, config.round_ttl),
            uploads: UploadDir::new(config.upload_dir.clone()),
            config: Arc::new(config),
            locks: RoundLocks::default(),
        }
    }

    /// Store deadline for one request. Taken after any round lock is held,
    /// so time queued on the lock doesn't count against the store budget.
    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.config.store_timeout)
    }

    /// Load a round or fail with 404
    pub async fn load_round(&self, code: &str, deadline: Deadline) -> Result<Round, RoundError> {
        self.rounds
            .load(code, deadline)
            .await?
            .ok_or_else(|| RoundError::NotFound("Round not found".to_string()))
    }

    /// Serialise load -> mutate -> save sequences on one round
    pub async fn lock_round(&self, code: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(code).await
    }
}

/// Per-round mutexes, keyed by join code.
///
/// Entries nobody holds or waits on are pruned on the next lock call.
#[derive(Clone, Default)]
pub struct RoundLocks {
    inner: Arc<Mutex<HashMap<JoinCode, Arc<Mutex<()>>>>>,
}

impl RoundLocks {
    pub async fn lock(&self, code: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.inner.lock().await;
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks.entry(code.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Number of codes currently tracked
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_round_lock_serialises_same_code() {
        let locks = RoundLocks::default();
        let guard = locks.lock("ABC123").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("ABC123").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_round_lock_different_codes_independent() {
        let locks = RoundLocks::default();
        let _a = locks.lock("AAAAAA").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("BBBBBB")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_round_locks_pruned_when_released() {
        let locks = RoundLocks::default();
        drop(locks.lock("AAAAAA").await);
        drop(locks.lock("BBBBBB").await);
        // Locking prunes released entries before inserting its own
        let _c = locks.lock("CCCCCC").await;
        assert_eq!(locks.len().await, 1);
    }

    #[tokio::test]
    async fn test_load_missing_round_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            upload_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        let state = AppState::new(Arc::new(MemoryStore::new()), config);
        let err = state.load_round("NOPE00", state.deadline()).await.unwrap_err();
        assert!(matches!(err, RoundError::NotFound(_)));
    }
}
