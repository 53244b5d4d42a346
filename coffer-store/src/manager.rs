//! Single-host façade over a chunk store and its action authority.
//!
//! The manager simulates what a remote chunk network would do for local
//! testing: optional latency before each operation, an advisory lock in a
//! shared directory so cooperating processes on one host serialize access,
//! and an in-process transaction table so concurrent calls on the same name
//! queue up instead of interleaving.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use data_encoding::BASE32_NOPAD;
use tracing::debug;

use coffer_util::lock::DirLock;

use crate::actions::{ChunkActionAuthority, GetOutput};
use crate::chunk::ChunkName;
use crate::error::{ChunkError, Result};
use crate::store::ChunkStore;

/// How long an operation waits for the cross-process lock before giving up.
const LOCK_DEADLINE: Duration = Duration::from_secs(10);
/// Poll interval while another in-process transaction holds the same name.
const TRANSACTION_POLL: Duration = Duration::from_millis(5);

#[derive(Debug)]
pub struct LocalChunkManager {
    authority: ChunkActionAuthority,
    lock_directory: PathBuf,
    get_wait: Duration,
    action_wait: Duration,
    transactions: Arc<Mutex<HashMap<ChunkName, u64>>>,
    next_transaction: AtomicU64,
}

impl LocalChunkManager {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        lock_directory: impl Into<PathBuf>,
        get_wait: Duration,
        action_wait: Duration,
    ) -> Self {
        Self {
            authority: ChunkActionAuthority::new(store),
            lock_directory: lock_directory.into(),
            get_wait,
            action_wait,
            transactions: Arc::new(Mutex::new(HashMap::new())),
            next_transaction: AtomicU64::new(1),
        }
    }

    /// Fetches a chunk.
    ///
    /// With a `local_version` hint that matches the stored version, returns
    /// `Ok(None)` immediately: the caller's copy is current and the
    /// authority is never consulted.
    pub async fn get(
        &self,
        name: &ChunkName,
        local_version: Option<&[u8]>,
        public_key: &[u8],
    ) -> Result<Option<GetOutput>> {
        if let Some(local) = local_version {
            if self.authority.version(name).as_deref() == Some(local) {
                debug!(%name, "get: local version is current");
                return Ok(None);
            }
        }
        self.wait(self.get_wait).await;
        let _txn = self.begin_transaction(name).await;
        let _lock = self.acquire_lock(name).await?;
        self.authority.get(name, public_key).map(Some)
    }

    pub async fn store(&self, name: &ChunkName, content: &[u8], public_key: &[u8]) -> Result<()> {
        self.wait(self.action_wait).await;
        let _txn = self.begin_transaction(name).await;
        let _lock = self.acquire_lock(name).await?;
        self.authority.store(name, content, public_key)
    }

    pub async fn delete(
        &self,
        name: &ChunkName,
        ownership_proof: Option<&[u8]>,
        public_key: &[u8],
    ) -> Result<()> {
        self.wait(self.action_wait).await;
        let _txn = self.begin_transaction(name).await;
        let _lock = self.acquire_lock(name).await?;
        self.authority.delete(name, ownership_proof, public_key)
    }

    pub async fn modify(
        &self,
        name: &ChunkName,
        content: &[u8],
        public_key: &[u8],
    ) -> Result<Bytes> {
        self.wait(self.action_wait).await;
        let _txn = self.begin_transaction(name).await;
        let _lock = self.acquire_lock(name).await?;
        self.authority.modify(name, content, public_key)
    }

    pub async fn has(&self, name: &ChunkName) -> Result<()> {
        self.authority.has(name)
    }

    pub fn version(&self, name: &ChunkName) -> Option<Bytes> {
        self.authority.version(name)
    }

    pub fn storage_size(&self) -> u64 {
        self.authority.backend().size()
    }

    pub fn storage_capacity(&self) -> u64 {
        self.authority.backend().capacity()
    }

    async fn wait(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }

    async fn acquire_lock(&self, name: &ChunkName) -> Result<DirLock> {
        let lock_name = format!("{}.lock", BASE32_NOPAD.encode(name.as_bytes()));
        DirLock::acquire(&self.lock_directory, &lock_name, LOCK_DEADLINE)
            .await
            .map_err(|err| {
                debug!(%name, "failed to take chunk lock: {err}");
                ChunkError::GeneralError
            })
    }

    /// Claims `name` in the transaction table, waiting while another
    /// in-process operation on the same name is in flight.
    async fn begin_transaction(&self, name: &ChunkName) -> TransactionGuard {
        loop {
            {
                let mut transactions = self.transactions.lock().unwrap();
                if !transactions.contains_key(name) {
                    let id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
                    transactions.insert(name.clone(), id);
                    return TransactionGuard {
                        name: name.clone(),
                        transactions: Arc::clone(&self.transactions),
                    };
                }
            }
            tokio::time::sleep(TRANSACTION_POLL).await;
        }
    }
}

struct TransactionGuard {
    name: ChunkName,
    transactions: Arc<Mutex<HashMap<ChunkName, u64>>>,
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.transactions.lock().unwrap().remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::actions::AppendableByAll;
    use crate::chunk::ChunkType;
    use crate::keys::Keys;
    use crate::store::MemoryChunkStore;

    fn keys(seed: u64) -> Keys {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
        Keys::generate(&b"id"[..], &b""[..], &mut rng)
    }

    fn manager(lock_dir: &std::path::Path) -> LocalChunkManager {
        LocalChunkManager::new(
            Arc::new(MemoryChunkStore::default()),
            lock_dir,
            Duration::ZERO,
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn get_short_circuits_on_current_version() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let owner = keys(1);
        let chunk = AppendableByAll::new_owned(&owner.signing_key(), true);
        let name = ChunkName::for_content(&chunk.to_bytes(), ChunkType::AppendableByAll);
        manager
            .store(&name, &chunk.to_bytes(), &owner.public_key)
            .await
            .unwrap();

        let version = manager.version(&name).unwrap();
        let unchanged = manager
            .get(&name, Some(version.as_ref()), &owner.public_key)
            .await
            .unwrap();
        assert!(unchanged.is_none());

        let fetched = manager
            .get(&name, Some(b"stale version".as_slice()), &owner.public_key)
            .await
            .unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn same_name_operations_serialize_in_process() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(dir.path()));
        let owner = keys(1);
        let appender = keys(2);
        let chunk = AppendableByAll::new_owned(&owner.signing_key(), true);
        let name = ChunkName::for_content(&chunk.to_bytes(), ChunkType::AppendableByAll);
        manager
            .store(&name, &chunk.to_bytes(), &owner.public_key)
            .await
            .unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8u8 {
            let manager = manager.clone();
            let name = name.clone();
            let appendix = crate::keys::SignedData::sign(vec![i], &appender.signing_key());
            let key = appender.public_key;
            tasks.spawn(async move {
                manager.modify(&name, &appendix.to_bytes(), &key).await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        let stored = manager
            .get(&name, None, &owner.public_key)
            .await
            .unwrap()
            .unwrap();
        let parsed = AppendableByAll::from_bytes(&stored.into_bytes()).unwrap();
        assert_eq!(parsed.appendices.len(), 8);
    }

    #[tokio::test]
    async fn lock_files_are_released_after_errors() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let owner = keys(1);
        let name = ChunkName::for_content(b"absent", ChunkType::AppendableByAll);
        assert_eq!(
            manager.get(&name, None, &owner.public_key).await,
            Err(ChunkError::FailedToFindChunk)
        );
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "lock directory must be empty");
    }
}
