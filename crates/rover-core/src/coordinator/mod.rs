//! Read-modify-write of remote configuration documents.
//!
//! Every change runs as one cycle under a per-resource lock: fetch the
//! current document, merge the caller's partial patch into it, write the
//! whole document back. A conflicting write restarts the cycle from a fresh
//! fetch, so a write is never derived from a base known to be outdated.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{CoordinatorError, StoreError};

mod locks;
mod merge;
mod store;

pub use locks::{ResourceGuard, ResourceLocks};
pub use merge::{merge, merge_into};
pub use store::{DocumentStore, HttpDocumentStore, Snapshot, WriteMethod};

#[derive(Clone, Debug, PartialEq)]
pub struct CoordinatorPolicy {
    /// Extra fetch attempts after the first failure.
    pub fetch_retries: u32,
    pub fetch_retry_delay: Duration,
    /// Fresh cycles allowed after a conflicting write.
    pub conflict_retries: u32,
    /// Fresh cycles allowed after a non-conflict write failure.
    pub write_retries: u32,
}

impl Default for CoordinatorPolicy {
    fn default() -> Self {
        Self {
            fetch_retries: 2,
            fetch_retry_delay: Duration::from_millis(250),
            conflict_retries: 3,
            write_retries: 1,
        }
    }
}

/// One caller's change, owned by the coordinator for the length of a cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingWrite {
    pub resource: String,
    pub patch: Value,
    pub attempt: u32,
}

#[derive(Clone)]
pub struct ConfigCoordinator {
    store: Arc<dyn DocumentStore>,
    locks: ResourceLocks,
    policy: CoordinatorPolicy,
}

impl ConfigCoordinator {
    pub fn new(store: impl DocumentStore, policy: CoordinatorPolicy) -> Self {
        Self::with_store(Arc::new(store), policy)
    }

    pub fn with_store(store: Arc<dyn DocumentStore>, policy: CoordinatorPolicy) -> Self {
        Self {
            store,
            locks: ResourceLocks::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &CoordinatorPolicy {
        &self.policy
    }

    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }

    /// Merges `patch` into the document at `resource` and returns the
    /// resulting document.
    ///
    /// The cycle runs on its own task: dropping the returned future does not
    /// interrupt a write already in flight, and the resource lock is released
    /// when the cycle ends either way.
    pub async fn apply(&self, resource: &str, patch: Value) -> Result<Value, CoordinatorError> {
        if !patch.is_object() {
            return Err(CoordinatorError::InvalidPatch {
                resource: resource.to_string(),
            });
        }
        let pending = PendingWrite {
            resource: resource.to_string(),
            patch,
            attempt: 0,
        };
        let this = self.clone();
        tokio::spawn(async move { this.run_cycle(pending).await })
            .await
            .map_err(|err| CoordinatorError::Aborted {
                resource: resource.to_string(),
                reason: err.to_string(),
            })?
    }

    /// Current document without modifying it.
    pub async fn read(&self, resource: &str) -> Result<Value, CoordinatorError> {
        self.fetch_with_retry(resource).await.map(|s| s.document)
    }

    async fn run_cycle(&self, mut pending: PendingWrite) -> Result<Value, CoordinatorError> {
        let _guard = self.locks.acquire(&pending.resource).await;
        let mut conflicts: u32 = 0;
        let mut write_failures: u32 = 0;
        loop {
            pending.attempt += 1;
            let snapshot = self.fetch_with_retry(&pending.resource).await?;
            let merged = merge(&snapshot.document, &pending.patch);
            if merged == snapshot.document {
                debug!(
                    target: "rover::coordinator",
                    resource = %pending.resource,
                    "patch already applied; skipping write"
                );
                return Ok(merged);
            }
            let written = self
                .store
                .write(&pending.resource, &merged, snapshot.version.as_deref())
                .await;
            match written {
                Ok(()) => {
                    info!(
                        target: "rover::coordinator",
                        resource = %pending.resource,
                        attempt = pending.attempt,
                        "configuration written"
                    );
                    return Ok(merged);
                }
                Err(err) if err.is_conflict() => {
                    conflicts += 1;
                    if conflicts > self.policy.conflict_retries {
                        warn!(target: "rover::coordinator", resource = %pending.resource, conflicts, "giving up after repeated conflicts");
                        return Err(CoordinatorError::ConflictExhausted {
                            resource: pending.resource,
                            attempts: conflicts,
                        });
                    }
                    debug!(target: "rover::coordinator", resource = %pending.resource, conflicts, "write conflict; refetching");
                }
                Err(err) => {
                    write_failures += 1;
                    if write_failures > self.policy.write_retries {
                        return Err(CoordinatorError::Write {
                            resource: pending.resource,
                            attempts: write_failures,
                            source: err,
                        });
                    }
                    warn!(target: "rover::coordinator", resource = %pending.resource, error = %err, "write failed; restarting cycle");
                }
            }
        }
    }

    async fn fetch_with_retry(&self, resource: &str) -> Result<Snapshot, CoordinatorError> {
        let attempts = self.policy.fetch_retries.saturating_add(1);
        let mut last: Option<StoreError> = None;
        for attempt in 1..=attempts {
            match self.store.fetch(resource).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(err) => {
                    warn!(target: "rover::coordinator", resource, attempt, error = %err, "fetch failed");
                    last = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.fetch_retry_delay).await;
                    }
                }
            }
        }
        Err(CoordinatorError::Fetch {
            resource: resource.to_string(),
            attempts,
            source: last.unwrap_or_else(|| StoreError::Transport("no attempt made".into())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};

    type Edit = Box<dyn FnOnce(&mut Value) + Send>;

    /// In-memory store with a version counter per document. Writes carrying an
    /// outdated version are rejected as conflicts.
    #[derive(Default)]
    struct MemoryStore {
        docs: Mutex<HashMap<String, (Value, u64)>>,
        /// Concurrent edits applied just before the next writes land.
        interleaved: Mutex<VecDeque<Edit>>,
        fetch_failures: Mutex<u32>,
        write_failures: Mutex<u32>,
        write_delay: Option<Duration>,
        unversioned: bool,
        write_log: Mutex<Vec<Value>>,
    }

    impl MemoryStore {
        fn with_doc(resource: &str, doc: Value) -> Self {
            let store = Self::default();
            store.docs.lock().insert(resource.to_string(), (doc, 1));
            store
        }

        fn interleave(&self, edit: impl FnOnce(&mut Value) + Send + 'static) {
            self.interleaved.lock().push_back(Box::new(edit));
        }

        fn doc(&self, resource: &str) -> Value {
            self.docs.lock()[resource].0.clone()
        }
    }

    #[async_trait]
    impl DocumentStore for MemoryStore {
        async fn fetch(&self, resource: &str) -> Result<Snapshot, StoreError> {
            {
                let mut failures = self.fetch_failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(StoreError::Transport("connection refused".into()));
                }
            }
            let docs = self.docs.lock();
            let (document, version) = docs
                .get(resource)
                .cloned()
                .ok_or(StoreError::Status(404))?;
            Ok(Snapshot {
                document,
                version: (!self.unversioned).then(|| version.to_string()),
            })
        }

        async fn write(
            &self,
            resource: &str,
            document: &Value,
            version: Option<&str>,
        ) -> Result<(), StoreError> {
            if let Some(delay) = self.write_delay {
                tokio::time::sleep(delay).await;
            }
            self.write_log.lock().push(document.clone());
            {
                let mut failures = self.write_failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(StoreError::Status(500));
                }
            }
            let edit = self.interleaved.lock().pop_front();
            let mut docs = self.docs.lock();
            let entry = docs
                .get_mut(resource)
                .ok_or(StoreError::Status(404))?;
            if let Some(edit) = edit {
                edit(&mut entry.0);
                entry.1 += 1;
            }
            if let Some(v) = version {
                if v != entry.1.to_string() {
                    return Err(StoreError::Conflict(format!("{resource} at v{}", entry.1)));
                }
            }
            entry.0 = document.clone();
            entry.1 += 1;
            Ok(())
        }
    }

    fn fast_policy() -> CoordinatorPolicy {
        CoordinatorPolicy {
            fetch_retry_delay: Duration::from_millis(10),
            ..CoordinatorPolicy::default()
        }
    }

    const DEVICE: &str = "/configuration/device";

    #[tokio::test]
    async fn untouched_fields_survive() {
        let store = Arc::new(MemoryStore::with_doc(
            DEVICE,
            json!({"a": 1, "b": {"c": 2, "d": 3}}),
        ));
        let coordinator = ConfigCoordinator::with_store(store.clone(), fast_policy());
        let merged = coordinator.apply(DEVICE, json!({"b": {"c": 5}})).await.unwrap();
        assert_eq!(merged, json!({"a": 1, "b": {"c": 5, "d": 3}}));
        assert_eq!(store.doc(DEVICE), merged);
        assert_eq!(coordinator.locks().active(), 0);
    }

    #[tokio::test]
    async fn conflict_refetches_and_never_writes_stale_base() {
        let store = Arc::new(MemoryStore::with_doc(
            DEVICE,
            json!({"antenna_height": 1.5, "night_mode": false}),
        ));
        store.interleave(|doc| doc["antenna_height"] = json!(2.0));
        let coordinator = ConfigCoordinator::with_store(store.clone(), fast_policy());

        let merged = coordinator
            .apply(DEVICE, json!({"night_mode": true}))
            .await
            .unwrap();
        assert_eq!(merged, json!({"antenna_height": 2.0, "night_mode": true}));
        assert_eq!(store.doc(DEVICE), merged);

        let log = store.write_log.lock().clone();
        assert_eq!(log.len(), 2);
        // The write after the conflict is built on the refreshed document.
        assert_eq!(log[1]["antenna_height"], json!(2.0));
    }

    #[tokio::test]
    async fn persistent_conflicts_are_exhausted() {
        let store = Arc::new(MemoryStore::with_doc(DEVICE, json!({"counter": 0})));
        for i in 1..=4 {
            store.interleave(move |doc| doc["counter"] = json!(i));
        }
        let coordinator = ConfigCoordinator::with_store(store.clone(), fast_policy());
        let err = coordinator
            .apply(DEVICE, json!({"night_mode": true}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoordinatorError::ConflictExhausted {
                resource: DEVICE.into(),
                attempts: 4
            }
        );
        assert_eq!(store.doc(DEVICE), json!({"counter": 4}));
        assert_eq!(coordinator.locks().active(), 0);
    }

    #[tokio::test]
    async fn fetch_is_retried_then_reported() {
        let store = Arc::new(MemoryStore::with_doc(DEVICE, json!({"x": 1})));
        *store.fetch_failures.lock() = 2;
        let coordinator = ConfigCoordinator::with_store(store.clone(), fast_policy());
        assert!(coordinator.apply(DEVICE, json!({"x": 2})).await.is_ok());

        *store.fetch_failures.lock() = 3;
        let err = coordinator.apply(DEVICE, json!({"x": 3})).await.unwrap_err();
        match err {
            CoordinatorError::Fetch {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 3);
                assert!(matches!(source, StoreError::Transport(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.doc(DEVICE), json!({"x": 2}));
    }

    #[tokio::test]
    async fn write_failures_restart_then_surface() {
        let store = Arc::new(MemoryStore::with_doc(DEVICE, json!({"x": 1})));
        *store.write_failures.lock() = 1;
        let coordinator = ConfigCoordinator::with_store(store.clone(), fast_policy());
        assert_eq!(
            coordinator.apply(DEVICE, json!({"x": 2})).await.unwrap(),
            json!({"x": 2})
        );

        *store.write_failures.lock() = 2;
        let err = coordinator.apply(DEVICE, json!({"x": 3})).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Write {
                attempts: 2,
                source: StoreError::Status(500),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unchanged_document_is_not_written() {
        let store = Arc::new(MemoryStore::with_doc(DEVICE, json!({"night_mode": true})));
        let coordinator = ConfigCoordinator::with_store(store.clone(), fast_policy());
        let merged = coordinator
            .apply(DEVICE, json!({"night_mode": true}))
            .await
            .unwrap();
        assert_eq!(merged, json!({"night_mode": true}));
        assert!(store.write_log.lock().is_empty());
    }

    #[tokio::test]
    async fn scalar_patch_is_rejected() {
        let store = Arc::new(MemoryStore::with_doc(DEVICE, json!({"x": 1})));
        let coordinator = ConfigCoordinator::with_store(store.clone(), fast_policy());
        let err = coordinator.apply(DEVICE, json!(5)).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidPatch { .. }));
        assert_eq!(store.doc(DEVICE), json!({"x": 1}));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_on_one_resource_do_not_lose_updates() {
        let store = Arc::new(MemoryStore {
            write_delay: Some(Duration::from_millis(50)),
            unversioned: true,
            ..MemoryStore::with_doc(DEVICE, json!({"base": true}))
        });
        let coordinator = ConfigCoordinator::with_store(store.clone(), fast_policy());

        let a = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.apply(DEVICE, json!({"a": 1})).await })
        };
        let b = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.apply(DEVICE, json!({"b": 2})).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(store.doc(DEVICE), json!({"base": true, "a": 1, "b": 2}));
        assert_eq!(coordinator.locks().active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_caller_does_not_abort_write() {
        let store = Arc::new(MemoryStore {
            write_delay: Some(Duration::from_secs(2)),
            ..MemoryStore::with_doc(DEVICE, json!({"night_mode": false}))
        });
        let coordinator = ConfigCoordinator::with_store(store.clone(), fast_policy());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            coordinator.apply(DEVICE, json!({"night_mode": true})),
        )
        .await;
        assert!(abandoned.is_err());

        // Queues behind the abandoned cycle, which still completes.
        let merged = coordinator
            .apply(DEVICE, json!({"antenna_height": 1.7}))
            .await
            .unwrap();
        assert_eq!(merged, json!({"night_mode": true, "antenna_height": 1.7}));
        assert_eq!(coordinator.locks().active(), 0);
    }
}
