//! In-memory index of active forwarding rules, keyed by source chat.
//!
//! The store is the source of truth. Every mutation writes the store first
//! and then reloads; if the reload fails the cache is patched in place so it
//! never lags the store by more than the operation in progress. A failed
//! reload keeps the previous contents.
//!
//! `reload` and `deactivate` hold the write lock across their store calls,
//! so a reload can never read a rule that is halfway through being
//! deactivated.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{CacheError, DatabaseError};
use crate::rules::model::ForwardingRule;
use crate::store::TaskStore;
use crate::transport::ChatId;

pub struct TaskCache {
    store: Arc<dyn TaskStore>,
    by_source: RwLock<HashMap<ChatId, Vec<ForwardingRule>>>,
}

impl TaskCache {
    /// Create an empty cache. Call `reload()` before use.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            by_source: RwLock::new(HashMap::new()),
        }
    }

    /// Active rules for `source`, ordered by rule id.
    pub async fn lookup(&self, source: ChatId) -> Vec<ForwardingRule> {
        self.by_source
            .read()
            .await
            .get(&source)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the whole mapping from the store. Returns the number of
    /// active rules loaded.
    pub async fn reload(&self) -> Result<usize, CacheError> {
        let mut by_source = self.by_source.write().await;
        let rules = self.store.list_active().await.map_err(|e| {
            warn!(error = %e, "Rule reload failed, keeping cached rules");
            CacheError::StoreUnavailable(e)
        })?;

        let count = rules.len();
        *by_source = index_by_source(rules);
        debug!(rules = count, "Rule cache reloaded");
        Ok(count)
    }

    /// Add (or reactivate) a `source → destination` rule.
    pub async fn add(
        &self,
        source: ChatId,
        destination: ChatId,
    ) -> Result<ForwardingRule, CacheError> {
        let rule = self
            .store
            .add_rule(source, destination)
            .await
            .map_err(CacheError::StoreUnavailable)?;

        if self.reload().await.is_err() {
            self.patch_insert(rule.clone()).await;
        }
        Ok(rule)
    }

    /// Flip a rule's active flag. Returns the rule in its new state.
    pub async fn toggle(&self, rule_id: i64) -> Result<ForwardingRule, CacheError> {
        let mut rule = self
            .store
            .get_rule(rule_id)
            .await
            .map_err(CacheError::StoreUnavailable)?
            .ok_or(CacheError::RuleNotFound(rule_id))?;

        rule.active = !rule.active;
        self.store
            .set_active(rule_id, rule.active)
            .await
            .map_err(|e| map_store_error(rule_id, e))?;

        if self.reload().await.is_err() {
            if rule.active {
                self.patch_insert(rule.clone()).await;
            } else {
                self.patch_remove(rule_id).await;
            }
        }

        info!(rule_id, active = rule.active, "Rule toggled");
        Ok(rule)
    }

    /// Delete a rule from the store and the cache.
    pub async fn delete(&self, rule_id: i64) -> Result<(), CacheError> {
        self.store
            .delete_rule(rule_id)
            .await
            .map_err(|e| map_store_error(rule_id, e))?;

        if self.reload().await.is_err() {
            self.patch_remove(rule_id).await;
        }
        Ok(())
    }

    /// Disable a rule after a permanent delivery failure.
    ///
    /// Returns `true` only for the caller that actually removed the rule from
    /// the cache; that caller also records the failure in the store. Later
    /// callers for the same rule get `false` and must not notify.
    pub async fn deactivate(&self, rule_id: i64, reason: &str) -> bool {
        let mut by_source = self.by_source.write().await;
        if !remove_rule(&mut by_source, rule_id) {
            return false;
        }

        if let Err(e) = self.store.set_active(rule_id, false).await {
            error!(rule_id, error = %e, "Failed to persist rule deactivation");
        }
        if let Err(e) = self.store.record_stats(rule_id, false, Some(reason)).await {
            error!(rule_id, error = %e, "Failed to record deactivation reason");
        }
        drop(by_source);

        warn!(rule_id, reason, "Rule deactivated");
        true
    }

    /// Whether the rule is currently active in the cache.
    pub async fn is_active(&self, rule_id: i64) -> bool {
        self.by_source
            .read()
            .await
            .values()
            .flatten()
            .any(|r| r.id == rule_id)
    }

    /// Number of active rules.
    pub async fn active_count(&self) -> usize {
        self.by_source.read().await.values().map(Vec::len).sum()
    }

    /// Every rule in the store, active or not.
    pub async fn all_rules(&self) -> Result<Vec<ForwardingRule>, CacheError> {
        self.store
            .list_rules()
            .await
            .map_err(CacheError::StoreUnavailable)
    }

    /// Deactivate every rule.
    pub async fn pause_all(&self) -> Result<usize, CacheError> {
        let changed = self
            .store
            .pause_all()
            .await
            .map_err(CacheError::StoreUnavailable)?;

        if self.reload().await.is_err() {
            self.by_source.write().await.clear();
        }
        Ok(changed)
    }

    /// Reactivate every rule.
    ///
    /// If the reload fails the cache is rebuilt from the full rule list,
    /// which the store has just marked active.
    pub async fn resume_all(&self) -> Result<usize, CacheError> {
        let changed = self
            .store
            .resume_all()
            .await
            .map_err(CacheError::StoreUnavailable)?;

        if let Err(reload_err) = self.reload().await {
            let rules = self.store.list_rules().await.map_err(|e| {
                error!(error = %e, "Rule cache out of sync after resume");
                reload_err
            })?;
            let active = rules.into_iter().filter(|r| r.active);
            *self.by_source.write().await = index_by_source(active);
        }
        Ok(changed)
    }

    async fn patch_insert(&self, rule: ForwardingRule) {
        let mut map = self.by_source.write().await;
        for group in map.values_mut() {
            group.retain(|r| r.id != rule.id);
        }
        let group = map.entry(rule.source).or_default();
        group.push(rule);
        group.sort_by_key(|r| r.id);
    }

    async fn patch_remove(&self, rule_id: i64) -> bool {
        remove_rule(&mut *self.by_source.write().await, rule_id)
    }
}

/// Group rules by source, each group ordered by rule id.
fn index_by_source(
    rules: impl IntoIterator<Item = ForwardingRule>,
) -> HashMap<ChatId, Vec<ForwardingRule>> {
    let mut map: HashMap<ChatId, Vec<ForwardingRule>> = HashMap::new();
    for rule in rules {
        map.entry(rule.source).or_default().push(rule);
    }
    for group in map.values_mut() {
        group.sort_by_key(|r| r.id);
    }
    map
}

/// Remove a rule; returns whether it was present.
fn remove_rule(map: &mut HashMap<ChatId, Vec<ForwardingRule>>, rule_id: i64) -> bool {
    let mut removed = false;
    for group in map.values_mut() {
        let before = group.len();
        group.retain(|r| r.id != rule_id);
        removed |= group.len() != before;
    }
    map.retain(|_, group| !group.is_empty());
    removed
}

fn map_store_error(rule_id: i64, err: DatabaseError) -> CacheError {
    match err {
        DatabaseError::NotFound { .. } => CacheError::RuleNotFound(rule_id),
        other => CacheError::StoreUnavailable(other),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tokio::sync::{Notify, oneshot};

    use super::*;
    use crate::rules::RuleStatistics;
    use crate::store::{LibSqlTaskStore, SystemStatsRecord};

    const SRC: ChatId = ChatId(-1001);

    /// In-memory store with two hooks: `list_active` can be made to fail,
    /// and the next deactivating `set_active` can be held until released.
    struct HookedStore {
        inner: LibSqlTaskStore,
        fail_list_active: AtomicBool,
        held_deactivation: Mutex<Option<oneshot::Receiver<()>>>,
        deactivation_started: Notify,
    }

    impl HookedStore {
        async fn new() -> Self {
            Self {
                inner: LibSqlTaskStore::new_memory().await.unwrap(),
                fail_list_active: AtomicBool::new(false),
                held_deactivation: Mutex::new(None),
                deactivation_started: Notify::new(),
            }
        }

        fn hold_next_deactivation(&self) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            *self.held_deactivation.lock().unwrap() = Some(rx);
            tx
        }
    }

    #[async_trait]
    impl TaskStore for HookedStore {
        async fn add_rule(
            &self,
            source: ChatId,
            destination: ChatId,
        ) -> Result<ForwardingRule, DatabaseError> {
            self.inner.add_rule(source, destination).await
        }

        async fn get_rule(&self, id: i64) -> Result<Option<ForwardingRule>, DatabaseError> {
            self.inner.get_rule(id).await
        }

        async fn list_rules(&self) -> Result<Vec<ForwardingRule>, DatabaseError> {
            self.inner.list_rules().await
        }

        async fn list_active(&self) -> Result<Vec<ForwardingRule>, DatabaseError> {
            if self.fail_list_active.load(Ordering::SeqCst) {
                return Err(DatabaseError::Query("database is locked".into()));
            }
            self.inner.list_active().await
        }

        async fn get_by_source(
            &self,
            source: ChatId,
        ) -> Result<Vec<ForwardingRule>, DatabaseError> {
            self.inner.get_by_source(source).await
        }

        async fn set_active(&self, id: i64, active: bool) -> Result<(), DatabaseError> {
            let held = if active {
                None
            } else {
                self.held_deactivation.lock().unwrap().take()
            };
            if let Some(release) = held {
                self.deactivation_started.notify_one();
                let _ = release.await;
            }
            self.inner.set_active(id, active).await
        }

        async fn delete_rule(&self, id: i64) -> Result<(), DatabaseError> {
            self.inner.delete_rule(id).await
        }

        async fn record_stats(
            &self,
            id: i64,
            success: bool,
            error: Option<&str>,
        ) -> Result<(), DatabaseError> {
            self.inner.record_stats(id, success, error).await
        }

        async fn pause_all(&self) -> Result<usize, DatabaseError> {
            self.inner.pause_all().await
        }

        async fn resume_all(&self) -> Result<usize, DatabaseError> {
            self.inner.resume_all().await
        }

        async fn rule_statistics(&self) -> Result<RuleStatistics, DatabaseError> {
            self.inner.rule_statistics().await
        }

        async fn log_system_stats(&self, record: &SystemStatsRecord) -> Result<(), DatabaseError> {
            self.inner.log_system_stats(record).await
        }

        async fn system_stats_since(
            &self,
            since: DateTime<Utc>,
        ) -> Result<Vec<SystemStatsRecord>, DatabaseError> {
            self.inner.system_stats_since(since).await
        }

        async fn cleanup_old_stats(&self, keep_days: u32) -> Result<usize, DatabaseError> {
            self.inner.cleanup_old_stats(keep_days).await
        }

        async fn ping(&self) -> Result<(), DatabaseError> {
            self.inner.ping().await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    async fn setup() -> (Arc<LibSqlTaskStore>, TaskCache) {
        let store = Arc::new(LibSqlTaskStore::new_memory().await.unwrap());
        let cache = TaskCache::new(store.clone());
        (store, cache)
    }

    #[tokio::test]
    async fn add_then_lookup_round_trip() {
        let (_store, cache) = setup().await;
        let rule = cache.add(SRC, ChatId(-2001)).await.unwrap();
        cache.reload().await.unwrap();

        let found = cache.lookup(SRC).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, rule.id);
        assert!(found[0].active);
        assert!(cache.is_active(rule.id).await);
    }

    #[tokio::test]
    async fn lookup_is_ordered_by_id() {
        let (_store, cache) = setup().await;
        let a = cache.add(SRC, ChatId(-2003)).await.unwrap();
        let b = cache.add(SRC, ChatId(-2001)).await.unwrap();
        let c = cache.add(SRC, ChatId(-2002)).await.unwrap();

        let ids: Vec<i64> = cache.lookup(SRC).await.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[tokio::test]
    async fn lookup_unknown_source_is_empty() {
        let (_store, cache) = setup().await;
        assert!(cache.lookup(ChatId(5)).await.is_empty());
    }

    #[tokio::test]
    async fn toggle_removes_and_restores() {
        let (_store, cache) = setup().await;
        let rule = cache.add(SRC, ChatId(-2001)).await.unwrap();

        let off = cache.toggle(rule.id).await.unwrap();
        assert!(!off.active);
        assert!(cache.lookup(SRC).await.is_empty());

        let on = cache.toggle(rule.id).await.unwrap();
        assert!(on.active);
        assert_eq!(cache.lookup(SRC).await.len(), 1);
    }

    #[tokio::test]
    async fn toggle_missing_rule() {
        let (_store, cache) = setup().await;
        assert!(matches!(
            cache.toggle(99).await.unwrap_err(),
            CacheError::RuleNotFound(99)
        ));
    }

    #[tokio::test]
    async fn delete_removes_from_store_and_cache() {
        let (store, cache) = setup().await;
        let rule = cache.add(SRC, ChatId(-2001)).await.unwrap();
        cache.delete(rule.id).await.unwrap();

        assert!(cache.lookup(SRC).await.is_empty());
        assert!(store.get_rule(rule.id).await.unwrap().is_none());
        assert!(matches!(
            cache.delete(rule.id).await.unwrap_err(),
            CacheError::RuleNotFound(_)
        ));
    }

    #[tokio::test]
    async fn deactivate_happens_exactly_once() {
        let (store, cache) = setup().await;
        let rule = cache.add(SRC, ChatId(-2001)).await.unwrap();

        assert!(cache.deactivate(rule.id, "bot was kicked").await);
        assert!(!cache.deactivate(rule.id, "bot was kicked").await);

        let stored = store.get_rule(rule.id).await.unwrap().unwrap();
        assert!(!stored.active);
        assert_eq!(stored.error_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("bot was kicked"));
        assert!(!cache.is_active(rule.id).await);
    }

    #[tokio::test]
    async fn concurrent_deactivation_has_one_winner() {
        let (_store, cache) = setup().await;
        let cache = Arc::new(cache);
        let rule_id = cache.add(SRC, ChatId(-2001)).await.unwrap().id;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.deactivate(rule_id, "forbidden").await })
            })
            .collect();

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_contents() {
        let (store, cache) = setup().await;
        cache.add(SRC, ChatId(-2001)).await.unwrap();
        store.close().await;

        let err = cache.reload().await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::StoreUnavailable(DatabaseError::Closed)
        ));
        assert_eq!(cache.lookup(SRC).await.len(), 1);
    }

    #[tokio::test]
    async fn reload_waits_for_inflight_deactivation() {
        let store = Arc::new(HookedStore::new().await);
        let cache = Arc::new(TaskCache::new(store.clone()));
        let rule_id = cache.add(SRC, ChatId(-2001)).await.unwrap().id;

        let release = store.hold_next_deactivation();
        let deactivating = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.deactivate(rule_id, "bot was kicked").await })
        };
        store.deactivation_started.notified().await;

        let reloading = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.reload().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reloading.is_finished(), "reload ran while the store write was pending");

        release.send(()).unwrap();
        assert!(deactivating.await.unwrap());
        assert_eq!(reloading.await.unwrap().unwrap(), 0);

        assert!(!cache.is_active(rule_id).await);
        assert!(cache.lookup(SRC).await.is_empty());
        assert!(!cache.deactivate(rule_id, "bot was kicked").await);
    }

    #[tokio::test]
    async fn resume_all_patches_cache_when_reload_fails() {
        let store = Arc::new(HookedStore::new().await);
        let cache = TaskCache::new(store.clone());
        cache.add(SRC, ChatId(-2001)).await.unwrap();
        cache.add(ChatId(-1002), ChatId(-2002)).await.unwrap();
        cache.pause_all().await.unwrap();
        assert_eq!(cache.active_count().await, 0);

        store.fail_list_active.store(true, Ordering::SeqCst);
        assert_eq!(cache.resume_all().await.unwrap(), 2);

        assert_eq!(cache.active_count().await, 2);
        assert_eq!(cache.lookup(SRC).await.len(), 1);
        assert!(cache.reload().await.is_err());
    }

    #[tokio::test]
    async fn pause_and_resume_all() {
        let (_store, cache) = setup().await;
        cache.add(SRC, ChatId(-2001)).await.unwrap();
        cache.add(ChatId(-1002), ChatId(-2002)).await.unwrap();

        assert_eq!(cache.pause_all().await.unwrap(), 2);
        assert_eq!(cache.active_count().await, 0);

        assert_eq!(cache.resume_all().await.unwrap(), 2);
        assert_eq!(cache.active_count().await, 2);
        assert_eq!(cache.all_rules().await.unwrap().len(), 2);
    }
}
