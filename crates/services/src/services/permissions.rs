//! Ability checks backed by a time-bounded in-memory cache.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use db::models::sortable::SortableRow;
use moka::future::Cache;
use thiserror::Error;
use tracing::{debug, warn};

use super::{config::Config, reorder::ReorderGate};

#[derive(Debug, Clone, Error)]
pub enum PermissionError {
    #[error("permission store error: {0}")]
    Store(String),
}

pub type Abilities = Arc<HashSet<String>>;

/// Loads a user's granted abilities, e.g. from ACL tables.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn abilities(&self, user_id: i64) -> Result<Vec<String>, PermissionError>;
}

/// In-memory grants. Counts loads so cache hits are observable.
#[derive(Debug, Default)]
pub struct StaticPermissionStore {
    grants: HashMap<i64, Vec<String>>,
    loads: AtomicUsize,
}

impl StaticPermissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant<I, S>(mut self, user_id: i64, abilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grants
            .entry(user_id)
            .or_default()
            .extend(abilities.into_iter().map(Into::into));
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PermissionStore for StaticPermissionStore {
    async fn abilities(&self, user_id: i64) -> Result<Vec<String>, PermissionError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.grants.get(&user_id).cloned().unwrap_or_default())
    }
}

#[derive(Clone)]
pub struct PermissionCache {
    inner: Cache<i64, Abilities>,
}

impl PermissionCache {
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.permission_cache_ttl(), config.permission_cache_capacity)
    }

    pub async fn get(&self, user_id: i64) -> Option<Abilities> {
        self.inner.get(&user_id).await
    }

    pub async fn insert(&self, user_id: i64, abilities: Abilities) {
        self.inner.insert(user_id, abilities).await;
    }

    /// Drop one user's entry, e.g. after their roles changed.
    pub async fn invalidate(&self, user_id: i64) {
        self.inner.invalidate(&user_id).await;
    }

    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }
}

/// True when `ability` is granted exactly, through `resource.*`, or by `*`.
pub fn ability_matches(granted: &HashSet<String>, ability: &str) -> bool {
    if granted.contains(ability) || granted.contains("*") {
        return true;
    }
    ability
        .rsplit_once('.')
        .is_some_and(|(resource, _)| granted.contains(&format!("{resource}.*")))
}

#[derive(Clone)]
pub struct PermissionChecker {
    cache: PermissionCache,
    store: Arc<dyn PermissionStore>,
}

impl PermissionChecker {
    pub fn new(cache: PermissionCache, store: Arc<dyn PermissionStore>) -> Self {
        Self { cache, store }
    }

    pub fn cache(&self) -> &PermissionCache {
        &self.cache
    }

    pub async fn abilities(&self, user_id: i64) -> Result<Abilities, PermissionError> {
        if let Some(abilities) = self.cache.get(user_id).await {
            return Ok(abilities);
        }
        let abilities: Abilities =
            Arc::new(self.store.abilities(user_id).await?.into_iter().collect());
        debug!(user_id, count = abilities.len(), "Loaded abilities");
        self.cache.insert(user_id, Arc::clone(&abilities)).await;
        Ok(abilities)
    }

    pub async fn allows(&self, user_id: i64, ability: &str) -> Result<bool, PermissionError> {
        let abilities = self.abilities(user_id).await?;
        Ok(ability_matches(&abilities, ability))
    }
}

/// Lets a user reorder rows when they hold `ability`.
#[derive(Clone)]
pub struct PermissionGate {
    checker: PermissionChecker,
    user_id: i64,
    ability: String,
}

impl PermissionGate {
    pub fn new(checker: PermissionChecker, user_id: i64, ability: impl Into<String>) -> Self {
        Self {
            checker,
            user_id,
            ability: ability.into(),
        }
    }
}

#[async_trait]
impl ReorderGate for PermissionGate {
    async fn can_reorder(&self, row: &SortableRow) -> bool {
        match self.checker.allows(self.user_id, &self.ability).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(
                    user_id = self.user_id,
                    ability = %self.ability,
                    row = row.id,
                    error = %e,
                    "Permission lookup failed, denying"
                );
                false
            }
        }
    }
}
