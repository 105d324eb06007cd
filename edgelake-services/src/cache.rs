//! Serviceable cache.
//!
//! Entries are bucketed by the cache prefix of the matcher they were resolved
//! for and keyed by serviceable id inside a bucket, so there is at most one
//! live entry per `(prefix, id)`.
use std::{collections::HashMap, sync::Arc};

use edgelake_core::{
    config::CacheConfig,
    matcher::{MatchDefinition, MatchIndex},
    naming::NamingService,
    Error, Result,
};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::serviceable::Serviceable;

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Score an entry must have to be returned; `HIGH_MATCH` when unset.
    pub match_index: Option<MatchIndex>,
    /// Re-check commit freshness and evict stale entries.
    pub validation: bool,
    /// Branches to check freshness against; the configured defaults when empty.
    pub branches: Vec<String>,
}

impl GetOptions {
    pub fn validated() -> Self {
        Self {
            validation: true,
            ..Default::default()
        }
    }
}

type Bucket = HashMap<String, Serviceable>;

pub struct Cache {
    map: RwLock<HashMap<String, Bucket>>,
    naming: Arc<dyn NamingService>,
    config: CacheConfig,
}

impl Cache {
    pub fn new(naming: Arc<dyn NamingService>, config: CacheConfig) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            naming,
            config,
        }
    }

    /// Inserts `serviceable` unless an entry for its id is already present
    /// and still an exact match for its own matcher. Returns the canonical
    /// entry, which may not be the one passed in.
    pub fn add(&self, serviceable: Serviceable) -> Result<Serviceable> {
        let prefix = serviceable.matcher().cache_prefix();
        let mut map = self.map.write();
        let bucket = map.entry(prefix).or_default();
        if let Some(existing) = bucket.get(serviceable.id()) {
            if existing.match_index(existing.matcher()).is_high() {
                return Ok(existing.clone());
            }
        }

        serviceable
            .validate(serviceable.matcher())
            .map_err(|e| Error::Provision {
                id: serviceable.id().to_string(),
                source: Box::new(e),
            })?;
        if let Some(old) = bucket.insert(serviceable.id().to_string(), serviceable.clone()) {
            debug!("replaced cached {} `{}`", old.kind(), old.id());
        }
        Ok(serviceable)
    }

    pub async fn get(
        &self,
        matcher: &MatchDefinition,
        options: &GetOptions,
    ) -> Result<Vec<Serviceable>> {
        let wanted = options.match_index.unwrap_or(MatchIndex::HIGH_MATCH);
        let candidates: Vec<Serviceable> = {
            let map = self.map.read();
            map.get(&matcher.cache_prefix())
                .map(|bucket| {
                    bucket
                        .values()
                        .filter(|s| s.match_index(matcher) == wanted)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        let branches = if options.branches.is_empty() {
            &self.config.default_branches
        } else {
            &options.branches
        };
        let mut found = Vec::with_capacity(candidates.len());
        for serviceable in candidates {
            if options.validation {
                if let Err(e) = self.validate(&serviceable, branches).await {
                    warn!("evicting cached {} `{}`: {e}", serviceable.kind(), serviceable.id());
                    if self.evict(&serviceable) {
                        serviceable.close();
                    }
                    continue;
                }
            }
            found.push(serviceable);
        }

        if found.is_empty() {
            return Err(Error::NotFound(matcher.to_string()));
        }
        debug!("cache hit for {matcher}: {} serviceable(s)", found.len());
        Ok(found)
    }

    /// Deletes the entry for the serviceable's id and closes the serviceable,
    /// whether or not it was cached.
    pub fn remove(&self, serviceable: &Serviceable) {
        let prefix = serviceable.matcher().cache_prefix();
        {
            let mut map = self.map.write();
            if let Some(bucket) = map.get_mut(&prefix) {
                bucket.remove(serviceable.id());
                if bucket.is_empty() {
                    map.remove(&prefix);
                }
            }
        }
        serviceable.close();
    }

    /// Deletes the entry only if it is this very serviceable. Does not close it.
    pub fn evict(&self, serviceable: &Serviceable) -> bool {
        let prefix = serviceable.matcher().cache_prefix();
        let mut map = self.map.write();
        let Some(bucket) = map.get_mut(&prefix) else {
            return false;
        };
        match bucket.get(serviceable.id()) {
            Some(cached) if cached.ptr_eq(serviceable) => {
                bucket.remove(serviceable.id());
                if bucket.is_empty() {
                    map.remove(&prefix);
                }
                true
            }
            _ => false,
        }
    }

    /// Drops every entry. Entries are not closed here.
    pub fn close(&self) {
        self.map.write().clear();
    }

    pub fn len(&self) -> usize {
        self.map.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_len(&self, prefix: &str) -> usize {
        self.map.read().get(prefix).map_or(0, HashMap::len)
    }

    async fn validate(&self, serviceable: &Serviceable, branches: &[String]) -> Result<()> {
        let (latest, _branch) = self
            .naming
            .commit(serviceable.project(), branches)
            .await
            .map_err(|source| Error::Fetch {
                path: format!("commit of project `{}`", serviceable.project()),
                source,
            })?;
        if latest != serviceable.commit() {
            return Err(Error::Stale {
                id: serviceable.id().to_string(),
                cached: serviceable.commit().to_string(),
                latest,
            });
        }
        // Asset content addresses are not re-checked; a new asset always
        // comes with a new commit.
        Ok(())
    }
}
