//! Activity display names per process definition, behind a bounded LRU.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use tracing::debug;

use crate::backends::EngineGateway;

pub const DEFAULT_CAPACITY: usize = 128;

type NameMap = Arc<HashMap<String, String>>;

#[derive(Clone)]
pub struct ActivityNames {
    engine: Arc<dyn EngineGateway>,
    cache: Arc<Mutex<LruCache<String, NameMap>>>,
}

impl ActivityNames {
    pub fn new(engine: Arc<dyn EngineGateway>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            engine,
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Names for `activity_ids` under `definition_id`. Ids without a
    /// non-empty name are left out.
    pub async fn resolve(
        &self,
        definition_id: Option<&str>,
        activity_ids: &[String],
    ) -> BTreeMap<String, String> {
        let Some(definition_id) = definition_id else {
            return BTreeMap::new();
        };
        if activity_ids.is_empty() {
            return BTreeMap::new();
        }
        let Some(names) = self.definition(definition_id).await else {
            return BTreeMap::new();
        };
        activity_ids
            .iter()
            .filter_map(|id| {
                names
                    .get(id)
                    .filter(|name| !name.is_empty())
                    .map(|name| (id.clone(), name.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Failed lookups are not cached.
    async fn definition(&self, definition_id: &str) -> Option<NameMap> {
        let cached = self.lock().get(definition_id).cloned();
        if cached.is_some() {
            return cached;
        }
        match self.engine.find_activity_names(definition_id).await {
            Ok(names) => {
                let names = Arc::new(names);
                self.lock().put(definition_id.to_string(), names.clone());
                Some(names)
            }
            Err(err) => {
                debug!(definition_id, error = %err, "activity name lookup failed");
                None
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, NameMap>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
