// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::analysed_target::AnalysedTarget;
use crate::config::Configuration;
use crate::hasher::ContentHash;
use crate::name::EntityName;

const SHARDS: usize = 16;

/// Canonicalising registry of fully analysed targets.
///
/// Keys are `(target, effective configuration)`. Whoever installs a value
/// first wins; later equivalent analyses receive the already-registered
/// value, so equal analyses share one pointer for the whole run.
pub struct ResultTargetMap {
    shards: Vec<Mutex<HashMap<(EntityName, ContentHash), Arc<AnalysedTarget>>>>,
}

impl Default for ResultTargetMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultTargetMap {
    pub fn new() -> ResultTargetMap {
        ResultTargetMap {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn add(
        &self,
        target: EntityName,
        effective_config: &Configuration,
        candidate: Arc<AnalysedTarget>,
    ) -> Arc<AnalysedTarget> {
        let key = (target, effective_config.hash());
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let shard = &self.shards[hasher.finish() as usize % SHARDS];
        let mut entries = shard.lock();
        Arc::clone(entries.entry(key).or_insert(candidate))
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ResultTargetMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultTargetMap")
            .field("len", &self.len())
            .finish()
    }
}
