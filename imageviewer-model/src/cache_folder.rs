use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::ids::{CacheFolderId, CollectionId};

/// One cache root directory. Size and file counters are only ever moved by
/// atomic store increments; `cached_collections` behaves as a set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheFolder {
    pub id: CacheFolderId,
    pub name: String,
    pub path: String,
    pub is_active: bool,
    #[serde(default)]
    pub current_size_bytes: u64,
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub cached_collections: BTreeSet<CollectionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CacheFolder {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: CacheFolderId::new(),
            name: name.into(),
            path: path.into(),
            is_active: true,
            current_size_bytes: 0,
            total_files: 0,
            cached_collections: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }
}
