use crate::detection::DetectionResult;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct StoredDetection {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub result: DetectionResult,
}

/// Recent detections keyed by id, so concurrent callers never read each
/// other's results. The oldest entry is evicted once `capacity` is reached.
pub struct DetectionStore {
    entries: RwLock<IndexMap<Uuid, StoredDetection>>,
    capacity: usize,
}

impl DetectionStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&self, result: DetectionResult, timestamp: DateTime<Utc>) -> StoredDetection {
        let stored = StoredDetection {
            id: Uuid::new_v4(),
            timestamp,
            result,
        };

        let mut entries = self.entries.write();
        while entries.len() >= self.capacity {
            entries.shift_remove_index(0);
        }
        entries.insert(stored.id, stored.clone());

        stored
    }

    pub fn get(&self, id: &Uuid) -> Option<StoredDetection> {
        self.entries.read().get(id).cloned()
    }
}
