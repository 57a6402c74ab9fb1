use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::backends::BackendKind;
use crate::models::PredictionResponse;

type Key = (BackendKind, String);

#[derive(Default)]
struct Entries {
    map: HashMap<Key, PredictionResponse>,
    order: VecDeque<Key>,
}

/// Bounded memo of prediction responses keyed by backend and filename.
///
/// A capacity of zero disables caching. The oldest entry is evicted first.
pub struct PredictionCache {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl PredictionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn get(&self, backend: BackendKind, filename: &str) -> Option<PredictionResponse> {
        if !self.is_enabled() {
            return None;
        }
        let entries = self.entries.lock().ok()?;
        entries.map.get(&(backend, filename.to_string())).cloned()
    }

    pub fn insert(&self, backend: BackendKind, filename: &str, response: PredictionResponse) {
        if !self.is_enabled() {
            return;
        }
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let key = (backend, filename.to_string());
        if entries.map.insert(key.clone(), response).is_none() {
            entries.order.push_back(key);
        }
        while entries.map.len() > self.capacity {
            match entries.order.pop_front() {
                Some(oldest) => {
                    entries.map.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
