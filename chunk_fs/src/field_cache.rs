use crate::schema::FileField;
use rusqlite::types::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct CachedField {
    value: Value,
    loaded_at: Instant,
}

/// Per-file metadata cache; each lookup supplies the TTL of its field.
#[derive(Default)]
pub struct FieldCache {
    entries: HashMap<FileField, CachedField>,
}

impl FieldCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: FileField, ttl: Duration) -> Option<&Value> {
        let entry = self.entries.get(&field)?;
        if entry.loaded_at.elapsed() > ttl {
            return None;
        }
        Some(&entry.value)
    }

    pub fn put(&mut self, field: FileField, value: Value) {
        self.entries.insert(
            field,
            CachedField {
                value,
                loaded_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&mut self, field: FileField) {
        self.entries.remove(&field);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
