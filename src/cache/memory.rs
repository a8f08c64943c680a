use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MemoryEntry {
    pub raw_query: String,
    pub payload: String,
    pub source: String,
    pub written_at: i64,
}

#[derive(Debug)]
struct Slot {
    entry: MemoryEntry,
    seq: u64,
}

/// Bounded in-process tier. When full, the entry with the oldest write time
/// is evicted regardless of how recently it was read.
#[derive(Debug)]
pub(crate) struct MemoryTier {
    capacity: usize,
    entries: HashMap<String, Slot>,
    next_seq: u64,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns the entry when `now - written_at < ttl_millis`; a stale entry is
    /// dropped on the way out.
    pub fn get_fresh(&mut self, key: &str, now: i64, ttl_millis: i64) -> Option<MemoryEntry> {
        let fresh = match self.entries.get(key) {
            Some(slot) => now - slot.entry.written_at < ttl_millis,
            None => return None,
        };
        if fresh {
            self.entries.get(key).map(|slot| slot.entry.clone())
        } else {
            self.entries.remove(key);
            None
        }
    }

    /// Inserts or replaces `key`. Returns the evicted key, if any.
    pub fn insert(&mut self, key: String, entry: MemoryEntry) -> Option<String> {
        let mut evicted = None;
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            evicted = self.oldest_key();
            if let Some(oldest) = &evicted {
                self.entries.remove(oldest);
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key, Slot { entry, seq });
        evicted
    }

    pub fn retain_fresh(&mut self, now: i64, ttl_millis: i64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, slot| now - slot.entry.written_at < ttl_millis);
        before - self.entries.len()
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    // Ties on written_at fall back to insertion order.
    fn oldest_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, slot)| (slot.entry.written_at, slot.seq))
            .map(|(key, _)| key.clone())
    }
}
