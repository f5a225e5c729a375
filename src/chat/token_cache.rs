use std::collections::{HashMap, VecDeque};

pub const DEFAULT_CAPACITY: usize = 1000;

/// Token counts keyed by exact text. Oldest insertions are evicted first once
/// the cache holds more than `capacity` entries.
#[derive(Debug)]
pub struct TokenCountCache {
    capacity: usize,
    counts: HashMap<String, usize>,
    order: VecDeque<String>,
}

impl TokenCountCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            counts: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn get(&self, text: &str) -> Option<usize> {
        self.counts.get(text).copied()
    }

    pub fn insert(&mut self, text: &str, count: usize) {
        if self.counts.insert(text.to_string(), count).is_none() {
            self.order.push_back(text.to_string());
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.counts.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl Default for TokenCountCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
