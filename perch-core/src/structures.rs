//! Bounded and expiring containers used for history, flood windows and
//! hostmask lists.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use crate::ident::{Casemap, hostmask_pattern_equal};

// ── RingBuffer ──

/// Fixed-capacity FIFO; pushing onto a full buffer evicts the oldest item.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity.min(4096)),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the capacity, dropping the oldest items if it shrinks.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.items.len() > capacity {
            self.items.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

// ── TimeoutQueue ──

/// Lifetime of items in a [`TimeoutQueue`], fixed or read live.
#[derive(Clone)]
pub enum Timeout {
    Fixed(f64),
    Dynamic(Arc<dyn Fn() -> f64 + Send + Sync>),
}

impl Timeout {
    pub fn get(&self) -> f64 {
        match self {
            Timeout::Fixed(t) => *t,
            Timeout::Dynamic(f) => f(),
        }
    }
}

impl std::fmt::Debug for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Timeout::Fixed(t) => write!(f, "Timeout::Fixed({t})"),
            Timeout::Dynamic(_) => f.write_str("Timeout::Dynamic"),
        }
    }
}

/// FIFO whose items vanish `timeout` seconds after insertion.
#[derive(Debug, Clone)]
pub struct TimeoutQueue<T> {
    timeout: Timeout,
    items: VecDeque<(f64, T)>,
}

impl<T> TimeoutQueue<T> {
    pub fn new(timeout: Timeout) -> Self {
        Self {
            timeout,
            items: VecDeque::new(),
        }
    }

    pub fn set_timeout(&mut self, timeout: Timeout) {
        self.timeout = timeout;
    }

    pub fn enqueue(&mut self, item: T, now: f64) {
        self.expire(now);
        self.items.push_back((now, item));
    }

    pub fn expire(&mut self, now: f64) {
        let timeout = self.timeout.get();
        while let Some((at, _)) = self.items.front() {
            if now - at > timeout {
                self.items.pop_front();
            } else {
                break;
            }
        }
    }

    /// Live items at `now`. Items inserted at the same instant stay
    /// live for exactly `timeout` seconds.
    pub fn len(&self, now: f64) -> usize {
        let timeout = self.timeout.get();
        self.items.iter().filter(|(at, _)| now - at <= timeout).count()
    }

    pub fn is_empty(&self, now: f64) -> bool {
        self.len(now) == 0
    }

    pub fn iter(&self, now: f64) -> impl Iterator<Item = &T> {
        let timeout = self.timeout.get();
        self.items
            .iter()
            .filter(move |(at, _)| now - at <= timeout)
            .map(|(_, item)| item)
    }

    pub fn reset(&mut self) {
        self.items.clear();
    }
}

// ── FloodQueue ──

/// One [`TimeoutQueue`] of event times per key (usually `user@host`).
#[derive(Debug, Clone)]
pub struct FloodQueue<K> {
    timeout: Timeout,
    queues: HashMap<K, TimeoutQueue<()>>,
}

impl<K: Eq + Hash + Clone> FloodQueue<K> {
    pub fn new(timeout: Timeout) -> Self {
        Self {
            timeout,
            queues: HashMap::new(),
        }
    }

    /// Record an event and return how many are now inside the window.
    pub fn enqueue(&mut self, key: &K, now: f64) -> usize {
        let queue = self
            .queues
            .entry(key.clone())
            .or_insert_with(|| TimeoutQueue::new(self.timeout.clone()));
        queue.enqueue((), now);
        queue.len(now)
    }

    pub fn len(&self, key: &K, now: f64) -> usize {
        self.queues.get(key).map_or(0, |q| q.len(now))
    }

    pub fn clear(&mut self, key: &K) {
        self.queues.remove(key);
    }

    /// Drop keys whose windows are empty.
    pub fn gc(&mut self, now: f64) {
        self.queues.retain(|_, q| {
            q.expire(now);
            !q.is_empty(now)
        });
    }

    pub fn keys(&self) -> usize {
        self.queues.len()
    }
}

// ── Hostmask containers ──

/// Ordered list of hostmask patterns.
#[derive(Debug, Clone, Default)]
pub struct HostmaskSet {
    casemap: Casemap,
    patterns: Vec<String>,
}

impl HostmaskSet {
    pub fn new(casemap: Casemap) -> Self {
        Self {
            casemap,
            patterns: Vec::new(),
        }
    }

    pub fn add(&mut self, pattern: &str) -> bool {
        if self.patterns.iter().any(|p| p == pattern) {
            return false;
        }
        self.patterns.push(pattern.to_string());
        true
    }

    pub fn remove(&mut self, pattern: &str) -> bool {
        let before = self.patterns.len();
        self.patterns.retain(|p| p != pattern);
        before != self.patterns.len()
    }

    /// First stored pattern matching `hostmask`.
    pub fn matching(&self, hostmask: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|p| hostmask_pattern_equal(p, hostmask, self.casemap))
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Hostmask patterns with an optional absolute expiry and a payload.
#[derive(Debug, Clone)]
pub struct ExpiringHostmaskDict<V = ()> {
    casemap: Casemap,
    entries: Vec<(String, Option<f64>, V)>,
}

impl<V> Default for ExpiringHostmaskDict<V> {
    fn default() -> Self {
        Self::new(Casemap::default())
    }
}

impl<V> ExpiringHostmaskDict<V> {
    pub fn new(casemap: Casemap) -> Self {
        Self {
            casemap,
            entries: Vec::new(),
        }
    }

    /// Insert or replace `pattern`. `expires` is an absolute time; `None`
    /// never expires.
    pub fn add(&mut self, pattern: &str, expires: Option<f64>, value: V) {
        self.entries.retain(|(p, _, _)| p != pattern);
        self.entries.push((pattern.to_string(), expires, value));
    }

    pub fn remove(&mut self, pattern: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(p, _, _)| p != pattern);
        before != self.entries.len()
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.entries.iter().any(|(p, _, _)| p == pattern)
    }

    /// First live pattern matching `hostmask`.
    pub fn matching(&self, hostmask: &str, now: f64) -> Option<(&str, &V)> {
        self.entries
            .iter()
            .filter(|(_, exp, _)| exp.is_none_or(|e| e > now))
            .find(|(p, _, _)| hostmask_pattern_equal(p, hostmask, self.casemap))
            .map(|(p, _, v)| (p.as_str(), v))
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn expire(&mut self, now: f64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(_, exp, _)| exp.is_none_or(|e| e > now));
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f64>, &V)> {
        self.entries.iter().map(|(p, e, v)| (p.as_str(), *e, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest() {
        let mut ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.push(i);
            assert!(ring.len() <= 3);
        }
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        ring.resize(2);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(ring.last(), Some(&4));
    }

    #[test]
    fn zero_capacity_ring_stays_empty() {
        let mut ring = RingBuffer::new(0);
        ring.push(1);
        assert!(ring.is_empty());
    }

    #[test]
    fn timeout_queue_expires() {
        let mut q = TimeoutQueue::new(Timeout::Fixed(10.0));
        q.enqueue("a", 0.0);
        q.enqueue("b", 5.0);
        assert_eq!(q.len(10.0), 2);
        assert_eq!(q.len(12.0), 1);
        assert_eq!(q.iter(12.0).copied().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(q.len(16.0), 0);
    }

    #[test]
    fn dynamic_timeout_is_read_live() {
        let limit = Arc::new(parking_lot::Mutex::new(10.0));
        let reader = limit.clone();
        let mut q = TimeoutQueue::new(Timeout::Dynamic(Arc::new(move || *reader.lock())));
        q.enqueue((), 0.0);
        assert_eq!(q.len(8.0), 1);
        *limit.lock() = 5.0;
        assert_eq!(q.len(8.0), 0);
    }

    #[test]
    fn flood_queue_interleaving() {
        let mut f = FloodQueue::new(Timeout::Fixed(60.0));
        let a = "a@h".to_string();
        let b = "b@h".to_string();
        assert_eq!(f.enqueue(&a, 0.0), 1);
        assert_eq!(f.enqueue(&b, 1.0), 1);
        assert_eq!(f.enqueue(&a, 30.0), 2);
        assert_eq!(f.len(&a, 60.0), 2);
        assert_eq!(f.len(&a, 61.0), 1);
        assert_eq!(f.enqueue(&a, 95.0), 1);
        assert_eq!(f.len(&b, 95.0), 0);
        f.gc(95.0);
        assert_eq!(f.keys(), 1);
    }

    #[test]
    fn hostmask_set_first_match() {
        let mut s = HostmaskSet::new(Casemap::Rfc1459);
        s.add("*!*@a.example");
        s.add("alice!*@*");
        assert_eq!(s.matching("ALICE!x@a.example"), Some("*!*@a.example"));
        assert_eq!(s.matching("alice!x@b.example"), Some("alice!*@*"));
        assert_eq!(s.matching("bob!x@b.example"), None);
        assert!(!s.add("alice!*@*"));
    }

    #[test]
    fn expiring_dict_respects_expiry() {
        let mut d = ExpiringHostmaskDict::new(Casemap::Rfc1459);
        d.add("*!*@spam", Some(100.0), "flood");
        d.add("troll!*@*", None, "manual");
        assert_eq!(d.matching("x!y@spam", 50.0).map(|(_, v)| *v), Some("flood"));
        assert_eq!(d.matching("x!y@spam", 100.0), None);
        assert_eq!(d.expire(150.0), 1);
        assert_eq!(d.matching("troll!a@b", 1e12).map(|(p, _)| p), Some("troll!*@*"));
    }
}
