//! Small blocking primitives shared by the page manager and its worker.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

use parking_lot::{Condvar, Mutex};

/// A set of keys, each of which can be locked independently.
///
/// Used to make sure a page is read from disk by exactly one thread while
/// others wanting the same page wait for it.
pub struct MutexSet<K> {
    locked: Mutex<HashSet<K>>,
    released: Condvar,
}

pub struct MutexSetGuard<'a, K: Eq + Hash + Copy> {
    set: &'a MutexSet<K>,
    key: K,
}

impl<K: Eq + Hash + Copy> Default for MutexSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Copy> MutexSet<K> {
    pub fn new() -> Self {
        Self {
            locked: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    /// Blocks until `key` is not held by anyone else.
    pub fn lock(&self, key: K) -> MutexSetGuard<'_, K> {
        let mut locked = self.locked.lock();
        while locked.contains(&key) {
            self.released.wait(&mut locked);
        }
        locked.insert(key);
        MutexSetGuard { set: self, key }
    }

    pub fn is_locked(&self, key: K) -> bool {
        self.locked.lock().contains(&key)
    }
}

impl<K: Eq + Hash + Copy> Drop for MutexSetGuard<'_, K> {
    fn drop(&mut self) {
        self.set.locked.lock().remove(&self.key);
        self.set.released.notify_all();
    }
}

/// Unbounded FIFO with a blocking `pop`.
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.available.notify_one();
    }

    pub fn pop(&self) -> T {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            self.available.wait(&mut items);
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_mutex_set_serializes_same_key() {
        let set = Arc::new(MutexSet::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let set = set.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _guard = set.lock(7u32);
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(50));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(!set.is_locked(7));
    }

    #[test]
    fn test_mutex_set_different_keys_do_not_block() {
        let set = MutexSet::new();
        let _a = set.lock(1u32);
        let _b = set.lock(2u32);
        assert!(set.is_locked(1));
        assert!(set.is_locked(2));
    }

    #[test]
    fn test_work_queue_is_fifo_across_threads() {
        let queue = Arc::new(WorkQueue::new());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || (0..100).map(|_| queue.pop()).collect::<Vec<u32>>())
        };
        for i in 0..100u32 {
            queue.push(i);
        }
        let received = consumer.join().unwrap();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }
}
