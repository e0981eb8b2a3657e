//! Bounded free-list object pool
//!
//! Objects are handed out by value and given back by value, so the borrow
//! checker enforces that a released object is never touched again by its
//! previous owner. Objects released into a full pool are dropped.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Types that can be recycled through an [`ObjectPool`]
pub trait Poolable: Default + Send {
    /// Drop every reference the object holds and clear its fields
    fn reset(&mut self);
}

pub struct ObjectPool<T> {
    free: ArrayQueue<T>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl<T: Poolable> ObjectPool<T> {
    /// Pool retaining at most `capacity` idle objects
    pub fn new(capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity.max(1)),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Take an idle object, or build a fresh one when the pool is empty
    pub fn acquire(&self) -> T {
        match self.free.pop() {
            Some(obj) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                obj
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                T::default()
            }
        }
    }

    /// Reset `obj` and keep it for reuse
    pub fn release(&self, mut obj: T) {
        obj.reset();
        // full pool: let it drop
        let _ = self.free.push(obj);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            idle: self.free.len(),
            capacity: self.free.capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: usize,
    pub misses: usize,
    pub idle: usize,
    pub capacity: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Buf {
        data: Vec<u8>,
        resets: usize,
    }

    impl Poolable for Buf {
        fn reset(&mut self) {
            self.data.clear();
            self.resets += 1;
        }
    }

    #[test]
    fn test_release_resets_and_reuses() {
        let pool = ObjectPool::<Buf>::new(4);
        let mut buf = pool.acquire();
        buf.data.extend_from_slice(b"payload");
        pool.release(buf);

        let reused = pool.acquire();
        assert!(reused.data.is_empty());
        assert_eq!(reused.resets, 1);
        // allocation is kept across reuse
        assert!(reused.data.capacity() >= 7);

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_full_pool_drops_extras() {
        let pool = ObjectPool::<Buf>::new(2);
        for _ in 0..5 {
            pool.release(Buf::default());
        }
        assert_eq!(pool.stats().idle, 2);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = std::sync::Arc::new(ObjectPool::<Buf>::new(16));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let buf = pool.acquire();
                        pool.release(buf);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.hits + stats.misses, 8000);
        assert!(stats.idle <= 16);
    }
}
