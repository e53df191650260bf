//! Instance pools.
//!
//! A pooled resource hands its instance back on release instead of dropping
//! it, and the next container of that resource takes it from the pool before
//! asking the source for a fresh one.

use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A resource instance as seen by the runtime
pub type Instance = Arc<dyn Any + Send + Sync>;

/// An instance together with how many times it has been reused
#[derive(Clone)]
pub struct PooledInstance {
    /// The instance
    pub instance: Instance,
    /// Times this instance was taken back out of a pool
    pub reuse_count: u64,
}

impl std::fmt::Debug for PooledInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledInstance")
            .field("reuse_count", &self.reuse_count)
            .finish_non_exhaustive()
    }
}

/// Pool backing a pooled resource
pub trait InstancePool: Send + Sync {
    /// Take an idle instance, if any
    fn acquire(&self) -> Option<PooledInstance>;

    /// Return an instance for reuse
    fn release(&self, instance: PooledInstance);

    /// An instance that will not come back (invalidated, failed, rejected)
    fn discard(&self, instance: PooledInstance);

    /// Idle instances currently held
    fn idle(&self) -> usize;
}

/// Bounded LIFO pool
///
/// Releases beyond `max_idle` are discarded.
#[derive(Debug)]
pub struct IdlePool {
    max_idle: usize,
    idle: Mutex<Vec<PooledInstance>>,
    discarded: AtomicU64,
}

impl IdlePool {
    /// Create a pool holding at most `max_idle` instances
    #[must_use]
    pub fn new(max_idle: usize) -> Self {
        Self {
            max_idle,
            idle: Mutex::new(Vec::new()),
            discarded: AtomicU64::new(0),
        }
    }

    /// Instances dropped instead of pooled
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

impl InstancePool for IdlePool {
    fn acquire(&self) -> Option<PooledInstance> {
        self.idle.lock().pop()
    }

    fn release(&self, instance: PooledInstance) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(instance);
        } else {
            drop(idle);
            self.discard(instance);
        }
    }

    fn discard(&self, _instance: PooledInstance) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pooled(value: u32) -> PooledInstance {
        PooledInstance {
            instance: Arc::new(value),
            reuse_count: 0,
        }
    }

    #[test]
    fn test_release_then_acquire_returns_same_instance() {
        let pool = IdlePool::new(4);
        let first = pooled(1);
        let original = Arc::clone(&first.instance);

        pool.release(first);
        let again = pool.acquire().unwrap();
        assert!(Arc::ptr_eq(&original, &again.instance));
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_overflow_is_discarded() {
        let pool = IdlePool::new(1);
        pool.release(pooled(1));
        pool.release(pooled(2));

        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.discarded(), 1);
    }

    #[test]
    fn test_lifo_order() {
        let pool = IdlePool::new(4);
        pool.release(pooled(1));
        pool.release(pooled(2));

        let top = pool.acquire().unwrap();
        assert_eq!(top.instance.downcast_ref::<u32>(), Some(&2));
    }
}
