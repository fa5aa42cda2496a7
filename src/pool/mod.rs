//! Bounded Resource Pool
//!
//! Blocking object pool used to bound the number of live auxiliary resources
//! (backend client handles, connections) created on demand.
//!
//! # Admission Policies
//!
//! - [`PoolPolicy::Performance`]: `get` reuses an idle item or constructs a
//!   new one, even beyond capacity. Never blocks.
//! - [`PoolPolicy::StrictConcurrency`]: at most `capacity` items are allocated
//!   at once; `get` waits on a condition variable until an idle item appears
//!   or an allocation slot frees up.
//!
//! A capacity of zero yields a [`NilPool`] that never retains anything.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Constructor for new pool items
pub type Constructor<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Finalizer invoked on items leaving the pool for good
pub type Finalizer<T> = Box<dyn Fn(T) + Send + Sync>;

/// Admission policy of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolPolicy {
    /// Never block; allocate past capacity when no idle item exists
    #[default]
    Performance,
    /// Hard cap on concurrently allocated items
    StrictConcurrency,
}

/// Common pool capability
pub trait Pool<T>: Send + Sync {
    /// Take an item, constructing one if allowed by the policy.
    fn get(&self) -> T;

    /// Discard an allocated item for good.
    fn release(&self, item: T);

    /// Return an item for reuse. Finalizes it if the idle set is full.
    fn put(&self, item: T);

    /// Drain and finalize all idle items.
    fn close(&self);
}

/// Build a pool for the given capacity and policy.
pub fn new_pool<T: Send + 'static>(
    capacity: usize,
    policy: PoolPolicy,
    new: Constructor<T>,
    finalize: Option<Finalizer<T>>,
) -> Arc<dyn Pool<T>> {
    if capacity == 0 {
        return Arc::new(NilPool::new(new, finalize));
    }
    Arc::new(ConcurrencyPool::new(capacity, policy, new, finalize))
}

// =============================================================================
// Concurrency Pool
// =============================================================================

struct PoolState<T> {
    /// Items constructed and not yet released
    allocated: usize,
    /// Items available for reuse
    idle: VecDeque<T>,
}

/// Pool with a bounded idle set and optional hard allocation cap
pub struct ConcurrencyPool<T> {
    new: Constructor<T>,
    finalize: Option<Finalizer<T>>,
    capacity: usize,
    policy: PoolPolicy,
    state: Mutex<PoolState<T>>,
    available: Condvar,
}

impl<T> ConcurrencyPool<T> {
    /// Create a pool holding at most `capacity` idle items.
    pub fn new(
        capacity: usize,
        policy: PoolPolicy,
        new: Constructor<T>,
        finalize: Option<Finalizer<T>>,
    ) -> Self {
        Self {
            new,
            finalize,
            capacity,
            policy,
            state: Mutex::new(PoolState {
                allocated: 0,
                idle: VecDeque::with_capacity(capacity),
            }),
            available: Condvar::new(),
        }
    }

    /// Number of items constructed and not yet released
    pub fn allocated(&self) -> usize {
        self.state.lock().allocated
    }

    /// Number of idle items
    pub fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn finalize_item(&self, item: T) {
        if let Some(finalize) = &self.finalize {
            finalize(item);
        }
    }
}

impl<T: Send> Pool<T> for ConcurrencyPool<T> {
    fn get(&self) -> T {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.idle.pop_front() {
                return item;
            }
            if state.allocated < self.capacity || self.policy == PoolPolicy::Performance {
                state.allocated += 1;
                // Constructing under the lock keeps `allocated` exact.
                return (self.new)();
            }
            self.available.wait(&mut state);
        }
    }

    fn release(&self, item: T) {
        {
            let mut state = self.state.lock();
            state.allocated = state.allocated.saturating_sub(1);
            self.available.notify_one();
        }
        self.finalize_item(item);
    }

    fn put(&self, item: T) {
        let overflow = {
            let mut state = self.state.lock();
            if state.idle.len() < self.capacity {
                state.idle.push_back(item);
                self.available.notify_one();
                None
            } else {
                Some(item)
            }
        };
        if let Some(item) = overflow {
            self.finalize_item(item);
        }
    }

    fn close(&self) {
        let drained: Vec<T> = self.state.lock().idle.drain(..).collect();
        for item in drained {
            self.finalize_item(item);
        }
    }
}

// =============================================================================
// Nil Pool
// =============================================================================

/// Degenerate pool: always constructs, always finalizes
pub struct NilPool<T> {
    new: Constructor<T>,
    finalize: Option<Finalizer<T>>,
}

impl<T> NilPool<T> {
    pub fn new(new: Constructor<T>, finalize: Option<Finalizer<T>>) -> Self {
        Self { new, finalize }
    }
}

impl<T: Send> Pool<T> for NilPool<T> {
    fn get(&self) -> T {
        (self.new)()
    }

    fn release(&self, item: T) {
        if let Some(finalize) = &self.finalize {
            finalize(item);
        }
    }

    fn put(&self, item: T) {
        self.release(item);
    }

    fn close(&self) {}
}

// =============================================================================
// Tests
// =============================================================================
