//! Server-wide free pools.
//!
//! Two flavors.  Object pools (clients, channels, events, put-notifies) are
//! counted-permit admission gates: `alloc` hands out a permit while the pool
//! has capacity and the permit restores the count when dropped.  Byte pools
//! recycle real zeroed slabs for the two TCP buffer classes.  Neither flavor
//! blocks and neither grows; callers that outlive a pool's capacity consult
//! the memory oracle and proceed unpooled when it reports headroom.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use biometrics::Counter;

use crate::db::MemoryOracle;
use crate::MAX_TCP;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static POOL_ALLOC: Counter = Counter::new("rsrv.pool.alloc");
static POOL_EXHAUSTED: Counter = Counter::new("rsrv.pool.exhausted");
static POOL_RELEASE: Counter = Counter::new("rsrv.pool.release");

static SLAB_ALLOC: Counter = Counter::new("rsrv.pool.slab.alloc");
static SLAB_RELEASE: Counter = Counter::new("rsrv.pool.slab.release");
static SLAB_UNPOOLED: Counter = Counter::new("rsrv.pool.slab.unpooled");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&POOL_ALLOC);
    collector.register_counter(&POOL_EXHAUSTED);
    collector.register_counter(&POOL_RELEASE);
    collector.register_counter(&SLAB_ALLOC);
    collector.register_counter(&SLAB_RELEASE);
    collector.register_counter(&SLAB_UNPOOLED);
}

/////////////////////////////////////////////// Pool ///////////////////////////////////////////////

struct PoolInner {
    label: &'static str,
    free: Mutex<usize>,
    init: usize,
}

impl PoolInner {
    fn release(&self) {
        let mut free = self.free.lock().unwrap();
        *free += 1;
        assert!(*free <= self.init, "pool {} over-released", self.label);
        POOL_RELEASE.click();
    }
}

/// A counted-permit pool for one object kind.  Clones share the pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(label: &'static str, count: usize) -> Pool {
        Pool {
            inner: Arc::new(PoolInner {
                label,
                free: Mutex::new(count),
                init: count,
            }),
        }
    }

    /// Take one permit.  Returns None when the pool is exhausted.
    pub fn alloc(&self) -> Option<Permit> {
        let mut free = self.inner.free.lock().unwrap();
        if *free > 0 {
            *free -= 1;
            POOL_ALLOC.click();
            Some(Permit {
                inner: Arc::clone(&self.inner),
            })
        } else {
            POOL_EXHAUSTED.click();
            None
        }
    }

    pub fn items_available(&self) -> usize {
        *self.inner.free.lock().unwrap()
    }

    pub fn label(&self) -> &'static str {
        self.inner.label
    }

    pub fn capacity(&self) -> usize {
        self.inner.init
    }
}

////////////////////////////////////////////// Permit //////////////////////////////////////////////

/// One unit of pool capacity.  Dropping it returns the unit.
pub struct Permit {
    inner: Arc<PoolInner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.inner.release();
    }
}

////////////////////////////////////////////// BufPool /////////////////////////////////////////////

struct BufPoolInner {
    label: &'static str,
    size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl BufPoolInner {
    fn put_back(&self, bytes: Box<[u8]>) {
        assert_eq!(self.size, bytes.len(), "pool {} fed a foreign slab", self.label);
        SLAB_RELEASE.click();
        self.free.lock().unwrap().push(bytes);
    }
}

/// A slab pool for one TCP buffer class.  Slabs are preallocated at
/// construction and recycled through [Slab]'s drop.
#[derive(Clone)]
pub struct BufPool {
    inner: Arc<BufPoolInner>,
}

impl BufPool {
    pub fn new(label: &'static str, size: usize, count: usize) -> BufPool {
        let mut free = Vec::with_capacity(count);
        for _ in 0..count {
            free.push(vec![0u8; size].into_boxed_slice());
        }
        BufPool {
            inner: Arc::new(BufPoolInner {
                label,
                size,
                free: Mutex::new(free),
            }),
        }
    }

    /// Take one zeroed slab.  Returns None when the pool is exhausted.
    pub fn alloc_zeroed(&self) -> Option<Slab> {
        let mut bytes = self.inner.free.lock().unwrap().pop()?;
        bytes.fill(0);
        SLAB_ALLOC.click();
        Some(Slab {
            bytes: Some(bytes),
            pool: Some(Arc::clone(&self.inner)),
        })
    }

    pub fn items_available(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }

    pub fn label(&self) -> &'static str {
        self.inner.label
    }

    pub fn slab_size(&self) -> usize {
        self.inner.size
    }
}

/////////////////////////////////////////////// Slab ///////////////////////////////////////////////

/// An owned byte region.  Pooled slabs return to their pool on drop;
/// oracle-admitted slabs came from the heap and go back to it.
pub struct Slab {
    bytes: Option<Box<[u8]>>,
    pool: Option<Arc<BufPoolInner>>,
}

impl Slab {
    /// A zeroed heap slab outside any pool.
    pub fn heap(size: usize) -> Slab {
        SLAB_UNPOOLED.click();
        Slab {
            bytes: Some(vec![0u8; size].into_boxed_slice()),
            pool: None,
        }
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }
}

impl Deref for Slab {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes.as_ref().expect("slab must hold bytes")
    }
}

impl DerefMut for Slab {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.bytes.as_mut().expect("slab must hold bytes")
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        if let (Some(bytes), Some(pool)) = (self.bytes.take(), self.pool.take()) {
            pool.put_back(bytes);
        }
    }
}

/////////////////////////////////////////////// Pools //////////////////////////////////////////////

/// The six server-wide pools.
pub struct Pools {
    pub clients: Pool,
    pub channels: Pool,
    pub events: Pool,
    pub put_notifies: Pool,
    pub small_tcp: BufPool,
    pub large_tcp: BufPool,
}

impl Pools {
    pub fn new(large_buf_size: usize) -> Pools {
        Pools {
            clients: Pool::new("rsrv.clients", 8),
            channels: Pool::new("rsrv.channels", 512),
            events: Pool::new("rsrv.events", 512),
            put_notifies: Pool::new("rsrv.put_notifies", 16),
            small_tcp: BufPool::new("rsrv.small_tcp", MAX_TCP, 16),
            large_tcp: BufPool::new("rsrv.large_tcp", large_buf_size, 1),
        }
    }

    /// The pool-sufficient predicate for the small TCP class: a pooled slab
    /// when one is free, a heap slab when the oracle reports headroom.
    pub fn alloc_small_tcp(&self, oracle: &dyn MemoryOracle) -> Option<Slab> {
        self.small_tcp.alloc_zeroed().or_else(|| {
            if oracle.sufficient_space(self.small_tcp.slab_size()) {
                Some(Slab::heap(self.small_tcp.slab_size()))
            } else {
                None
            }
        })
    }

    /// The pool-sufficient predicate for the large TCP class.
    pub fn alloc_large_tcp(&self, oracle: &dyn MemoryOracle) -> Option<Slab> {
        self.large_tcp.alloc_zeroed().or_else(|| {
            if oracle.sufficient_space(self.large_tcp.slab_size()) {
                Some(Slab::heap(self.large_tcp.slab_size()))
            } else {
                None
            }
        })
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod permit_pool {
    use super::*;

    #[test]
    fn exhaustion_and_release() {
        let pool = Pool::new("test.pool", 2);
        assert_eq!(2, pool.items_available());
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(0, pool.items_available());
        assert!(pool.alloc().is_none());
        drop(a);
        assert_eq!(1, pool.items_available());
        drop(b);
        assert_eq!(2, pool.items_available());
    }
}

#[cfg(test)]
mod buf_pool {
    use super::*;
    use crate::db::test_support::FixedOracle;

    #[test]
    fn slabs_recycle_zeroed() {
        let pool = BufPool::new("test.bufs", 64, 1);
        let mut slab = pool.alloc_zeroed().unwrap();
        assert_eq!(0, pool.items_available());
        slab[0] = 0xff;
        drop(slab);
        assert_eq!(1, pool.items_available());
        let slab = pool.alloc_zeroed().unwrap();
        assert_eq!(0u8, slab[0]);
    }

    #[test]
    fn heap_slabs_stay_out_of_the_pool() {
        let pool = BufPool::new("test.bufs", 64, 0);
        assert!(pool.alloc_zeroed().is_none());
        let slab = Slab::heap(64);
        assert!(!slab.is_pooled());
        drop(slab);
        assert_eq!(0, pool.items_available());
    }

    #[test]
    fn pool_sufficient_predicate() {
        let pools = Pools::new(MAX_TCP);
        let generous = FixedOracle(true);
        let stingy = FixedOracle(false);
        let mut held = Vec::new();
        while let Some(slab) = pools.small_tcp.alloc_zeroed() {
            held.push(slab);
        }
        assert!(pools.alloc_small_tcp(&stingy).is_none());
        let overflow = pools.alloc_small_tcp(&generous).unwrap();
        assert!(!overflow.is_pooled());
        drop(overflow);
        drop(held);
        assert_eq!(16, pools.small_tcp.items_available());
    }
}
