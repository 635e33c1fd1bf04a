//! Per-circuit send and receive buffer slots.
//!
//! A slot owns one byte region plus two watermarks.  For a receive slot,
//! `cnt` is the number of bytes read off the wire and `stk` is the prefix
//! already consumed by the command loop; `cnt - stk` is the unprocessed
//! window.  For a send slot, `stk` is the number of undelivered response
//! bytes queued behind it.
//!
//! The storage is a tagged sum carrying the owning pool's identity, so the
//! slab always goes back to the pool it came from.  Promotion from the small
//! TCP class to the large class is one-way for the life of the circuit.

use biometrics::Counter;

use crate::db::MemoryOracle;
use crate::pool::{Pools, Slab};
use crate::MAX_TCP;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static EXPAND_SEND: Counter = Counter::new("rsrv.buffers.expand_send");
static EXPAND_RECV: Counter = Counter::new("rsrv.buffers.expand_recv");
static EXPAND_DENIED: Counter = Counter::new("rsrv.buffers.expand_denied");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&EXPAND_SEND);
    collector.register_counter(&EXPAND_RECV);
    collector.register_counter(&EXPAND_DENIED);
}

////////////////////////////////////////////// BufKind /////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BufKind {
    SmallTcp,
    LargeTcp,
    Udp,
}

////////////////////////////////////////////// Storage /////////////////////////////////////////////

enum Storage {
    SmallTcp(Slab),
    LargeTcp(Slab),
    Udp(Vec<u8>),
}

impl Storage {
    fn bytes(&self) -> &[u8] {
        match self {
            Storage::SmallTcp(slab) => slab,
            Storage::LargeTcp(slab) => slab,
            Storage::Udp(buf) => buf,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Storage::SmallTcp(slab) => slab,
            Storage::LargeTcp(slab) => slab,
            Storage::Udp(buf) => buf,
        }
    }
}

///////////////////////////////////////////// BufferSlot ///////////////////////////////////////////

pub struct BufferSlot {
    storage: Storage,
    /// Consumed prefix (receive) or queued bytes (send).
    pub stk: usize,
    /// Filled bytes (receive).
    pub cnt: usize,
}

impl BufferSlot {
    pub fn small_tcp(slab: Slab) -> BufferSlot {
        BufferSlot {
            storage: Storage::SmallTcp(slab),
            stk: 0,
            cnt: 0,
        }
    }

    pub fn udp(size: usize) -> BufferSlot {
        BufferSlot {
            storage: Storage::Udp(vec![0u8; size]),
            stk: 0,
            cnt: 0,
        }
    }

    pub fn kind(&self) -> BufKind {
        match &self.storage {
            Storage::SmallTcp(_) => BufKind::SmallTcp,
            Storage::LargeTcp(_) => BufKind::LargeTcp,
            Storage::Udp(_) => BufKind::Udp,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.bytes().len()
    }

    pub fn bytes(&self) -> &[u8] {
        self.storage.bytes()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.storage.bytes_mut()
    }

    /// Promote a small send slot to the large class so that a response of
    /// `size` bytes can be queued.  The queued prefix `[0..stk]` is carried
    /// over and the small slab returns to its pool.  Left unchanged when the
    /// slot is not small, when `size` does not fit the large class, or when
    /// the large class is not pool-sufficient.
    pub fn expand_send(&mut self, size: usize, pools: &Pools, oracle: &dyn MemoryOracle) {
        if !self.expandable(size, pools) {
            return;
        }
        let Some(mut slab) = pools.alloc_large_tcp(oracle) else {
            EXPAND_DENIED.click();
            return;
        };
        slab[..self.stk].copy_from_slice(&self.storage.bytes()[..self.stk]);
        self.storage = Storage::LargeTcp(slab);
        EXPAND_SEND.click();
    }

    /// Promote a small receive slot to the large class.  The unconsumed
    /// window `[stk..cnt]` moves to the start of the new slab.
    pub fn expand_recv(&mut self, size: usize, pools: &Pools, oracle: &dyn MemoryOracle) {
        if !self.expandable(size, pools) {
            return;
        }
        let Some(mut slab) = pools.alloc_large_tcp(oracle) else {
            EXPAND_DENIED.click();
            return;
        };
        debug_assert!(self.cnt >= self.stk);
        let window = self.cnt - self.stk;
        slab[..window].copy_from_slice(&self.storage.bytes()[self.stk..self.cnt]);
        self.storage = Storage::LargeTcp(slab);
        self.cnt = window;
        self.stk = 0;
        EXPAND_RECV.click();
    }

    fn expandable(&self, size: usize, pools: &Pools) -> bool {
        self.kind() == BufKind::SmallTcp
            && pools.large_tcp.slab_size() > MAX_TCP
            && size <= pools.large_tcp.slab_size()
    }

    /// Give the slab back to its pool and leave the slot empty.  Called by
    /// circuit teardown; the slot must not be used afterward.
    pub fn release(&mut self) {
        self.storage = Storage::Udp(Vec::new());
        self.stk = 0;
        self.cnt = 0;
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::FixedOracle;

    fn small_slot(pools: &Pools) -> BufferSlot {
        BufferSlot::small_tcp(pools.small_tcp.alloc_zeroed().unwrap())
    }

    #[test]
    fn recv_promotion_preserves_the_unconsumed_window() {
        let pools = Pools::new(2 * MAX_TCP);
        let mut slot = small_slot(&pools);
        for (i, b) in slot.bytes_mut()[..100].iter_mut().enumerate() {
            *b = i as u8;
        }
        slot.cnt = 100;
        slot.stk = 25;
        slot.expand_recv(MAX_TCP + 1, &pools, &FixedOracle(false));
        assert_eq!(BufKind::LargeTcp, slot.kind());
        assert_eq!(2 * MAX_TCP, slot.capacity());
        assert_eq!(0, slot.stk);
        assert_eq!(75, slot.cnt);
        let expected: Vec<u8> = (25u8..100u8).collect();
        assert_eq!(&expected[..], &slot.bytes()[..75]);
    }

    #[test]
    fn send_promotion_preserves_the_queued_prefix() {
        let pools = Pools::new(2 * MAX_TCP);
        let mut slot = small_slot(&pools);
        slot.bytes_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        slot.stk = 4;
        let small_before = pools.small_tcp.items_available();
        slot.expand_send(MAX_TCP + 1, &pools, &FixedOracle(false));
        assert_eq!(BufKind::LargeTcp, slot.kind());
        assert_eq!(4, slot.stk);
        assert_eq!(&[1, 2, 3, 4], &slot.bytes()[..4]);
        // the small slab went home
        assert_eq!(small_before + 1, pools.small_tcp.items_available());
        assert_eq!(0, pools.large_tcp.items_available());
    }

    #[test]
    fn promotion_is_one_way() {
        let pools = Pools::new(2 * MAX_TCP);
        let mut slot = small_slot(&pools);
        slot.expand_send(MAX_TCP + 1, &pools, &FixedOracle(false));
        assert_eq!(BufKind::LargeTcp, slot.kind());
        // a second request neither shrinks nor reallocates
        slot.expand_send(1, &pools, &FixedOracle(true));
        assert_eq!(BufKind::LargeTcp, slot.kind());
        assert_eq!(2 * MAX_TCP, slot.capacity());
    }

    #[test]
    fn oversized_requests_leave_the_slot_unchanged() {
        let pools = Pools::new(2 * MAX_TCP);
        let mut slot = small_slot(&pools);
        slot.expand_send(2 * MAX_TCP + 1, &pools, &FixedOracle(true));
        assert_eq!(BufKind::SmallTcp, slot.kind());
    }

    #[test]
    fn large_class_at_the_floor_never_promotes() {
        let pools = Pools::new(MAX_TCP);
        let mut slot = small_slot(&pools);
        slot.expand_send(10, &pools, &FixedOracle(true));
        assert_eq!(BufKind::SmallTcp, slot.kind());
    }

    #[test]
    fn exhausted_large_pool_defers_to_the_oracle() {
        let pools = Pools::new(2 * MAX_TCP);
        let hog = pools.large_tcp.alloc_zeroed().unwrap();
        let mut slot = small_slot(&pools);
        slot.expand_send(MAX_TCP + 1, &pools, &FixedOracle(false));
        assert_eq!(BufKind::SmallTcp, slot.kind());
        slot.expand_send(MAX_TCP + 1, &pools, &FixedOracle(true));
        assert_eq!(BufKind::LargeTcp, slot.kind());
        drop(hog);
    }

    #[test]
    fn release_returns_the_slab() {
        let pools = Pools::new(2 * MAX_TCP);
        let mut slot = small_slot(&pools);
        assert_eq!(15, pools.small_tcp.items_available());
        slot.release();
        assert_eq!(16, pools.small_tcp.items_available());
    }

    #[test]
    fn udp_slots_come_from_the_heap() {
        let slot = BufferSlot::udp(crate::MAX_UDP_SEND);
        assert_eq!(BufKind::Udp, slot.kind());
        assert_eq!(crate::MAX_UDP_SEND, slot.capacity());
    }
}
