//! The CA message header.
//!
//! Only the fixed 16-byte header is modeled here: the core emits the initial
//! version reply itself and keeps a header snapshot per monitor
//! subscription.  Command dispatch and payload handling belong to the
//! command loop, not to this crate.

use crate::buffers::BufferSlot;

///////////////////////////////////////////// constants ////////////////////////////////////////////

pub const CA_PROTO_VERSION: u16 = 0;

pub const CA_HEADER_SIZE: usize = 16;
/// Header plus the two 32-bit extension words that large payloads carry.
pub const CA_MESSAGE_OVERHEAD: usize = CA_HEADER_SIZE + 2 * 4;

////////////////////////////////////////////// CaHeader ////////////////////////////////////////////

/// One wire header, host-order fields.  All fields serialize big-endian.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CaHeader {
    pub command: u16,
    pub payload_size: u16,
    pub data_type: u16,
    pub data_count: u16,
    pub cid: u32,
    pub available: u32,
}

impl CaHeader {
    pub fn encode(&self) -> [u8; CA_HEADER_SIZE] {
        let mut wire = [0u8; CA_HEADER_SIZE];
        wire[0..2].copy_from_slice(&self.command.to_be_bytes());
        wire[2..4].copy_from_slice(&self.payload_size.to_be_bytes());
        wire[4..6].copy_from_slice(&self.data_type.to_be_bytes());
        wire[6..8].copy_from_slice(&self.data_count.to_be_bytes());
        wire[8..12].copy_from_slice(&self.cid.to_be_bytes());
        wire[12..16].copy_from_slice(&self.available.to_be_bytes());
        wire
    }

    /// Queue this header behind the bytes already in `slot`.  Returns false
    /// when the slot lacks capacity; the slot is left unchanged.
    pub fn queue(&self, slot: &mut BufferSlot) -> bool {
        let stk = slot.stk;
        if slot.capacity() - stk < CA_HEADER_SIZE {
            return false;
        }
        slot.bytes_mut()[stk..stk + CA_HEADER_SIZE].copy_from_slice(&self.encode());
        slot.stk = stk + CA_HEADER_SIZE;
        true
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_big_endian_in_field_order() {
        let hdr = CaHeader {
            command: 0x0102,
            payload_size: 0x0304,
            data_type: 0x0506,
            data_count: 0x0708,
            cid: 0x090a0b0c,
            available: 0x0d0e0f10,
        };
        assert_eq!(
            [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16],
            hdr.encode()
        );
    }

    #[test]
    fn queue_appends_behind_queued_bytes() {
        let mut slot = BufferSlot::udp(64);
        slot.stk = 3;
        let hdr = CaHeader {
            command: CA_PROTO_VERSION,
            data_count: 13,
            ..CaHeader::default()
        };
        assert!(hdr.queue(&mut slot));
        assert_eq!(3 + CA_HEADER_SIZE, slot.stk);
        assert_eq!(&hdr.encode()[..], &slot.bytes()[3..3 + CA_HEADER_SIZE]);
    }

    #[test]
    fn queue_refuses_when_full() {
        let mut slot = BufferSlot::udp(CA_HEADER_SIZE);
        slot.stk = 1;
        let hdr = CaHeader::default();
        assert!(!hdr.queue(&mut slot));
        assert_eq!(1, slot.stk);
    }
}
