//! The process-wide identifier table.
//!
//! Maps the 32-bit server-assigned channel ID back to the in-use channel.
//! The table has no lock of its own: every mutation and lookup happens under
//! the client-queue mutex, which the server reuses to keep the lock count
//! down.  See [crate::server::ClientQ].

use std::collections::HashMap;
use std::sync::Arc;

use biometrics::Counter;

use tatl::{HeyListen, Stationary};

use crate::client::ChannelInUse;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static INSERT: Counter = Counter::new("rsrv.table.insert");
static INSERT_DISPLACED: Counter = Counter::new("rsrv.table.insert_displaced");
static REMOVE: Counter = Counter::new("rsrv.table.remove");
static REMOVE_NOT_FOUND: Counter = Counter::new("rsrv.table.remove_not_found");

static REMOVE_NOT_FOUND_MONITOR: Stationary =
    Stationary::new("rsrv.table.remove_not_found", &REMOVE_NOT_FOUND);

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&INSERT);
    collector.register_counter(&INSERT_DISPLACED);
    collector.register_counter(&REMOVE);
    collector.register_counter(&REMOVE_NOT_FOUND);
}

pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&REMOVE_NOT_FOUND_MONITOR);
}

////////////////////////////////////////////// SidTable ////////////////////////////////////////////

#[derive(Default)]
pub struct SidTable {
    entries: HashMap<u32, Arc<ChannelInUse>>,
}

impl SidTable {
    pub fn new() -> SidTable {
        SidTable {
            entries: HashMap::new(),
        }
    }

    /// Index `chan` under its server ID.  Most-recent wins: a displaced
    /// entry is handed back to the caller.
    pub fn insert(&mut self, chan: Arc<ChannelInUse>) -> Option<Arc<ChannelInUse>> {
        INSERT.click();
        let displaced = self.entries.insert(chan.sid, chan);
        if displaced.is_some() {
            INSERT_DISPLACED.click();
        }
        displaced
    }

    pub fn lookup(&self, sid: u32) -> Option<Arc<ChannelInUse>> {
        self.entries.get(&sid).map(Arc::clone)
    }

    /// Unindex `sid`.  Absent IDs leave the table untouched; the caller
    /// decides whether that is worth logging.
    pub fn remove(&mut self, sid: u32) -> Option<Arc<ChannelInUse>> {
        let removed = self.entries.remove(&sid);
        if removed.is_some() {
            REMOVE.click();
        } else {
            REMOVE_NOT_FOUND.click();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn show(&self) {
        println!(
            "The server's resource id conversion table: {} entries, capacity for {}",
            self.entries.len(),
            self.entries.capacity()
        );
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;
    use crate::db::{AsClient, DbChannel};

    fn chan(sid: u32) -> Arc<ChannelInUse> {
        Arc::new(ChannelInUse::new(
            sid,
            Weak::new(),
            DbChannel(sid as u64),
            AsClient(sid as u64),
            None,
        ))
    }

    #[test]
    fn lookup_returns_the_most_recent_insert() {
        let mut table = SidTable::new();
        assert!(table.lookup(7).is_none());
        let first = chan(7);
        let second = chan(7);
        assert!(table.insert(Arc::clone(&first)).is_none());
        assert!(Arc::ptr_eq(&first, &table.lookup(7).unwrap()));
        let displaced = table.insert(Arc::clone(&second)).unwrap();
        assert!(Arc::ptr_eq(&first, &displaced));
        assert!(Arc::ptr_eq(&second, &table.lookup(7).unwrap()));
    }

    #[test]
    fn remove_absent_leaves_the_table_unchanged() {
        let mut table = SidTable::new();
        table.insert(chan(1));
        table.insert(chan(2));
        assert!(table.remove(3).is_none());
        assert_eq!(2, table.len());
        assert!(table.lookup(1).is_some());
        assert!(table.lookup(2).is_some());
    }

    #[test]
    fn remove_unindexes() {
        let mut table = SidTable::new();
        table.insert(chan(9));
        assert!(table.remove(9).is_some());
        assert!(table.lookup(9).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn distinct_ids_do_not_collide() {
        let mut table = SidTable::new();
        for sid in 0..1000u32 {
            table.insert(chan(sid));
        }
        assert_eq!(1000, table.len());
        for sid in 0..1000u32 {
            assert_eq!(sid, table.lookup(sid).unwrap().sid);
        }
    }
}
