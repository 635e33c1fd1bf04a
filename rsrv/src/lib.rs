#![doc = include_str!("../README.md")]

use biometrics::Counter;

use tatl::{HeyListen, Stationary};

pub mod buffers;
pub mod client;
pub mod config;
pub mod control;
pub mod db;
pub mod iface;
pub mod pool;
pub mod proto;
pub mod sched;
pub mod server;
pub mod stats;
pub mod table;

mod listener;

pub use client::{Client, ChannelInUse, EventExt, Proto, PutNotify};
pub use config::ServerOptions;
pub use db::{AccessSecurity, Database, Deps, EventSession, MemoryOracle, Tasks, Watchdog};
pub use iface::IfaceConfig;
pub use server::CaServer;

///////////////////////////////////////////// constants ////////////////////////////////////////////

/// Size of the small TCP buffer class; also the floor of the large class.
pub const MAX_TCP: usize = 1024 * 16;
/// Heap-allocated send buffer size for UDP pseudo-clients.
pub const MAX_UDP_SEND: usize = 1024;
/// Heap-allocated receive buffer size for UDP pseudo-clients.
pub const MAX_UDP_RECV: usize = 0xffff + 16;

/// The well-known TCP listen and UDP name-search port.
pub const CA_SERVER_PORT: u16 = 5064;
/// The well-known beacon destination port.
pub const CA_REPEATER_PORT: u16 = 5065;

pub const CA_MAJOR_PROTOCOL_REVISION: u16 = 4;
pub const CA_MINOR_PROTOCOL_REVISION: u16 = 13;
/// Sentinel minor version before the peer has told us theirs.
pub const CA_UKN_MINOR_VERSION: u16 = 0;

pub const CA_PROTO_PRIORITY_MIN: u8 = 0;
pub const CA_PROTO_PRIORITY_MAX: u8 = 99;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static IO_ERROR: Counter = Counter::new("rsrv.error.io");
static NO_SPACE_IN_POOL: Counter = Counter::new("rsrv.error.no_space_in_pool");
static NO_INTERFACES: Counter = Counter::new("rsrv.error.no_interfaces");
static EVENT_FACILITY_ERROR: Counter = Counter::new("rsrv.error.event_facility");

static NO_SPACE_IN_POOL_MONITOR: Stationary =
    Stationary::new("rsrv.error.no_space_in_pool", &NO_SPACE_IN_POOL);

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&IO_ERROR);
    collector.register_counter(&NO_SPACE_IN_POOL);
    collector.register_counter(&NO_INTERFACES);
    collector.register_counter(&EVENT_FACILITY_ERROR);
    buffers::register_biometrics(collector);
    client::register_biometrics(collector);
    iface::register_biometrics(collector);
    listener::register_biometrics(collector);
    pool::register_biometrics(collector);
    table::register_biometrics(collector);
}

pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&NO_SPACE_IN_POOL_MONITOR);
    table::register_monitors(hey_listen);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////////// Error //////////////////////////////////////////////

#[derive(Debug)]
pub enum Error {
    /// Admission was refused: the relevant pool is empty and the process is
    /// below its free-memory threshold.
    NoSpaceInPool,
    /// Interface pruning left nothing to bind.
    NoInterfaces,
    /// The database layer's event facility failed to open or start.
    EventFacility(String),
    Io(std::io::Error),
}

impl Error {
    pub(crate) fn no_space_in_pool() -> Self {
        NO_SPACE_IN_POOL.click();
        Error::NoSpaceInPool
    }

    pub(crate) fn no_interfaces() -> Self {
        NO_INTERFACES.click();
        Error::NoInterfaces
    }

    pub(crate) fn event_facility(what: impl Into<String>) -> Self {
        EVENT_FACILITY_ERROR.click();
        Error::EventFacility(what.into())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::NoSpaceInPool => write!(f, "no space in pool for a new client"),
            Error::NoInterfaces => write!(f, "no usable interface addresses remain"),
            Error::EventFacility(what) => write!(f, "event facility failure: {}", what),
            Error::Io(err) => write!(f, "{}", err),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        IO_ERROR.click();
        Self::Io(err)
    }
}

impl From<&Error> for indicio::Value {
    fn from(err: &Error) -> Self {
        match err {
            Error::NoSpaceInPool => indicio::value!({ no_space_in_pool: true }),
            Error::NoInterfaces => indicio::value!({ no_interfaces: true }),
            Error::EventFacility(what) => indicio::value!({ event_facility: what.as_str() }),
            Error::Io(err) => indicio::value!({ io: err.to_string() }),
        }
    }
}
