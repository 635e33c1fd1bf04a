//! Interfaces to the collaborators the core consumes.
//!
//! The database layer owns the process variables, fires monitors, and hosts
//! the per-circuit event facility; access security arbitrates reads and
//! writes; the watchdog tracks long-running threads; the memory oracle
//! answers the admission question "is there headroom for this many bytes".
//! The bodies of the per-circuit command loop, the UDP name-search
//! responder, and the beacon transmitter live outside this crate and are
//! supplied through [Tasks].

use std::sync::Arc;
use std::thread::ThreadId;

use crate::client::Client;
use crate::iface::IfaceConfig;
use crate::sched::Priority;
use crate::server::CaServer;
use crate::Error;

////////////////////////////////////////////// handles /////////////////////////////////////////////

/// The database layer's handle for one attached channel.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DbChannel(pub u64);

/// The database layer's handle for one monitor subscription.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DbEvent(pub u64);

/// The access-security token held for one channel.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct AsClient(pub u64);

////////////////////////////////////////////// Database ////////////////////////////////////////////

/// Work the event facility runs on the circuit's behalf between monitor
/// deliveries.
pub type ExtraLabor = Box<dyn Fn() + Send + Sync>;

/// One circuit's session with the event facility.
pub trait EventSession: Send + Sync {
    /// Install the extra-labor callback, or clear it with `None`.  After a
    /// clear returns, no new callback invocation will begin.
    fn add_extra_labor(&self, labor: Option<ExtraLabor>) -> Result<(), Error>;

    /// Wait until extra labor already queued has finished.
    fn flush_extra_labor(&self);

    /// Start delivering events on a named thread at `priority`.
    fn start(&self, name: &str, priority: Priority) -> Result<(), Error>;

    /// Tear the session down.
    fn close(self: Box<Self>);
}

pub trait Database: Send + Sync {
    /// Open an event-facility session for one circuit.
    fn init_events(&self) -> Result<Box<dyn EventSession>, Error>;

    /// Cancel one monitor subscription.
    fn cancel_event(&self, event: DbEvent);

    /// Release one attached channel.
    fn delete_channel(&self, channel: DbChannel);

    /// Print one channel for the introspection dump.
    fn show_channel(&self, channel: DbChannel, level: u32);

    /// Make this endpoint visible as a pluggable server.
    fn register_server(&self, registration: ServerRegistration);
}

/////////////////////////////////////////// AccessSecurity /////////////////////////////////////////

pub trait AccessSecurity: Send + Sync {
    fn check_get(&self, token: AsClient) -> bool;
    fn check_put(&self, token: AsClient) -> bool;

    /// Retire a channel's token.  Errors are reported, not fatal.
    fn remove_client(&self, token: AsClient) -> Result<(), String>;
}

////////////////////////////////////////////// Watchdog ////////////////////////////////////////////

pub trait Watchdog: Send + Sync {
    fn insert(&self, thread: ThreadId);
    fn remove(&self, thread: ThreadId);
}

///////////////////////////////////////////// MemoryOracle /////////////////////////////////////////

pub trait MemoryOracle: Send + Sync {
    fn sufficient_space(&self, bytes: usize) -> bool;
}

/////////////////////////////////////////////// Tasks //////////////////////////////////////////////

/// The loop bodies the core spawns but does not implement.  Each body is
/// expected to sample the corresponding control flag at its own poll points
/// and to exit when its transport dies.
pub trait Tasks: Send + Sync {
    /// The per-circuit command loop.  Runs on the `CAS-client` thread; calls
    /// [CaServer::attach_thread_to_client] on entry and
    /// [CaServer::destroy_tcp_client] before returning.
    fn circuit(&self, server: CaServer, client: Arc<Client>);

    /// The UDP name-search responder for one interface.  `broadcast` selects
    /// the broadcast-receiver socket over the unicast one.
    fn name_search(&self, server: CaServer, iface: Arc<IfaceConfig>, broadcast: bool);

    /// The beacon transmitter.
    fn beacon(&self, server: CaServer);

    /// Extra labor run by a circuit's event session between deliveries.
    fn extra_labor(&self, client: &Arc<Client>);
}

/////////////////////////////////////// ServerRegistration /////////////////////////////////////////

/// The record registered with the database layer so the endpoint shows up
/// beside other servers.
pub struct ServerRegistration {
    pub name: &'static str,
    pub show: Box<dyn Fn(u32) + Send + Sync>,
    /// Returns (channel count, circuit count).
    pub stats: Box<dyn Fn() -> (u32, u32) + Send + Sync>,
    pub current_client: Box<dyn Fn() -> Option<Arc<Client>> + Send + Sync>,
}

/////////////////////////////////////////////// Deps ///////////////////////////////////////////////

/// Collaborator wiring handed to [CaServer::initialize].
pub struct Deps {
    pub database: Arc<dyn Database>,
    pub access: Arc<dyn AccessSecurity>,
    pub watchdog: Arc<dyn Watchdog>,
    pub oracle: Arc<dyn MemoryOracle>,
    pub tasks: Arc<dyn Tasks>,
}

//////////////////////////////////////////// test support //////////////////////////////////////////
