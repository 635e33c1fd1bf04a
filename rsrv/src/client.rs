//! The per-circuit client record and its teardown protocol.
//!
//! A client aggregates one transport, two buffer slots, and the collections
//! it owns: the channel lists, the per-channel monitor queues, and the
//! put-notify queue.  Four independent mutex domains protect it; to avoid
//! deadlock they are acquired in the order client-queue lock, then
//! `channels`, then `eventq`, while `send` and `put_notify` are leaves that
//! are never held while taking another lock.  No lock is held across
//! blocking I/O or collaborator calls: elements are removed under their lock
//! and operated on outside it.
//!
//! Teardown is a hard contract: quiesce the event facility (deregister the
//! extra-labor callback, then flush in-flight labor), drain and free each
//! channel (monitors first, then the put-notify slot, then the identifier
//! table entry, then the database handle), close the event session, and only
//! then dismantle the record itself.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use biometrics::Counter;

use indicio::{clue, DEBUG, ERROR, INFO};

use crate::buffers::BufferSlot;
use crate::control::Event;
use crate::db::{AsClient, DbChannel, DbEvent, EventSession, ExtraLabor};
use crate::pool::Permit;
use crate::proto::{CaHeader, CA_PROTO_VERSION};
use crate::server::ServerCore;
use crate::{
    Error, COLLECTOR, CA_MINOR_PROTOCOL_REVISION, CA_PROTO_PRIORITY_MIN, CA_UKN_MINOR_VERSION,
    MAX_TCP, MAX_UDP_RECV, MAX_UDP_SEND,
};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static CREATE_CLIENT: Counter = Counter::new("rsrv.client.create");
static CREATE_REFUSED: Counter = Counter::new("rsrv.client.create.refused");
static CREATE_TCP_CLIENT: Counter = Counter::new("rsrv.client.create_tcp");
static DESTROY_CLIENT: Counter = Counter::new("rsrv.client.destroy");
static DESTROY_TCP_CLIENT: Counter = Counter::new("rsrv.client.destroy_tcp");
static DESTROY_CHANNEL: Counter = Counter::new("rsrv.client.destroy_channel");
static EVENT_CANCELED: Counter = Counter::new("rsrv.client.event_canceled");
static ATTACH_THREAD: Counter = Counter::new("rsrv.client.attach_thread");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&CREATE_CLIENT);
    collector.register_counter(&CREATE_REFUSED);
    collector.register_counter(&CREATE_TCP_CLIENT);
    collector.register_counter(&DESTROY_CLIENT);
    collector.register_counter(&DESTROY_TCP_CLIENT);
    collector.register_counter(&DESTROY_CHANNEL);
    collector.register_counter(&EVENT_CANCELED);
    collector.register_counter(&ATTACH_THREAD);
}

/////////////////////////////////////////////// Proto //////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Proto {
    Tcp,
    Udp,
}

///////////////////////////////////////////// Transport ////////////////////////////////////////////

pub enum Transport {
    Tcp(TcpStream),
    Udp(Arc<UdpSocket>),
}

impl Transport {
    fn proto(&self) -> Proto {
        match self {
            Transport::Tcp(_) => Proto::Tcp,
            Transport::Udp(_) => Proto::Udp,
        }
    }
}

////////////////////////////////////////////// EventExt ////////////////////////////////////////////

/// One monitor subscription, owned by its channel's queue.
pub struct EventExt {
    /// The owning channel's server ID.
    pub sid: u32,
    pub mask: u16,
    /// Snapshot of the subscription request header, echoed in replies.
    pub header: CaHeader,
    /// The database layer's subscription handle, absent until armed.
    pub dbev: Option<DbEvent>,
    _permit: Option<Permit>,
}

impl EventExt {
    pub fn new(
        sid: u32,
        mask: u16,
        header: CaHeader,
        dbev: Option<DbEvent>,
        permit: Option<Permit>,
    ) -> EventExt {
        EventExt {
            sid,
            mask,
            header,
            dbev,
            _permit: permit,
        }
    }
}

///////////////////////////////////////////// PutNotify ////////////////////////////////////////////

/// One outstanding server-side put-notify operation.
pub struct PutNotify {
    pub sid: u32,
    pub header: CaHeader,
    /// True while the database layer holds the operation.
    pub busy: bool,
    _permit: Option<Permit>,
}

impl PutNotify {
    pub fn new(sid: u32, header: CaHeader, permit: Option<Permit>) -> PutNotify {
        PutNotify {
            sid,
            header,
            busy: false,
            _permit: permit,
        }
    }
}

/////////////////////////////////////////// PutNotifyState /////////////////////////////////////////

/// Everything in the put-notify mutex domain: the FIFO of channels with
/// outstanding operations plus each channel's slot.
#[derive(Default)]
pub struct PutNotifyState {
    pub que: VecDeque<u32>,
    pub slots: HashMap<u32, PutNotify>,
}

impl PutNotifyState {
    fn forget(&mut self, sid: u32) {
        self.slots.remove(&sid);
        self.que.retain(|queued| *queued != sid);
    }
}

//////////////////////////////////////////// EventQueues ///////////////////////////////////////////

/// Every monitor queue this client owns, keyed by channel, all guarded by
/// the one `eventq` mutex.
#[derive(Default)]
pub struct EventQueues {
    by_sid: HashMap<u32, VecDeque<EventExt>>,
}

impl EventQueues {
    pub fn push(&mut self, event: EventExt) {
        self.by_sid.entry(event.sid).or_default().push_back(event);
    }

    pub fn pop(&mut self, sid: u32) -> Option<EventExt> {
        let queue = self.by_sid.get_mut(&sid)?;
        let event = queue.pop_front();
        if queue.is_empty() {
            self.by_sid.remove(&sid);
        }
        event
    }

    pub fn remove(&mut self, sid: u32, dbev: DbEvent) -> Option<EventExt> {
        let queue = self.by_sid.get_mut(&sid)?;
        let index = queue.iter().position(|ev| ev.dbev == Some(dbev))?;
        let event = queue.remove(index);
        if queue.is_empty() {
            self.by_sid.remove(&sid);
        }
        event
    }

    pub fn len_for(&self, sid: u32) -> usize {
        self.by_sid.get(&sid).map(VecDeque::len).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.by_sid.values().map(VecDeque::len).sum()
    }
}

//////////////////////////////////////////// ChannelInUse //////////////////////////////////////////

/// One attached channel.  Owned by exactly one client's list and reachable
/// by server ID through the identifier table.  The client reference is a
/// navigation relation, never ownership.
pub struct ChannelInUse {
    pub sid: u32,
    pub client: Weak<Client>,
    pub dbch: DbChannel,
    pub as_client: AsClient,
    _permit: Option<Permit>,
}

impl ChannelInUse {
    pub fn new(
        sid: u32,
        client: Weak<Client>,
        dbch: DbChannel,
        as_client: AsClient,
        permit: Option<Permit>,
    ) -> ChannelInUse {
        ChannelInUse {
            sid,
            client,
            dbch,
            as_client,
            _permit: permit,
        }
    }
}

///////////////////////////////////////////// ChanLists ////////////////////////////////////////////

/// The two channel lists in the `channels` mutex domain.  Channels park on
/// the pending list while their access rights are re-evaluated.
#[derive(Default)]
pub struct ChanLists {
    pub chan_list: VecDeque<Arc<ChannelInUse>>,
    pub chan_pending_update_ar_list: VecDeque<Arc<ChannelInUse>>,
}

impl ChanLists {
    pub fn total(&self) -> usize {
        self.chan_list.len() + self.chan_pending_update_ar_list.len()
    }
}

////////////////////////////////////////////// Client //////////////////////////////////////////////

pub struct Client {
    proto: Proto,
    transport: Transport,
    /// Peer address; rewritten per datagram for UDP pseudo-clients.
    pub addr: Mutex<SocketAddr>,
    pub user_name: Mutex<Option<String>>,
    pub host_name: Mutex<Option<String>>,
    pub minor_version: AtomicU16,
    pub priority: AtomicU8,
    pub disconnect: AtomicBool,
    tid: Mutex<Option<std::thread::ThreadId>>,
    last_send_micros: AtomicU64,
    last_recv_micros: AtomicU64,
    /// The send path.  Leaf lock.
    pub send: Mutex<BufferSlot>,
    /// The receive slot, owned by the command loop.
    pub recv: Mutex<BufferSlot>,
    pub channels: Mutex<ChanLists>,
    pub eventq: Mutex<EventQueues>,
    /// Leaf lock.
    pub put_notify: Mutex<PutNotifyState>,
    /// Blocks the command loop while the circuit is flow-controlled; the
    /// sender signals as capacity clears.
    pub block: Event,
    evuser: Mutex<Option<Box<dyn EventSession>>>,
    _permit: Option<Permit>,
}

impl Client {
    pub fn proto(&self) -> Proto {
        self.proto
    }

    pub fn tcp_stream(&self) -> Option<&TcpStream> {
        match &self.transport {
            Transport::Tcp(stream) => Some(stream),
            Transport::Udp(_) => None,
        }
    }

    pub fn udp_socket(&self) -> Option<&Arc<UdpSocket>> {
        match &self.transport {
            Transport::Tcp(_) => None,
            Transport::Udp(sock) => Some(sock),
        }
    }

    pub fn note_send(&self) {
        self.last_send_micros
            .store(utilz::time::now::micros(), Ordering::Relaxed);
    }

    pub fn note_recv(&self) {
        self.last_recv_micros
            .store(utilz::time::now::micros(), Ordering::Relaxed);
    }

    pub fn seconds_since_last_send(&self) -> f64 {
        since_seconds(self.last_send_micros.load(Ordering::Relaxed))
    }

    pub fn seconds_since_last_recv(&self) -> f64 {
        since_seconds(self.last_recv_micros.load(Ordering::Relaxed))
    }

    pub fn thread_id(&self) -> Option<std::thread::ThreadId> {
        *self.tid.lock().unwrap()
    }
}

fn since_seconds(micros: u64) -> f64 {
    utilz::time::now::micros().saturating_sub(micros) as f64 / 1_000_000.0
}

///////////////////////////////////////////// creation /////////////////////////////////////////////

/// Construct a client record around `transport`.  Admission is refused when
/// the client pool is dry and the process lacks headroom for one record plus
/// one small TCP buffer; the transport is dropped (closing the socket) on
/// every failure path.
pub(crate) fn create_client(
    core: &Arc<ServerCore>,
    transport: Transport,
) -> Result<Arc<Client>, Error> {
    let proto = transport.proto();
    let space_on_free_lists = core.pools.clients.items_available() > 0
        && core.pools.small_tcp.items_available() > 0;
    let space_needed = std::mem::size_of::<Client>() + MAX_TCP;
    if !(core.deps.oracle.sufficient_space(space_needed) || space_on_free_lists) {
        CREATE_REFUSED.click();
        clue!(COLLECTOR, ERROR, {
            create_client: {
                refused: "no space in pool for a new client",
            },
        });
        return Err(Error::no_space_in_pool());
    }
    let permit = core.pools.clients.alloc();
    let (send, recv) = match proto {
        Proto::Tcp => {
            let send = core
                .pools
                .alloc_small_tcp(&*core.deps.oracle)
                .ok_or_else(Error::no_space_in_pool)?;
            let recv = core
                .pools
                .alloc_small_tcp(&*core.deps.oracle)
                .ok_or_else(Error::no_space_in_pool)?;
            (BufferSlot::small_tcp(send), BufferSlot::small_tcp(recv))
        }
        Proto::Udp => (
            BufferSlot::udp(MAX_UDP_SEND),
            BufferSlot::udp(MAX_UDP_RECV),
        ),
    };
    let now = utilz::time::now::micros();
    CREATE_CLIENT.click();
    Ok(Arc::new(Client {
        proto,
        transport,
        addr: Mutex::new(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))),
        user_name: Mutex::new(None),
        host_name: Mutex::new(None),
        minor_version: AtomicU16::new(CA_UKN_MINOR_VERSION),
        priority: AtomicU8::new(CA_PROTO_PRIORITY_MIN),
        disconnect: AtomicBool::new(false),
        tid: Mutex::new(None),
        last_send_micros: AtomicU64::new(now),
        last_recv_micros: AtomicU64::new(now),
        send: Mutex::new(send),
        recv: Mutex::new(recv),
        channels: Mutex::new(ChanLists::default()),
        eventq: Mutex::new(EventQueues::default()),
        put_notify: Mutex::new(PutNotifyState::default()),
        block: Event::new(),
        evuser: Mutex::new(None),
        _permit: permit,
    }))
}

/// Finish a TCP circuit: socket options, peer identity, the event-facility
/// session with its extra-labor callback, and the initial version reply.
pub(crate) fn create_tcp_client(
    core: &Arc<ServerCore>,
    stream: TcpStream,
) -> Result<Arc<Client>, Error> {
    let client = create_client(core, Transport::Tcp(stream))?;
    let stream = client.tcp_stream().expect("tcp client must hold a stream");
    // Unsolicited single events go out much faster without Nagle; keepalive
    // lets the command loop find out when the peer crashes.
    if let Err(err) = stream.set_nodelay(true) {
        clue!(COLLECTOR, ERROR, {
            create_tcp_client: { nodelay: err.to_string() },
        });
        destroy_client(core, &client);
        return Err(err.into());
    }
    if let Err(err) = socket2::SockRef::from(stream).set_keepalive(true) {
        clue!(COLLECTOR, ERROR, {
            create_tcp_client: { keepalive: err.to_string() },
        });
        destroy_client(core, &client);
        return Err(err.into());
    }
    match stream.peer_addr() {
        Ok(peer) => {
            *client.addr.lock().unwrap() = peer;
        }
        Err(err) => {
            clue!(COLLECTOR, ERROR, {
                create_tcp_client: { peer_addr: err.to_string() },
            });
            destroy_tcp_client(core, client);
            return Err(err.into());
        }
    }
    let session = match core.deps.database.init_events() {
        Ok(session) => session,
        Err(err) => {
            clue!(COLLECTOR, ERROR, {
                create_tcp_client: { init_events: err.to_string() },
            });
            destroy_tcp_client(core, client);
            return Err(Error::event_facility("unable to init the event facility"));
        }
    };
    *client.evuser.lock().unwrap() = Some(session);
    let labor_client = Arc::downgrade(&client);
    let labor_tasks = Arc::clone(&core.deps.tasks);
    let labor: ExtraLabor = Box::new(move || {
        if let Some(client) = labor_client.upgrade() {
            labor_tasks.extra_labor(&client);
        }
    });
    let status = {
        let evuser = client.evuser.lock().unwrap();
        let session = evuser.as_ref().expect("session was just installed");
        session
            .add_extra_labor(Some(labor))
            .and_then(|()| session.start("CAS-event", core.prios[1]))
    };
    if let Err(err) = status {
        clue!(COLLECTOR, ERROR, {
            create_tcp_client: { event_facility: err.to_string() },
        });
        destroy_tcp_client(core, client);
        return Err(Error::event_facility("unable to start the event facility"));
    }
    version_reply(&client);
    CREATE_TCP_CLIENT.click();
    clue!(COLLECTOR, DEBUG, {
        create_tcp_client: {
            peer: client.addr.lock().unwrap().to_string(),
        },
    });
    Ok(client)
}

/// Queue the greeting so the peer learns our protocol revision before any
/// reply needs it.
fn version_reply(client: &Client) {
    let header = CaHeader {
        command: CA_PROTO_VERSION,
        payload_size: 0,
        data_type: client.priority.load(Ordering::Relaxed) as u16,
        data_count: CA_MINOR_PROTOCOL_REVISION,
        cid: 0,
        available: 0,
    };
    let mut send = client.send.lock().unwrap();
    if !header.queue(&mut send) {
        clue!(COLLECTOR, ERROR, {
            version_reply: { queue_full: true },
        });
    }
}

////////////////////////////////////////// thread binding //////////////////////////////////////////

thread_local! {
    static CURRENT_CLIENT: RefCell<Option<Arc<Client>>> = const { RefCell::new(None) };
}

/// The client record bound to the calling thread, if any.
pub fn current_client() -> Option<Arc<Client>> {
    CURRENT_CLIENT.with(|current| current.borrow().clone())
}

/// Bind the calling command-loop thread to `client`: ignore the signals a
/// dying peer can raise, record the thread for introspection, publish the
/// client through thread-local storage, and register with the watchdog.
pub(crate) fn attach_thread_to_client(core: &ServerCore, client: &Arc<Client>) {
    ATTACH_THREAD.click();
    install_sigalrm_ignore();
    install_sigpipe_ignore();
    *client.tid.lock().unwrap() = Some(std::thread::current().id());
    CURRENT_CLIENT.with(|current| *current.borrow_mut() = Some(Arc::clone(client)));
    core.deps.watchdog.insert(std::thread::current().id());
}

pub(crate) fn install_sigpipe_ignore() {
    // SAFETY(rsrv): installing SIG_IGN for SIGPIPE has no handler to race
    // with and is the documented way to keep writes to a dead peer from
    // killing the process.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn install_sigalrm_ignore() {
    // SAFETY(rsrv): as above, for SIGALRM.
    unsafe {
        libc::signal(libc::SIGALRM, libc::SIG_IGN);
    }
}

///////////////////////////////////////////// teardown /////////////////////////////////////////////

/// Dismantle a TCP circuit.  Safe to call while monitor callbacks are still
/// in flight: the event facility is quiesced before any channel is freed,
/// and every channel leaves the identifier table before its storage is
/// released.  Errors from collaborators are logged, never propagated.
pub fn destroy_tcp_client(core: &Arc<ServerCore>, client: Arc<Client>) {
    DESTROY_TCP_CLIENT.click();
    clue!(COLLECTOR, INFO, {
        destroy_tcp_client: {
            peer: client.addr.lock().unwrap().to_string(),
        },
    });
    {
        let mut clientq = core.clientq.lock().unwrap();
        clientq.clients.retain(|queued| !Arc::ptr_eq(queued, &client));
    }
    {
        let evuser = client.evuser.lock().unwrap();
        if let Some(session) = evuser.as_ref() {
            // No callback may begin after this pair completes.
            if let Err(err) = session.add_extra_labor(None) {
                clue!(COLLECTOR, ERROR, {
                    destroy_tcp_client: { deregister_extra_labor: err.to_string() },
                });
            }
            session.flush_extra_labor();
        }
    }
    destroy_all_channels(core, &client, ListSel::Chan);
    destroy_all_channels(core, &client, ListSel::PendingUpdateAr);
    if let Some(session) = client.evuser.lock().unwrap().take() {
        session.close();
    }
    destroy_client(core, &client);
}

#[derive(Clone, Copy)]
enum ListSel {
    Chan,
    PendingUpdateAr,
}

fn destroy_all_channels(core: &Arc<ServerCore>, client: &Arc<Client>, which: ListSel) {
    loop {
        let chan = {
            let mut lists = client.channels.lock().unwrap();
            match which {
                ListSel::Chan => lists.chan_list.pop_front(),
                ListSel::PendingUpdateAr => lists.chan_pending_update_ar_list.pop_front(),
            }
        };
        let Some(chan) = chan else {
            break;
        };
        // Access-security state changes could be walking this queue.
        loop {
            let event = { client.eventq.lock().unwrap().pop(chan.sid) };
            let Some(event) = event else {
                break;
            };
            if let Some(dbev) = event.dbev {
                core.deps.database.cancel_event(dbev);
            }
            EVENT_CANCELED.click();
        }
        client.put_notify.lock().unwrap().forget(chan.sid);
        {
            let mut clientq = core.clientq.lock().unwrap();
            if clientq.table.remove(chan.sid).is_some() {
                clientq.channel_count -= 1;
            } else {
                clue!(COLLECTOR, ERROR, {
                    destroy_channel: {
                        bad_sid_at_close: chan.sid,
                    },
                });
            }
        }
        if let Err(what) = core.deps.access.remove_client(chan.as_client) {
            clue!(COLLECTOR, ERROR, {
                destroy_channel: {
                    as_remove_client: what,
                },
            });
        }
        core.deps.database.delete_channel(chan.dbch);
        DESTROY_CHANNEL.click();
    }
}

/// Dismantle the record itself: watchdog, socket, buffers, identity
/// strings.  Pool permits travel with the dropped pieces.
pub fn destroy_client(core: &Arc<ServerCore>, client: &Arc<Client>) {
    DESTROY_CLIENT.click();
    if let Some(tid) = client.thread_id() {
        core.deps.watchdog.remove(tid);
    }
    if let Transport::Tcp(stream) = &client.transport {
        let _ = stream.shutdown(Shutdown::Both);
    }
    client.send.lock().unwrap().release();
    client.recv.lock().unwrap().release();
    client.user_name.lock().unwrap().take();
    client.host_name.lock().unwrap().take();
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::buffers::BufKind;
    use crate::config::ServerOptions;
    use crate::db::test_support;
    use crate::proto::CA_HEADER_SIZE;

    fn core() -> (Arc<ServerCore>, Arc<Mutex<Vec<String>>>) {
        let (deps, log) = test_support::deps();
        let core = ServerCore::new(ServerOptions::default(), deps);
        (core, log)
    }

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let ours = TcpStream::connect(addr).unwrap();
        let (theirs, _) = listener.accept().unwrap();
        (ours, theirs)
    }

    fn install_channel(core: &Arc<ServerCore>, client: &Arc<Client>, sid: u32) {
        let chan = Arc::new(ChannelInUse::new(
            sid,
            Arc::downgrade(client),
            DbChannel(sid as u64),
            AsClient(sid as u64),
            core.pools.channels.alloc(),
        ));
        {
            let mut clientq = core.clientq.lock().unwrap();
            clientq.table.insert(Arc::clone(&chan));
            clientq.channel_count += 1;
        }
        client.channels.lock().unwrap().chan_list.push_back(chan);
    }

    #[test]
    fn udp_clients_use_heap_buffers() {
        let (core, _log) = core();
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let client = create_client(&core, Transport::Udp(sock)).unwrap();
        assert_eq!(Proto::Udp, client.proto());
        assert_eq!(BufKind::Udp, client.send.lock().unwrap().kind());
        assert_eq!(MAX_UDP_SEND, client.send.lock().unwrap().capacity());
        assert_eq!(MAX_UDP_RECV, client.recv.lock().unwrap().capacity());
        assert_eq!(16, core.pools.small_tcp.items_available());
        destroy_client(&core, &client);
        drop(client);
        assert_eq!(8, core.pools.clients.items_available());
    }

    #[test]
    fn admission_refused_when_pools_dry_and_memory_low() {
        let (deps, _log) = test_support::deps();
        let deps = crate::db::Deps {
            oracle: Arc::new(test_support::FixedOracle(false)),
            ..deps
        };
        let core = ServerCore::new(ServerOptions::default(), deps);
        let mut permits = Vec::new();
        while let Some(permit) = core.pools.clients.alloc() {
            permits.push(permit);
        }
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let refused = create_client(&core, Transport::Udp(sock));
        assert!(matches!(refused, Err(Error::NoSpaceInPool)));
    }

    #[test]
    fn tcp_client_gets_options_identity_and_greeting() {
        let (core, _log) = core();
        let (ours, _theirs) = loopback_pair();
        let expected_peer = ours.peer_addr().unwrap();
        let client = create_tcp_client(&core, ours).unwrap();
        let stream = client.tcp_stream().unwrap();
        assert!(stream.nodelay().unwrap());
        assert!(socket2::SockRef::from(stream).keepalive().unwrap());
        assert_eq!(expected_peer, *client.addr.lock().unwrap());
        // the version greeting is queued
        let send = client.send.lock().unwrap();
        assert_eq!(CA_HEADER_SIZE, send.stk);
        assert_eq!(&[0, 0], &send.bytes()[0..2]);
        assert_eq!(
            &CA_MINOR_PROTOCOL_REVISION.to_be_bytes()[..],
            &send.bytes()[6..8]
        );
        drop(send);
        destroy_tcp_client(&core, client);
    }

    #[test]
    fn teardown_quiesces_then_drains_then_frees() {
        let (core, log) = core();
        let (ours, _theirs) = loopback_pair();
        let client = create_tcp_client(&core, ours).unwrap();
        core.clientq.lock().unwrap().clients.push(Arc::clone(&client));
        install_channel(&core, &client, 42);
        client.eventq.lock().unwrap().push(EventExt::new(
            42,
            0x7,
            CaHeader::default(),
            Some(DbEvent(7000)),
            core.pools.events.alloc(),
        ));
        client
            .put_notify
            .lock()
            .unwrap()
            .slots
            .insert(42, PutNotify::new(42, CaHeader::default(), core.pools.put_notifies.alloc()));
        destroy_tcp_client(&core, Arc::clone(&client));
        drop(client);
        let log = log.lock().unwrap().clone();
        let position = |needle: &str| log.iter().position(|entry| entry == needle).unwrap();
        // quiesce strictly precedes channel destruction; unindexing happens
        // before the database handle is released
        assert!(position("clear_extra_labor") < position("flush_extra_labor"));
        assert!(position("flush_extra_labor") < position("cancel_event:7000"));
        assert!(position("cancel_event:7000") < position("delete_channel:42"));
        assert!(position("delete_channel:42") < position("close_events"));
        // bookkeeping restored
        let clientq = core.clientq.lock().unwrap();
        assert_eq!(0, clientq.channel_count);
        assert!(clientq.table.is_empty());
        assert!(clientq.clients.is_empty());
        drop(clientq);
        assert_eq!(8, core.pools.clients.items_available());
        assert_eq!(512, core.pools.channels.items_available());
        assert_eq!(512, core.pools.events.items_available());
        assert_eq!(16, core.pools.put_notifies.items_available());
        assert_eq!(16, core.pools.small_tcp.items_available());
    }

    #[test]
    fn teardown_survives_a_thousand_channels() {
        let (core, _log) = core();
        let (ours, _theirs) = loopback_pair();
        let client = create_tcp_client(&core, ours).unwrap();
        for sid in 0..1000u32 {
            install_channel(&core, &client, sid);
        }
        {
            let clientq = core.clientq.lock().unwrap();
            assert_eq!(1000, clientq.channel_count);
            assert_eq!(1000, clientq.table.len());
        }
        assert_eq!(0, core.pools.channels.items_available());
        destroy_tcp_client(&core, Arc::clone(&client));
        drop(client);
        let clientq = core.clientq.lock().unwrap();
        assert_eq!(0, clientq.channel_count);
        assert!(clientq.table.is_empty());
        drop(clientq);
        assert_eq!(512, core.pools.channels.items_available());
    }

    #[test]
    fn thread_binding_round_trips() {
        let (core, _log) = core();
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let client = create_client(&core, Transport::Udp(sock)).unwrap();
        assert!(current_client().is_none());
        attach_thread_to_client(&core, &client);
        let bound = current_client().unwrap();
        assert!(Arc::ptr_eq(&client, &bound));
        assert_eq!(Some(std::thread::current().id()), client.thread_id());
        CURRENT_CLIENT.with(|current| current.borrow_mut().take());
    }
}
