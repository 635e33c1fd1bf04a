//! Server-wide state and the initialization pipeline.
//!
//! One [ServerCore] owns everything the original kept in globals: the client
//! queue (whose mutex also serializes the identifier table and the channel
//! count), the six free pools, the interface list, the three traffic gates,
//! the startup handshake events, the priority bands, and the collaborator
//! handles.  [CaServer] is the cloneable handle passed to every thread.
//!
//! Initialization runs strictly in the original's order: signal ignores,
//! server registration, port and buffer-size resolution, TCP acquisition
//! across interfaces, then per-interface thread startup with a handshake
//! after each spawn, and the beacon sender last.  All gates start paused;
//! nothing processes traffic until [CaServer::run].

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use indicio::{clue, ERROR, INFO, WARNING};

use crate::client::{self, ChannelInUse, Client, Transport};
use crate::config::ServerOptions;
use crate::control::{cant_proceed, CtlFlag, CtlState, Event};
use crate::db::{Deps, ServerRegistration};
use crate::iface::{self, IfaceConfig};
use crate::listener;
use crate::pool::Pools;
use crate::sched::{self, Priority, NUM_BANDS};
use crate::stats;
use crate::table::SidTable;
use crate::{Error, COLLECTOR};

////////////////////////////////////////////// ClientQ /////////////////////////////////////////////

/// Everything serialized by the client-queue mutex: the circuits themselves,
/// the identifier table, and the channel count that mirrors it.
pub struct ClientQ {
    pub clients: Vec<Arc<Client>>,
    pub table: SidTable,
    pub channel_count: u32,
}

////////////////////////////////////////////// CtlFlags ////////////////////////////////////////////

pub struct CtlFlags {
    pub tcp: CtlFlag,
    pub udp: CtlFlag,
    pub beacon: CtlFlag,
}

pub(crate) struct StartEvents {
    pub tcp: Event,
    pub udp: Event,
    pub beacon: Event,
}

///////////////////////////////////////////// ServerCore ///////////////////////////////////////////

pub struct ServerCore {
    server_port: AtomicU16,
    beacon_port: u16,
    pub clientq: Mutex<ClientQ>,
    pub pools: Pools,
    pub(crate) ifaces: Mutex<Vec<Arc<IfaceConfig>>>,
    pub ctl: CtlFlags,
    pub(crate) start_events: StartEvents,
    pub prios: [Priority; NUM_BANDS],
    pub deps: Deps,
}

impl ServerCore {
    pub(crate) fn new(options: ServerOptions, deps: Deps) -> Arc<ServerCore> {
        let large_buf_size = options.large_buf_size();
        Arc::new(ServerCore {
            server_port: AtomicU16::new(options.server_port),
            beacon_port: options.beacon_port,
            clientq: Mutex::new(ClientQ {
                clients: Vec::new(),
                table: SidTable::new(),
                channel_count: 0,
            }),
            pools: Pools::new(large_buf_size),
            ifaces: Mutex::new(Vec::new()),
            ctl: CtlFlags {
                tcp: CtlFlag::new(),
                udp: CtlFlag::new(),
                beacon: CtlFlag::new(),
            },
            start_events: StartEvents {
                tcp: Event::new(),
                udp: Event::new(),
                beacon: Event::new(),
            },
            prios: sched::priority_bands(),
            deps,
        })
    }

    /// The port every interface's TCP listener and UDP receiver share.
    pub fn server_port(&self) -> u16 {
        self.server_port.load(Ordering::Acquire)
    }

    pub fn beacon_port(&self) -> u16 {
        self.beacon_port
    }

    pub fn ifaces(&self) -> Vec<Arc<IfaceConfig>> {
        self.ifaces.lock().unwrap().clone()
    }
}

////////////////////////////////////////////// CaServer ////////////////////////////////////////////

/// The endpoint handle.  Cheap to clone; every worker thread carries one.
#[derive(Clone)]
pub struct CaServer {
    core: Arc<ServerCore>,
}

impl CaServer {
    /// Bring the endpoint up: bind every interface, start its listener and
    /// name-search threads plus the beacon sender, and register with the
    /// database layer.  All traffic gates remain paused.
    pub fn initialize(options: ServerOptions, deps: Deps) -> Result<CaServer, Error> {
        client::install_sigpipe_ignore();

        let mut addrs = options.intf_addr_list.clone();
        if addrs.is_empty() {
            addrs.push(Ipv4Addr::UNSPECIFIED);
        }

        let core = ServerCore::new(options, deps);
        let server = CaServer {
            core: Arc::clone(&core),
        };
        register_with_database(&core);

        let preferred = core.server_port();
        let mut port = preferred;
        let socks = iface::grab_tcp(&mut addrs, &mut port)?;
        if port != preferred {
            println!("cas warning: Configured TCP port was unavailable.");
            println!("cas warning: Using dynamically assigned TCP port {},", port);
            println!("cas warning: but now two or more servers share the same UDP port.");
            println!("cas warning: Depending on your IP kernel this server may not be");
            println!("cas warning: reachable with UDP unicast (a host's IP in EPICS_CA_ADDR_LIST)");
            clue!(COLLECTOR, WARNING, {
                initialize: {
                    preferred_port_unavailable: preferred as u32,
                    assigned_port: port as u32,
                },
            });
        }
        core.server_port.store(port, Ordering::Release);

        for (addr, sock) in addrs.into_iter().zip(socks) {
            let conf = match iface::build_iface(addr, port, core.beacon_port, sock) {
                Ok(conf) => Arc::new(conf),
                Err(err) => {
                    clue!(COLLECTOR, ERROR, {
                        initialize: {
                            iface: addr.to_string(),
                            skipped: err.to_string(),
                        },
                    });
                    continue;
                }
            };
            core.ifaces.lock().unwrap().push(Arc::clone(&conf));

            spawn_listener(&server, &conf);
            core.start_events.tcp.wait();

            spawn_name_search(&server, &conf, false);
            core.start_events.udp.wait();

            if conf.udp_bcast.is_some() {
                spawn_name_search(&server, &conf, true);
                core.start_events.udp.wait();
            }
        }

        spawn_beacon(&server);
        core.start_events.beacon.wait();

        clue!(COLLECTOR, INFO, {
            initialize: {
                port: port as u32,
                interfaces: core.ifaces.lock().unwrap().len(),
            },
        });
        Ok(server)
    }

    pub fn core(&self) -> Arc<ServerCore> {
        Arc::clone(&self.core)
    }

    /// Open the traffic gates.
    pub fn run(&self) {
        self.core.ctl.tcp.set(CtlState::Run);
        self.core.ctl.udp.set(CtlState::Run);
        self.core.ctl.beacon.set(CtlState::Run);
    }

    /// Close the traffic gates; effective within one poll interval each.
    pub fn pause(&self) {
        self.core.ctl.beacon.set(CtlState::Pause);
        self.core.ctl.udp.set(CtlState::Pause);
        self.core.ctl.tcp.set(CtlState::Pause);
    }

    pub fn casr(&self, level: u32) {
        stats::casr(&self.core, level);
    }

    /// (channel count, circuit count).
    pub fn stats(&self) -> (u32, u32) {
        stats::stats(&self.core)
    }

    /// The client record bound to the calling thread.
    pub fn current_client() -> Option<Arc<Client>> {
        client::current_client()
    }

    /// Bind the calling command-loop thread to `client`.
    pub fn attach_thread_to_client(&self, client: &Arc<Client>) {
        client::attach_thread_to_client(&self.core, client);
    }

    /// Build a UDP pseudo-client around the shared name-search socket.
    pub fn create_udp_client(&self, sock: Arc<UdpSocket>) -> Result<Arc<Client>, Error> {
        client::create_client(&self.core, Transport::Udp(sock))
    }

    /// Dismantle a TCP circuit; called by its command loop on disconnect.
    pub fn destroy_tcp_client(&self, client: Arc<Client>) {
        client::destroy_tcp_client(&self.core, client);
    }

    /// Dismantle a UDP pseudo-client.
    pub fn destroy_client(&self, client: &Arc<Client>) {
        client::destroy_client(&self.core, client);
    }

    /// Promote the send slot so a response of `size` bytes fits.
    pub fn expand_send_buffer(&self, client: &Client, size: usize) {
        let mut send = client.send.lock().unwrap();
        send.expand_send(size, &self.core.pools, &*self.core.deps.oracle);
    }

    /// Promote the receive slot so a request of `size` bytes fits.
    pub fn expand_recv_buffer(&self, client: &Client, size: usize) {
        let mut recv = client.recv.lock().unwrap();
        recv.expand_recv(size, &self.core.pools, &*self.core.deps.oracle);
    }

    /// Index a freshly attached channel and hand it to its owner.
    pub fn install_channel(&self, client: &Arc<Client>, chan: Arc<ChannelInUse>) {
        {
            let mut clientq = self.core.clientq.lock().unwrap();
            if let Some(displaced) = clientq.table.insert(Arc::clone(&chan)) {
                clue!(COLLECTOR, WARNING, {
                    install_channel: {
                        displaced_sid: displaced.sid,
                    },
                });
            } else {
                clientq.channel_count += 1;
            }
        }
        client.channels.lock().unwrap().chan_list.push_back(chan);
    }

    /// The channel currently indexed under `sid`.
    pub fn lookup_channel(&self, sid: u32) -> Option<Arc<ChannelInUse>> {
        self.core.clientq.lock().unwrap().table.lookup(sid)
    }

    /// Unindex `sid`, e.g. for a single clear-channel request.  The caller
    /// still owns the list entry and the teardown of the channel itself.
    pub fn uninstall_channel(&self, sid: u32) -> Option<Arc<ChannelInUse>> {
        let mut clientq = self.core.clientq.lock().unwrap();
        let removed = clientq.table.remove(sid);
        if removed.is_some() {
            clientq.channel_count -= 1;
        }
        removed
    }
}

//////////////////////////////////////////// registration //////////////////////////////////////////

fn register_with_database(core: &Arc<ServerCore>) {
    let show_core = Arc::downgrade(core);
    let stats_core = Arc::downgrade(core);
    let registration = ServerRegistration {
        name: "rsrv",
        show: Box::new(move |level| {
            if let Some(core) = show_core.upgrade() {
                stats::casr(&core, level);
            }
        }),
        stats: Box::new(move || {
            stats_core
                .upgrade()
                .map(|core| stats::stats(&core))
                .unwrap_or((0, 0))
        }),
        current_client: Box::new(client::current_client),
    };
    core.deps.database.register_server(registration);
}

////////////////////////////////////////////// spawning ////////////////////////////////////////////

fn spawn_listener(server: &CaServer, conf: &Arc<IfaceConfig>) {
    let core = server.core();
    let thread_server = server.clone();
    let thread_conf = Arc::clone(conf);
    let prio = core.prios[2];
    let spawned = std::thread::Builder::new()
        .name("CAS-TCP".to_string())
        .spawn(move || {
            sched::apply_to_current_thread(prio);
            listener::listener_thread(thread_server, thread_conf);
        });
    if spawned.is_err() {
        cant_proceed("could not create the CAS-TCP thread");
    }
}

fn spawn_name_search(server: &CaServer, conf: &Arc<IfaceConfig>, broadcast: bool) {
    let core = server.core();
    let thread_server = server.clone();
    let thread_conf = Arc::clone(conf);
    let prio = core.prios[4];
    let name = if broadcast { "CAS-UDP2" } else { "CAS-UDP" };
    let spawned = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            sched::apply_to_current_thread(prio);
            let inner = thread_server.core();
            inner.deps.watchdog.insert(std::thread::current().id());
            inner.start_events.udp.signal();
            let tasks = Arc::clone(&inner.deps.tasks);
            tasks.name_search(thread_server, thread_conf, broadcast);
        });
    if spawned.is_err() {
        cant_proceed("could not create the CAS-UDP thread");
    }
}

fn spawn_beacon(server: &CaServer) {
    let core = server.core();
    let thread_server = server.clone();
    let prio = core.prios[3];
    let spawned = std::thread::Builder::new()
        .name("CAS-beacon".to_string())
        .spawn(move || {
            sched::apply_to_current_thread(prio);
            let inner = thread_server.core();
            inner.deps.watchdog.insert(std::thread::current().id());
            inner.start_events.beacon.signal();
            let tasks = Arc::clone(&inner.deps.tasks);
            tasks.beacon(thread_server);
        });
    if spawned.is_err() {
        cant_proceed("could not create the CAS-beacon thread");
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::net::{SocketAddrV4, TcpListener, TcpStream};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::db::test_support;

    /// Beacon construction needs a broadcast-capable interface; hosts
    /// without one (loopback-only sandboxes) skip the end-to-end tests.
    fn can_beacon() -> bool {
        !iface::broadcast_addresses(Ipv4Addr::UNSPECIFIED).is_empty()
    }

    fn initialize(options: ServerOptions) -> (CaServer, Arc<Mutex<Vec<String>>>) {
        let (deps, log) = test_support::deps();
        let server = CaServer::initialize(options, deps).unwrap();
        (server, log)
    }

    #[test]
    fn gates_start_paused_and_follow_run_pause() {
        if !can_beacon() {
            return;
        }
        let (server, log) = initialize(ServerOptions::default().with_server_port(0));
        let core = server.core();
        assert_eq!(CtlState::Pause, core.ctl.tcp.get());
        assert_eq!(CtlState::Pause, core.ctl.udp.get());
        assert_eq!(CtlState::Pause, core.ctl.beacon.get());
        assert!(log.lock().unwrap().contains(&"register_server".to_string()));
        server.run();
        assert_eq!(CtlState::Run, core.ctl.tcp.get());
        assert_eq!(CtlState::Run, core.ctl.udp.get());
        assert_eq!(CtlState::Run, core.ctl.beacon.get());
        server.pause();
        assert_eq!(CtlState::Pause, core.ctl.tcp.get());
    }

    #[test]
    fn wildcard_default_gets_one_interface_with_a_shared_port() {
        if !can_beacon() {
            return;
        }
        let (server, _log) = initialize(ServerOptions::default().with_server_port(0));
        let core = server.core();
        let port = core.server_port();
        assert_ne!(0, port);
        let ifaces = core.ifaces();
        assert_eq!(1, ifaces.len());
        assert_eq!(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port), ifaces[0].tcp_addr);
        assert_eq!(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port), ifaces[0].udp_addr);
        // wildcard interfaces get no separate broadcast receiver
        assert!(ifaces[0].udp_bcast.is_none());
        assert_eq!(core.beacon_port(), ifaces[0].beacon_tx.port());
    }

    #[test]
    fn occupied_port_falls_back_to_a_kernel_choice() {
        if !can_beacon() {
            return;
        }
        let occupant = TcpListener::bind("0.0.0.0:0").unwrap();
        let occupied = occupant.local_addr().unwrap().port();
        let (server, _log) = initialize(ServerOptions::default().with_server_port(occupied));
        assert_ne!(occupied, server.core().server_port());
        assert_ne!(0, server.core().server_port());
    }

    #[test]
    fn paused_server_admits_no_circuit_until_run() {
        if !can_beacon() {
            return;
        }
        let (server, _log) = initialize(ServerOptions::default().with_server_port(0));
        let port = server.core().server_port();
        let _peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        let (_, circuits) = server.stats();
        assert_eq!(0, circuits);
        server.run();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let (_, circuits) = server.stats();
            if circuits == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "no circuit appeared after run()");
            std::thread::sleep(Duration::from_millis(10));
        }
        server.pause();
    }

    #[test]
    fn casr_smoke() {
        if !can_beacon() {
            return;
        }
        let (server, _log) = initialize(ServerOptions::default().with_server_port(0));
        server.casr(0);
        server.casr(3);
    }
}
