//! Per-interface socket acquisition.
//!
//! Every configured interface gets one TCP listen socket, and all of them
//! share a single port number so the name server and beacon sender have one
//! number to advertise.  Binding starts from the preferred port and falls
//! back to a kernel-chosen port when the preferred one is taken; interfaces
//! that are no longer configured are pruned with a notice.  Each interface
//! then gets a UDP name-search receiver, a connected beacon sender, and (off
//! Windows, for non-wildcard interfaces) a second receiver bound to the
//! broadcast address to catch what BSD-style stacks withhold from the
//! unicast socket.

use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::{Arc, Mutex};

use biometrics::Counter;

use indicio::{clue, ERROR, INFO, WARNING};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::control::{cant_proceed, suspend_self};
use crate::{Error, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static BIND_RESTART_IN_USE: Counter = Counter::new("rsrv.iface.bind_restart_in_use");
static IFACE_SKIPPED: Counter = Counter::new("rsrv.iface.skipped");
static IFACE_BUILT: Counter = Counter::new("rsrv.iface.built");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&BIND_RESTART_IN_USE);
    collector.register_counter(&IFACE_SKIPPED);
    collector.register_counter(&IFACE_BUILT);
}

///////////////////////////////////////////// IfaceConfig //////////////////////////////////////////

/// The sockets and addresses bound to one local interface.  Read-only after
/// initialization, except that the listener thread takes the TCP socket.
pub struct IfaceConfig {
    pub tcp_addr: SocketAddrV4,
    tcp: Mutex<Option<Socket>>,
    pub udp_addr: SocketAddrV4,
    pub udp: Arc<UdpSocket>,
    pub udp_bcast_addr: Option<SocketAddrV4>,
    pub udp_bcast: Option<Arc<UdpSocket>>,
    /// Local binding of the beacon sender (kernel-chosen port).
    pub beacon_rx: SocketAddrV4,
    /// Where beacons go: the interface broadcast address at the beacon port.
    pub beacon_tx: SocketAddrV4,
    pub beacon: Arc<UdpSocket>,
}

impl IfaceConfig {
    pub(crate) fn take_tcp(&self) -> Option<Socket> {
        self.tcp.lock().unwrap().take()
    }
}

////////////////////////////////////////////// grab_tcp ////////////////////////////////////////////

/// Bind one TCP socket per interface in `addrs`, all to the same port.
///
/// Starts from `*port`; a port of zero (initially, or after a collision)
/// lets the kernel choose on the first interface and propagates the choice
/// to the rest.  `EADDRNOTAVAIL` prunes the interface and restarts with the
/// port unchanged; `EADDRINUSE` closes everything bound so far and restarts
/// with a kernel-chosen port; any other bind error suspends the calling
/// thread.  On success `*port` holds the port every socket shares.
pub(crate) fn grab_tcp(addrs: &mut Vec<Ipv4Addr>, port: &mut u16) -> Result<Vec<Socket>, Error> {
    loop {
        if addrs.is_empty() {
            return Err(Error::no_interfaces());
        }
        let mut bound: Vec<Socket> = Vec::with_capacity(addrs.len());
        let mut pass_port = *port;
        let mut outcome = Outcome::Complete;
        for i in 0..addrs.len() {
            let addr = addrs[i];
            let sock = match tcp_socket() {
                Ok(sock) => sock,
                Err(err) => cant_proceed(&format!("ran out of sockets during initialization: {}", err)),
            };
            let bind_to = SocketAddrV4::new(addr, pass_port);
            match sock.bind(&SockAddr::from(bind_to)) {
                Ok(()) => {
                    if pass_port == 0 {
                        debug_assert_eq!(0, i);
                        pass_port = local_port(&sock);
                        debug_assert_ne!(0, pass_port);
                    }
                    bound.push(sock);
                }
                Err(err) if err.raw_os_error() == Some(libc::EADDRNOTAVAIL) => {
                    IFACE_SKIPPED.click();
                    println!("Skipping {} which is not an interface address", addr);
                    clue!(COLLECTOR, WARNING, {
                        grab_tcp: {
                            skipping: addr.to_string(),
                        },
                    });
                    outcome = Outcome::Restart { next_port: *port };
                    addrs.remove(i);
                    break;
                }
                Err(err) if err.raw_os_error() == Some(libc::EADDRINUSE) => {
                    BIND_RESTART_IN_USE.click();
                    clue!(COLLECTOR, INFO, {
                        grab_tcp: {
                            in_use: bind_to.to_string(),
                        },
                    });
                    outcome = Outcome::Restart { next_port: 0 };
                    break;
                }
                Err(err) => {
                    clue!(COLLECTOR, ERROR, {
                        grab_tcp: {
                            bind: bind_to.to_string(),
                            error: err.to_string(),
                        },
                    });
                    suspend_self();
                }
            }
        }
        match outcome {
            Outcome::Complete => {
                debug_assert_ne!(0, pass_port);
                *port = pass_port;
                return Ok(bound);
            }
            Outcome::Restart { next_port } => {
                drop(bound);
                *port = next_port;
            }
        }
    }
}

enum Outcome {
    Complete,
    Restart { next_port: u16 },
}

fn tcp_socket() -> Result<Socket, std::io::Error> {
    let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    // reuse during TIME_WAIT so a restarted server rebinds immediately
    sock.set_reuse_address(true)?;
    Ok(sock)
}

fn local_port(sock: &Socket) -> u16 {
    match sock.local_addr().map(|addr| addr.as_socket()) {
        Ok(Some(SocketAddr::V4(addr))) => addr.port(),
        _ => 0,
    }
}

//////////////////////////////////////////// UDP sockets ///////////////////////////////////////////

/// Build the complete socket set for one interface around its already-bound
/// TCP socket.  Errors mean this interface is unusable (its sockets are
/// closed and the interface is skipped); invariant violations do not return.
pub(crate) fn build_iface(
    addr: Ipv4Addr,
    server_port: u16,
    beacon_port: u16,
    tcp: Socket,
) -> Result<IfaceConfig, Error> {
    let tcp_addr = SocketAddrV4::new(addr, server_port);

    // The beacon sender binds to a kernel-chosen port and never reads; the
    // read side is shut down to keep the kernel from warning about it.
    let beacon = match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)) {
        Ok(sock) => sock,
        Err(_) => cant_proceed(&format!("ran out of udp sockets for beacon at {}", addr)),
    };
    try_bind(&beacon, SocketAddrV4::new(addr, 0), "UDP beacon socket")?;
    if let Err(err) = beacon.set_broadcast(true) {
        clue!(COLLECTOR, ERROR, {
            build_iface: {
                broadcast_option: err.to_string(),
            },
        });
        suspend_self();
    }
    let beacon_rx = match beacon.local_addr().map(|a| a.as_socket()) {
        Ok(Some(SocketAddr::V4(local))) => local,
        _ => SocketAddrV4::new(addr, 0),
    };

    let bcasts = broadcast_addresses(addr);
    if bcasts.is_empty() {
        cant_proceed(&format!("can't find broadcast address of interface {}", addr));
    }
    if bcasts.len() > 1 && addr.is_unspecified() {
        println!("Interface {} has more than one broadcast address?", addr);
        clue!(COLLECTOR, WARNING, {
            build_iface: {
                multiple_broadcast_addresses: addr.to_string(),
            },
        });
    }
    let beacon_tx = SocketAddrV4::new(bcasts[0], beacon_port);
    if let Err(err) = beacon.connect(&SockAddr::from(beacon_tx)) {
        cant_proceed(&format!(
            "CA beacon routing (connect to \"{}\") error was \"{}\"",
            beacon_tx, err
        ));
    }
    // fails on ancient stacks; harmless to ignore
    let _ = beacon.shutdown(Shutdown::Read);

    // UDP name-search receiver, shared-port so multiple servers coexist.
    let udp = match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)) {
        Ok(sock) => sock,
        Err(_) => cant_proceed("ran out of udp sockets"),
    };
    enable_datagram_fanout(&udp);
    let udp_addr = SocketAddrV4::new(addr, server_port);
    try_bind(&udp, udp_addr, "UDP unicast socket")?;

    // A BSD-stack oddness: a socket bound to a specific interface address
    // receives only unicast, so broadcasts need their own socket bound to
    // the broadcast address.
    let mut udp_bcast_addr = None;
    let mut udp_bcast = None;
    #[cfg(not(windows))]
    if !addr.is_unspecified() {
        let bcast = match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)) {
            Ok(sock) => sock,
            Err(_) => cant_proceed("ran out of udp sockets for bcast"),
        };
        enable_datagram_fanout(&bcast);
        let bind_to = SocketAddrV4::new(bcasts[0], server_port);
        try_bind(&bcast, bind_to, "UDP Socket bcast")?;
        udp_bcast_addr = Some(bind_to);
        udp_bcast = Some(Arc::new(UdpSocket::from(bcast)));
    }

    IFACE_BUILT.click();
    Ok(IfaceConfig {
        tcp_addr,
        tcp: Mutex::new(Some(tcp)),
        udp_addr,
        udp: Arc::new(UdpSocket::from(udp)),
        udp_bcast_addr,
        udp_bcast,
        beacon_rx,
        beacon_tx,
        beacon: Arc::new(UdpSocket::from(beacon)),
    })
}

/// Bind, distinguishing the survivable collision from everything else.  A
/// collision is reported to the caller; any other failure suspends.
fn try_bind(sock: &Socket, addr: SocketAddrV4, what: &str) -> Result<(), Error> {
    match sock.bind(&SockAddr::from(addr)) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EADDRINUSE) => {
            clue!(COLLECTOR, ERROR, {
                try_bind: {
                    what: what,
                    addr: addr.to_string(),
                    in_use: true,
                },
            });
            Err(err.into())
        }
        Err(err) => {
            clue!(COLLECTOR, ERROR, {
                try_bind: {
                    what: what,
                    addr: addr.to_string(),
                    error: err.to_string(),
                },
            });
            suspend_self();
        }
    }
}

fn enable_datagram_fanout(sock: &Socket) {
    let _ = sock.set_reuse_address(true);
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    {
        let _ = sock.set_reuse_port(true);
    }
}

///////////////////////////////////////// broadcast lookup /////////////////////////////////////////

/// Broadcast addresses of the broadcast-capable interfaces matching
/// `match_addr`; a wildcard matches every interface.  The returned list is
/// owned by the caller.
pub(crate) fn broadcast_addresses(match_addr: Ipv4Addr) -> Vec<Ipv4Addr> {
    let mut found = Vec::new();
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY(rsrv): getifaddrs fills a linked list that we walk read-only
    // and hand back to freeifaddrs; every pointer is checked for null before
    // the dereference, and sockaddr casts are guarded by the address family.
    unsafe {
        if libc::getifaddrs(&mut ifap) != 0 {
            return found;
        }
        let mut cursor = ifap;
        while !cursor.is_null() {
            let ifa = &*cursor;
            cursor = ifa.ifa_next;
            if ifa.ifa_flags & (libc::IFF_UP as libc::c_uint) == 0 {
                continue;
            }
            if ifa.ifa_flags & (libc::IFF_BROADCAST as libc::c_uint) == 0 {
                continue;
            }
            if ifa.ifa_addr.is_null() {
                continue;
            }
            if (*ifa.ifa_addr).sa_family as libc::c_int != libc::AF_INET {
                continue;
            }
            let own = (*(ifa.ifa_addr as *const libc::sockaddr_in)).sin_addr.s_addr;
            let own = Ipv4Addr::from(u32::from_be(own));
            if !match_addr.is_unspecified() && own != match_addr {
                continue;
            }
            #[cfg(any(target_os = "linux", target_os = "android"))]
            let broad = ifa.ifa_ifu;
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            let broad = ifa.ifa_dstaddr;
            if broad.is_null() {
                continue;
            }
            if (*broad).sa_family as libc::c_int != libc::AF_INET {
                continue;
            }
            let bcast = (*(broad as *const libc::sockaddr_in)).sin_addr.s_addr;
            found.push(Ipv4Addr::from(u32::from_be(bcast)));
        }
        libc::freeifaddrs(ifap);
    }
    found
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn kernel_chosen_port_propagates() {
        let mut addrs = vec![Ipv4Addr::LOCALHOST];
        let mut port = 0u16;
        let socks = grab_tcp(&mut addrs, &mut port).unwrap();
        assert_eq!(1, socks.len());
        assert_ne!(0, port);
        assert_eq!(port, local_port(&socks[0]));
    }

    #[test]
    fn every_socket_shares_the_final_port() {
        let mut addrs = vec![Ipv4Addr::LOCALHOST, Ipv4Addr::new(127, 0, 0, 2)];
        let mut port = 0u16;
        let socks = grab_tcp(&mut addrs, &mut port).unwrap();
        assert_eq!(2, socks.len());
        for sock in &socks {
            assert_eq!(port, local_port(sock));
        }
    }

    #[test]
    fn collision_falls_back_to_a_kernel_port() {
        let occupant = TcpListener::bind("127.0.0.1:0").unwrap();
        let occupied = occupant.local_addr().unwrap().port();
        let mut addrs = vec![Ipv4Addr::LOCALHOST];
        let mut port = occupied;
        let socks = grab_tcp(&mut addrs, &mut port).unwrap();
        assert_eq!(1, socks.len());
        assert_ne!(occupied, port);
        assert_ne!(0, port);
    }

    #[test]
    fn dead_interfaces_are_pruned() {
        // TEST-NET-1 is never configured locally
        let mut addrs = vec![Ipv4Addr::new(192, 0, 2, 86), Ipv4Addr::LOCALHOST];
        let mut port = 0u16;
        let socks = grab_tcp(&mut addrs, &mut port).unwrap();
        assert_eq!(vec![Ipv4Addr::LOCALHOST], addrs);
        assert_eq!(1, socks.len());
        assert_ne!(0, port);
    }

    #[test]
    fn pruning_everything_is_an_error() {
        let mut addrs = vec![Ipv4Addr::new(192, 0, 2, 86)];
        let mut port = 0u16;
        assert!(matches!(
            grab_tcp(&mut addrs, &mut port),
            Err(crate::Error::NoInterfaces)
        ));
        assert!(addrs.is_empty());
    }

    #[test]
    fn wildcard_matches_some_broadcast_interface() {
        // every test host has either a broadcast-capable interface or none;
        // the call must not crash either way
        let _ = broadcast_addresses(Ipv4Addr::UNSPECIFIED);
    }
}
