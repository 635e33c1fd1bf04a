//! Operator introspection.
//!
//! `casr` prints to stdout, mirroring what the console user asked for at
//! each level; `stats` answers the lightweight counters query.  Everything
//! that walks the client queue holds the queue lock so the view is a
//! consistent snapshot.

use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::client::{Client, EventExt, ChannelInUse, PutNotify, Proto};
use crate::server::ServerCore;
use crate::{CA_MAJOR_PROTOCOL_REVISION, CA_MINOR_PROTOCOL_REVISION};

////////////////////////////////////////////// stats ///////////////////////////////////////////////

/// (channel count, circuit count), the latter clamped at zero.
pub(crate) fn stats(core: &ServerCore) -> (u32, u32) {
    let clientq = core.clientq.lock().unwrap();
    let circuits = u32::try_from(clientq.clients.len()).unwrap_or(0);
    (clientq.channel_count, circuits)
}

/////////////////////////////////////////////// casr ///////////////////////////////////////////////

pub(crate) fn casr(core: &Arc<ServerCore>, level: u32) {
    println!(
        "Channel Access Server V{}.{}",
        CA_MAJOR_PROTOCOL_REVISION, CA_MINOR_PROTOCOL_REVISION
    );
    let clientq = core.clientq.lock().unwrap();
    if clientq.clients.is_empty() {
        println!("No clients connected.");
    } else {
        println!("Connected circuits:");
    }
    for client in &clientq.clients {
        log_one_client(core, client, level);
    }
    if level >= 2 {
        for iface in core.ifaces.lock().unwrap().iter() {
            println!("Server interface");
            println!(" TCP listener {}", iface.tcp_addr);
            println!(" UDP receiver 1 {}", iface.udp_addr);
            if let Some(bcast) = iface.udp_bcast_addr {
                println!(" UDP receiver 2 {}", bcast);
            }
            println!(" UDP beacon socket bound {}", iface.beacon_rx);
            println!(" UDP beacon destination {}", iface.beacon_tx);
        }
    }
    drop(clientq);

    if level >= 2 {
        let pools = &core.pools;
        let mut bytes_reserved = 0usize;
        bytes_reserved += std::mem::size_of::<Client>() * pools.clients.items_available();
        bytes_reserved += std::mem::size_of::<ChannelInUse>() * pools.channels.items_available();
        bytes_reserved += std::mem::size_of::<EventExt>() * pools.events.items_available();
        bytes_reserved += std::mem::size_of::<PutNotify>() * pools.put_notifies.items_available();
        bytes_reserved += pools.small_tcp.slab_size() * pools.small_tcp.items_available();
        bytes_reserved += pools.large_tcp.slab_size() * pools.large_tcp.items_available();
        println!(
            "There are currently {} bytes on the server's free list",
            bytes_reserved
        );
        println!(
            "{} client(s), {} channel(s), {} event(s) (monitors), {} putNotify(s)",
            pools.clients.items_available(),
            pools.channels.items_available(),
            pools.events.items_available(),
            pools.put_notifies.items_available()
        );
        println!(
            "{} small buffers ({} bytes ea), and {} jumbo buffers ({} bytes ea)",
            pools.small_tcp.items_available(),
            pools.small_tcp.slab_size(),
            pools.large_tcp.items_available(),
            pools.large_tcp.slab_size()
        );
        core.clientq.lock().unwrap().table.show();
        println!(
            "The server's array size limit is {} bytes max",
            pools.large_tcp.slab_size()
        );
    }
}

/////////////////////////////////////////// log_one_client /////////////////////////////////////////

fn log_one_client(core: &Arc<ServerCore>, client: &Arc<Client>, level: u32) {
    let proto = match client.proto() {
        Proto::Tcp => "TCP",
        Proto::Udp => "UDP",
    };
    let peer = client.addr.lock().unwrap().to_string();
    let host = client.host_name.lock().unwrap().clone().unwrap_or_default();
    let user = client.user_name.lock().unwrap().clone().unwrap_or_default();
    let channels = client.channels.lock().unwrap().total();
    println!(
        "{} {}({}): User=\"{}\", V{}.{}, {} Channels, Priority={}",
        proto,
        peer,
        host,
        user,
        CA_MAJOR_PROTOCOL_REVISION,
        client.minor_version.load(Ordering::Relaxed),
        channels,
        client.priority.load(Ordering::Relaxed)
    );
    if level >= 1 {
        let fd = client
            .tcp_stream()
            .map(|stream| stream.as_raw_fd())
            .or_else(|| client.udp_socket().map(|sock| sock.as_raw_fd()))
            .unwrap_or(-1);
        println!("\tTask Id={:?}, Socket FD={}", client.thread_id(), fd);
        println!(
            "\tSecs since last send {:6.2}, Secs since last receive {:6.2}",
            client.seconds_since_last_send(),
            client.seconds_since_last_recv()
        );
        let (unprocessed, recv_kind) = {
            let recv = client.recv.lock().unwrap();
            (recv.cnt - recv.stk, recv.kind())
        };
        let (undelivered, send_kind) = {
            let send = client.send.lock().unwrap();
            (send.stk, send.kind())
        };
        println!(
            "\tUnprocessed request bytes={}, Undelivered response bytes={}",
            unprocessed, undelivered
        );
        let state = if client.disconnect.load(Ordering::Relaxed) {
            "down"
        } else {
            "up"
        };
        println!(
            "\tState={}{}{}",
            state,
            if send_kind == crate::buffers::BufKind::LargeTcp {
                " jumbo-send-buf"
            } else {
                ""
            },
            if recv_kind == crate::buffers::BufKind::LargeTcp {
                " jumbo-recv-buf"
            } else {
                ""
            }
        );
    }
    if level >= 2 {
        let mut bytes_reserved = std::mem::size_of::<Client>();
        {
            let lists = client.channels.lock().unwrap();
            for chan in lists.chan_list.iter().chain(lists.chan_pending_update_ar_list.iter()) {
                bytes_reserved += std::mem::size_of::<ChannelInUse>();
                bytes_reserved += std::mem::size_of::<EventExt>()
                    * client.eventq.lock().unwrap().len_for(chan.sid);
                if client.put_notify.lock().unwrap().slots.contains_key(&chan.sid) {
                    bytes_reserved += std::mem::size_of::<PutNotify>();
                }
            }
        }
        println!("\t{} bytes allocated", bytes_reserved);
        show_chan_lists(core, client, level - 2);
    }
    if level >= 3 {
        println!("\tSend Lock");
        show_mutex(&client.send);
        println!("\tPut Notify Lock");
        show_mutex(&client.put_notify);
        println!("\tAddress Queue Lock");
        show_mutex(&client.channels);
        println!("\tEvent Queue Lock");
        show_mutex(&client.eventq);
        println!("\tBlock Semaphore");
        println!("\t\tsignaled={}", client.block.is_signaled());
    }
}

fn show_chan_lists(core: &Arc<ServerCore>, client: &Arc<Client>, level: u32) {
    let lists = client.channels.lock().unwrap();
    for chan in lists.chan_list.iter().chain(lists.chan_pending_update_ar_list.iter()) {
        core.deps.database.show_channel(chan.dbch, level);
        println!(
            "          # on eventq={}, access={}{}",
            client.eventq.lock().unwrap().len_for(chan.sid),
            if core.deps.access.check_get(chan.as_client) {
                'r'
            } else {
                '-'
            },
            if core.deps.access.check_put(chan.as_client) {
                'w'
            } else {
                '-'
            }
        );
    }
}

fn show_mutex<T>(mutex: &Mutex<T>) {
    match mutex.try_lock() {
        Ok(_) => println!("\t\tunlocked"),
        Err(std::sync::TryLockError::WouldBlock) => println!("\t\tlocked"),
        Err(std::sync::TryLockError::Poisoned(_)) => println!("\t\tpoisoned"),
    }
}
