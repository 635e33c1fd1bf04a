//! The per-interface TCP listener thread.
//!
//! Accepts circuits while the TCP gate says run, builds the client record,
//! links it into the server-wide queue, and spawns the command-loop thread.
//! Transient failures back off for fifteen seconds so a wedged socket cannot
//! spin the thread.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use biometrics::Counter;

use indicio::{clue, ERROR};

use crate::client::{create_tcp_client, destroy_tcp_client};
use crate::control::{suspend_self, CtlState};
use crate::iface::IfaceConfig;
use crate::sched;
use crate::server::CaServer;
use crate::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static ACCEPT: Counter = Counter::new("rsrv.listener.accept");
static ACCEPT_ERROR: Counter = Counter::new("rsrv.listener.accept.error");
static CLIENT_REJECTED: Counter = Counter::new("rsrv.listener.client_rejected");
static SPAWN_ERROR: Counter = Counter::new("rsrv.listener.spawn.error");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&ACCEPT);
    collector.register_counter(&ACCEPT_ERROR);
    collector.register_counter(&CLIENT_REJECTED);
    collector.register_counter(&SPAWN_ERROR);
}

///////////////////////////////////////////// constants ////////////////////////////////////////////

const PAUSE_POLL: Duration = Duration::from_millis(100);
const ERROR_BACKOFF: Duration = Duration::from_secs(15);
const LISTEN_BACKLOG: i32 = 20;

///////////////////////////////////////////// listener /////////////////////////////////////////////

pub(crate) fn listener_thread(server: CaServer, iface: Arc<IfaceConfig>) {
    let core = server.core();
    core.deps.watchdog.insert(std::thread::current().id());

    let Some(sock) = iface.take_tcp() else {
        clue!(COLLECTOR, ERROR, {
            listener: { missing_tcp_socket: iface.tcp_addr.to_string() },
        });
        return;
    };
    if let Err(err) = sock.listen(LISTEN_BACKLOG) {
        clue!(COLLECTOR, ERROR, {
            listener: {
                listen: iface.tcp_addr.to_string(),
                error: err.to_string(),
            },
        });
        drop(sock);
        suspend_self();
    }
    core.start_events.tcp.signal();
    let listener = TcpListener::from(sock);

    loop {
        while core.ctl.tcp.get() == CtlState::Pause {
            std::thread::sleep(PAUSE_POLL);
        }
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) => {
                ACCEPT_ERROR.click();
                clue!(COLLECTOR, ERROR, {
                    listener: { accept: err.to_string() },
                });
                std::thread::sleep(ERROR_BACKOFF);
                continue;
            }
        };
        ACCEPT.click();
        let client = match create_tcp_client(&core, stream) {
            Ok(client) => client,
            Err(_) => {
                CLIENT_REJECTED.click();
                std::thread::sleep(ERROR_BACKOFF);
                continue;
            }
        };
        {
            let mut clientq = core.clientq.lock().unwrap();
            clientq.clients.push(Arc::clone(&client));
        }
        let circuit_server = server.clone();
        let circuit_client = Arc::clone(&client);
        let circuit_tasks = Arc::clone(&core.deps.tasks);
        let circuit_prio = core.prios[0];
        let spawned = std::thread::Builder::new()
            .name("CAS-client".to_string())
            .spawn(move || {
                sched::apply_to_current_thread(circuit_prio);
                circuit_tasks.circuit(circuit_server, circuit_client);
            });
        if let Err(err) = spawned {
            SPAWN_ERROR.click();
            clue!(COLLECTOR, ERROR, {
                listener: {
                    task_creation_failed: err.to_string(),
                },
            });
            {
                let mut clientq = core.clientq.lock().unwrap();
                clientq.clients.retain(|queued| !Arc::ptr_eq(queued, &client));
            }
            destroy_tcp_client(&core, client);
            std::thread::sleep(ERROR_BACKOFF);
            continue;
        }
    }
}
