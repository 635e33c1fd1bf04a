//! Server configuration.
//!
//! Options resolve from the environment with the CAS-specific variables
//! preferred over the CA-wide fallbacks.  Unset or malformed values fall
//! back to the protocol defaults with a warning; they never fail startup.

use std::net::Ipv4Addr;

use indicio::{clue, WARNING};

use crate::proto::CA_MESSAGE_OVERHEAD;
use crate::{COLLECTOR, CA_REPEATER_PORT, CA_SERVER_PORT, MAX_TCP};

/////////////////////////////////////////// ServerOptions //////////////////////////////////////////

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerOptions {
    /// TCP listen and UDP name-search port.
    pub server_port: u16,
    /// UDP beacon destination port.
    pub beacon_port: u16,
    /// Upper bound on a single array payload; the large TCP buffer class is
    /// sized from this.  None means the small class bound.
    pub max_array_bytes: Option<u32>,
    /// Interface addresses to bind.  Empty means one wildcard interface.
    pub intf_addr_list: Vec<Ipv4Addr>,
}

impl ServerOptions {
    /// Resolve options from the `EPICS_*` environment.
    pub fn from_env() -> Self {
        let server_port = env_port("EPICS_CAS_SERVER_PORT")
            .or_else(|| env_port("EPICS_CA_SERVER_PORT"))
            .unwrap_or(CA_SERVER_PORT);
        let beacon_port = env_port("EPICS_CAS_BEACON_PORT")
            .or_else(|| env_port("EPICS_CA_REPEATER_PORT"))
            .unwrap_or(CA_REPEATER_PORT);
        let max_array_bytes = env_max_array_bytes("EPICS_CA_MAX_ARRAY_BYTES");
        let intf_addr_list = env_addr_list("EPICS_CAS_INTF_ADDR_LIST");
        Self {
            server_port,
            beacon_port,
            max_array_bytes,
            intf_addr_list,
        }
    }

    pub fn with_server_port(mut self, server_port: u16) -> Self {
        self.server_port = server_port;
        self
    }

    pub fn with_beacon_port(mut self, beacon_port: u16) -> Self {
        self.beacon_port = beacon_port;
        self
    }

    pub fn with_max_array_bytes(mut self, max_array_bytes: u32) -> Self {
        self.max_array_bytes = Some(max_array_bytes);
        self
    }

    pub fn with_intf_addr(mut self, addr: Ipv4Addr) -> Self {
        self.intf_addr_list.push(addr);
        self
    }

    /// The large TCP buffer class size: the configured payload bound plus
    /// protocol header overhead, floored at the small class size.
    pub fn large_buf_size(&self) -> usize {
        let Some(max_bytes) = self.max_array_bytes else {
            return MAX_TCP;
        };
        let max_bytes = max_bytes.saturating_add(CA_MESSAGE_OVERHEAD as u32) as usize;
        if max_bytes < MAX_TCP {
            clue!(COLLECTOR, WARNING, {
                max_array_bytes_rounded_up: MAX_TCP as u64,
            });
            MAX_TCP
        } else {
            max_bytes
        }
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            server_port: CA_SERVER_PORT,
            beacon_port: CA_REPEATER_PORT,
            max_array_bytes: None,
            intf_addr_list: Vec::new(),
        }
    }
}

///////////////////////////////////////////// resolution ///////////////////////////////////////////

fn env_port(name: &str) -> Option<u16> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Some(port),
        _ => {
            clue!(COLLECTOR, WARNING, {
                bad_port: {
                    name: name,
                    value: value.clone(),
                },
            });
            None
        }
    }
}

fn env_max_array_bytes(name: &str) -> Option<u32> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse::<i64>() {
        Ok(bytes) if (0..=u32::MAX as i64).contains(&bytes) => Some(bytes as u32),
        _ => {
            clue!(COLLECTOR, WARNING, {
                max_array_bytes_not_positive: value.clone(),
            });
            None
        }
    }
}

fn env_addr_list(name: &str) -> Vec<Ipv4Addr> {
    let Ok(value) = std::env::var(name) else {
        return Vec::new();
    };
    let mut addrs = Vec::new();
    for word in value.split_whitespace() {
        match word.parse::<Ipv4Addr>() {
            Ok(addr) => addrs.push(addr),
            Err(_) => {
                clue!(COLLECTOR, WARNING, {
                    bad_intf_addr: word,
                });
            }
        }
    }
    addrs
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = ServerOptions::default();
        assert_eq!(CA_SERVER_PORT, options.server_port);
        assert_eq!(CA_REPEATER_PORT, options.beacon_port);
        assert_eq!(MAX_TCP, options.large_buf_size());
        assert!(options.intf_addr_list.is_empty());
    }

    #[test]
    fn large_buf_floors_at_the_small_class() {
        let options = ServerOptions::default().with_max_array_bytes(16);
        assert_eq!(MAX_TCP, options.large_buf_size());
    }

    #[test]
    fn large_buf_adds_header_overhead() {
        let options = ServerOptions::default().with_max_array_bytes(2 * MAX_TCP as u32);
        assert_eq!(2 * MAX_TCP + CA_MESSAGE_OVERHEAD, options.large_buf_size());
    }

    #[test]
    fn large_buf_saturates_instead_of_wrapping() {
        let options = ServerOptions::default().with_max_array_bytes(u32::MAX - 4);
        assert_eq!(u32::MAX as usize, options.large_buf_size());
    }

    #[test]
    fn environment_resolution_prefers_cas_variables() {
        std::env::set_var("EPICS_CAS_SERVER_PORT", "6064");
        std::env::set_var("EPICS_CA_SERVER_PORT", "7064");
        std::env::set_var("EPICS_CA_REPEATER_PORT", "6065");
        std::env::set_var("EPICS_CA_MAX_ARRAY_BYTES", "100000");
        std::env::set_var("EPICS_CAS_INTF_ADDR_LIST", "192.0.2.10 not-an-ip 192.0.2.11");
        let options = ServerOptions::from_env();
        std::env::remove_var("EPICS_CAS_SERVER_PORT");
        std::env::remove_var("EPICS_CA_SERVER_PORT");
        std::env::remove_var("EPICS_CA_REPEATER_PORT");
        std::env::remove_var("EPICS_CA_MAX_ARRAY_BYTES");
        std::env::remove_var("EPICS_CAS_INTF_ADDR_LIST");
        assert_eq!(6064, options.server_port);
        assert_eq!(6065, options.beacon_port);
        assert_eq!(Some(100000), options.max_array_bytes);
        assert_eq!(
            vec!["192.0.2.10".parse::<Ipv4Addr>().unwrap(), "192.0.2.11".parse().unwrap()],
            options.intf_addr_list
        );
    }
}
