use num::{One, traits::WrappingAdd};
use pnet::datalink;
use std::{
    env,
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
    time::Duration,
};
use tracing::{debug, warn};

/// Return the current value of a counter, and advance it, wrapping at the maximum
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + One + Copy>(value: &mut T) -> T {
    let current = *value;
    *value = current.wrapping_add(&T::one());
    current
}

/// An `EPICS_CA_*` setting, if present and parseable
fn from_env<T: FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring unparseable {name}={value}");
            None
        }
    }
}

/// Port CA servers listen on, from `EPICS_CA_SERVER_PORT` (default 5064, never below 5000)
pub fn get_default_server_port() -> u16 {
    from_env("EPICS_CA_SERVER_PORT").unwrap_or(5064).max(5000)
}

/// Seconds of circuit silence before the connection is considered suspect
pub fn get_default_connection_timeout() -> f32 {
    from_env("EPICS_CA_CONN_TMO").unwrap_or(30.0f32).max(0.1)
}

/// Upper bound on the interval between repeated searches for one name
pub fn get_default_max_search_interval() -> Duration {
    Duration::from_secs_f32(from_env("EPICS_CA_MAX_SEARCH_PERIOD").unwrap_or(300.0f32).max(60.0))
}

/// Resolve a whitespace-separated address list, e.g. `EPICS_CA_ADDR_LIST`
///
/// Entries without an explicit port get `default_port`. Unresolvable entries are
/// logged and skipped.
pub fn parse_address_list(list: &str, default_port: u16) -> Vec<SocketAddr> {
    list.split_ascii_whitespace()
        .flat_map(|entry| {
            let resolved = if entry.contains(':') {
                entry.to_socket_addrs()
            } else {
                (entry, default_port).to_socket_addrs()
            };
            match resolved {
                Ok(addresses) => {
                    let addresses: Vec<_> = addresses.filter(SocketAddr::is_ipv4).collect();
                    debug!("Search address {entry} resolved to {addresses:?}");
                    addresses
                }
                Err(e) => {
                    warn!("Could not resolve search address {entry}: {e}");
                    Vec::new()
                }
            }
        })
        .collect()
}

/// Broadcast address of every non-loopback IPv4 interface
fn interface_broadcasts(port: u16) -> impl Iterator<Item = SocketAddr> {
    datalink::interfaces()
        .into_iter()
        .filter(|interface| !interface.is_loopback())
        .flat_map(|interface| interface.ips)
        .filter(|network| network.is_ipv4())
        .map(move |network| SocketAddr::new(network.broadcast(), port))
}

/// Where to send searches, following `EPICS_CA_AUTO_ADDR_LIST` and `EPICS_CA_ADDR_LIST`
///
/// Hostnames in the address list are resolved again on every call.
pub fn get_target_broadcast_ips(search_port: u16) -> Vec<SocketAddr> {
    let automatic = env::var("EPICS_CA_AUTO_ADDR_LIST")
        .map_or(true, |v| !v.trim().eq_ignore_ascii_case("no"));
    let mut addresses: Vec<SocketAddr> = if automatic {
        interface_broadcasts(search_port).collect()
    } else {
        Vec::new()
    };
    if let Ok(list) = env::var("EPICS_CA_ADDR_LIST") {
        addresses.extend(parse_address_list(&list, search_port));
    }
    addresses.dedup();
    if addresses.is_empty() {
        warn!("No CA search addresses: set EPICS_CA_ADDR_LIST or EPICS_CA_AUTO_ADDR_LIST");
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_wrap() {
        let mut i = 3u32;
        assert_eq!(wrapping_inplace_add(&mut i), 3);
        assert_eq!(i, 4);
        let mut j = u16::MAX;
        assert_eq!(wrapping_inplace_add(&mut j), u16::MAX);
        assert_eq!(j, 0);
    }

    #[test]
    fn address_list_ports() {
        let addrs = parse_address_list("127.0.0.1 10.1.2.3:5070  ", 5064);
        assert_eq!(
            addrs,
            vec![
                "127.0.0.1:5064".parse().unwrap(),
                "10.1.2.3:5070".parse().unwrap()
            ]
        );
        assert!(parse_address_list("", 5064).is_empty());
    }
}
