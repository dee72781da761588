use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use nix::sys::socket::{AddressFamily, SockaddrStorage};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum NetInterfaceError {
    #[error("failed to parse interface prefix list: {0}")]
    ParsePrefix(String),
    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

pub struct NetInterfaceSpec {
    pub prefix: String,
    pub port: Option<u16>,
}

/// Parses a comma-separated interface prefix list. Each entry is a name
/// prefix with an optional `:port` suffix; empty prefixes are skipped.
pub fn parse_prefix_list(prefix_list: &str) -> Result<Vec<NetInterfaceSpec>, NetInterfaceError> {
    if !prefix_list.is_ascii() {
        return Err(NetInterfaceError::ParsePrefix(prefix_list.to_string()));
    }
    let mut specs = Vec::new();
    for entry in prefix_list.split(',') {
        let (prefix, port) = match entry.split_once(':') {
            Some((prefix, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| NetInterfaceError::ParsePrefix(prefix_list.to_string()))?;
                (prefix, Some(port))
            }
            None => (entry, None),
        };
        if prefix.is_empty() {
            continue;
        }
        specs.push(NetInterfaceSpec {
            prefix: prefix.to_string(),
            port,
        });
    }
    Ok(specs)
}

pub fn match_interface_list(
    name: &str,
    port: Option<u16>,
    specs: &[NetInterfaceSpec],
    match_exact: bool,
) -> bool {
    if specs.is_empty() {
        return true;
    }
    for spec in specs {
        if let (Some(spec_port), Some(port)) = (spec.port, port) {
            if spec_port != port {
                continue;
            }
        }
        let matched = if match_exact {
            spec.prefix == name
        } else {
            name.starts_with(&spec.prefix)
        };
        if matched {
            return true;
        }
    }
    false
}

fn storage_to_socket_addr(storage: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(sin) = storage.as_sockaddr_in() {
        return Some(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::from(sin.ip()),
            sin.port(),
        )));
    }
    if let Some(sin6) = storage.as_sockaddr_in6() {
        return Some(SocketAddr::V6(SocketAddrV6::new(
            sin6.ip(),
            sin6.port(),
            sin6.flowinfo(),
            sin6.scope_id(),
        )));
    }
    None
}

fn family_matches(addr: &SocketAddr, family: Option<AddressFamily>) -> bool {
    match family {
        None => true,
        Some(AddressFamily::Inet) => addr.is_ipv4(),
        Some(AddressFamily::Inet6) => addr.is_ipv6(),
        Some(_) => false,
    }
}

fn find_interfaces_with_prefix(
    mut prefix_list: &str,
    sock_family: Option<AddressFamily>,
    max_num_interfaces: usize,
) -> Result<Vec<(String, SocketAddr)>, NetInterfaceError> {
    if !prefix_list.is_ascii() {
        return Err(NetInterfaceError::ParsePrefix(prefix_list.to_string()));
    }
    let search_not = prefix_list.starts_with('^');
    if search_not {
        prefix_list = &prefix_list[1..];
    }
    let search_exact = prefix_list.starts_with('=');
    if search_exact {
        prefix_list = &prefix_list[1..];
    }
    let specs = parse_prefix_list(prefix_list)?;

    let mut interfaces: Vec<(String, SocketAddr)> = Vec::new();
    for interface in nix::ifaddrs::getifaddrs()? {
        let Some(storage) = interface.address.as_ref() else {
            continue;
        };
        let Some(addr) = storage_to_socket_addr(storage) else {
            continue;
        };
        if !family_matches(&addr, sock_family) {
            continue;
        }
        // Link-local and loopback v6 addresses are never usable for
        // cross-host rendezvous.
        if let IpAddr::V6(ip) = addr.ip() {
            if ip.is_loopback() {
                continue;
            }
        }
        log::trace!("found interface {} ({})", interface.interface_name, addr);

        let name = interface.interface_name.as_str();
        if !(match_interface_list(name, None, &specs, search_exact) ^ search_not) {
            continue;
        }
        if interfaces.iter().any(|(seen, _)| seen == name) {
            continue;
        }
        interfaces.push((interface.interface_name, addr));
        if interfaces.len() >= max_num_interfaces {
            break;
        }
    }
    Ok(interfaces)
}

/// Finds usable interfaces, preferring the fabric ("ib") ones, then anything
/// that is neither a docker bridge nor loopback, with loopback as the last
/// resort.
pub fn find_interfaces(
    specified_prefix: Option<&str>,
    specified_family: Option<AddressFamily>,
    max_num_interfaces: usize,
) -> Result<Vec<(String, SocketAddr)>, NetInterfaceError> {
    if let Some(prefix_list) = specified_prefix {
        return find_interfaces_with_prefix(prefix_list, specified_family, max_num_interfaces);
    }
    for prefix_list in ["ib", "^docker,lo", "docker", "lo"] {
        let interfaces =
            find_interfaces_with_prefix(prefix_list, specified_family, max_num_interfaces)?;
        if !interfaces.is_empty() {
            return Ok(interfaces);
        }
    }
    Ok(Vec::new())
}

fn same_subnet(local: &SocketAddr, mask: &SocketAddr, remote: &SocketAddr) -> bool {
    match (local.ip(), mask.ip(), remote.ip()) {
        (IpAddr::V4(local), IpAddr::V4(mask), IpAddr::V4(remote)) => {
            let mask = u32::from(mask);
            u32::from(local) & mask == u32::from(remote) & mask
        }
        (IpAddr::V6(local), IpAddr::V6(mask), IpAddr::V6(remote)) => {
            let mask = mask.octets();
            local
                .octets()
                .iter()
                .zip(remote.octets().iter())
                .zip(mask.iter())
                .all(|((l, r), m)| l & m == r & m)
        }
        _ => false,
    }
}

/// Finds the first interface on the same subnet as `remote`, used to pick
/// the outbound interface when the root address is pinned by the
/// environment.
pub fn find_interface_match_subnet(
    remote: &SocketAddr,
) -> Result<Option<(String, SocketAddr)>, NetInterfaceError> {
    for interface in nix::ifaddrs::getifaddrs()? {
        let (Some(addr_storage), Some(mask_storage)) =
            (interface.address.as_ref(), interface.netmask.as_ref())
        else {
            continue;
        };
        let (Some(addr), Some(mask)) = (
            storage_to_socket_addr(addr_storage),
            storage_to_socket_addr(mask_storage),
        ) else {
            continue;
        };
        if same_subnet(&addr, &mask, remote) {
            log::trace!(
                "interface {} ({}) matches subnet of {}",
                interface.interface_name,
                addr,
                remote
            );
            return Ok(Some((interface.interface_name, addr)));
        }
    }
    Ok(None)
}
