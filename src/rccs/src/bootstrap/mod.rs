pub mod task;

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;

use crate::utils::interfaces::{self, NetInterfaceError};

pub use task::{bootstrap_root, create_root, get_unique_id};

/// Environment variable pinning the root rendezvous address, in the form
/// `<ipv4>:<port>`, `[<ipv6>]:<port>` or `<hostname>:<port>`.
pub const ENV_COMM_ID: &str = "COMM_ID";
/// Optional interface prefix-list filter for the bootstrap network.
pub const ENV_SOCKET_IFNAME: &str = "SOCKET_IFNAME";

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Interface(#[from] NetInterfaceError),
    #[error("system error: {0}")]
    Os(#[from] nix::Error),
    #[error("invalid COMM_ID \"{0}\", please use format: <ipv4>:<port> or [<ipv6>]:<port> or <hostname>:<port>")]
    InvalidCommId(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("no usable network interface found")]
    NoInterface,
    #[error("mismatch in rank count from procs {0} : {1}")]
    NumRanksMismatch(usize, usize),
    #[error("rank {0} of {1} ranks has already checked in")]
    DuplicateCheckIn(usize, usize),
    #[error("rank {0} is out of range")]
    RankOverflow(usize),
    #[error("message truncated : received {0} bytes instead of {1}")]
    MessageTruncated(usize, usize),
    #[error("unexpected connections are not empty")]
    UnexpectedConnections,
    #[error("bootstrap ring is busy, only a single outstanding collective is allowed")]
    RingBusy,
    #[error("operation aborted")]
    Aborted,
}

/// The out-of-band token every rank needs to find the root: the root's
/// listen address plus a random 64-bit magic that fences off foreign groups.
/// Produced once via [`get_unique_id`] and distributed by the launcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapHandle {
    pub addr: SocketAddr,
    pub magic: u64,
}

/// Shared abort flag. Monotone: once set non-zero it is never cleared, and
/// every blocking bootstrap operation polls it while waiting.
pub type AbortFlag = Arc<AtomicU32>;

pub struct UnexpectedConn {
    pub peer: usize,
    pub tag: i32,
    pub stream: TcpStream,
}

pub struct BootstrapRing {
    pub ring_send: TcpStream,
    pub ring_recv: TcpStream,
}

pub struct BootstrapState {
    pub listener: TcpListener,
    pub ring: AsyncMutex<BootstrapRing>,
    pub peer_comm_addrs: Vec<SocketAddr>,
    pub peer_proxy_addrs: Vec<SocketAddr>,
    // Touched only by the owning rank's recv path; the lock is never held
    // across an await.
    pub unexpected_connections: Mutex<Vec<UnexpectedConn>>,
    pub rank: usize,
    pub num_ranks: usize,
    pub magic: u64,
    pub abort_flag: AbortFlag,
}

/// Listener and peer address table handed off to the data-plane proxy
/// service after rendezvous.
pub struct ProxySetup {
    pub listener: TcpListener,
    pub peer_addrs: Vec<SocketAddr>,
}

/// A fully rendezvoused rank: its bootstrap state plus the proxy resources.
/// `proxy` is `None` only for a [`BootstrapState::split`] that shares the
/// parent's proxy.
pub struct BootstrapInit {
    pub state: Arc<BootstrapState>,
    pub proxy: Option<ProxySetup>,
}

pub struct BootstrapNetIf {
    pub name: String,
    pub addr: SocketAddr,
}

static BOOTSTRAP_NET_IF: OnceCell<BootstrapNetIf> = OnceCell::new();

pub(crate) fn parse_comm_id(comm_id: &str) -> Result<SocketAddr, BootstrapError> {
    if let Ok(addr) = comm_id.parse() {
        return Ok(addr);
    }
    comm_id
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| BootstrapError::InvalidCommId(comm_id.to_string()))
}

/// Selects the bootstrap network interface, once per process. With
/// `COMM_ID` set, the interface on the same subnet as the parsed address
/// wins; otherwise the first usable interface (optionally filtered through
/// `SOCKET_IFNAME`) is taken. The returned address carries port 0.
pub fn bootstrap_net_init() -> Result<&'static BootstrapNetIf, BootstrapError> {
    BOOTSTRAP_NET_IF.get_or_try_init(|| {
        let (name, mut addr) = if let Ok(comm_id) = std::env::var(ENV_COMM_ID) {
            let remote = parse_comm_id(&comm_id)?;
            interfaces::find_interface_match_subnet(&remote)?.ok_or(BootstrapError::NoInterface)?
        } else {
            let ifname = std::env::var(ENV_SOCKET_IFNAME).ok();
            interfaces::find_interfaces(ifname.as_deref(), None, 1)?
                .into_iter()
                .next()
                .ok_or(BootstrapError::NoInterface)?
        };
        addr.set_port(0);
        log::info!("bootstrap: using interface {} ({})", name, addr.ip());
        Ok(BootstrapNetIf { name, addr })
    })
}
