use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;

use super::{
    bootstrap_net_init, parse_comm_id, AbortFlag, BootstrapError, BootstrapHandle, BootstrapInit,
    BootstrapRing, BootstrapState, ProxySetup, UnexpectedConn, ENV_COMM_ID,
};
use crate::utils::tcp;

const EXCHANGE_INFO_SEND_SIZE: usize = 72;
const SOCK_ADDR_SEND_SIZE: usize = 32;

// Connect attempts against the root are staggered above this group size to
// keep its accept queue from overflowing. Heuristic, not load-bearing.
const ROOT_CONNECT_STAGGER_THRESHOLD: usize = 128;

const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);
const CONNECT_RETRY_LIMIT: usize = 600;

// Reserved tag for the ring-address exchange during split.
const SPLIT_RING_TAG: i32 = -2;

pub struct BootstrapExchangeInfo {
    pub rank: usize,
    pub num_ranks: usize,
    pub listen_addr_root: SocketAddr,
    pub listen_addr: SocketAddr,
}

impl BootstrapExchangeInfo {
    fn encode(&self) -> [u8; EXCHANGE_INFO_SEND_SIZE] {
        let mut buf = [0u8; EXCHANGE_INFO_SEND_SIZE];
        {
            let mut cursor = &mut buf[..8];
            cursor.put_i32(self.rank as i32);
            cursor.put_i32(self.num_ranks as i32);
        }
        buf[8..40].copy_from_slice(&encode_addr_slot(&self.listen_addr_root));
        buf[40..72].copy_from_slice(&encode_addr_slot(&self.listen_addr));
        buf
    }

    fn decode(buf: &[u8; EXCHANGE_INFO_SEND_SIZE]) -> io::Result<Self> {
        let mut cursor = &buf[..8];
        let rank = cursor.get_i32();
        let num_ranks = cursor.get_i32();
        if rank < 0 || num_ranks <= 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "non-positive rank or rank count",
            ));
        }
        Ok(Self {
            rank: rank as usize,
            num_ranks: num_ranks as usize,
            listen_addr_root: decode_addr_slot(&buf[8..40])?,
            listen_addr: decode_addr_slot(&buf[40..72])?,
        })
    }
}

fn encode_addr_slot(addr: &SocketAddr) -> [u8; SOCK_ADDR_SEND_SIZE] {
    let mut slot = [0u8; SOCK_ADDR_SEND_SIZE];
    let mut cursor = &mut slot[..];
    tcp::encode_socket_addr(addr, &mut cursor);
    slot
}

fn decode_addr_slot(mut slot: &[u8]) -> io::Result<SocketAddr> {
    tcp::decode_socket_addr(&mut slot)
}

fn decode_addr_table(slots: &[u8], num_ranks: usize) -> io::Result<Vec<SocketAddr>> {
    (0..num_ranks)
        .map(|r| decode_addr_slot(&slots[r * SOCK_ADDR_SEND_SIZE..(r + 1) * SOCK_ADDR_SEND_SIZE]))
        .collect()
}

/// Writes a 4-byte length prefix followed by the payload.
pub async fn bootstrap_net_send(
    stream: &mut TcpStream,
    data: &[u8],
) -> Result<(), BootstrapError> {
    stream.write_u32(data.len() as u32).await?;
    stream.write_all(data).await?;
    Ok(())
}

/// Reads one framed message into `data`, refusing frames larger than the
/// buffer. Returns the number of payload bytes delivered.
pub async fn bootstrap_net_recv(
    stream: &mut TcpStream,
    data: &mut [u8],
) -> Result<usize, BootstrapError> {
    let recv_size = stream.read_u32().await? as usize;
    if recv_size > data.len() {
        log::warn!(
            "message truncated : received {} bytes instead of {}",
            recv_size,
            data.len()
        );
        return Err(BootstrapError::MessageTruncated(recv_size, data.len()));
    }
    stream.read_exact(&mut data[..recv_size]).await?;
    Ok(recv_size)
}

async fn send_framed_i32(stream: &mut TcpStream, value: i32) -> Result<(), BootstrapError> {
    bootstrap_net_send(stream, &value.to_be_bytes()).await
}

async fn recv_framed_i32(stream: &mut TcpStream) -> Result<i32, BootstrapError> {
    let mut buf = [0u8; 4];
    let received = bootstrap_net_recv(stream, &mut buf).await?;
    if received != buf.len() {
        return Err(BootstrapError::MessageTruncated(received, buf.len()));
    }
    Ok(i32::from_be_bytes(buf))
}

/// Drives `op` while polling the abort flag; observing a non-zero flag
/// unwinds with [`BootstrapError::Aborted`].
async fn abortable<T, F>(abort_flag: &AtomicU32, op: F) -> Result<T, BootstrapError>
where
    F: Future<Output = Result<T, BootstrapError>>,
{
    tokio::pin!(op);
    let mut poll = tokio::time::interval(ABORT_POLL_INTERVAL);
    loop {
        tokio::select! {
            res = &mut op => return res,
            _ = poll.tick() => {
                if abort_flag.load(Ordering::Relaxed) != 0 {
                    return Err(BootstrapError::Aborted);
                }
            }
        }
    }
}

async fn accept_abortable(
    listener: &TcpListener,
    magic: u64,
    abort_flag: &AtomicU32,
) -> Result<TcpStream, BootstrapError> {
    abortable(abort_flag, async {
        Ok(tcp::async_accept(listener, magic).await?)
    })
    .await
}

/// Dials a peer, retrying while its listener is still coming up.
async fn connect_peer(
    addr: &SocketAddr,
    magic: u64,
    abort_flag: &AtomicU32,
) -> Result<TcpStream, BootstrapError> {
    let mut attempts = 0;
    loop {
        let res = abortable(abort_flag, async {
            Ok(tcp::async_connect(addr, magic).await?)
        })
        .await;
        match res {
            Ok(stream) => return Ok(stream),
            Err(BootstrapError::Io(err))
                if attempts < CONNECT_RETRY_LIMIT
                    && matches!(
                        err.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                    ) =>
            {
                attempts += 1;
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn raise_files_limit() -> Result<(), BootstrapError> {
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    if soft < hard {
        setrlimit(Resource::RLIMIT_NOFILE, hard, hard)?;
    }
    Ok(())
}

/// The root coordinator body: collects one check-in per rank, then dials
/// every rank back with the listen address of its right-hand ring neighbor.
/// Consumes and closes the listener on every exit path.
pub async fn bootstrap_root(listener: TcpListener, magic: u64) -> Result<(), BootstrapError> {
    raise_files_limit()?;
    let mut num_ranks = 0;
    let mut received = 0;
    let mut rank_addrs: Vec<Option<SocketAddr>> = Vec::new();
    let mut rank_addrs_root: Vec<Option<SocketAddr>> = Vec::new();
    let mut recv_buf = [0u8; EXCHANGE_INFO_SEND_SIZE];

    loop {
        let mut stream = tcp::async_accept(&listener, magic).await?;
        let n = bootstrap_net_recv(&mut stream, &mut recv_buf).await?;
        if n != EXCHANGE_INFO_SEND_SIZE {
            return Err(BootstrapError::MessageTruncated(n, EXCHANGE_INFO_SEND_SIZE));
        }
        drop(stream);
        let info = BootstrapExchangeInfo::decode(&recv_buf)?;

        if received == 0 {
            num_ranks = info.num_ranks;
            rank_addrs = vec![None; num_ranks];
            rank_addrs_root = vec![None; num_ranks];
        }
        if info.num_ranks != num_ranks {
            log::warn!(
                "bootstrap root: mismatch in rank count from procs {} : {}",
                num_ranks,
                info.num_ranks
            );
            return Err(BootstrapError::NumRanksMismatch(num_ranks, info.num_ranks));
        }
        if info.rank >= num_ranks {
            return Err(BootstrapError::RankOverflow(info.rank));
        }
        if rank_addrs_root[info.rank].is_some() {
            log::warn!(
                "bootstrap root: rank {} of {} ranks has already checked in",
                info.rank,
                num_ranks
            );
            return Err(BootstrapError::DuplicateCheckIn(info.rank, num_ranks));
        }
        rank_addrs[info.rank] = Some(info.listen_addr);
        rank_addrs_root[info.rank] = Some(info.listen_addr_root);
        received += 1;
        log::trace!(
            "bootstrap root: received check-in from rank {}, total {}/{}",
            info.rank,
            received,
            num_ranks
        );
        if received == num_ranks {
            break;
        }
    }

    for r in 0..num_ranks {
        let next = (r + 1) % num_ranks;
        let connect_addr = rank_addrs_root[r].as_ref().unwrap();
        let mut stream = tcp::async_connect(connect_addr, magic).await?;
        let slot = encode_addr_slot(rank_addrs[next].as_ref().unwrap());
        bootstrap_net_send(&mut stream, &slot).await?;
    }
    log::trace!("bootstrap root: sent out all {} ring addresses", num_ranks);
    Ok(())
}

/// Binds the root listener at `handle.addr`, writes the bound address back
/// into the handle, and spawns the coordinator as a detached task. Nobody
/// awaits it; failures are logged and swallowed. Must be called from within
/// a tokio runtime.
pub fn create_root(handle: &mut BootstrapHandle) -> Result<(), BootstrapError> {
    let listener = tcp::async_listen(&handle.addr)?;
    handle.addr = listener.local_addr()?;
    let magic = handle.magic;
    tokio::spawn(async move {
        if let Err(err) = bootstrap_root(listener, magic).await {
            log::warn!("bootstrap root task failed: {}", err);
        }
    });
    Ok(())
}

/// Produces the group handle. With `COMM_ID` set, the address is taken from
/// the environment and the caller hosting that address is expected to call
/// [`create_root`] itself; otherwise the root is spawned here, on the
/// bootstrap interface. Must be called from within a tokio runtime.
pub fn get_unique_id() -> Result<BootstrapHandle, BootstrapError> {
    let magic = rand::random();
    match std::env::var(ENV_COMM_ID) {
        Ok(comm_id) => {
            log::info!("{} set by environment to {}", ENV_COMM_ID, comm_id);
            let addr = parse_comm_id(&comm_id)?;
            Ok(BootstrapHandle { addr, magic })
        }
        Err(_) => {
            let mut handle = BootstrapHandle {
                addr: bootstrap_net_init()?.addr,
                magic,
            };
            create_root(&mut handle)?;
            Ok(handle)
        }
    }
}

async fn ring_all_gather(
    ring: &mut BootstrapRing,
    rank: usize,
    num_ranks: usize,
    abort_flag: &AtomicU32,
    data: &mut [u8],
) -> Result<(), BootstrapError> {
    let slice_size = data.len() / num_ranks;
    // At step i, send slice (rank - i) to the right and receive slice
    // (rank - i - 1) from the left.
    for i in 0..num_ranks - 1 {
        let send_slice = (rank + num_ranks - i) % num_ranks;
        let recv_slice = (rank + num_ranks - i - 1) % num_ranks;
        abortable(
            abort_flag,
            bootstrap_net_send(
                &mut ring.ring_send,
                &data[send_slice * slice_size..(send_slice + 1) * slice_size],
            ),
        )
        .await?;
        let received = abortable(
            abort_flag,
            bootstrap_net_recv(
                &mut ring.ring_recv,
                &mut data[recv_slice * slice_size..(recv_slice + 1) * slice_size],
            ),
        )
        .await?;
        if received != slice_size {
            return Err(BootstrapError::MessageTruncated(received, slice_size));
        }
    }
    Ok(())
}

impl BootstrapState {
    /// Per-rank rendezvous: checks in with the root, stitches the ring,
    /// all-gathers every rank's listen and proxy addresses, and hands the
    /// proxy listener off to the caller.
    pub async fn init(
        handle: &BootstrapHandle,
        rank: usize,
        num_ranks: usize,
        abort_flag: AbortFlag,
    ) -> Result<BootstrapInit, BootstrapError> {
        if num_ranks == 0 {
            return Err(BootstrapError::InvalidArgument("rank count must be positive"));
        }
        if rank >= num_ranks {
            return Err(BootstrapError::RankOverflow(rank));
        }
        let bind_addr = bootstrap_net_init()?.addr;
        log::trace!("bootstrap init: rank {} of {}", rank, num_ranks);

        // One listener for all later peer traffic, one short-lived listener
        // for the root's callback.
        let listener = tcp::async_listen(&bind_addr)?;
        let listen_addr = listener.local_addr()?;
        let root_listener = tcp::async_listen(&bind_addr)?;
        let root_listen_addr = root_listener.local_addr()?;

        if num_ranks > ROOT_CONNECT_STAGGER_THRESHOLD {
            log::trace!("rank {} delaying connection to root by {} ms", rank, rank);
            tokio::time::sleep(Duration::from_millis(rank as u64)).await;
        }

        // Check in with the root.
        let info = BootstrapExchangeInfo {
            rank,
            num_ranks,
            listen_addr_root: root_listen_addr,
            listen_addr,
        };
        let mut stream = connect_peer(&handle.addr, handle.magic, &abort_flag).await?;
        abortable(&abort_flag, bootstrap_net_send(&mut stream, &info.encode())).await?;
        drop(stream);

        // The root calls back with the listen address of the next rank in
        // the ring.
        let mut stream = accept_abortable(&root_listener, handle.magic, &abort_flag).await?;
        let mut slot = [0u8; SOCK_ADDR_SEND_SIZE];
        abortable(&abort_flag, bootstrap_net_recv(&mut stream, &mut slot)).await?;
        let next_addr = decode_addr_slot(&slot)?;
        drop(stream);
        drop(root_listener);

        let ring_send = connect_peer(&next_addr, handle.magic, &abort_flag).await?;
        let ring_recv = accept_abortable(&listener, handle.magic, &abort_flag).await?;
        let mut ring = BootstrapRing {
            ring_send,
            ring_recv,
        };

        // All-gather every rank's listen address over the fresh ring.
        let mut comm_slots = vec![0u8; SOCK_ADDR_SEND_SIZE * num_ranks];
        comm_slots[rank * SOCK_ADDR_SEND_SIZE..(rank + 1) * SOCK_ADDR_SEND_SIZE]
            .copy_from_slice(&encode_addr_slot(&listen_addr));
        ring_all_gather(&mut ring, rank, num_ranks, &abort_flag, &mut comm_slots).await?;
        let peer_comm_addrs = decode_addr_table(&comm_slots, num_ranks)?;

        // Same exchange for the data-plane proxy listeners; the listener
        // itself is handed off to the proxy service.
        let proxy_listener = tcp::async_listen(&bind_addr)?;
        let mut proxy_slots = vec![0u8; SOCK_ADDR_SEND_SIZE * num_ranks];
        proxy_slots[rank * SOCK_ADDR_SEND_SIZE..(rank + 1) * SOCK_ADDR_SEND_SIZE]
            .copy_from_slice(&encode_addr_slot(&proxy_listener.local_addr()?));
        ring_all_gather(&mut ring, rank, num_ranks, &abort_flag, &mut proxy_slots).await?;
        let peer_proxy_addrs = decode_addr_table(&proxy_slots, num_ranks)?;

        let state = Arc::new(BootstrapState {
            listener,
            ring: AsyncMutex::new(ring),
            peer_comm_addrs,
            peer_proxy_addrs: peer_proxy_addrs.clone(),
            unexpected_connections: Mutex::new(Vec::new()),
            rank,
            num_ranks,
            magic: handle.magic,
            abort_flag,
        });
        log::trace!("bootstrap init: rank {} of {} - done", rank, num_ranks);
        Ok(BootstrapInit {
            state,
            proxy: Some(ProxySetup {
                listener: proxy_listener,
                peer_addrs: peer_proxy_addrs,
            }),
        })
    }

    /// Ring all-gather: `data` holds `num_ranks` equally sized slices, with
    /// the caller's own slice pre-filled; on return every slice holds the
    /// contribution of the corresponding rank.
    pub async fn all_gather(&self, data: &mut [u8]) -> Result<(), BootstrapError> {
        if data.is_empty() {
            return Err(BootstrapError::InvalidArgument(
                "all-gather buffer must be non-empty",
            ));
        }
        if data.len() % self.num_ranks != 0 {
            return Err(BootstrapError::InvalidArgument(
                "all-gather buffer must divide evenly across ranks",
            ));
        }
        let mut ring = self
            .ring
            .try_lock()
            .map_err(|_| BootstrapError::RingBusy)?;
        ring_all_gather(
            &mut ring,
            self.rank,
            self.num_ranks,
            &self.abort_flag,
            data,
        )
        .await?;
        log::trace!(
            "bootstrap all-gather done: rank {} of {}, slice size {}",
            self.rank,
            self.num_ranks,
            data.len() / self.num_ranks
        );
        Ok(())
    }

    pub async fn send(&self, peer: usize, tag: i32, data: &[u8]) -> Result<(), BootstrapError> {
        if peer >= self.num_ranks {
            return Err(BootstrapError::RankOverflow(peer));
        }
        let mut stream =
            connect_peer(&self.peer_comm_addrs[peer], self.magic, &self.abort_flag).await?;
        abortable(&self.abort_flag, async {
            send_framed_i32(&mut stream, self.rank as i32).await?;
            send_framed_i32(&mut stream, tag).await?;
            bootstrap_net_send(&mut stream, data).await
        })
        .await
    }

    /// Receives the next message matching `(peer, tag)`, parking mismatched
    /// connections on the unexpected queue. Returns the payload size.
    pub async fn recv(
        &self,
        peer: usize,
        tag: i32,
        data: &mut [u8],
    ) -> Result<usize, BootstrapError> {
        if peer >= self.num_ranks {
            return Err(BootstrapError::RankOverflow(peer));
        }
        // A matching connection may already be parked; entries drain in
        // arrival order.
        if let Some(mut stream) = self.unexpected_dequeue(peer, tag) {
            return abortable(&self.abort_flag, bootstrap_net_recv(&mut stream, data)).await;
        }
        loop {
            let mut stream = accept_abortable(&self.listener, self.magic, &self.abort_flag).await?;
            let (recv_peer, recv_tag) = abortable(&self.abort_flag, async {
                let peer = recv_framed_i32(&mut stream).await?;
                let tag = recv_framed_i32(&mut stream).await?;
                Ok((peer, tag))
            })
            .await?;
            if recv_peer < 0 {
                return Err(BootstrapError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "negative sender rank",
                )));
            }
            if recv_peer as usize == peer && recv_tag == tag {
                return abortable(&self.abort_flag, bootstrap_net_recv(&mut stream, data)).await;
            }
            log::trace!(
                "rank {} parking unexpected connection from peer {} tag {}",
                self.rank,
                recv_peer,
                recv_tag
            );
            self.unexpected_enqueue(recv_peer as usize, recv_tag, stream);
        }
    }

    fn unexpected_enqueue(&self, peer: usize, tag: i32, stream: TcpStream) {
        let mut connections = self.unexpected_connections.lock().unwrap();
        connections.push(UnexpectedConn { peer, tag, stream });
    }

    fn unexpected_dequeue(&self, peer: usize, tag: i32) -> Option<TcpStream> {
        let mut connections = self.unexpected_connections.lock().unwrap();
        let idx = connections
            .iter()
            .position(|c| c.peer == peer && c.tag == tag)?;
        // Keep arrival order for the remaining entries.
        Some(connections.remove(idx).stream)
    }

    fn group_rank(&self, ranks: &[usize]) -> Result<usize, BootstrapError> {
        ranks
            .iter()
            .position(|&r| r == self.rank)
            .ok_or(BootstrapError::InvalidArgument(
                "calling rank is not a member of the group",
            ))
    }

    /// Dissemination barrier over the group described by `ranks` (local
    /// index -> global rank). After ceil(log2 n) rounds every rank has
    /// transitively heard from every other.
    pub async fn barrier(&self, ranks: &[usize], tag: i32) -> Result<(), BootstrapError> {
        let num_ranks = ranks.len();
        if num_ranks == 1 {
            return Ok(());
        }
        let rank = self.group_rank(ranks)?;
        let mut token = [0u8; 4];
        let mut mask = 1;
        while mask < num_ranks {
            let src = (rank + num_ranks - mask) % num_ranks;
            let dst = (rank + mask) % num_ranks;
            self.send(ranks[dst], tag, &token).await?;
            self.recv(ranks[src], tag, &mut token).await?;
            mask <<= 1;
        }
        log::trace!("bootstrap barrier done: rank {} of {}", rank, num_ranks);
        Ok(())
    }

    pub async fn intra_node_all_gather(
        &self,
        ranks: &[usize],
        data: &mut [u8],
    ) -> Result<(), BootstrapError> {
        let num_ranks = ranks.len();
        if num_ranks == 0 || data.is_empty() || data.len() % num_ranks != 0 {
            return Err(BootstrapError::InvalidArgument(
                "all-gather buffer must divide evenly across the group",
            ));
        }
        if num_ranks == 1 {
            return Ok(());
        }
        let rank = self.group_rank(ranks)?;
        let slice_size = data.len() / num_ranks;
        for i in 1..num_ranks {
            let src = (rank + num_ranks - i) % num_ranks;
            let dst = (rank + i) % num_ranks;
            let own = rank * slice_size;
            self.send(ranks[dst], i as i32, &data[own..own + slice_size])
                .await?;
            let recv_start = src * slice_size;
            let received = self
                .recv(
                    ranks[src],
                    i as i32,
                    &mut data[recv_start..recv_start + slice_size],
                )
                .await?;
            if received != slice_size {
                return Err(BootstrapError::MessageTruncated(received, slice_size));
            }
        }
        log::trace!(
            "bootstrap intra-node all-gather done: rank {} of {}, slice size {}",
            rank,
            num_ranks,
            slice_size
        );
        Ok(())
    }

    /// In-place broadcast from the group member at local index `root`; the
    /// root's buffer is left untouched.
    pub async fn intra_node_broadcast(
        &self,
        ranks: &[usize],
        root: usize,
        data: &mut [u8],
    ) -> Result<(), BootstrapError> {
        let num_ranks = ranks.len();
        if root >= num_ranks {
            return Err(BootstrapError::InvalidArgument(
                "broadcast root is not a member of the group",
            ));
        }
        if num_ranks == 1 {
            return Ok(());
        }
        let rank = self.group_rank(ranks)?;
        if rank == root {
            for i in 0..num_ranks {
                if i != root {
                    self.send(ranks[i], ranks[i] as i32, data).await?;
                }
            }
        } else {
            let received = self.recv(ranks[root], ranks[rank] as i32, data).await?;
            if received != data.len() {
                return Err(BootstrapError::MessageTruncated(received, data.len()));
            }
        }
        log::trace!(
            "bootstrap broadcast done: rank {} of {}, root {}",
            rank,
            num_ranks,
            root
        );
        Ok(())
    }

    /// Builds a child group over `parent_ranks` (local index -> global
    /// rank), exchanging ring addresses through the parent's p2p fabric
    /// instead of a root coordinator. With `split_share` the child reuses
    /// the parent's proxy service and no proxy resources are returned.
    pub async fn split(
        &self,
        parent_ranks: &[usize],
        split_share: bool,
        abort_flag: AbortFlag,
    ) -> Result<BootstrapInit, BootstrapError> {
        let num_ranks = parent_ranks.len();
        if num_ranks == 0 {
            return Err(BootstrapError::InvalidArgument(
                "split group must be non-empty",
            ));
        }
        let rank = parent_ranks
            .iter()
            .position(|&r| r == self.rank)
            .ok_or(BootstrapError::InvalidArgument(
                "calling rank is not a member of the split group",
            ))?;
        let prev = parent_ranks[(rank + num_ranks - 1) % num_ranks];
        let next = parent_ranks[(rank + 1) % num_ranks];

        let bind_addr = bootstrap_net_init()?.addr;
        let listener = tcp::async_listen(&bind_addr)?;
        let listen_addr = listener.local_addr()?;

        self.send(prev, SPLIT_RING_TAG, &encode_addr_slot(&listen_addr))
            .await?;
        let mut slot = [0u8; SOCK_ADDR_SEND_SIZE];
        self.recv(next, SPLIT_RING_TAG, &mut slot).await?;
        let next_addr = decode_addr_slot(&slot)?;

        let ring_send = connect_peer(&next_addr, self.magic, &abort_flag).await?;
        let ring_recv = accept_abortable(&listener, self.magic, &abort_flag).await?;
        let mut ring = BootstrapRing {
            ring_send,
            ring_recv,
        };

        let mut comm_slots = vec![0u8; SOCK_ADDR_SEND_SIZE * num_ranks];
        comm_slots[rank * SOCK_ADDR_SEND_SIZE..(rank + 1) * SOCK_ADDR_SEND_SIZE]
            .copy_from_slice(&encode_addr_slot(&listen_addr));
        ring_all_gather(&mut ring, rank, num_ranks, &abort_flag, &mut comm_slots).await?;
        let peer_comm_addrs = decode_addr_table(&comm_slots, num_ranks)?;

        let (peer_proxy_addrs, proxy) = if split_share {
            (Vec::new(), None)
        } else {
            let proxy_listener = tcp::async_listen(&bind_addr)?;
            let mut proxy_slots = vec![0u8; SOCK_ADDR_SEND_SIZE * num_ranks];
            proxy_slots[rank * SOCK_ADDR_SEND_SIZE..(rank + 1) * SOCK_ADDR_SEND_SIZE]
                .copy_from_slice(&encode_addr_slot(&proxy_listener.local_addr()?));
            ring_all_gather(&mut ring, rank, num_ranks, &abort_flag, &mut proxy_slots).await?;
            let peer_addrs = decode_addr_table(&proxy_slots, num_ranks)?;
            (
                peer_addrs.clone(),
                Some(ProxySetup {
                    listener: proxy_listener,
                    peer_addrs,
                }),
            )
        };

        let state = Arc::new(BootstrapState {
            listener,
            ring: AsyncMutex::new(ring),
            peer_comm_addrs,
            peer_proxy_addrs,
            unexpected_connections: Mutex::new(Vec::new()),
            rank,
            num_ranks,
            magic: self.magic,
            abort_flag,
        });
        log::trace!(
            "bootstrap split: rank {} of {}, prev {} next {} - done",
            rank,
            num_ranks,
            prev,
            next
        );
        Ok(BootstrapInit { state, proxy })
    }

    /// Tears the state down. Leftover unexpected connections are a protocol
    /// error unless the group is aborting; sockets and tables are released
    /// on drop either way.
    pub fn close(self: Arc<Self>) -> Result<(), BootstrapError> {
        let connections = self.unexpected_connections.lock().unwrap();
        if !connections.is_empty() && self.abort_flag.load(Ordering::Relaxed) == 0 {
            log::warn!(
                "rank {}: {} unexpected connections at close",
                self.rank,
                connections.len()
            );
            return Err(BootstrapError::UnexpectedConnections);
        }
        Ok(())
    }

    /// Best-effort teardown: releases everything without reporting leftover
    /// unexpected connections.
    pub fn abort(self: Arc<Self>) {
        log::trace!("bootstrap abort: rank {} of {}", self.rank, self.num_ranks);
    }
}
