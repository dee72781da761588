use std::io;
use std::net::SocketAddr;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

const LISTEN_BACKLOG: u32 = 16384;

pub fn async_listen(addr: &SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_reuseport(true)?;
    socket.bind(*addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Accepts the next connection that presents the expected magic. Connections
/// carrying a foreign magic are dropped and the loop keeps accepting.
pub async fn async_accept(listener: &TcpListener, magic: u64) -> io::Result<TcpStream> {
    let mut buf = [0u8; std::mem::size_of::<u64>()];
    let stream = loop {
        let (mut stream, _) = listener.accept().await?;
        stream.read_exact(buf.as_mut_slice()).await?;
        let recv_magic = LittleEndian::read_u64(&buf);
        if recv_magic == magic {
            break stream;
        }
        log::warn!(
            "TCP listener accept: invalid magic {:#x} != {:#x}",
            recv_magic,
            magic
        );
    };
    Ok(stream)
}

pub async fn async_connect(addr: &SocketAddr, magic: u64) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let mut buf = [0u8; std::mem::size_of::<u64>()];
    LittleEndian::write_u64(&mut buf, magic);
    stream.write_all(&buf).await?;
    Ok(stream)
}

pub fn encode_socket_addr<B: BufMut>(sock_addr: &SocketAddr, buf: &mut B) {
    match sock_addr {
        SocketAddr::V4(addr) => {
            buf.put_u8(4);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        SocketAddr::V6(addr) => {
            buf.put_u8(6);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
            buf.put_u32(addr.flowinfo());
            buf.put_u32(addr.scope_id());
        }
    }
}

pub fn decode_socket_addr<B: Buf>(buf: &mut B) -> io::Result<SocketAddr> {
    let addr_type = buf.get_u8();
    match addr_type {
        4 => {
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(octets),
                port,
            )))
        }
        6 => {
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            let flowinfo = buf.get_u32();
            let scope_id = buf.get_u32();
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                flowinfo,
                scope_id,
            )))
        }
        t => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected address type {}", t),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addr_codec_v4() {
        let addr: SocketAddr = "192.168.7.41:29500".parse().unwrap();
        let mut buf = Vec::new();
        encode_socket_addr(&addr, &mut buf);
        let decoded = decode_socket_addr(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn socket_addr_codec_v6() {
        let addr: SocketAddr = "[fe80::1%3]:4242".parse().unwrap();
        let mut buf = Vec::new();
        encode_socket_addr(&addr, &mut buf);
        let decoded = decode_socket_addr(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn socket_addr_decode_rejects_unknown_type() {
        let buf = [9u8; 32];
        assert!(decode_socket_addr(&mut buf.as_slice()).is_err());
    }

    #[tokio::test]
    async fn accept_rejects_foreign_magic() {
        let listener = async_listen(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut stream = async_accept(&listener, 0x1234).await.unwrap();
            stream.read_u8().await.unwrap()
        });

        // The first dial advertises the wrong magic and must be discarded;
        // only the second connection reaches the caller.
        let _bad = async_connect(&addr, 0xdead).await.unwrap();
        let mut good = async_connect(&addr, 0x1234).await.unwrap();
        good.write_u8(42).await.unwrap();
        assert_eq!(server.await.unwrap(), 42);
    }
}
