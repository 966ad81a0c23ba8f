use crate::config::SharedConfig;
use crate::dns::handlers::Handler;
use crate::store::SharedStore;
use crate::zone::SharedZone;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, UdpSocket};
use trust_dns_server::ServerFuture;

/// A DNS server with its listeners bound, not yet serving.
pub struct DnsServer {
    server: ServerFuture<Handler>,
    udp_addrs: Vec<SocketAddr>,
    tcp_addrs: Vec<SocketAddr>,
}

impl DnsServer {
    /// Local addresses of the UDP sockets, useful when binding port `0`.
    pub fn udp_addrs(&self) -> &[SocketAddr] {
        &self.udp_addrs
    }

    /// Local addresses of the TCP listeners.
    pub fn tcp_addrs(&self) -> &[SocketAddr] {
        &self.tcp_addrs
    }

    /// Serve until every listener has shut down.
    pub async fn block_until_done(self) -> Result<(), crate::error::Error> {
        Ok(self.server.block_until_done().await?)
    }
}

/// Bind a socket of each enabled transport on every [`Config::dns_bind_addrs`][crate::Config]
/// address.
pub async fn new(
    config: SharedConfig,
    zone: SharedZone,
    store: SharedStore,
) -> anyhow::Result<DnsServer> {
    let protocol = config.dns_protocol;
    let dns_handler = Handler::new(zone, store, config.dns_query_timeout);
    let mut dns_server = ServerFuture::new(dns_handler);
    let (mut udp_addrs, mut tcp_addrs) = (Vec::new(), Vec::new());

    for addr in &config.dns_bind_addrs {
        if protocol.udp() {
            let socket = bind_udp(*addr)?;
            let local = socket.local_addr()?;
            tracing::info!("DNS listening on UDP {local}");
            udp_addrs.push(local);
            dns_server.register_socket(socket);
        }
        if protocol.tcp() {
            let listener = bind_tcp(*addr)?;
            let local = listener.local_addr()?;
            tracing::info!("DNS listening on TCP {local}");
            tcp_addrs.push(local);
            dns_server.register_listener(listener, config.dns_tcp_timeout);
        }
    }

    Ok(DnsServer {
        server: dns_server,
        udp_addrs,
        tcp_addrs,
    })
}

/// IPv6 sockets are bound v6-only so `0.0.0.0` and `[::]` can share a port.
fn new_socket(addr: SocketAddr, ty: Type, protocol: Protocol) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    Ok(socket)
}

fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = new_socket(addr, Type::DGRAM, Protocol::UDP)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

fn bind_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = new_socket(addr, Type::STREAM, Protocol::TCP)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}
