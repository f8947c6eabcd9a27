//! Bind-address selection for the ad-hoc link subnet and socket
//! construction/configuration helpers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use log::{debug, warn};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

/// Send/receive buffer size. Small to minimize buffering latency.
const SOCKET_BUF_SIZE: usize = 4096;
/// Listener backlog. One peer ever connects; the rest is headroom.
const LISTEN_BACKLOG: i32 = 50;

/// Pick the local address to bind on. Prefers an address inside the ad-hoc
/// subnet, falls back to `owner_fallback` (the group-owner address, which is
/// local only on the host side), else `None` for unbound/default binding.
/// Guards against the OS picking the wrong physical interface when several
/// are up.
pub fn select_bind_address(subnet_prefix: &str, owner_fallback: Option<IpAddr>) -> Option<IpAddr> {
    if let Some(local) = subnet_local_address(subnet_prefix, owner_fallback) {
        debug!("selected subnet-local address {local}");
        return Some(local);
    }
    if let Some(owner) = owner_fallback {
        debug!("no address inside {subnet_prefix}*, falling back to group-owner address {owner}");
    }
    owner_fallback
}

/// Find the local address the kernel would source traffic to the ad-hoc
/// subnet from, if it falls inside the subnet. The routing table is probed
/// with an unsent UDP connect; no packet leaves the machine.
fn subnet_local_address(prefix: &str, hint: Option<IpAddr>) -> Option<IpAddr> {
    let target: IpAddr = match hint {
        Some(addr) => addr,
        None => format!("{prefix}1").parse().ok()?,
    };
    let local = route_local_address(target)?;
    if local.to_string().starts_with(prefix) {
        Some(local)
    } else {
        debug!("route probe toward {target} returned {local}, outside {prefix}*");
        None
    }
}

fn route_local_address(target: IpAddr) -> Option<IpAddr> {
    let bind: SocketAddr = match target {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let sock = UdpSocket::bind(bind).ok()?;
    // Discard port; connect() only consults the routing table.
    sock.connect((target, 9)).ok()?;
    sock.local_addr().ok().map(|a| a.ip())
}

/// Bind a listener with SO_REUSEADDR so a fresh session can rebind the fixed
/// port right after teardown.
pub fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Configure an established stream for low-latency chat: no send coalescing,
/// keep-alive on, small fixed buffers. Read timeouts stay off; the receive
/// loop blocks until data, EOF, or error.
pub fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;
    if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUF_SIZE) {
        warn!("could not shrink receive buffer: {e}");
    }
    if let Err(e) = sock.set_send_buffer_size(SOCKET_BUF_SIZE) {
        warn!("could not shrink send buffer: {e}");
    }
    Ok(())
}
