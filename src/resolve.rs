use std::io;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};

use tokio::net::lookup_host;

/// The resolver's error taxonomy, surfaced to callers unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("hostname not found")]
    NameNotFound,

    #[error("hostname has no usable address")]
    AddressNotFound,

    #[error("service not found")]
    ServiceNotFound,

    #[error("temporary resolver failure, try again")]
    TransientFailure,

    #[error("permanent resolver failure")]
    PermanentFailure,

    #[error("invalid resolver flags")]
    InvalidFlags,

    #[error("resolver ran out of memory")]
    OutOfMemory,

    #[error("resolver system error: {0}")]
    SystemError(io::Error),

    #[error("address family not supported")]
    AddressFamilyUnsupported,
}

/// Resolves `host` to the first suitable UDP-capable address on `port`.
///
/// IPv4 results are preferred (TFTP servers overwhelmingly listen there) and
/// every result is returned in a single storage type: an IPv6 socket address,
/// with IPv4 carried as its canonical IPv4-mapped form.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddrV6, ResolveError> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(classify_lookup_error)?
        .collect();

    let preferred = addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .ok_or(ResolveError::AddressNotFound)?;

    Ok(canonical_addr(*preferred))
}

/// Folds any socket address into the uniform IPv6-capable storage.
pub fn canonical_addr(addr: SocketAddr) -> SocketAddrV6 {
    match addr {
        SocketAddr::V4(v4) => SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0),
        SocketAddr::V6(v6) => v6,
    }
}

/// Recovers the address to actually put on the wire: a canonically mapped
/// IPv4 address goes back out through an IPv4 socket.
pub fn wire_addr(addr: SocketAddrV6) -> SocketAddr {
    match addr.ip().to_ipv4_mapped() {
        Some(v4) => SocketAddr::V4(SocketAddrV4::new(v4, addr.port())),
        None => SocketAddr::V6(addr),
    }
}

/// The address family the wire form of `addr` belongs to, as an unspecified
/// local bind address.
pub fn unspecified_bind_addr(addr: SocketAddrV6) -> SocketAddr {
    match wire_addr(addr) {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
    }
}

// The std resolver folds getaddrinfo failures into an opaque io::Error, so
// only a coarse classification is possible from here.
fn classify_lookup_error(e: io::Error) -> ResolveError {
    match e.kind() {
        io::ErrorKind::NotFound => ResolveError::NameNotFound,
        io::ErrorKind::InvalidInput => ResolveError::InvalidFlags,
        io::ErrorKind::OutOfMemory => ResolveError::OutOfMemory,
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => ResolveError::TransientFailure,
        _ if e.raw_os_error().is_some() => ResolveError::SystemError(e),
        _ => ResolveError::NameNotFound,
    }
}
