use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::stream::FcgiStream;

/// TCP listener for FastCGI connections.
///
/// FastCGI over TCP is usually restricted to the web server hosts; an
/// allowlist can be configured with [`TcpSocket::with_allowed_peers`].
/// Connections from other addresses are closed right after accept.
pub struct TcpSocket {
    listener: TcpListener,
    local_addr: SocketAddr,
    allowed_peers: Option<Vec<IpAddr>>,
}

impl TcpSocket {
    /// Bind and listen on a TCP address.
    pub fn bind(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<Self> {
        let label = format!("{addr:?}");
        let listener = TcpListener::bind(&addr).map_err(|source| TransportError::Bind {
            addr: label.clone(),
            source,
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr: label, source })?;

        info!(%local_addr, "listening on tcp");

        Ok(Self {
            listener,
            local_addr,
            allowed_peers: None,
        })
    }

    /// Restrict accepted connections to the given peer addresses.
    ///
    /// An empty list means no restriction.
    pub fn with_allowed_peers(mut self, peers: Vec<IpAddr>) -> Self {
        self.allowed_peers = if peers.is_empty() { None } else { Some(peers) };
        self
    }

    /// Parse a comma-separated allowlist, as carried by the
    /// `FCGI_WEB_SERVER_ADDRS` environment variable.
    pub fn parse_allowlist(raw: &str) -> Result<Vec<IpAddr>> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<IpAddr>()
                    .map_err(|_| TransportError::InvalidAddress(s.to_string()))
            })
            .collect()
    }

    /// Accept the next allowed connection (blocking).
    ///
    /// Rejected peers are logged and skipped.
    pub fn accept(&self) -> Result<FcgiStream> {
        loop {
            let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
            if let Err(err) = self.check_peer(peer.ip()) {
                warn!(%peer, "{err}");
                let _ = stream.shutdown(std::net::Shutdown::Both);
                continue;
            }
            debug!(%peer, "accepted connection");
            return Ok(FcgiStream::from_tcp(stream));
        }
    }

    /// Connect to a listening FastCGI application over TCP (blocking).
    pub fn connect(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<FcgiStream> {
        let stream = TcpStream::connect(&addr).map_err(|source| TransportError::Connect {
            addr: format!("{addr:?}"),
            source,
        })?;
        let _ = stream.set_nodelay(true);
        debug!(?addr, "connected over tcp");
        Ok(FcgiStream::from_tcp(stream))
    }

    /// The address this socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn check_peer(&self, ip: IpAddr) -> Result<()> {
        match &self.allowed_peers {
            Some(allowed) if !allowed.contains(&ip) => Err(TransportError::Rejected(ip)),
            _ => Ok(()),
        }
    }
}
