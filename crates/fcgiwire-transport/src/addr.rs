//! Listen/connect address parsing and a listener over either transport.
//!
//! Accepted forms:
//! - `unix:/run/app.sock` or any string containing a `/`
//! - `tcp:127.0.0.1:9000` or a bare `host:port`

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Result, TransportError};
use crate::stream::FcgiStream;
use crate::tcp::TcpSocket;

#[cfg(unix)]
use crate::uds::UnixDomainSocket;

/// Address of a FastCGI endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// Filesystem-path Unix domain socket.
    Unix(PathBuf),
    /// TCP `host:port`.
    Tcp(String),
}

impl FromStr for ListenAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(TransportError::InvalidAddress(s.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(hostport) = s.strip_prefix("tcp:") {
            return parse_hostport(hostport).map(Self::Tcp);
        }
        if s.contains('/') {
            return Ok(Self::Unix(PathBuf::from(s)));
        }
        parse_hostport(s).map(Self::Tcp)
    }
}

fn parse_hostport(s: &str) -> Result<String> {
    match s.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(s.to_string()),
        _ => Err(TransportError::InvalidAddress(s.to_string())),
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(hostport) => write!(f, "tcp:{hostport}"),
        }
    }
}

impl ListenAddr {
    /// Bind a listener on this address.
    ///
    /// `allowed_peers` only applies to TCP.
    pub fn bind(&self, allowed_peers: Vec<IpAddr>) -> Result<Listener> {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => Ok(Listener::Unix(UnixDomainSocket::bind(path)?)),
            #[cfg(not(unix))]
            Self::Unix(_) => Err(TransportError::InvalidAddress(self.to_string())),
            Self::Tcp(hostport) => Ok(Listener::Tcp(
                TcpSocket::bind(hostport.as_str())?.with_allowed_peers(allowed_peers),
            )),
        }
    }

    /// Connect to the endpoint at this address.
    pub fn connect(&self) -> Result<FcgiStream> {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => UnixDomainSocket::connect(path),
            #[cfg(not(unix))]
            Self::Unix(_) => Err(TransportError::InvalidAddress(self.to_string())),
            Self::Tcp(hostport) => TcpSocket::connect(hostport.as_str()),
        }
    }
}

/// A bound listener on either transport.
pub enum Listener {
    #[cfg(unix)]
    Unix(UnixDomainSocket),
    Tcp(TcpSocket),
}

impl Listener {
    /// Accept the next connection (blocking).
    pub fn accept(&self) -> Result<FcgiStream> {
        match self {
            #[cfg(unix)]
            Self::Unix(socket) => socket.accept(),
            Self::Tcp(socket) => socket.accept(),
        }
    }

    /// The address actually bound (resolves TCP port 0).
    pub fn local_addr(&self) -> ListenAddr {
        match self {
            #[cfg(unix)]
            Self::Unix(socket) => ListenAddr::Unix(socket.path().to_path_buf()),
            Self::Tcp(socket) => ListenAddr::Tcp(socket.local_addr().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefixed_forms() {
        assert_eq!(
            "unix:/run/app.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix(PathBuf::from("/run/app.sock"))
        );
        assert_eq!(
            "tcp:127.0.0.1:9000".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("127.0.0.1:9000".to_string())
        );
    }

    #[test]
    fn parses_bare_forms() {
        assert_eq!(
            "/tmp/app.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix(PathBuf::from("/tmp/app.sock"))
        );
        assert_eq!(
            "localhost:9000".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("localhost:9000".to_string())
        );
    }

    #[test]
    fn rejects_missing_port() {
        assert!("localhost".parse::<ListenAddr>().is_err());
        assert!("tcp:host:notaport".parse::<ListenAddr>().is_err());
        assert!("unix:".parse::<ListenAddr>().is_err());
    }

    #[test]
    fn display_roundtrips_through_parse() {
        let addr: ListenAddr = "tcp:[::1]:9000".parse().unwrap();
        assert_eq!(addr.to_string().parse::<ListenAddr>().unwrap(), addr);
    }

    #[test]
    fn tcp_listener_reports_resolved_port() {
        let listener = ListenAddr::Tcp("127.0.0.1:0".to_string())
            .bind(Vec::new())
            .unwrap();
        match listener.local_addr() {
            ListenAddr::Tcp(hostport) => assert!(!hostport.ends_with(":0")),
            other => panic!("unexpected address {other:?}"),
        }
    }
}
