//! Byte-stream transports for FastCGI connections.
//!
//! FastCGI assumes nothing from its transport beyond an ordered byte stream
//! in each direction. This crate provides the two transports web servers
//! actually use:
//! - Unix domain sockets (Linux/macOS)
//! - TCP, with an optional allowlist of web server addresses
//!
//! Everything above this layer only sees the [`FcgiStream`] type, which is
//! plain `Read + Write`.

pub mod addr;
pub mod error;
pub mod stream;
pub mod tcp;

#[cfg(unix)]
pub mod uds;

pub use addr::{ListenAddr, Listener};
pub use error::{Result, TransportError};
pub use stream::FcgiStream;
pub use tcp::TcpSocket;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
