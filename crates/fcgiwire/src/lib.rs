//! FastCGI wire protocol for the application side of a web server connection.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte-stream transports (Unix sockets, TCP with a web
//!   server allowlist)
//! - [`record`]: record framing, typed bodies and name-value pairs
//! - [`mux`]: request multiplexing, management records and connection
//!   serving (behind the `mux` feature)

/// Re-export transport types.
pub mod transport {
    pub use fcgiwire_transport::*;
}

/// Re-export record types.
pub mod record {
    pub use fcgiwire_record::*;
}

/// Re-export multiplexer types (requires `mux` feature).
#[cfg(feature = "mux")]
pub mod mux {
    pub use fcgiwire_mux::*;
}
