//! FastCGI request multiplexing for the application side of a connection.
//!
//! Records decoded by `fcgiwire-record` flow through here:
//! - request id 0 goes to the [`ManagementChannel`]
//! - everything else goes to the [`RequestMultiplexer`], which assembles
//!   each request's Params, Stdin and Data streams and hands the finished
//!   request to the application exactly once
//!
//! [`Connection`] ties this to a transport and a [`Handler`].

pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod management;
pub mod multiplexer;
pub mod request;
pub mod stream;

pub use config::{
    ManagementValues, MuxConfig, DEFAULT_MAX_REQS, DEFAULT_MAX_STREAM_SIZE, FCGI_MAX_CONNS,
    FCGI_MAX_REQS, FCGI_MPXS_CONNS,
};
pub use connection::{Connection, ConnectionEnd, EndStatus, Handler, Output};
pub use error::{MuxError, Result};
pub use listener::FcgiListener;
pub use management::ManagementChannel;
pub use multiplexer::{EndOutcome, MuxEvent, RequestMultiplexer};
pub use request::{AbortSignal, ReadyRequest, RequestState};
pub use stream::{StreamAssembler, StreamEvent};
