use std::io;

use fcgiwire_record::RecordError;
use fcgiwire_transport::TransportError;

/// Errors raised while routing records to requests.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Record-level error (framing, I/O, closed connection).
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A record the peer must never send, or one for a request that does
    /// not exist.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A record arrived in a state that does not allow it.
    #[error("request {request_id}: out-of-sequence record: {reason}")]
    CallSeq { request_id: u16, reason: String },

    /// The application referred to a request that is not open.
    #[error("request {0} is not open")]
    UnknownRequest(u16),

    /// A previous fatal error stopped this connection.
    #[error("connection halted after a fatal error")]
    Halted,

    /// A worker panicked while holding the connection state.
    #[error("connection state lock poisoned")]
    Poisoned,
}

impl MuxError {
    /// Whether the connection must be torn down after this error.
    ///
    /// Request-scoped problems never surface as `MuxError`; they are
    /// answered with an EndRequest and the connection keeps going.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Record(err) => !matches!(err, RecordError::ContentTooLarge { .. }),
            Self::UnknownRequest(_) => false,
            _ => true,
        }
    }

    /// Whether an error from accepting or setting up a connection means the
    /// listener itself is unusable.
    ///
    /// Everything else (an aborted handshake, descriptor exhaustion, a
    /// failed socket option on the new stream) only loses that connection.
    pub fn is_listener_fatal(&self) -> bool {
        match self {
            Self::Transport(TransportError::Accept(err)) => listener_broken(err),
            Self::Transport(TransportError::Rejected(_) | TransportError::Io(_)) => false,
            Self::Record(RecordError::Io(_)) => false,
            _ => true,
        }
    }

    pub(crate) fn call_seq(request_id: u16, reason: impl Into<String>) -> Self {
        Self::CallSeq {
            request_id,
            reason: reason.into(),
        }
    }
}

/// OS errors from `accept` that mean the listening socket itself is bad.
#[cfg(unix)]
const LISTENER_BROKEN: &[i32] = &[
    libc::EBADF,
    libc::ENOTSOCK,
    libc::EFAULT,
    libc::EINVAL,
    libc::EOPNOTSUPP,
];
#[cfg(not(unix))]
const LISTENER_BROKEN: &[i32] = &[];

#[cfg(unix)]
const RESOURCE_EXHAUSTED: &[i32] = &[libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM];
#[cfg(not(unix))]
const RESOURCE_EXHAUSTED: &[i32] = &[];

fn listener_broken(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported
    ) || err
        .raw_os_error()
        .is_some_and(|code| LISTENER_BROKEN.contains(&code))
}

/// Accept failures that call for a pause before retrying.
pub(crate) fn is_resource_exhaustion(err: &MuxError) -> bool {
    match err {
        MuxError::Transport(TransportError::Accept(err)) => err
            .raw_os_error()
            .is_some_and(|code| RESOURCE_EXHAUSTED.contains(&code)),
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(MuxError::call_seq(1, "dup").is_fatal());
        assert!(MuxError::Protocol("x".into()).is_fatal());
        assert!(MuxError::Halted.is_fatal());
        assert!(MuxError::Record(RecordError::UnsupportedVersion(2)).is_fatal());
        assert!(MuxError::Record(RecordError::ConnectionClosed).is_fatal());
        assert!(!MuxError::UnknownRequest(4).is_fatal());
        assert!(!MuxError::Record(RecordError::ContentTooLarge { size: 1, max: 0 }).is_fatal());
    }

    #[test]
    fn per_connection_accept_failures_keep_the_listener() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert!(!MuxError::Transport(TransportError::Accept(aborted)).is_listener_fatal());
        let setup = io::Error::from(io::ErrorKind::TimedOut);
        assert!(!MuxError::Record(RecordError::Io(setup)).is_listener_fatal());
        let rejected = TransportError::Rejected("10.0.0.9".parse().expect("ip"));
        assert!(!MuxError::Transport(rejected).is_listener_fatal());

        let broken = io::Error::from(io::ErrorKind::InvalidInput);
        assert!(MuxError::Transport(TransportError::Accept(broken)).is_listener_fatal());
        assert!(MuxError::Poisoned.is_listener_fatal());
    }

    #[cfg(unix)]
    #[test]
    fn descriptor_exhaustion_is_transient_and_paced() {
        let emfile = MuxError::Transport(TransportError::Accept(io::Error::from_raw_os_error(
            libc::EMFILE,
        )));
        assert!(!emfile.is_listener_fatal());
        assert!(is_resource_exhaustion(&emfile));

        let ebadf = MuxError::Transport(TransportError::Accept(io::Error::from_raw_os_error(
            libc::EBADF,
        )));
        assert!(ebadf.is_listener_fatal());
        assert!(!is_resource_exhaustion(&ebadf));

        let econnaborted = MuxError::Transport(TransportError::Accept(
            io::Error::from_raw_os_error(libc::ECONNABORTED),
        ));
        assert!(!econnaborted.is_listener_fatal());
        assert!(!is_resource_exhaustion(&econnaborted));
    }

    #[test]
    fn call_seq_message_names_request() {
        let err = MuxError::call_seq(7, "BeginRequest for an open request");
        assert_eq!(
            err.to_string(),
            "request 7: out-of-sequence record: BeginRequest for an open request"
        );
    }
}
