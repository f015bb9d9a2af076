use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use crate::error::Result;

/// A connected FastCGI transport stream (Read + Write).
///
/// Carries no framing of its own; records are layered on top by the
/// record crate.
pub struct FcgiStream {
    inner: FcgiStreamInner,
}

enum FcgiStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    Tcp(TcpStream),
}

impl Read for FcgiStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            FcgiStreamInner::Unix(stream) => stream.read(buf),
            FcgiStreamInner::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for FcgiStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            FcgiStreamInner::Unix(stream) => stream.write(buf),
            FcgiStreamInner::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            FcgiStreamInner::Unix(stream) => stream.flush(),
            FcgiStreamInner::Tcp(stream) => stream.flush(),
        }
    }
}

impl FcgiStream {
    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: FcgiStreamInner::Unix(stream),
        }
    }

    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: FcgiStreamInner::Tcp(stream),
        }
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            FcgiStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            FcgiStreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            FcgiStreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            FcgiStreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    ///
    /// Used to split a connection into an independent reader and writer.
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            FcgiStreamInner::Unix(stream) => Ok(Self::from_unix(stream.try_clone()?)),
            FcgiStreamInner::Tcp(stream) => Ok(Self::from_tcp(stream.try_clone()?)),
        }
    }

    /// Shut down both directions of the connection.
    ///
    /// Unblocks a reader parked in `read` on a cloned handle.
    pub fn shutdown(&self) -> Result<()> {
        let res = match &self.inner {
            #[cfg(unix)]
            FcgiStreamInner::Unix(stream) => stream.shutdown(Shutdown::Both),
            FcgiStreamInner::Tcp(stream) => stream.shutdown(Shutdown::Both),
        };
        match res {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Human-readable description of the remote end, for logging.
    pub fn peer_label(&self) -> String {
        match &self.inner {
            #[cfg(unix)]
            FcgiStreamInner::Unix(_) => match self.peer_credentials() {
                Some((uid, _, pid)) => format!("unix:pid={pid},uid={uid}"),
                None => "unix".to_string(),
            },
            FcgiStreamInner::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| format!("tcp:{addr}"))
                .unwrap_or_else(|_| "tcp:unknown".to_string()),
        }
    }

    /// Get the credentials of the connected peer (Linux Unix sockets only).
    ///
    /// Returns `(uid, gid, pid)` via `SO_PEERCRED`, or `None` if unavailable.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        use std::os::fd::AsRawFd;

        let fd = match &self.inner {
            FcgiStreamInner::Unix(stream) => stream.as_raw_fd(),
            FcgiStreamInner::Tcp(_) => return None,
        };

        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable pointers for the provided sizes,
        // and `fd` is an open Unix socket descriptor owned by this process.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    /// Get the credentials of the connected peer.
    ///
    /// Returns `None` on platforms that do not expose peer credentials.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

impl std::fmt::Debug for FcgiStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            #[cfg(unix)]
            FcgiStreamInner::Unix(_) => "unix",
            FcgiStreamInner::Tcp(_) => "tcp",
        };
        f.debug_struct("FcgiStream").field("type", &kind).finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_connection() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let left = FcgiStream::from_unix(left);
        let mut right = FcgiStream::from_unix(right);

        let mut writer = left.try_clone().unwrap();
        writer.write_all(b"abc").unwrap();

        let mut buf = [0u8; 3];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn shutdown_unblocks_reader_with_eof() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let left = FcgiStream::from_unix(left);
        let mut reader = left.try_clone().unwrap();
        let _keep = right;

        left.shutdown().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn unix_peer_label_includes_pid() {
        let (left, _right) = std::os::unix::net::UnixStream::pair().unwrap();
        let stream = FcgiStream::from_unix(left);
        let label = stream.peer_label();
        assert!(label.contains(&format!("pid={}", std::process::id())));
    }
}
