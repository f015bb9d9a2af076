use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::FcgiStream;

/// Unix domain socket listener.
///
/// Binds a filesystem-path socket the web server connects to. The socket
/// file is removed on drop, unless something else replaced it meanwhile.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl UnixDomainSocket {
    /// Default permission mode for created socket paths.
    ///
    /// Web servers usually run as a different user than the application,
    /// so group access is granted.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o660;
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on a filesystem-path Unix domain socket.
    ///
    /// If the file already exists and is a socket, it is removed first
    /// (stale socket cleanup).
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind and listen with an explicit permission mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        let bind_err = |source: std::io::Error| TransportError::Bind {
            addr: path.display().to_string(),
            source,
        };

        // Remove stale socket if it exists, but never remove non-socket files.
        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(bind_err)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening on unix domain socket");

        let created_inode = Some((created.dev(), created.ino()));
        Ok(Self {
            listener,
            path,
            created_inode,
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<FcgiStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted connection");
        Ok(FcgiStream::from_unix(stream))
    }

    /// Connect to a listening Unix domain socket (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<FcgiStream> {
        let path = path.as_ref();
        let stream =
            std::os::unix::net::UnixStream::connect(path).map_err(|e| TransportError::Connect {
                addr: path.display().to_string(),
                source: e,
            })?;
        debug!(?path, "connected to unix domain socket");
        Ok(FcgiStream::from_unix(stream))
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        let Some((expected_dev, expected_ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn socket_in_temp_dir(tag: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("fcgiwire-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        let sock = dir.join("app.sock");
        (dir, sock)
    }

    #[test]
    fn web_server_connects_and_socket_is_cleaned_up() {
        let (dir, sock_path) = socket_in_temp_dir("uds");
        let listener = UnixDomainSocket::bind(&sock_path).expect("bind");
        assert_eq!(listener.path(), sock_path.as_path());

        let client_path = sock_path.clone();
        let web_server = std::thread::spawn(move || {
            let mut stream = UnixDomainSocket::connect(&client_path).expect("connect");
            // BeginRequest header for request 1.
            stream.write_all(&[1, 1, 0, 1, 0, 8, 0, 0]).expect("write");
        });

        let mut app = listener.accept().expect("accept");
        let mut header = [0u8; 8];
        app.read_exact(&mut header).expect("read");
        assert_eq!(header[1], 1);
        web_server.join().expect("web server thread");

        drop(listener);
        assert!(!sock_path.exists(), "socket file should be removed on drop");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stale_socket_is_replaced_and_mode_applied() {
        let (dir, sock_path) = socket_in_temp_dir("uds-stale");
        let stale = UnixListener::bind(&sock_path).expect("stale bind");
        drop(stale);
        assert!(sock_path.exists(), "std listener leaves its socket file behind");

        let listener = UnixDomainSocket::bind(&sock_path).expect("rebind over stale socket");
        let mode = std::fs::metadata(&sock_path)
            .expect("metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, UnixDomainSocket::DEFAULT_SOCKET_MODE);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn refuses_to_clobber_regular_file() {
        let (dir, sock_path) = socket_in_temp_dir("uds-file");
        std::fs::write(&sock_path, b"not a socket").expect("write file");

        let result = UnixDomainSocket::bind(&sock_path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));
        assert_eq!(std::fs::read(&sock_path).expect("file kept"), b"not a socket");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn replaced_path_survives_drop() {
        let (dir, sock_path) = socket_in_temp_dir("uds-drop");
        let listener = UnixDomainSocket::bind(&sock_path).expect("bind");
        std::fs::remove_file(&sock_path).expect("remove");
        std::fs::write(&sock_path, b"replacement").expect("write");

        drop(listener);
        assert!(sock_path.exists(), "drop must not remove a replaced path");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn overlong_path_and_missing_socket_fail_cleanly() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        assert!(matches!(
            UnixDomainSocket::bind(&long_path),
            Err(TransportError::PathTooLong { .. })
        ));

        let missing = UnixDomainSocket::connect("/tmp/fcgiwire-no-such-dir/app.sock");
        let Err(TransportError::Connect { source, .. }) = missing else {
            panic!("connect to a missing path should fail");
        };
        assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
    }
}
