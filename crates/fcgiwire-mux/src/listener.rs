use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fcgiwire_transport::{ListenAddr, Listener};
use tracing::{debug, info, warn};

use crate::config::MuxConfig;
use crate::connection::{Connection, ConnectionEnd, Handler};
use crate::error::{is_resource_exhaustion, MuxError, Result};

/// Pause after an accept failed for lack of descriptors or memory.
const EXHAUSTION_BACKOFF: Duration = Duration::from_millis(100);

/// Listens for and accepts web server connections.
pub struct FcgiListener {
    listener: Listener,
    config: MuxConfig,
    threaded: bool,
    next_connection_id: AtomicU64,
}

impl FcgiListener {
    /// Bind to a Unix socket path or TCP address.
    pub fn bind(addr: &ListenAddr) -> Result<Self> {
        Self::bind_with_allowlist(addr, Vec::new())
    }

    /// Bind, accepting TCP connections only from `allowed_peers`.
    ///
    /// An empty list accepts everyone. Ignored for Unix sockets.
    pub fn bind_with_allowlist(addr: &ListenAddr, allowed_peers: Vec<IpAddr>) -> Result<Self> {
        let listener = addr.bind(allowed_peers)?;
        info!(addr = %listener.local_addr(), "fastcgi listener bound");
        Ok(Self {
            listener,
            config: MuxConfig::default(),
            threaded: false,
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// Override connection config.
    pub fn with_config(mut self, config: MuxConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve each connection's requests on worker threads.
    pub fn with_threaded(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Bound address; TCP port 0 is resolved.
    pub fn local_addr(&self) -> ListenAddr {
        self.listener.local_addr()
    }

    /// Accept the next connection (blocking).
    pub fn accept(&self) -> Result<Connection<fcgiwire_transport::FcgiStream>> {
        let stream = self.listener.accept()?;
        Connection::from_stream(stream, &self.config)
    }

    /// Accept one connection and serve it on a new thread.
    pub fn spawn_next<H>(&self, handler: &Arc<H>) -> Result<thread::JoinHandle<()>>
    where
        H: Handler + Send + Sync + 'static,
    {
        let mut conn = self.accept()?;
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let peer = conn.peer_label();
        debug!(connection = id, %peer, "connection accepted");

        let handler = Arc::clone(handler);
        let threaded = self.threaded;
        thread::Builder::new()
            .name(format!("fcgi-conn-{id}"))
            .spawn(move || {
                let result = if threaded {
                    conn.serve_threaded(handler)
                } else {
                    conn.serve(handler.as_ref())
                };
                log_end(id, &peer, result);
            })
            .map_err(|err| MuxError::Record(err.into()))
    }

    /// Like [`spawn_next`](Self::spawn_next), but a failure that only
    /// concerns the new connection is logged and yields `Ok(None)`.
    pub fn next_connection<H>(&self, handler: &Arc<H>) -> Result<Option<thread::JoinHandle<()>>>
    where
        H: Handler + Send + Sync + 'static,
    {
        match self.spawn_next(handler) {
            Ok(handle) => Ok(Some(handle)),
            Err(err) if err.is_listener_fatal() => Err(err),
            Err(err) => {
                warn!(error = %err, "connection setup failed; still listening");
                if is_resource_exhaustion(&err) {
                    thread::sleep(EXHAUSTION_BACKOFF);
                }
                Ok(None)
            }
        }
    }

    /// Accept and serve connections until the listener itself fails.
    pub fn serve<H>(&self, handler: Arc<H>) -> Result<()>
    where
        H: Handler + Send + Sync + 'static,
    {
        loop {
            self.next_connection(&handler)?;
        }
    }
}

fn log_end(id: u64, peer: &str, result: Result<ConnectionEnd>) {
    match result {
        Ok(end) => debug!(connection = id, %peer, ?end, "connection finished"),
        Err(err) => warn!(connection = id, %peer, error = %err, "connection failed"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::{Read, Write};
    use std::path::PathBuf;

    use bytes::BytesMut;
    use fcgiwire_record::{
        decode_record_buf, encode_record, Body, ProtocolStatus, Record, RecordType, Role,
    };

    use super::*;
    use crate::connection::{EndStatus, Output};
    use crate::request::ReadyRequest;

    fn make_sock_path(tag: &str) -> PathBuf {
        let dir = std::path::PathBuf::from(format!(
            "/tmp/fcgiw-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir.join("listener.sock")
    }

    fn hello(request: ReadyRequest, out: &mut Output) -> EndStatus {
        out.write_stdout(b"Content-Type: text/plain\r\n\r\nhello ")
            .expect("stdout");
        out.write_stdout(request.param("NAME").map_or(&b"?"[..], |v| &v[..]))
            .expect("stdout");
        EndStatus::complete(0)
    }

    fn send_request(stream: &mut impl Write, id: u16, name: &str) {
        let pairs = [fcgiwire_record::NameValuePair::new("NAME", name.to_string())];
        let mut params = BytesMut::new();
        fcgiwire_record::encode_pairs(&pairs, &mut params).expect("params");
        let mut buf = BytesMut::new();
        for record in [
            Record::begin_request(id, Role::Responder, false),
            Record::new(RecordType::Params, id, params.freeze()),
            Record::empty(RecordType::Params, id),
            Record::empty(RecordType::Stdin, id),
        ] {
            encode_record(&record, &mut buf).expect("encode");
        }
        stream.write_all(&buf).expect("send");
    }

    fn read_all_records(stream: &mut impl Read) -> Vec<Record> {
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).expect("read");
        let mut buf = BytesMut::from(raw.as_slice());
        let mut records = Vec::new();
        while let Some(record) = decode_record_buf(&mut buf).expect("decode") {
            records.push(record);
        }
        records
    }

    #[test]
    fn serves_one_connection_over_unix_socket() {
        let sock_path = make_sock_path("serve");
        let addr = ListenAddr::Unix(sock_path.clone());
        let listener = FcgiListener::bind(&addr).expect("listener should bind");
        let handler = Arc::new(hello);

        let server = thread::spawn(move || {
            listener
                .spawn_next(&handler)
                .expect("accept")
                .join()
                .expect("connection thread");
        });

        let mut client = addr.connect().expect("client should connect");
        send_request(&mut client, 1, "unix");
        let records = read_all_records(&mut client);
        server.join().expect("server thread should finish");

        let stdout: Vec<u8> = records
            .iter()
            .filter(|r| r.record_type == RecordType::Stdout)
            .flat_map(|r| r.content.to_vec())
            .collect();
        assert!(stdout.ends_with(b"hello unix"));
        let Body::EndRequest(end) = records.last().expect("records").body().expect("body") else {
            panic!("last record should be EndRequest");
        };
        assert_eq!(end.protocol_status, ProtocolStatus::RequestComplete);

        if let Some(parent) = sock_path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn serve_keeps_accepting_after_a_peer_hangs_up() {
        let listener = FcgiListener::bind(&"127.0.0.1:0".parse().expect("addr"))
            .expect("listener should bind");
        let addr = listener.local_addr();
        thread::spawn(move || listener.serve(Arc::new(hello)));

        // A peer that leaves before sending anything must not stop the loop.
        drop(addr.connect().expect("first client should connect"));

        for (id, name) in [(1, "second"), (2, "third")] {
            let mut client = addr.connect().expect("client should connect");
            send_request(&mut client, id, name);
            let records = read_all_records(&mut client);
            let stdout: Vec<u8> = records
                .iter()
                .filter(|r| r.record_type == RecordType::Stdout)
                .flat_map(|r| r.content.to_vec())
                .collect();
            assert!(stdout.ends_with(name.as_bytes()));
        }
    }

    #[test]
    fn threaded_connection_over_tcp() {
        let listener = FcgiListener::bind(&"127.0.0.1:0".parse().expect("addr"))
            .expect("listener should bind")
            .with_threaded(true);
        let addr = listener.local_addr();
        let handler = Arc::new(hello);

        let server = thread::spawn(move || {
            listener
                .spawn_next(&handler)
                .expect("accept")
                .join()
                .expect("connection thread");
        });

        let mut client = addr.connect().expect("client should connect");
        send_request(&mut client, 9, "tcp");
        let records = read_all_records(&mut client);
        server.join().expect("server thread should finish");

        assert!(records.iter().all(|r| r.request_id == 9));
        assert_eq!(
            records.last().map(|r| r.record_type),
            Some(RecordType::EndRequest)
        );
    }
}
