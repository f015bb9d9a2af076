//! Drives one FastCGI connection: reads records, routes them, runs the
//! application, writes the replies.
//!
//! Two shapes are supported:
//! - [`Connection::serve`] runs the handler inline, one request at a time
//!   in arrival order of readiness.
//! - [`Connection::serve_threaded`] hands every ready request to its own
//!   worker thread while the reader keeps decoding.
//!
//! In both shapes record decoding stays on the calling thread. Workers
//! share the request table and the writer, each behind its own mutex;
//! the table lock is never held across a socket write.

use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use fcgiwire_record::{ProtocolStatus, Record, RecordError, RecordReader, RecordWriter};
use fcgiwire_transport::FcgiStream;
use tracing::{debug, warn};

use crate::config::MuxConfig;
use crate::error::{MuxError, Result};
use crate::multiplexer::{EndOutcome, MuxEvent, RequestMultiplexer};
use crate::request::{AbortSignal, ReadyRequest};

/// How the application finished a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndStatus {
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

impl EndStatus {
    /// Normal completion with the given application exit code.
    pub fn complete(app_status: u32) -> Self {
        Self {
            app_status,
            protocol_status: ProtocolStatus::RequestComplete,
        }
    }
}

impl Default for EndStatus {
    fn default() -> Self {
        Self::complete(0)
    }
}

/// Application side of a connection.
pub trait Handler {
    /// Serve one request. Output goes through `out`; the returned status
    /// becomes the EndRequest record.
    fn handle(&self, request: ReadyRequest, out: &mut Output) -> EndStatus;

    /// The peer aborted a request the application is already serving.
    fn on_abort(&self, _request_id: u16) {}
}

impl<F> Handler for F
where
    F: Fn(ReadyRequest, &mut Output) -> EndStatus,
{
    fn handle(&self, request: ReadyRequest, out: &mut Output) -> EndStatus {
        self(request, out)
    }
}

/// Why [`Connection::serve`] returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// The peer closed its side between records.
    PeerClosed,
    /// A request without keep-conn ended and nothing else was open.
    KeepConnFalse,
}

/// Routing state, locked briefly by the reader and by workers.
struct State {
    mux: RequestMultiplexer,
    close_requested: bool,
    /// Record batches built but not yet on the wire.
    pending_writes: usize,
    shut_down: bool,
}

/// Everything the reader and workers share.
///
/// Records are built under `state` and written under `writer`; no thread
/// holds `state` while writing, so routing never waits on a slow peer.
struct Shared {
    state: Mutex<State>,
    writer: Mutex<RecordWriter<Box<dyn Write + Send>>>,
    /// Used to unblock the reader once the connection should close.
    shutdown: Option<FcgiStream>,
}

impl Shared {
    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| MuxError::Poisoned)
    }

    /// Build output records for a request and write them.
    fn output<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(&mut RequestMultiplexer) -> Result<Vec<Record>>,
    {
        let records = {
            let mut state = self.state()?;
            let records = build(&mut state.mux)?;
            state.pending_writes += 1;
            records
        };
        self.send(&records)
    }

    /// Close out a request. Returns whether the connection should close.
    fn finish<F>(&self, end: F) -> Result<bool>
    where
        F: FnOnce(&mut RequestMultiplexer) -> Result<EndOutcome>,
    {
        let outcome = {
            let mut state = self.state()?;
            let outcome = end(&mut state.mux)?;
            state.pending_writes += 1;
            if outcome.close_connection {
                debug!(request_id = outcome.request_id, "closing connection after request");
                state.close_requested = true;
            }
            outcome
        };
        self.send(&outcome.records)?;
        Ok(outcome.close_connection)
    }

    /// Write one staged batch. The stream is shut down once a close was
    /// requested and every staged batch has been written.
    fn send(&self, records: &[Record]) -> Result<()> {
        let written = match self.writer.lock() {
            Ok(mut writer) => writer.write_records(records).map_err(MuxError::from),
            Err(_) => Err(MuxError::Poisoned),
        };

        let mut state = self.state()?;
        state.pending_writes = state.pending_writes.saturating_sub(1);
        if state.close_requested && state.pending_writes == 0 && !state.shut_down {
            state.shut_down = true;
            if let Some(stream) = &self.shutdown {
                if let Err(err) = stream.shutdown() {
                    debug!(error = %err, "shutdown after last request failed");
                }
            }
        }
        written
    }
}

/// Output handle for one request.
///
/// Also implements [`std::io::Write`] onto Stdout.
pub struct Output {
    request_id: u16,
    abort: AbortSignal,
    shared: Arc<Shared>,
}

impl Output {
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    /// Whether the peer aborted this request.
    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    pub fn write_stdout(&mut self, data: &[u8]) -> Result<()> {
        let request_id = self.request_id;
        self.shared.output(|mux| mux.write_stdout(request_id, data))
    }

    pub fn write_stderr(&mut self, data: &[u8]) -> Result<()> {
        let request_id = self.request_id;
        self.shared.output(|mux| mux.write_stderr(request_id, data))
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_stdout(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run the handler for one request and close it out.
///
/// A panicking handler still gets its EndRequest. Returns whether the
/// connection should close.
fn run_request<H: Handler + ?Sized>(
    handler: &H,
    ready: ReadyRequest,
    shared: &Arc<Shared>,
) -> Result<bool> {
    let request_id = ready.request_id;
    let mut out = Output {
        request_id,
        abort: ready.abort.clone(),
        shared: Arc::clone(shared),
    };
    let status = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(ready, &mut out)));

    shared.finish(|mux| match status {
        Ok(status) => mux.end_request(request_id, status.app_status, status.protocol_status),
        Err(_) => {
            warn!(request_id, "handler panicked; ending request");
            mux.synthesize_end(request_id)
        }
    })
}

/// A FastCGI connection from the application's side.
pub struct Connection<R> {
    reader: RecordReader<R>,
    shared: Arc<Shared>,
}

impl<R: Read> Connection<R> {
    /// Serve records read from `reader`, writing replies to `writer`.
    pub fn new<W>(reader: R, writer: W, config: &MuxConfig) -> Self
    where
        W: Write + Send + 'static,
    {
        Self::from_parts(RecordReader::new(reader), Box::new(writer), None, config)
    }

    fn from_parts(
        reader: RecordReader<R>,
        writer: Box<dyn Write + Send>,
        shutdown: Option<FcgiStream>,
        config: &MuxConfig,
    ) -> Self {
        Self {
            reader,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    mux: RequestMultiplexer::new(config),
                    close_requested: false,
                    pending_writes: 0,
                    shut_down: false,
                }),
                writer: Mutex::new(RecordWriter::new(writer)),
                shutdown,
            }),
        }
    }

    /// Next record, or `None` on a clean close by the peer.
    fn next_record(&mut self) -> Result<Option<Record>> {
        match self.reader.read_record() {
            Ok(record) => Ok(Some(record)),
            Err(RecordError::ConnectionClosed) if !self.reader.has_partial_record() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn route(&mut self, record: Record) -> Result<Option<MuxEvent>> {
        let event = self.shared.state()?.mux.handle_record(record);
        if let Err(err) = &event {
            debug!(error = %err, "stopping reader");
        }
        event
    }

    /// Common handling of events that do not involve the handler.
    /// Returns whether the connection should close.
    fn settle<H: Handler + ?Sized>(&mut self, handler: &H, event: MuxEvent) -> Result<bool> {
        match event {
            MuxEvent::Reply(record) => {
                self.shared.output(|_| Ok(vec![record]))?;
                Ok(false)
            }
            MuxEvent::Rejected(outcome) => self.shared.finish(|_| Ok(outcome)),
            MuxEvent::Abort {
                request_id,
                delivered: false,
            } => self.shared.finish(|mux| mux.synthesize_end(request_id)),
            MuxEvent::Abort {
                request_id,
                delivered: true,
            } => {
                handler.on_abort(request_id);
                Ok(false)
            }
            MuxEvent::Ready(ready) => Err(MuxError::Protocol(format!(
                "request {} ready outside of the serve loop",
                ready.request_id
            ))),
        }
    }

    fn close_requested(&self) -> Result<bool> {
        Ok(self.shared.state()?.close_requested)
    }

    /// Serve the connection on the calling thread.
    ///
    /// Each ready request runs to completion before the next record is
    /// read. Returns when the peer closes, when a non-keep-conn request
    /// ends, or with the first fatal error.
    pub fn serve<H: Handler + ?Sized>(&mut self, handler: &H) -> Result<ConnectionEnd> {
        loop {
            let Some(record) = self.next_record()? else {
                return Ok(ConnectionEnd::PeerClosed);
            };
            let close = match self.route(record)? {
                None => false,
                Some(MuxEvent::Ready(ready)) => run_request(handler, ready, &self.shared)?,
                Some(event) => self.settle(handler, event)?,
            };
            if close {
                return Ok(ConnectionEnd::KeepConnFalse);
            }
        }
    }

    /// Serve the connection with one worker thread per ready request.
    ///
    /// Returns once the reader stops and every worker has finished.
    pub fn serve_threaded<H>(&mut self, handler: Arc<H>) -> Result<ConnectionEnd>
    where
        H: Handler + Send + Sync + 'static,
    {
        let mut workers = Vec::new();
        let result = self.read_loop_threaded(&handler, &mut workers);

        for worker in workers {
            if worker.join().is_err() {
                warn!("request worker panicked");
            }
        }
        result
    }

    fn read_loop_threaded<H>(
        &mut self,
        handler: &Arc<H>,
        workers: &mut Vec<JoinHandle<()>>,
    ) -> Result<ConnectionEnd>
    where
        H: Handler + Send + Sync + 'static,
    {
        loop {
            let record = match self.next_record() {
                Ok(Some(record)) => record,
                Ok(None) if self.close_requested()? => return Ok(ConnectionEnd::KeepConnFalse),
                Ok(None) => return Ok(ConnectionEnd::PeerClosed),
                // The socket was shut down under us after the last request.
                Err(_) if self.close_requested()? => return Ok(ConnectionEnd::KeepConnFalse),
                Err(err) => return Err(err),
            };
            match self.route(record)? {
                None => {}
                Some(MuxEvent::Ready(ready)) => {
                    let request_id = ready.request_id;
                    let handler = Arc::clone(handler);
                    let shared = Arc::clone(&self.shared);
                    let worker = thread::Builder::new()
                        .name(format!("fcgi-request-{request_id}"))
                        .spawn(move || {
                            if let Err(err) = run_request(handler.as_ref(), ready, &shared) {
                                warn!(request_id, error = %err, "request worker failed");
                            }
                        })
                        .map_err(RecordError::Io)?;
                    workers.retain(|worker| !worker.is_finished());
                    workers.push(worker);
                }
                Some(event) => {
                    if self.settle(handler.as_ref(), event)? {
                        return Ok(ConnectionEnd::KeepConnFalse);
                    }
                }
            }
        }
    }

    /// Whether the peer ever had two requests open at once.
    pub fn is_multiplexed(&self) -> bool {
        self.shared
            .state()
            .map(|state| state.mux.is_multiplexed())
            .unwrap_or(false)
    }
}

impl Connection<FcgiStream> {
    /// Wrap an accepted transport stream, applying the configured timeouts.
    pub fn from_stream(stream: FcgiStream, config: &MuxConfig) -> Result<Self> {
        let reader = RecordReader::with_config(stream.try_clone()?, &config.record)?;
        stream.set_write_timeout(config.record.write_timeout)?;
        let shutdown = stream.try_clone()?;
        Ok(Self::from_parts(
            reader,
            Box::new(stream),
            Some(shutdown),
            config,
        ))
    }

    /// Label of the remote end, for logs.
    pub fn peer_label(&self) -> String {
        self.reader.get_ref().peer_label()
    }
}
