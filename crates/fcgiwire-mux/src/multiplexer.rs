//! Per-connection request table and lifecycle state machine.
//!
//! The multiplexer consumes decoded records strictly in wire order and
//! turns them into [`MuxEvent`]s. It owns every in-flight request; the
//! application only ever sees the [`ReadyRequest`] handed out once all of
//! a request's input streams are closed.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use fcgiwire_record::{
    decode_pairs, BeginRequestBody, ProtocolStatus, Record, RecordType, MAX_CONTENT_LENGTH,
};
use tracing::{debug, trace, warn};

use crate::config::MuxConfig;
use crate::error::{MuxError, Result};
use crate::management::ManagementChannel;
use crate::request::{ReadyRequest, Request, RequestState};
use crate::stream::StreamEvent;

/// Something the connection driver has to act on.
#[derive(Debug)]
pub enum MuxEvent {
    /// All input streams of a request are complete.
    Ready(ReadyRequest),
    /// The peer aborted a request. `delivered` tells whether the
    /// application already holds it; if not, the driver should answer with
    /// [`RequestMultiplexer::synthesize_end`] right away.
    Abort { request_id: u16, delivered: bool },
    /// A request was refused before reaching the application.
    Rejected(EndOutcome),
    /// Reply to a management record.
    Reply(Record),
}

/// Records closing out a request, and whether the transport should be
/// closed once they are flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOutcome {
    pub request_id: u16,
    pub records: Vec<Record>,
    pub close_connection: bool,
}

/// Routes records to requests by request id.
#[derive(Debug)]
pub struct RequestMultiplexer {
    max_stream_size: usize,
    management: ManagementChannel,
    requests: HashMap<u16, Request>,
    /// Ids ended or refused on this connection and not yet reused. Late
    /// records the peer sent before seeing our EndRequest are dropped.
    retired: HashSet<u16>,
    multiplexed: bool,
    halted: bool,
}

impl Default for RequestMultiplexer {
    fn default() -> Self {
        Self::new(&MuxConfig::default())
    }
}

impl RequestMultiplexer {
    pub fn new(config: &MuxConfig) -> Self {
        Self {
            max_stream_size: config.max_stream_size,
            management: ManagementChannel::new(config.management.clone()),
            requests: HashMap::new(),
            retired: HashSet::new(),
            multiplexed: false,
            halted: false,
        }
    }

    /// Route one inbound record.
    ///
    /// Fatal errors halt the multiplexer: every later call returns
    /// [`MuxError::Halted`] without looking at the record.
    pub fn handle_record(&mut self, record: Record) -> Result<Option<MuxEvent>> {
        if self.halted {
            return Err(MuxError::Halted);
        }
        trace!(
            record_type = ?record.record_type,
            request_id = record.request_id,
            len = record.content.len(),
            "routing record"
        );
        let result = self.route(record);
        if let Err(err) = &result {
            if err.is_fatal() {
                warn!(error = %err, "halting connection");
                self.halted = true;
            }
        }
        result
    }

    fn route(&mut self, record: Record) -> Result<Option<MuxEvent>> {
        if record.is_management() {
            let reply = self.management.handle(record.record_type, &record.content);
            return Ok(Some(MuxEvent::Reply(reply)));
        }
        match record.record_type {
            RecordType::BeginRequest => self.begin(&record),
            RecordType::AbortRequest => self.abort(record.request_id),
            RecordType::Params | RecordType::Stdin | RecordType::Data => self.stream(&record),
            other => Err(MuxError::Protocol(format!(
                "{other:?} record is not accepted from the web server (request {})",
                record.request_id
            ))),
        }
    }

    fn begin(&mut self, record: &Record) -> Result<Option<MuxEvent>> {
        let id = record.request_id;
        if self.requests.contains_key(&id) {
            return Err(MuxError::call_seq(id, "BeginRequest for an open request"));
        }
        let body = BeginRequestBody::decode(&record.content)?;
        self.retired.remove(&id);

        let Some(role) = body.role() else {
            warn!(request_id = id, role = body.role, "unknown role; rejecting request");
            self.retired.insert(id);
            return Ok(Some(MuxEvent::Rejected(EndOutcome {
                request_id: id,
                records: vec![Record::end_request(id, 0, ProtocolStatus::UnknownRole)],
                close_connection: !body.keep_conn() && self.requests.is_empty(),
            })));
        };

        if !self.requests.is_empty() && !self.multiplexed {
            self.multiplexed = true;
            debug!(request_id = id, open = self.requests.len(), "peer multiplexes requests");
        }
        self.requests.insert(
            id,
            Request::new(id, role, body.keep_conn(), self.max_stream_size),
        );
        debug!(request_id = id, %role, keep_conn = body.keep_conn(), "request opened");
        Ok(None)
    }

    fn abort(&mut self, id: u16) -> Result<Option<MuxEvent>> {
        let Some(request) = self.requests.get_mut(&id) else {
            return self.unknown_request(id, RecordType::AbortRequest);
        };
        if request.state == RequestState::Ending {
            trace!(request_id = id, "duplicate AbortRequest");
            return Ok(None);
        }
        request.state = RequestState::Ending;
        request.abort.raise();
        debug!(request_id = id, delivered = request.delivered, "request aborted");
        Ok(Some(MuxEvent::Abort {
            request_id: id,
            delivered: request.delivered,
        }))
    }

    fn stream(&mut self, record: &Record) -> Result<Option<MuxEvent>> {
        let id = record.request_id;
        let record_type = record.record_type;
        let Some(request) = self.requests.get_mut(&id) else {
            return self.unknown_request(id, record_type);
        };
        if request.state == RequestState::Ending {
            trace!(request_id = id, ?record_type, "dropping input for aborted request");
            return Ok(None);
        }
        let state = request.state;
        let role = request.role;
        let Some(assembler) = request.assembler_mut(record_type) else {
            return Err(MuxError::call_seq(
                id,
                format!("{record_type:?} record for a {role} request"),
            ));
        };
        if assembler.is_closed() {
            return Err(MuxError::call_seq(
                id,
                format!("{record_type:?} record after its stream was closed"),
            ));
        }
        if state.expected_stream() != Some(record_type) {
            return Err(MuxError::call_seq(
                id,
                format!("{record_type:?} record while {state:?}"),
            ));
        }

        match assembler.feed(id, record_type, &record.content) {
            StreamEvent::Appended => Ok(None),
            StreamEvent::Closed => self.advance(id),
            StreamEvent::AlreadyClosed => Err(MuxError::call_seq(
                id,
                format!("{record_type:?} record after its stream was closed"),
            )),
            StreamEvent::TooLarge => {
                warn!(
                    request_id = id,
                    ?record_type,
                    limit = self.max_stream_size,
                    "input stream too large; rejecting request"
                );
                Ok(Some(self.reject(id, ProtocolStatus::Overloaded)))
            }
        }
    }

    /// Step past a stream that just closed.
    fn advance(&mut self, id: u16) -> Result<Option<MuxEvent>> {
        let Some(request) = self.requests.get_mut(&id) else {
            return Err(MuxError::UnknownRequest(id));
        };
        match request.state {
            RequestState::AwaitingParams => {
                let raw = request
                    .assembler_mut(RecordType::Params)
                    .map(|params| params.take())
                    .unwrap_or_default();
                match decode_pairs(&raw) {
                    Ok(pairs) => {
                        trace!(request_id = id, count = pairs.len(), "params complete");
                        request.pairs = pairs;
                        request.state = RequestState::AwaitingStdin;
                        Ok(None)
                    }
                    Err(err) => {
                        warn!(request_id = id, error = %err, "malformed params; rejecting request");
                        Ok(Some(self.reject(id, ProtocolStatus::UnknownRole)))
                    }
                }
            }
            RequestState::AwaitingStdin if request.role.expects_data() => {
                request.state = RequestState::AwaitingData;
                Ok(None)
            }
            RequestState::AwaitingStdin | RequestState::AwaitingData => {
                let ready = request.deliver(id);
                debug!(
                    request_id = id,
                    role = %ready.role,
                    params = ready.params.len(),
                    stdin = ready.stdin.len(),
                    "request ready"
                );
                Ok(Some(MuxEvent::Ready(ready)))
            }
            state => Err(MuxError::call_seq(id, format!("stream closed while {state:?}"))),
        }
    }

    fn reject(&mut self, id: u16, status: ProtocolStatus) -> MuxEvent {
        let keep_conn = self
            .requests
            .remove(&id)
            .map(|request| request.keep_conn)
            .unwrap_or(true);
        self.retired.insert(id);
        MuxEvent::Rejected(EndOutcome {
            request_id: id,
            records: vec![Record::end_request(id, 0, status)],
            close_connection: !keep_conn && self.requests.is_empty(),
        })
    }

    fn unknown_request(&self, id: u16, record_type: RecordType) -> Result<Option<MuxEvent>> {
        if self.retired.contains(&id) {
            trace!(request_id = id, ?record_type, "dropping record for retired request");
            return Ok(None);
        }
        Err(MuxError::Protocol(format!(
            "{record_type:?} record for unknown request {id}"
        )))
    }

    /// Stdout records carrying `data`. Empty input yields no records.
    pub fn write_stdout(&mut self, request_id: u16, data: &[u8]) -> Result<Vec<Record>> {
        self.output(request_id, RecordType::Stdout, data)
    }

    /// Stderr records carrying `data`. Empty input yields no records.
    pub fn write_stderr(&mut self, request_id: u16, data: &[u8]) -> Result<Vec<Record>> {
        self.output(request_id, RecordType::Stderr, data)
    }

    fn output(&mut self, id: u16, record_type: RecordType, data: &[u8]) -> Result<Vec<Record>> {
        if self.halted {
            return Err(MuxError::Halted);
        }
        let request = self
            .requests
            .get_mut(&id)
            .ok_or(MuxError::UnknownRequest(id))?;
        if record_type == RecordType::Stderr && !data.is_empty() {
            request.stderr_written = true;
        }
        Ok(data
            .chunks(MAX_CONTENT_LENGTH)
            .map(|chunk| Record::new(record_type, id, Bytes::copy_from_slice(chunk)))
            .collect())
    }

    /// Close out a request: stream terminators, then EndRequest.
    ///
    /// The Stderr terminator is only sent if stderr was written.
    pub fn end_request(
        &mut self,
        request_id: u16,
        app_status: u32,
        protocol_status: ProtocolStatus,
    ) -> Result<EndOutcome> {
        if self.halted {
            return Err(MuxError::Halted);
        }
        let request = self
            .requests
            .remove(&request_id)
            .ok_or(MuxError::UnknownRequest(request_id))?;
        self.retired.insert(request_id);

        let mut records = vec![Record::empty(RecordType::Stdout, request_id)];
        if request.stderr_written {
            records.push(Record::empty(RecordType::Stderr, request_id));
        }
        records.push(Record::end_request(request_id, app_status, protocol_status));

        let close_connection = !request.keep_conn && self.requests.is_empty();
        debug!(
            request_id,
            app_status,
            ?protocol_status,
            close_connection,
            "request ended"
        );
        Ok(EndOutcome {
            request_id,
            records,
            close_connection,
        })
    }

    /// End a request the application never saw or did not finish.
    pub fn synthesize_end(&mut self, request_id: u16) -> Result<EndOutcome> {
        self.end_request(request_id, 0, ProtocolStatus::RequestComplete)
    }

    /// Number of requests not yet ended.
    pub fn open_requests(&self) -> usize {
        self.requests.len()
    }

    /// Ids of requests not yet ended, in no particular order.
    pub fn open_request_ids(&self) -> Vec<u16> {
        self.requests.keys().copied().collect()
    }

    /// Whether the peer ever had two requests open at once.
    pub fn is_multiplexed(&self) -> bool {
        self.multiplexed
    }

    /// Current state of a request id. `None` if it was never opened.
    pub fn state(&self, request_id: u16) -> Option<RequestState> {
        self.requests
            .get(&request_id)
            .map(|request| request.state)
            .or_else(|| self.retired.contains(&request_id).then_some(RequestState::Closed))
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn management(&self) -> &ManagementChannel {
        &self.management
    }
}
