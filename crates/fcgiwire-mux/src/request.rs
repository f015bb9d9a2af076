use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use fcgiwire_record::{NameValuePair, RecordType, Role};

use crate::stream::StreamAssembler;

/// Lifecycle of one request on a connection.
///
/// `AwaitingData` is only entered by Filter requests. `Closed` is reported
/// for ids whose EndRequest has been emitted and that have not been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    AwaitingParams,
    AwaitingStdin,
    AwaitingData,
    Active,
    Ending,
    Closed,
}

impl RequestState {
    /// Input stream type accepted in this state, if any.
    pub fn expected_stream(self) -> Option<RecordType> {
        match self {
            Self::AwaitingParams => Some(RecordType::Params),
            Self::AwaitingStdin => Some(RecordType::Stdin),
            Self::AwaitingData => Some(RecordType::Data),
            Self::Active | Self::Ending | Self::Closed => None,
        }
    }
}

/// Cancellation flag shared between the connection and the application.
///
/// Raised when the peer sends AbortRequest. Advisory only: the request
/// still ends with an EndRequest.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A fully assembled request, handed to the application exactly once.
#[derive(Debug, Clone)]
pub struct ReadyRequest {
    pub request_id: u16,
    pub role: Role,
    pub keep_conn: bool,
    /// Params in wire order; duplicate names are kept.
    pub params: Vec<NameValuePair>,
    pub stdin: Bytes,
    /// Present for Filter requests only.
    pub data: Option<Bytes>,
    pub abort: AbortSignal,
}

impl ReadyRequest {
    /// First value for `name`, if present.
    pub fn param(&self, name: &str) -> Option<&Bytes> {
        self.params
            .iter()
            .find(|pair| pair.name.as_ref() == name.as_bytes())
            .map(|pair| &pair.value)
    }

    /// First value for `name` as text, if present and valid UTF-8.
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.param(name).and_then(|value| std::str::from_utf8(value).ok())
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }
}

/// Per-request bookkeeping owned by the multiplexer.
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) role: Role,
    pub(crate) keep_conn: bool,
    pub(crate) state: RequestState,
    params: StreamAssembler,
    pub(crate) pairs: Vec<NameValuePair>,
    stdin: StreamAssembler,
    data: Option<StreamAssembler>,
    pub(crate) abort: AbortSignal,
    pub(crate) delivered: bool,
    pub(crate) stderr_written: bool,
}

impl Request {
    pub(crate) fn new(request_id: u16, role: Role, keep_conn: bool, max_stream_size: usize) -> Self {
        Self {
            role,
            keep_conn,
            state: RequestState::AwaitingParams,
            params: StreamAssembler::new(request_id, RecordType::Params, max_stream_size),
            pairs: Vec::new(),
            stdin: StreamAssembler::new(request_id, RecordType::Stdin, max_stream_size),
            data: role
                .expects_data()
                .then(|| StreamAssembler::new(request_id, RecordType::Data, max_stream_size)),
            abort: AbortSignal::new(),
            delivered: false,
            stderr_written: false,
        }
    }

    /// Assembler for an input stream type, if this request has one.
    pub(crate) fn assembler_mut(&mut self, record_type: RecordType) -> Option<&mut StreamAssembler> {
        match record_type {
            RecordType::Params => Some(&mut self.params),
            RecordType::Stdin => Some(&mut self.stdin),
            RecordType::Data => self.data.as_mut(),
            _ => None,
        }
    }

    /// Move the assembled streams out into the application-facing form.
    pub(crate) fn deliver(&mut self, request_id: u16) -> ReadyRequest {
        self.state = RequestState::Active;
        self.delivered = true;
        ReadyRequest {
            request_id,
            role: self.role,
            keep_conn: self.keep_conn,
            params: std::mem::take(&mut self.pairs),
            stdin: self.stdin.take(),
            data: self.data.as_mut().map(StreamAssembler::take),
            abort: self.abort.clone(),
        }
    }
}
