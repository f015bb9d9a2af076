//! Reassembly of one logical input stream from its records.

use bytes::{Bytes, BytesMut};
use fcgiwire_record::RecordType;

/// Result of feeding one record's content to a [`StreamAssembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// Content appended; the stream is still open.
    Appended,
    /// The zero-length terminator arrived; the stream is complete.
    Closed,
    /// A record arrived after the terminator. Nothing was appended.
    AlreadyClosed,
    /// Appending would exceed the size bound. Nothing was appended.
    TooLarge,
}

/// Accumulates the content of one `(request id, stream type)` pair.
///
/// Content is kept in arrival order; a zero-length record closes the stream
/// without contributing bytes.
#[derive(Debug)]
pub struct StreamAssembler {
    request_id: u16,
    record_type: RecordType,
    max_size: usize,
    buf: BytesMut,
    closed: bool,
}

impl StreamAssembler {
    pub fn new(request_id: u16, record_type: RecordType, max_size: usize) -> Self {
        Self {
            request_id,
            record_type,
            max_size,
            buf: BytesMut::new(),
            closed: false,
        }
    }

    /// Feed the content of one record belonging to this stream.
    pub fn feed(&mut self, request_id: u16, record_type: RecordType, content: &[u8]) -> StreamEvent {
        debug_assert_eq!(
            (request_id, record_type),
            (self.request_id, self.record_type),
            "record fed to the wrong stream"
        );
        if self.closed {
            return StreamEvent::AlreadyClosed;
        }
        if content.is_empty() {
            self.closed = true;
            return StreamEvent::Closed;
        }
        if self.buf.len().saturating_add(content.len()) > self.max_size {
            return StreamEvent::TooLarge;
        }
        self.buf.extend_from_slice(content);
        StreamEvent::Appended
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes accumulated so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    /// Hand out the assembled bytes, leaving the assembler empty.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdin(max: usize) -> StreamAssembler {
        StreamAssembler::new(1, RecordType::Stdin, max)
    }

    #[test]
    fn concatenates_in_arrival_order() {
        let mut stream = stdin(1024);
        assert_eq!(stream.feed(1, RecordType::Stdin, b"ab"), StreamEvent::Appended);
        assert_eq!(stream.feed(1, RecordType::Stdin, b"cd"), StreamEvent::Appended);
        assert_eq!(stream.feed(1, RecordType::Stdin, b""), StreamEvent::Closed);
        assert!(stream.is_closed());
        assert_eq!(stream.take().as_ref(), b"abcd");
    }

    #[test]
    fn terminator_alone_is_empty_stream() {
        let mut stream = stdin(1024);
        assert_eq!(stream.feed(1, RecordType::Stdin, b""), StreamEvent::Closed);
        assert!(stream.is_empty());
        assert!(stream.take().is_empty());
    }

    #[test]
    fn record_after_terminator_is_rejected() {
        let mut stream = stdin(1024);
        stream.feed(1, RecordType::Stdin, b"x");
        stream.feed(1, RecordType::Stdin, b"");
        assert_eq!(stream.feed(1, RecordType::Stdin, b"late"), StreamEvent::AlreadyClosed);
        assert_eq!(stream.feed(1, RecordType::Stdin, b""), StreamEvent::AlreadyClosed);
        assert_eq!(stream.len(), 1);
    }

    #[test]
    fn size_bound_is_enforced() {
        let mut stream = stdin(4);
        assert_eq!(stream.feed(1, RecordType::Stdin, b"abcd"), StreamEvent::Appended);
        assert_eq!(stream.feed(1, RecordType::Stdin, b"e"), StreamEvent::TooLarge);
        assert_eq!(stream.len(), 4);
        assert!(!stream.is_closed());
    }
}
