use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use fcgiwire_transport::FcgiStream;
use tracing::trace;

use crate::codec::{encode_record, encode_stream, encode_stream_end, Record, RecordConfig};
use crate::error::{RecordError, Result};
use crate::reader::transport_to_record_error;
use crate::types::{ProtocolStatus, RecordType};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete records to any `Write` stream.
///
/// Every call encodes into an internal buffer and writes it out in full
/// before returning, so records from different requests never interleave
/// mid-record.
pub struct RecordWriter<T> {
    inner: T,
    buf: BytesMut,
}

impl<T: Write> RecordWriter<T> {
    /// Create a new record writer.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Write a single record (blocking).
    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        self.buf.clear();
        encode_record(record, &mut self.buf)?;
        self.send_buffered()
    }

    /// Write several records back to back with one flush.
    pub fn write_records(&mut self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.buf.clear();
        for record in records {
            encode_record(record, &mut self.buf)?;
        }
        self.send_buffered()
    }

    /// Write `payload` on a stream, split into as many records as needed.
    ///
    /// An empty payload writes nothing; use [`RecordWriter::end_stream`] to
    /// terminate the stream.
    pub fn write_stream(
        &mut self,
        record_type: RecordType,
        request_id: u16,
        payload: &[u8],
    ) -> Result<()> {
        self.buf.clear();
        if encode_stream(record_type, request_id, payload, &mut self.buf)? == 0 {
            return Ok(());
        }
        self.send_buffered()
    }

    /// Write the empty record that closes a stream.
    pub fn end_stream(&mut self, record_type: RecordType, request_id: u16) -> Result<()> {
        self.buf.clear();
        encode_stream_end(record_type, request_id, &mut self.buf);
        self.send_buffered()
    }

    /// Write an `EndRequest` record.
    pub fn write_end_request(
        &mut self,
        request_id: u16,
        app_status: u32,
        protocol_status: ProtocolStatus,
    ) -> Result<()> {
        self.write_record(&Record::end_request(request_id, app_status, protocol_status))
    }

    fn send_buffered(&mut self) -> Result<()> {
        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(RecordError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(RecordError::Io(err)),
            }
        }
        trace!(bytes = self.buf.len(), "records written");

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(RecordError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl RecordWriter<FcgiStream> {
    /// Create a record writer for `FcgiStream` and apply write timeout from config.
    pub fn with_config(inner: FcgiStream, config: &RecordConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_record_error)?;
        Ok(Self::new(inner))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use bytes::BytesMut;

    use super::*;
    use crate::body::{Body, EndRequestBody};
    use crate::codec::{decode_record_buf, MAX_CONTENT_LENGTH};

    fn written(writer: RecordWriter<Cursor<Vec<u8>>>) -> BytesMut {
        BytesMut::from(writer.into_inner().into_inner().as_slice())
    }

    #[test]
    fn write_single_record() {
        let mut writer = RecordWriter::new(Cursor::new(Vec::<u8>::new()));
        writer
            .write_record(&Record::new(RecordType::Stdout, 1, &b"hello"[..]))
            .unwrap();

        let mut wire = written(writer);
        assert_eq!(wire.len(), 16);
        let record = decode_record_buf(&mut wire).unwrap().unwrap();
        assert_eq!(record.record_type, RecordType::Stdout);
        assert_eq!(record.content.as_ref(), b"hello");
    }

    #[test]
    fn write_stream_splits_and_terminates() {
        let mut writer = RecordWriter::new(Cursor::new(Vec::<u8>::new()));
        let payload = vec![b'x'; MAX_CONTENT_LENGTH + 1];
        writer.write_stream(RecordType::Stdout, 3, &payload).unwrap();
        writer.write_stream(RecordType::Stdout, 3, b"").unwrap();
        writer.end_stream(RecordType::Stdout, 3).unwrap();

        let mut wire = written(writer);
        let mut lens = Vec::new();
        while let Some(record) = decode_record_buf(&mut wire).unwrap() {
            assert_eq!(record.request_id, 3);
            lens.push(record.content.len());
        }
        assert_eq!(lens, vec![MAX_CONTENT_LENGTH, 1, 0]);
    }

    #[test]
    fn write_end_request_body() {
        let mut writer = RecordWriter::new(Cursor::new(Vec::<u8>::new()));
        writer
            .write_end_request(5, 42, ProtocolStatus::RequestComplete)
            .unwrap();

        let mut wire = written(writer);
        let record = decode_record_buf(&mut wire).unwrap().unwrap();
        assert_eq!(
            record.body().unwrap(),
            Body::EndRequest(EndRequestBody::new(42, ProtocolStatus::RequestComplete))
        );
    }

    #[test]
    fn write_records_batches_in_order() {
        let mut writer = RecordWriter::new(Cursor::new(Vec::<u8>::new()));
        writer
            .write_records(&[
                Record::empty(RecordType::Stdout, 1),
                Record::end_request(1, 0, ProtocolStatus::RequestComplete),
            ])
            .unwrap();

        let mut wire = written(writer);
        let first = decode_record_buf(&mut wire).unwrap().unwrap();
        let second = decode_record_buf(&mut wire).unwrap().unwrap();
        assert!(first.is_stream_end());
        assert_eq!(second.record_type, RecordType::EndRequest);
    }

    #[test]
    fn oversized_record_rejected() {
        let mut writer = RecordWriter::new(Cursor::new(Vec::<u8>::new()));
        let err = writer
            .write_record(&Record::new(RecordType::Stdout, 1, vec![0u8; MAX_CONTENT_LENGTH + 1]))
            .unwrap_err();
        assert!(matches!(err, RecordError::ContentTooLarge { .. }));
        assert!(written(writer).is_empty());
    }

    #[test]
    fn flush_propagates() {
        let sink = FlushTrackingWriter::default();
        let flag = Arc::clone(&sink.flushed);
        let mut writer = RecordWriter::new(sink);

        writer.end_stream(RecordType::Stdout, 1).unwrap();

        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn handles_interrupted_and_would_block() {
        let mut writer = RecordWriter::new(FlakyWriter {
            failures: vec![ErrorKind::Interrupted, ErrorKind::WouldBlock],
            data: Vec::new(),
        });
        writer.end_stream(RecordType::Stderr, 2).unwrap();
        assert_eq!(writer.get_ref().data.len(), 8);
    }

    #[test]
    fn connection_closed_when_write_returns_zero() {
        let mut writer = RecordWriter::new(ZeroWriter);
        let err = writer.end_stream(RecordType::Stdout, 1).unwrap_err();
        assert!(matches!(err, RecordError::ConnectionClosed));
    }

    #[derive(Default)]
    struct FlushTrackingWriter {
        flushed: Arc<AtomicBool>,
        data: Vec<u8>,
    }

    impl Write for FlushTrackingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FlakyWriter {
        failures: Vec<ErrorKind>,
        data: Vec<u8>,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Some(kind) = self.failures.pop() {
                return Err(std::io::Error::from(kind));
            }
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
