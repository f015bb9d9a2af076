use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use fcgiwire_transport::FcgiStream;
use tracing::trace;

use crate::codec::{decode_record_buf, Record, RecordConfig, SUGGESTED_BUFFER_SIZE};
use crate::error::{RecordError, Result};

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Reads complete records from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete records,
/// strictly in wire order. After a fatal decode error (unsupported version)
/// the reader refuses to continue: every later call returns
/// [`RecordError::Halted`].
pub struct RecordReader<T> {
    inner: T,
    buf: BytesMut,
    halted: bool,
}

impl<T: Read> RecordReader<T> {
    /// Create a new record reader.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(SUGGESTED_BUFFER_SIZE),
            halted: false,
        }
    }

    /// Read the next complete record (blocking).
    ///
    /// Returns `Err(RecordError::ConnectionClosed)` when EOF is reached;
    /// [`RecordReader::has_partial_record`] tells a clean close from a
    /// truncated one.
    pub fn read_record(&mut self) -> Result<Record> {
        if self.halted {
            return Err(RecordError::Halted);
        }
        loop {
            match decode_record_buf(&mut self.buf) {
                Ok(Some(record)) => {
                    trace!(
                        record_type = ?record.record_type,
                        request_id = record.request_id,
                        len = record.content.len(),
                        "record read"
                    );
                    return Ok(record);
                }
                Ok(None) => {}
                Err(err) => {
                    self.halted = err.is_fatal();
                    return Err(err);
                }
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(RecordError::Io(err)),
            };

            if read == 0 {
                return Err(RecordError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Whether bytes of an incomplete record are buffered.
    pub fn has_partial_record(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Whether a fatal error stopped this reader.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl RecordReader<FcgiStream> {
    /// Create a record reader for `FcgiStream` and apply read timeout from config.
    pub fn with_config(inner: FcgiStream, config: &RecordConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_record_error)?;
        Ok(Self::new(inner))
    }
}

pub(crate) fn transport_to_record_error(err: fcgiwire_transport::TransportError) -> RecordError {
    match err {
        fcgiwire_transport::TransportError::Io(io)
        | fcgiwire_transport::TransportError::Accept(io) => RecordError::Io(io),
        fcgiwire_transport::TransportError::Bind { source, .. }
        | fcgiwire_transport::TransportError::Connect { source, .. } => RecordError::Io(source),
        other => RecordError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::codec::encode_record;
    use crate::types::RecordType;

    fn wire(records: &[Record]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for record in records {
            encode_record(record, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn read_single_record() {
        let bytes = wire(&[Record::new(RecordType::Params, 1, &b"hello"[..])]);
        let mut reader = RecordReader::new(Cursor::new(bytes));
        let record = reader.read_record().unwrap();

        assert_eq!(record.request_id, 1);
        assert_eq!(record.content.as_ref(), b"hello");
    }

    #[test]
    fn read_multiple_records_in_order() {
        let bytes = wire(&[
            Record::new(RecordType::Params, 1, &b"one"[..]),
            Record::new(RecordType::Params, 2, &b"two"[..]),
            Record::empty(RecordType::Params, 1),
        ]);
        let mut reader = RecordReader::new(Cursor::new(bytes));

        let r1 = reader.read_record().unwrap();
        let r2 = reader.read_record().unwrap();
        let r3 = reader.read_record().unwrap();

        assert_eq!((r1.request_id, r1.content.as_ref()), (1, b"one".as_ref()));
        assert_eq!((r2.request_id, r2.content.as_ref()), (2, b"two".as_ref()));
        assert!(r3.is_stream_end());
    }

    #[test]
    fn read_record_with_maximal_content() {
        let payload = vec![0xAB; crate::codec::MAX_CONTENT_LENGTH];
        let bytes = wire(&[Record::new(RecordType::Stdin, 9, payload.clone())]);
        let mut reader = RecordReader::new(Cursor::new(bytes));
        let record = reader.read_record().unwrap();

        assert_eq!(record.content.as_ref(), payload.as_slice());
    }

    #[test]
    fn partial_read_handling() {
        let bytes = wire(&[Record::new(RecordType::Stdin, 4, &b"slow"[..])]);
        let mut reader = RecordReader::new(ByteByByteReader { bytes, pos: 0 });

        let record = reader.read_record().unwrap();
        assert_eq!(record.request_id, 4);
        assert_eq!(record.content.as_ref(), b"slow");
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = RecordReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_record().unwrap_err();
        assert!(matches!(err, RecordError::ConnectionClosed));
        assert!(!reader.has_partial_record());
    }

    #[test]
    fn connection_closed_mid_record() {
        let mut partial = BytesMut::new();
        partial.put_slice(&[1, 5, 0, 2, 0, 16, 0, 0]);
        partial.put_slice(b"only-part");

        let mut reader = RecordReader::new(Cursor::new(partial.to_vec()));
        let err = reader.read_record().unwrap_err();
        assert!(matches!(err, RecordError::ConnectionClosed));
        assert!(reader.has_partial_record());
    }

    #[test]
    fn unsupported_version_halts_reader() {
        let mut bytes = vec![2u8, 1, 0, 1, 0, 0, 0, 0];
        bytes.extend(wire(&[Record::new(RecordType::Params, 1, &b"later"[..])]));
        let mut reader = RecordReader::new(Cursor::new(bytes));

        assert!(matches!(
            reader.read_record().unwrap_err(),
            RecordError::UnsupportedVersion(2)
        ));
        assert!(reader.is_halted());
        assert!(matches!(reader.read_record().unwrap_err(), RecordError::Halted));
    }

    #[test]
    fn interrupted_read_retries() {
        let bytes = wire(&[Record::new(RecordType::Stdin, 8, &b"ok"[..])]);
        let mut reader = RecordReader::new(InterruptedThenData {
            interrupted: false,
            inner: Cursor::new(bytes),
        });
        let record = reader.read_record().unwrap();
        assert_eq!(record.content.as_ref(), b"ok");
    }

    #[test]
    fn would_block_propagates_io_error() {
        let mut reader = RecordReader::new(WouldBlock);
        let err = reader.read_record().unwrap_err();
        assert!(matches!(err, RecordError::Io(e) if e.kind() == ErrorKind::WouldBlock));
        assert!(!reader.is_halted());
    }

    #[test]
    #[cfg(unix)]
    fn roundtrip_over_socket_pair() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut writer = crate::writer::RecordWriter::new(left);
        let mut reader = RecordReader::new(right);

        writer
            .write_record(&Record::new(RecordType::GetValues, 0, &b"\x0e\x00FCGI_MAX_CONNS"[..]))
            .unwrap();
        let record = reader.read_record().unwrap();
        assert_eq!(record.record_type, RecordType::GetValues);
        assert!(record.is_management());
    }

    #[test]
    fn accessors_and_into_inner() {
        let mut reader = RecordReader::new(Cursor::new(Vec::<u8>::new()));
        let _ = reader.get_ref();
        let _ = reader.get_mut();
        let _inner = reader.into_inner();
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedThenData {
        interrupted: bool,
        inner: Cursor<Vec<u8>>,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.inner.read(buf)
        }
    }

    struct WouldBlock;

    impl Read for WouldBlock {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::WouldBlock))
        }
    }
}
