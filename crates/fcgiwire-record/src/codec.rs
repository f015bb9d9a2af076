use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RecordError, Result};
use crate::types::RecordType;

/// The FastCGI protocol version this implementation speaks.
pub const VERSION: u8 = 1;

/// Every record on the wire is a multiple of this many bytes.
pub const CHUNK_SIZE: usize = 8;

/// Record header: version (1) + type (1) + request id (2) + content
/// length (2) + padding length (1) + reserved (1) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest content a single record can carry.
pub const MAX_CONTENT_LENGTH: usize = u16::MAX as usize;

/// Largest padding a header can declare.
pub const MAX_PADDING: usize = u8::MAX as usize;

/// Buffer size that always fits one maximal record.
pub const SUGGESTED_BUFFER_SIZE: usize = CHUNK_SIZE * 2 + MAX_CONTENT_LENGTH;

/// Request id reserved for connection-scoped management records.
pub const NULL_REQUEST_ID: u16 = 0;

/// A single framed record.
///
/// The version is implied (always [`VERSION`]); padding is computed on
/// encode and dropped on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// What the content means.
    pub record_type: RecordType,
    /// Owning request, or [`NULL_REQUEST_ID`] for management records.
    pub request_id: u16,
    /// Opaque payload, at most [`MAX_CONTENT_LENGTH`] bytes.
    pub content: Bytes,
}

impl Record {
    /// Create a new record.
    pub fn new(record_type: RecordType, request_id: u16, content: impl Into<Bytes>) -> Self {
        Self {
            record_type,
            request_id,
            content: content.into(),
        }
    }

    /// A zero-length record: the terminator of a stream type.
    pub fn empty(record_type: RecordType, request_id: u16) -> Self {
        Self::new(record_type, request_id, Bytes::new())
    }

    /// Whether this record is addressed to the management channel.
    pub fn is_management(&self) -> bool {
        self.request_id == NULL_REQUEST_ID
    }

    /// Whether this is a stream terminator.
    pub fn is_stream_end(&self) -> bool {
        self.record_type.is_stream() && self.content.is_empty()
    }

    /// Padding the encoder appends after this record's content.
    pub fn padding_len(&self) -> usize {
        padding_for(self.content.len())
    }

    /// The total wire size of this record (header + content + padding).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.content.len() + self.padding_len()
    }

    /// Encode into a freshly allocated buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        encode_record(self, &mut buf)?;
        Ok(buf.freeze())
    }
}

/// Minimal padding that aligns a record with `content_len` bytes of content
/// to [`CHUNK_SIZE`]. Always in `0..CHUNK_SIZE`.
pub fn padding_for(content_len: usize) -> usize {
    (CHUNK_SIZE - content_len % CHUNK_SIZE) % CHUNK_SIZE
}

/// Outcome of decoding from a borrowed buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete record, and how many bytes of input it occupied
    /// (header, content and padding).
    Record { record: Record, consumed: usize },
    /// The buffer holds only part of a record; retry with more bytes.
    NeedMoreData,
}

/// Encode a record into the wire format.
///
/// Wire format:
/// ```text
/// ┌─────────┬──────┬────────────┬──────────────┬─────────┬──────────┬─────────┬─────────┐
/// │ version │ type │ request id │ content len  │ padding │ reserved │ content │ padding │
/// │ (1B)    │ (1B) │ (2B BE)    │ (2B BE)      │ len (1B)│ (1B) = 0 │         │ (zeros) │
/// └─────────┴──────┴────────────┴──────────────┴─────────┴──────────┴─────────┴─────────┘
/// ```
///
/// Callers split payloads above [`MAX_CONTENT_LENGTH`] themselves (see
/// [`encode_stream`]); oversized content is rejected.
pub fn encode_record(record: &Record, dst: &mut BytesMut) -> Result<()> {
    let len = record.content.len();
    if len > MAX_CONTENT_LENGTH {
        return Err(RecordError::ContentTooLarge {
            size: len,
            max: MAX_CONTENT_LENGTH,
        });
    }
    let padding = padding_for(len);

    dst.reserve(HEADER_SIZE + len + padding);
    dst.put_u8(VERSION);
    dst.put_u8(record.record_type.into());
    dst.put_u16(record.request_id);
    dst.put_u16(len as u16);
    dst.put_u8(padding as u8);
    dst.put_u8(0);
    dst.put_slice(&record.content);
    dst.put_bytes(0, padding);
    Ok(())
}

/// Encode `payload` as a sequence of stream records of at most
/// [`MAX_CONTENT_LENGTH`] bytes each.
///
/// Does not write the terminator; an empty payload writes nothing, so it
/// can never be mistaken for one. Returns the number of records written.
pub fn encode_stream(
    record_type: RecordType,
    request_id: u16,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<usize> {
    let mut written = 0;
    for chunk in payload.chunks(MAX_CONTENT_LENGTH) {
        let record = Record::new(record_type, request_id, Bytes::copy_from_slice(chunk));
        encode_record(&record, dst)?;
        written += 1;
    }
    Ok(written)
}

/// Encode the zero-length terminator of a stream.
pub fn encode_stream_end(record_type: RecordType, request_id: u16, dst: &mut BytesMut) {
    // An empty record never exceeds the content limit.
    let _ = encode_record(&Record::empty(record_type, request_id), dst);
}

struct Header {
    record_type: RecordType,
    request_id: u16,
    content_len: usize,
    padding_len: usize,
}

impl Header {
    fn total_len(&self) -> usize {
        HEADER_SIZE + self.content_len + self.padding_len
    }
}

fn parse_header(src: &[u8]) -> Result<Option<Header>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }
    if src[0] != VERSION {
        return Err(RecordError::UnsupportedVersion(src[0]));
    }
    // src[7] is reserved and ignored.
    Ok(Some(Header {
        record_type: RecordType::from(src[1]),
        request_id: u16::from_be_bytes([src[2], src[3]]),
        content_len: usize::from(u16::from_be_bytes([src[4], src[5]])),
        padding_len: usize::from(src[6]),
    }))
}

/// Decode one record from the front of `src` without consuming it.
///
/// Returns [`Decoded::NeedMoreData`] while the header or the declared
/// content and padding are incomplete.
pub fn decode_record(src: &[u8]) -> Result<Decoded> {
    let Some(header) = parse_header(src)? else {
        return Ok(Decoded::NeedMoreData);
    };
    let total = header.total_len();
    if src.len() < total {
        return Ok(Decoded::NeedMoreData);
    }

    let content = &src[HEADER_SIZE..HEADER_SIZE + header.content_len];
    Ok(Decoded::Record {
        record: Record {
            record_type: header.record_type,
            request_id: header.request_id,
            content: Bytes::copy_from_slice(content),
        },
        consumed: total,
    })
}

/// Decode one record from a growable buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete record yet.
/// On success, consumes the record bytes (including padding) from the
/// buffer; the content is split off without copying.
pub fn decode_record_buf(src: &mut BytesMut) -> Result<Option<Record>> {
    let Some(header) = parse_header(src)? else {
        return Ok(None);
    };
    if src.len() < header.total_len() {
        src.reserve(header.total_len() - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let content = src.split_to(header.content_len).freeze();
    src.advance(header.padding_len);

    Ok(Some(Record {
        record_type: header.record_type,
        request_id: header.request_id,
        content,
    }))
}

/// Configuration for record readers and writers.
#[derive(Debug, Clone, Default)]
pub struct RecordConfig {
    /// Read timeout applied to transport streams.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout applied to transport streams.
    pub write_timeout: Option<std::time::Duration>,
}
