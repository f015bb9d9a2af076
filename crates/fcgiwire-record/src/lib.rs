//! FastCGI record framing.
//!
//! Every FastCGI message travels as one or more records:
//! - An 8-byte header (version, type, big-endian request id and content
//!   length, padding length, reserved byte)
//! - Up to 65535 bytes of content
//! - Zero padding up to the next multiple of 8
//!
//! Readers hand out complete records only; writers never interleave two
//! records on the wire.

pub mod body;
pub mod codec;
pub mod error;
pub mod namevalue;
pub mod reader;
pub mod types;
pub mod writer;

#[cfg(feature = "async")]
pub mod async_codec;

pub use body::{BeginRequestBody, Body, BodyError, EndRequestBody, UnknownTypeBody, FCGI_KEEP_CONN};
pub use codec::{
    decode_record, decode_record_buf, encode_record, encode_stream, encode_stream_end,
    padding_for, Decoded, Record, RecordConfig, CHUNK_SIZE, HEADER_SIZE, MAX_CONTENT_LENGTH,
    NULL_REQUEST_ID, SUGGESTED_BUFFER_SIZE, VERSION,
};
pub use error::{ParamsError, RecordError, Result};
pub use namevalue::{decode_pairs, encode_pairs, encoded_len, NameValuePair, MAX_PAIR_LENGTH};
pub use reader::RecordReader;
pub use types::{ProtocolStatus, RecordType, Role};
pub use writer::RecordWriter;

#[cfg(feature = "async")]
pub use async_codec::FcgiCodec;
