//! Typed record bodies.
//!
//! [`Record::body`] interprets the opaque content according to the record
//! type, so consumers match on [`Body`] variants instead of picking bytes
//! out of the content by hand.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{Record, NULL_REQUEST_ID};
use crate::error::{ParamsError, RecordError, Result};
use crate::namevalue::{decode_pairs, encode_pairs, NameValuePair};
use crate::types::{ProtocolStatus, RecordType, Role};

/// Flag bit in [`BeginRequestBody::flags`]: keep the connection open after
/// the request ends.
pub const FCGI_KEEP_CONN: u8 = 1;

/// Size of the fixed-layout bodies below.
pub const FIXED_BODY_SIZE: usize = 8;

/// `BeginRequest` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestBody {
    /// Raw role value; see [`BeginRequestBody::role`].
    pub role: u16,
    pub flags: u8,
}

impl BeginRequestBody {
    pub fn new(role: Role, keep_conn: bool) -> Self {
        Self {
            role: role.as_u16(),
            flags: if keep_conn { FCGI_KEEP_CONN } else { 0 },
        }
    }

    /// The requested role, if it is one this implementation knows.
    pub fn role(&self) -> Option<Role> {
        Role::from_u16(self.role)
    }

    pub fn keep_conn(&self) -> bool {
        self.flags & FCGI_KEEP_CONN != 0
    }

    pub fn decode(content: &[u8]) -> Result<Self> {
        check_len(RecordType::BeginRequest, content)?;
        Ok(Self {
            role: u16::from_be_bytes([content[0], content[1]]),
            flags: content[2],
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FIXED_BODY_SIZE);
        buf.put_u16(self.role);
        buf.put_u8(self.flags);
        buf.put_bytes(0, 5);
        buf.freeze()
    }
}

/// `EndRequest` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequestBody {
    /// Application exit code.
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

impl EndRequestBody {
    pub fn new(app_status: u32, protocol_status: ProtocolStatus) -> Self {
        Self {
            app_status,
            protocol_status,
        }
    }

    /// Unrecognized protocol status bytes decode as `RequestComplete`;
    /// the app status still carries the application's verdict.
    pub fn decode(content: &[u8]) -> Result<Self> {
        check_len(RecordType::EndRequest, content)?;
        Ok(Self {
            app_status: u32::from_be_bytes([content[0], content[1], content[2], content[3]]),
            protocol_status: ProtocolStatus::from_u8(content[4])
                .unwrap_or(ProtocolStatus::RequestComplete),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FIXED_BODY_SIZE);
        buf.put_u32(self.app_status);
        buf.put_u8(self.protocol_status.as_u8());
        buf.put_bytes(0, 3);
        buf.freeze()
    }
}

/// `UnknownType` body: echoes a record type the receiver did not understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownTypeBody {
    pub record_type: u8,
}

impl UnknownTypeBody {
    pub fn decode(content: &[u8]) -> Result<Self> {
        check_len(RecordType::UnknownType, content)?;
        Ok(Self {
            record_type: content[0],
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FIXED_BODY_SIZE);
        buf.put_u8(self.record_type);
        buf.put_bytes(0, 7);
        buf.freeze()
    }
}

fn check_len(record_type: RecordType, content: &[u8]) -> Result<()> {
    if content.len() < FIXED_BODY_SIZE {
        return Err(RecordError::InvalidBody {
            record_type,
            expected: FIXED_BODY_SIZE,
            actual: content.len(),
        });
    }
    Ok(())
}

/// A record's content interpreted according to its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    BeginRequest(BeginRequestBody),
    /// `AbortRequest` has no body.
    AbortRequest,
    EndRequest(EndRequestBody),
    /// A chunk of a Params/Stdin/Stdout/Stderr/Data stream. Params chunks
    /// are not decoded here: pairs may straddle record boundaries.
    Stream(Bytes),
    /// `GetValues` or `GetValuesResult` pairs (always a single record).
    Values(Vec<NameValuePair>),
    UnknownType(UnknownTypeBody),
    /// Content of an undefined record type.
    Opaque(Bytes),
}

/// Failure to interpret a body.
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Params(#[from] ParamsError),
}

impl Record {
    /// Interpret the content according to the record type.
    pub fn body(&self) -> std::result::Result<Body, BodyError> {
        let body = match self.record_type {
            RecordType::BeginRequest => Body::BeginRequest(BeginRequestBody::decode(&self.content)?),
            RecordType::AbortRequest => Body::AbortRequest,
            RecordType::EndRequest => Body::EndRequest(EndRequestBody::decode(&self.content)?),
            RecordType::Params
            | RecordType::Stdin
            | RecordType::Stdout
            | RecordType::Stderr
            | RecordType::Data => Body::Stream(self.content.clone()),
            RecordType::GetValues | RecordType::GetValuesResult => {
                Body::Values(decode_pairs(&self.content)?)
            }
            RecordType::UnknownType => Body::UnknownType(UnknownTypeBody::decode(&self.content)?),
            RecordType::Other(_) => Body::Opaque(self.content.clone()),
        };
        Ok(body)
    }

    /// `BeginRequest` record.
    pub fn begin_request(request_id: u16, role: Role, keep_conn: bool) -> Self {
        Self::new(
            RecordType::BeginRequest,
            request_id,
            BeginRequestBody::new(role, keep_conn).encode(),
        )
    }

    /// `AbortRequest` record.
    pub fn abort_request(request_id: u16) -> Self {
        Self::empty(RecordType::AbortRequest, request_id)
    }

    /// `EndRequest` record.
    pub fn end_request(request_id: u16, app_status: u32, protocol_status: ProtocolStatus) -> Self {
        Self::new(
            RecordType::EndRequest,
            request_id,
            EndRequestBody::new(app_status, protocol_status).encode(),
        )
    }

    /// `UnknownType` reply on the management channel.
    pub fn unknown_type(record_type: RecordType) -> Self {
        Self::new(
            RecordType::UnknownType,
            NULL_REQUEST_ID,
            UnknownTypeBody {
                record_type: record_type.into(),
            }
            .encode(),
        )
    }

    /// `GetValues` or `GetValuesResult` record on the management channel.
    ///
    /// The pairs must fit one record; management bodies are never split.
    pub fn values(
        record_type: RecordType,
        pairs: &[NameValuePair],
    ) -> std::result::Result<Self, BodyError> {
        let mut buf = BytesMut::new();
        encode_pairs(pairs, &mut buf)?;
        if buf.len() > crate::codec::MAX_CONTENT_LENGTH {
            return Err(RecordError::ContentTooLarge {
                size: buf.len(),
                max: crate::codec::MAX_CONTENT_LENGTH,
            }
            .into());
        }
        Ok(Self::new(record_type, NULL_REQUEST_ID, buf.freeze()))
    }
}
