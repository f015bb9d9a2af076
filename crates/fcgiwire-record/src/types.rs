//! Protocol enumerations: record types, roles and protocol statuses.

use std::fmt;

/// Record type byte.
///
/// Undefined values are kept as [`RecordType::Other`] so the management
/// channel can echo them back in an `UnknownType` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    GetValuesResult,
    UnknownType,
    Other(u8),
}

impl From<u8> for RecordType {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::BeginRequest,
            2 => Self::AbortRequest,
            3 => Self::EndRequest,
            4 => Self::Params,
            5 => Self::Stdin,
            6 => Self::Stdout,
            7 => Self::Stderr,
            8 => Self::Data,
            9 => Self::GetValues,
            10 => Self::GetValuesResult,
            11 => Self::UnknownType,
            other => Self::Other(other),
        }
    }
}

impl From<RecordType> for u8 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::Stdin => 5,
            RecordType::Stdout => 6,
            RecordType::Stderr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::UnknownType => 11,
            RecordType::Other(other) => other,
        }
    }
}

impl RecordType {
    /// Management record types travel on request id 0.
    pub fn is_management(self) -> bool {
        matches!(
            self,
            Self::GetValues | Self::GetValuesResult | Self::UnknownType
        )
    }

    /// Stream types carry a byte sequence terminated by an empty record.
    pub fn is_stream(self) -> bool {
        matches!(
            self,
            Self::Params | Self::Stdin | Self::Stdout | Self::Stderr | Self::Data
        )
    }

    /// Types a web server sends to an application.
    pub fn is_inbound(self) -> bool {
        matches!(
            self,
            Self::BeginRequest
                | Self::AbortRequest
                | Self::Params
                | Self::Stdin
                | Self::Data
                | Self::GetValues
        )
    }
}

/// Role requested by the web server in `BeginRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Receives the request and produces the response (CGI/1.1 semantics).
    Responder,
    /// Produces an authorized/unauthorized decision.
    Authorizer,
    /// Like a responder, with an extra Data stream to filter.
    Filter,
}

impl Role {
    /// Parse a wire role value; `None` for values this implementation
    /// does not know.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Responder),
            2 => Some(Self::Authorizer),
            3 => Some(Self::Filter),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::Responder => 1,
            Self::Authorizer => 2,
            Self::Filter => 3,
        }
    }

    /// Whether requests in this role carry a Data stream after Stdin.
    pub fn expects_data(self) -> bool {
        self == Self::Filter
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Responder => "responder",
            Self::Authorizer => "authorizer",
            Self::Filter => "filter",
        };
        f.write_str(name)
    }
}

/// Protocol-level outcome reported in `EndRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolStatus {
    /// Normal end of request.
    RequestComplete,
    /// Rejected: the application does not multiplex requests on one connection.
    CantMpxConn,
    /// Rejected: the application ran out of some resource.
    Overloaded,
    /// Rejected: the requested role is unknown to the application.
    UnknownRole,
}

impl ProtocolStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::RequestComplete),
            1 => Some(Self::CantMpxConn),
            2 => Some(Self::Overloaded),
            3 => Some(Self::UnknownRole),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::RequestComplete => 0,
            Self::CantMpxConn => 1,
            Self::Overloaded => 2,
            Self::UnknownRole => 3,
        }
    }
}
