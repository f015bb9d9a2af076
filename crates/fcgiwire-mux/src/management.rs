//! Answers to records on request id 0.

use bytes::Bytes;
use fcgiwire_record::{
    decode_pairs, encoded_len, NameValuePair, Record, RecordType, MAX_CONTENT_LENGTH,
    NULL_REQUEST_ID,
};
use tracing::{debug, warn};

use crate::config::ManagementValues;

/// Connection-scoped management queries. Holds no per-request state.
#[derive(Debug, Clone, Default)]
pub struct ManagementChannel {
    values: ManagementValues,
}

impl ManagementChannel {
    pub fn new(values: ManagementValues) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &ManagementValues {
        &self.values
    }

    /// Build the reply to one management record.
    ///
    /// GetValues gets a GetValuesResult with the recognized names, in query
    /// order. Every other type gets UnknownType echoing the type byte.
    pub fn handle(&self, record_type: RecordType, content: &[u8]) -> Record {
        match record_type {
            RecordType::GetValues => self.get_values(content),
            other => {
                debug!(record_type = u8::from(other), "unknown management record");
                Record::unknown_type(other)
            }
        }
    }

    fn get_values(&self, content: &[u8]) -> Record {
        let names = decode_pairs(content).unwrap_or_else(|err| {
            warn!(error = %err, "malformed GetValues body; replying with no values");
            Vec::new()
        });

        let mut answers = Vec::with_capacity(names.len());
        let mut size = 0;
        for query in names {
            let Some(value) = self.values.lookup(&query.name) else {
                continue;
            };
            let answer = NameValuePair::new(query.name, value);
            size += encoded_len(std::slice::from_ref(&answer));
            if size > MAX_CONTENT_LENGTH {
                warn!("GetValuesResult would not fit one record; truncating");
                break;
            }
            answers.push(answer);
        }
        debug!(answered = answers.len(), "GetValues");

        Record::values(RecordType::GetValuesResult, &answers).unwrap_or_else(|err| {
            warn!(error = %err, "GetValuesResult encoding failed");
            Record::new(RecordType::GetValuesResult, NULL_REQUEST_ID, Bytes::new())
        })
    }
}
