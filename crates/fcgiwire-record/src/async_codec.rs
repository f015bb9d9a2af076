//! `tokio_util::codec` adapter for records.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_record_buf, encode_record, Record};
use crate::error::RecordError;

/// Frames a byte stream into [`Record`]s for `FramedRead`/`FramedWrite`.
///
/// An unsupported version poisons the codec: every later decode returns
/// [`RecordError::Halted`].
#[derive(Debug, Default)]
pub struct FcgiCodec {
    halted: bool,
}

impl FcgiCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FcgiCodec {
    type Item = Record;
    type Error = RecordError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Record>, RecordError> {
        if self.halted {
            return Err(RecordError::Halted);
        }
        decode_record_buf(src).inspect_err(|err| self.halted = err.is_fatal())
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Record>, RecordError> {
        match self.decode(src)? {
            Some(record) => Ok(Some(record)),
            None if src.is_empty() => Ok(None),
            None => Err(RecordError::ConnectionClosed),
        }
    }
}

impl Encoder<Record> for FcgiCodec {
    type Error = RecordError;

    fn encode(&mut self, item: Record, dst: &mut BytesMut) -> Result<(), RecordError> {
        encode_record(&item, dst)
    }
}

impl Encoder<&Record> for FcgiCodec {
    type Error = RecordError;

    fn encode(&mut self, item: &Record, dst: &mut BytesMut) -> Result<(), RecordError> {
        encode_record(item, dst)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::types::{ProtocolStatus, RecordType};

    #[tokio::test]
    async fn framed_roundtrip() {
        let mut wire = Vec::new();
        {
            let mut sink = FramedWrite::new(&mut wire, FcgiCodec::new());
            sink.send(Record::new(RecordType::Stdout, 1, &b"Status: 200\r\n\r\n"[..]))
                .await
                .unwrap();
            sink.send(Record::empty(RecordType::Stdout, 1)).await.unwrap();
            sink.send(Record::end_request(1, 0, ProtocolStatus::RequestComplete))
                .await
                .unwrap();
        }

        let mut stream = FramedRead::new(wire.as_slice(), FcgiCodec::new());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.content.as_ref(), b"Status: 200\r\n\r\n");
        assert!(stream.next().await.unwrap().unwrap().is_stream_end());
        let last = stream.next().await.unwrap().unwrap();
        assert_eq!(last.record_type, RecordType::EndRequest);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn truncated_stream_reports_closed() {
        let wire = [1u8, 6, 0, 1, 0, 9, 7, 0, b'x'];
        let mut stream = FramedRead::new(&wire[..], FcgiCodec::new());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, RecordError::ConnectionClosed));
    }

    #[test]
    fn bad_version_halts_codec() {
        let mut codec = FcgiCodec::new();
        let mut src = BytesMut::from(&[9u8, 1, 0, 1, 0, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut src).unwrap_err(),
            RecordError::UnsupportedVersion(9)
        ));
        assert!(matches!(codec.decode(&mut src).unwrap_err(), RecordError::Halted));
    }
}
