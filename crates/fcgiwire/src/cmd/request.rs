use std::fs;
use std::path::Path;

use bytes::BytesMut;
use fcgiwire_record::{
    encode_pairs, Body, NameValuePair, ProtocolStatus, Record, RecordConfig, RecordReader,
    RecordType, RecordWriter, Role,
};
use fcgiwire_transport::FcgiStream;

use crate::cmd::{parse_duration, RequestArgs};
use crate::exit::{
    io_error, record_error, transport_error, CliError, CliResult, DATA_INVALID, FAILURE,
    PROTOCOL_ERROR, USAGE,
};
use crate::output::{lossy, print_response, OutputFormat, ResponseOutput};

/// What came back for one request.
#[derive(Debug, Default)]
struct Response {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    app_status: u32,
    protocol_status: Option<ProtocolStatus>,
}

pub fn run(args: RequestArgs, format: OutputFormat) -> CliResult<i32> {
    let role = Role::from(args.role);
    if args.data.is_some() && !role.expects_data() {
        return Err(CliError::new(USAGE, "--data requires --role filter"));
    }
    let params = encode_params(&parse_params(&args.params)?)?;
    let stdin = read_optional(args.stdin.as_deref())?;
    let data = read_optional(args.data.as_deref())?;

    let timeout = parse_duration(&args.timeout)?;
    let config = RecordConfig {
        read_timeout: Some(timeout),
        write_timeout: Some(timeout),
    };
    let stream = args
        .addr
        .connect()
        .map_err(|err| transport_error("connect failed", err))?;
    let write_half = stream
        .try_clone()
        .map_err(|err| transport_error("connect failed", err))?;
    let mut writer = RecordWriter::with_config(write_half, &config)
        .map_err(|err| record_error("connect failed", err))?;
    let mut reader = RecordReader::with_config(stream, &config)
        .map_err(|err| record_error("connect failed", err))?;

    let id = args.request_id;
    let data = role.expects_data().then_some(&data[..]);
    send_request(&mut writer, id, role, &params, &stdin, data)
        .map_err(|err| record_error("send failed", err))?;
    let response = read_response(&mut reader, id)?;

    let Some(protocol_status) = response.protocol_status else {
        return Err(CliError::new(FAILURE, "connection closed before EndRequest"));
    };
    let out = ResponseOutput {
        request_id: id,
        app_status: response.app_status,
        protocol_status: status_name(protocol_status).to_string(),
        stdout: lossy(&response.stdout),
        stderr: lossy(&response.stderr),
    };
    print_response(&out, &response.stdout, &response.stderr, format);

    if protocol_status != ProtocolStatus::RequestComplete {
        return Err(CliError::new(
            FAILURE,
            format!("request rejected: {}", status_name(protocol_status)),
        ));
    }
    Ok(i32::try_from(response.app_status).unwrap_or(FAILURE))
}

fn parse_params(raw: &[String]) -> CliResult<Vec<NameValuePair>> {
    raw.iter()
        .map(|param| match param.split_once('=') {
            Some((name, value)) if !name.is_empty() => {
                Ok(NameValuePair::new(name.to_string(), value.to_string()))
            }
            _ => Err(CliError::new(
                USAGE,
                format!("invalid --param '{param}': expected NAME=VALUE"),
            )),
        })
        .collect()
}

fn encode_params(params: &[NameValuePair]) -> CliResult<BytesMut> {
    let mut encoded = BytesMut::new();
    encode_pairs(params, &mut encoded)
        .map_err(|err| CliError::new(DATA_INVALID, format!("invalid params: {err}")))?;
    Ok(encoded)
}

fn read_optional(path: Option<&Path>) -> CliResult<Vec<u8>> {
    match path {
        Some(path) => fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err)),
        None => Ok(Vec::new()),
    }
}

/// BeginRequest, then each input stream in order, each closed with an
/// empty record.
fn send_request(
    writer: &mut RecordWriter<FcgiStream>,
    id: u16,
    role: Role,
    params: &[u8],
    stdin: &[u8],
    data: Option<&[u8]>,
) -> fcgiwire_record::Result<()> {
    writer.write_record(&Record::begin_request(id, role, false))?;
    writer.write_stream(RecordType::Params, id, params)?;
    writer.end_stream(RecordType::Params, id)?;
    writer.write_stream(RecordType::Stdin, id, stdin)?;
    writer.end_stream(RecordType::Stdin, id)?;
    if let Some(data) = data {
        writer.write_stream(RecordType::Data, id, data)?;
        writer.end_stream(RecordType::Data, id)?;
    }
    Ok(())
}

fn read_response<T: std::io::Read>(reader: &mut RecordReader<T>, id: u16) -> CliResult<Response> {
    let mut response = Response::default();
    loop {
        let record = match reader.read_record() {
            Ok(record) => record,
            Err(fcgiwire_record::RecordError::ConnectionClosed) => return Ok(response),
            Err(err) => return Err(record_error("receive failed", err)),
        };
        if record.request_id != id {
            tracing::debug!(
                request_id = record.request_id,
                record_type = ?record.record_type,
                "ignoring record for another request"
            );
            continue;
        }
        match record.record_type {
            RecordType::Stdout => response.stdout.extend_from_slice(&record.content),
            RecordType::Stderr => response.stderr.extend_from_slice(&record.content),
            RecordType::EndRequest => {
                let Ok(Body::EndRequest(end)) = record.body() else {
                    return Err(CliError::new(PROTOCOL_ERROR, "malformed EndRequest body"));
                };
                response.app_status = end.app_status;
                response.protocol_status = Some(end.protocol_status);
                return Ok(response);
            }
            other => {
                return Err(CliError::new(
                    PROTOCOL_ERROR,
                    format!("unexpected {other:?} record for request {id}"),
                ))
            }
        }
    }
}

fn status_name(status: ProtocolStatus) -> &'static str {
    match status {
        ProtocolStatus::RequestComplete => "request_complete",
        ProtocolStatus::CantMpxConn => "cant_mpx_conn",
        ProtocolStatus::Overloaded => "overloaded",
        ProtocolStatus::UnknownRole => "unknown_role",
    }
}
