use fcgiwire_mux::{FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS};
use fcgiwire_record::{
    Body, NameValuePair, Record, RecordConfig, RecordReader, RecordType, RecordWriter,
};

use crate::cmd::{parse_duration, ProbeArgs};
use crate::exit::{record_error, transport_error, CliError, CliResult, PROTOCOL_ERROR, SUCCESS};
use crate::output::{print_values, OutputFormat};

/// The names every FastCGI application is expected to understand.
const PROBED_NAMES: [&str; 3] = [FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS];

pub fn run(args: ProbeArgs, format: OutputFormat) -> CliResult<i32> {
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

    writer
        .write_record(&get_values_query()?)
        .map_err(|err| record_error("send failed", err))?;

    let pairs = loop {
        let record = reader
            .read_record()
            .map_err(|err| record_error("receive failed", err))?;
        match (record.record_type, record.request_id) {
            (RecordType::GetValuesResult, 0) => break parse_result(&record)?,
            (RecordType::UnknownType, 0) => {
                return Err(CliError::new(
                    PROTOCOL_ERROR,
                    "application does not support FCGI_GET_VALUES",
                ))
            }
            (record_type, request_id) => {
                tracing::debug!(?record_type, request_id, "ignoring unexpected record");
            }
        }
    };

    print_values(&args.addr.to_string(), &pairs, format);
    Ok(SUCCESS)
}

fn get_values_query() -> CliResult<Record> {
    let names: Vec<NameValuePair> = PROBED_NAMES
        .iter()
        .map(|name| NameValuePair::name_only(*name))
        .collect();
    Record::values(RecordType::GetValues, &names)
        .map_err(|err| CliError::new(crate::exit::INTERNAL, format!("query encoding failed: {err}")))
}

fn parse_result(record: &Record) -> CliResult<Vec<NameValuePair>> {
    match record.body() {
        Ok(Body::Values(pairs)) => Ok(pairs),
        Ok(other) => Err(CliError::new(
            PROTOCOL_ERROR,
            format!("unexpected GetValuesResult body: {other:?}"),
        )),
        Err(err) => Err(CliError::new(
            PROTOCOL_ERROR,
            format!("malformed GetValuesResult: {err}"),
        )),
    }
}
