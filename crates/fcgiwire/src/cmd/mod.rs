use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use fcgiwire_mux::DEFAULT_MAX_REQS;
use fcgiwire_record::Role;
use fcgiwire_transport::ListenAddr;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod probe;
pub mod request;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve FastCGI requests with a built-in diagnostic responder.
    Serve(ServeArgs),
    /// Query an application's management values (FCGI_GET_VALUES).
    Probe(ProbeArgs),
    /// Send one request to an application and print its response.
    Request(RequestArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Probe(args) => probe::run(args, format),
        Command::Request(args) => request::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on (socket path, unix:PATH, or host:port).
    pub addr: ListenAddr,
    /// Run each request on its own worker thread.
    #[arg(long)]
    pub threaded: bool,
    /// FCGI_MAX_CONNS reported to the web server.
    #[arg(long, default_value = "1")]
    pub max_conns: u32,
    /// FCGI_MAX_REQS reported to the web server.
    #[arg(long, default_value_t = DEFAULT_MAX_REQS)]
    pub max_reqs: u32,
    /// Report FCGI_MPXS_CONNS=0.
    #[arg(long)]
    pub no_mpxs: bool,
    /// Largest accepted Params, Stdin or Data stream, in bytes.
    #[arg(long, value_name = "BYTES")]
    pub max_stream_size: Option<usize>,
    /// Per-connection read timeout (e.g. 30s, 500ms).
    #[arg(long)]
    pub read_timeout: Option<String>,
    /// Comma-separated web server addresses allowed to connect over TCP.
    #[arg(long, env = "FCGI_WEB_SERVER_ADDRS", value_name = "ADDRS")]
    pub allow: Option<String>,
    /// Exit after serving N connections.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Application address (socket path, unix:PATH, or host:port).
    pub addr: ListenAddr,
    /// Read timeout for the reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum RoleArg {
    Responder,
    Authorizer,
    Filter,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Responder => Role::Responder,
            RoleArg::Authorizer => Role::Authorizer,
            RoleArg::Filter => Role::Filter,
        }
    }
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    /// Application address (socket path, unix:PATH, or host:port).
    pub addr: ListenAddr,
    /// Request parameter as NAME=VALUE (repeatable).
    #[arg(long = "param", short = 'p', value_name = "NAME=VALUE")]
    pub params: Vec<String>,
    /// Read the request body (Stdin stream) from a file.
    #[arg(long, value_name = "FILE")]
    pub stdin: Option<PathBuf>,
    /// Read the Data stream from a file (filter role only).
    #[arg(long, value_name = "FILE")]
    pub data: Option<PathBuf>,
    /// Role requested in BeginRequest.
    #[arg(long, value_enum, default_value = "responder")]
    pub role: RoleArg,
    /// Request id to use.
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u16).range(1..))]
    pub request_id: u16,
    /// Read timeout for the response (e.g. 30s, 500ms).
    #[arg(long, default_value = "30s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `150ms`, `2s` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert_eq!(parse_duration("").unwrap_err().code, USAGE);
    }
}
