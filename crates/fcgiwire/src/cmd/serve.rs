use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use fcgiwire_mux::{
    EndStatus, FcgiListener, Handler, ManagementValues, MuxConfig, Output, ReadyRequest,
};
use fcgiwire_transport::{ListenAddr, TcpSocket};

use crate::cmd::{parse_duration, ServeArgs};
use crate::exit::{mux_error, transport_error, CliError, CliResult, SUCCESS};
use crate::output::{lossy, OutputFormat};

/// Answers every request with a plain-text dump of what arrived.
struct DiagnosticResponder;

impl Handler for DiagnosticResponder {
    fn handle(&self, request: ReadyRequest, out: &mut Output) -> EndStatus {
        tracing::info!(
            request_id = request.request_id,
            role = %request.role,
            params = request.params.len(),
            stdin = request.stdin.len(),
            "serving request"
        );
        if let Err(err) = out.write_stdout(&render_response(&request)) {
            tracing::warn!(request_id = request.request_id, error = %err, "response write failed");
        }
        EndStatus::complete(0)
    }

    fn on_abort(&self, request_id: u16) {
        tracing::info!(request_id, "request aborted by web server");
    }
}

fn render_response(request: &ReadyRequest) -> Vec<u8> {
    let mut body = String::from("Content-Type: text/plain\r\n\r\n");
    body.push_str(&format!("request_id: {}\n", request.request_id));
    body.push_str(&format!("role: {}\n", request.role));
    body.push_str(&format!("keep_conn: {}\n", request.keep_conn));
    for pair in &request.params {
        body.push_str(&format!("{}={}\n", lossy(&pair.name), lossy(&pair.value)));
    }
    body.push_str(&format!("stdin: {} bytes\n", request.stdin.len()));
    if let Some(data) = &request.data {
        body.push_str(&format!("data: {} bytes\n", data.len()));
    }
    body.into_bytes()
}

fn build_config(args: &ServeArgs) -> CliResult<MuxConfig> {
    let mut config = MuxConfig {
        management: ManagementValues {
            max_conns: Some(args.max_conns),
            max_reqs: Some(args.max_reqs),
            mpxs_conns: Some(!args.no_mpxs),
        },
        ..MuxConfig::default()
    };
    if let Some(max) = args.max_stream_size {
        config.max_stream_size = max;
    }
    if let Some(timeout) = &args.read_timeout {
        config.record.read_timeout = Some(parse_duration(timeout)?);
    }
    Ok(config)
}

pub fn run(args: ServeArgs, _format: OutputFormat) -> CliResult<i32> {
    let config = build_config(&args)?;
    let allowed = match &args.allow {
        Some(raw) => TcpSocket::parse_allowlist(raw)
            .map_err(|err| transport_error("invalid FCGI_WEB_SERVER_ADDRS", err))?,
        None => Vec::new(),
    };
    if matches!(args.addr, ListenAddr::Unix(_)) && !allowed.is_empty() {
        tracing::warn!("web server allowlist ignored for unix sockets");
    }

    let listener = FcgiListener::bind_with_allowlist(&args.addr, allowed)
        .map_err(|err| mux_error("bind failed", err))?
        .with_config(config)
        .with_threaded(args.threaded);
    tracing::info!(
        addr = %listener.local_addr(),
        threaded = args.threaded,
        "serving"
    );

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let handler = Arc::new(DiagnosticResponder);
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    let mut accepted = 0usize;
    while running.load(Ordering::SeqCst) {
        let Some(handle) = listener
            .next_connection(&handler)
            .map_err(|err| mux_error("accept failed", err))?
        else {
            continue;
        };
        accepted = accepted.saturating_add(1);
        connections.retain(|handle| !handle.is_finished());
        connections.push(handle);

        if args.count.is_some_and(|count| accepted >= count) {
            break;
        }
    }

    for handle in connections {
        if handle.join().is_err() {
            tracing::warn!("connection thread panicked");
        }
    }
    tracing::info!(connections = accepted, "listener stopped");
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
