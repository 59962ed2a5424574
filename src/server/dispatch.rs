/*!
Per-connection dispatcher: parse the head, authorize, route, and report errors as JSON.

Route order: authorization, the `/>/exit` control path, path resolution, then WebSocket
upgrade or method. Every error returned by a handler is reported before any response
byte was written for it.
*/

use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::cgi;
use crate::config::Config;
use crate::errors::{Operation, ShaasError};
use crate::fsentry::{self, EntryKind, FilesystemEntry};
use crate::server::auth::{self, AuthResult};
use crate::server::bridge::ProcessBridge;
use crate::server::http::{self, Method, RequestContext};
use crate::server::listing;
use crate::server::stream::{self, HttpEndpoint, StreamEndpoint};

pub const EXIT_PATH: &str = "/>/exit";

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
    cause: Option<&'a str>,
}

/// Write `err` as a pretty-printed JSON error response.
pub(crate) fn respond_error<W: Write>(w: &mut W, err: &ShaasError) {
    let message = err.message();
    let cause = err.cause();
    warn!(
        status = err.status(),
        message = %message,
        cause = cause.as_deref().unwrap_or(""),
        "request failed"
    );
    let body = ErrorBody {
        message: &message,
        cause: cause.as_deref(),
    };
    let mut json = serde_json::to_string_pretty(&body).unwrap_or_else(|_| "{}".to_string());
    json.push('\n');
    let mut extra = Vec::new();
    if err.status() == 401 {
        extra.push(("WWW-Authenticate", "Basic realm=\"shaas\"".to_string()));
    }
    if let Err(e) = http::respond_bytes(w, err.status(), "application/json", &extra, json.as_bytes()) {
        debug!(error = %e, "writing error response failed");
    }
}

/// Exit code requested by `/>/exit`: missing or empty is 0, malformed is 1.
pub fn exit_code(ctx: &RequestContext) -> i32 {
    match ctx.query_value("code") {
        None => 0,
        Some(c) if c.is_empty() => 0,
        Some(c) => c.parse::<i32>().unwrap_or(1),
    }
}

pub(crate) fn handle_connection(config: Arc<Config>, stream: TcpStream, peer: SocketAddr) {
    let (read_half, mut out) = match (stream.try_clone(), stream.try_clone()) {
        (Ok(r), Ok(o)) => (r, o),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "cloning connection failed");
            return;
        }
    };
    let mut reader = BufReader::new(read_half);
    // Port 0 binds an ephemeral port; children must see the real one
    let local_port = stream
        .local_addr()
        .map(|a| a.port())
        .unwrap_or_else(|_| config.port());
    let ctx = match http::read_request_head(&mut reader, &peer.to_string(), local_port) {
        Ok(ctx) => ctx,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return,
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
            warn!(remote = %peer, error = %e, "rejecting request");
            let _ = http::respond_bytes(&mut out, 431, "text/plain; charset=utf-8", &[], b"request headers too large\n");
            close_gracefully(&out);
            return;
        }
        Err(e) => {
            warn!(remote = %peer, error = %e, "malformed request");
            respond_error(&mut out, &ShaasError::BadRequest("Bad request".to_string()));
            close_gracefully(&out);
            return;
        }
    };

    let span = info_span!("request", method = %ctx.method, path = %ctx.path);
    let _entered = span.enter();
    info!(remote = %ctx.remote_addr, "request");

    if let Err(e) = route(&config, &ctx, reader, stream) {
        respond_error(&mut out, &e);
    }
    close_gracefully(&out);
}

/// Finish our side and give the client a moment to read before the socket closes, so
/// unread request bytes do not turn the close into a reset.
fn close_gracefully(stream: &TcpStream) {
    let _ = stream.shutdown(Shutdown::Write);
    let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));
    let mut sink = [0u8; 4096];
    let mut stream = stream;
    let mut drained = 0usize;
    while drained < 1 << 20 {
        match stream.read(&mut sink) {
            Ok(0) | Err(_) => break,
            Ok(n) => drained += n,
        }
    }
}

fn route(
    config: &Arc<Config>,
    ctx: &RequestContext,
    reader: BufReader<TcpStream>,
    stream: TcpStream,
) -> Result<(), ShaasError> {
    match auth::check(&ctx.headers, config.credentials()) {
        AuthResult::Authorized => {}
        AuthResult::Missing => return Err(ShaasError::AuthRequired),
        AuthResult::Rejected => return Err(ShaasError::AuthFailed),
    }

    if ctx.path == EXIT_PATH {
        let code = exit_code(ctx);
        info!(code, "exit requested");
        std::process::exit(code);
    }

    let entry = fsentry::inspect(&fsentry::resolve(config.root(), &ctx.path))?;

    match &ctx.method {
        Method::Get if ctx.is_websocket_upgrade() => exec_websocket(config, ctx, &entry, reader, stream),
        Method::Get => get(ctx, &entry, stream),
        Method::Post => post(config, ctx, &entry, reader, stream),
        Method::Other(m) => Err(ShaasError::MethodNotAllowed(m.clone())),
    }
}

fn get(ctx: &RequestContext, entry: &FilesystemEntry, mut stream: TcpStream) -> Result<(), ShaasError> {
    match entry.kind() {
        EntryKind::Directory => listing::serve_directory(&mut stream, ctx, entry),
        EntryKind::ExecutableFile | EntryKind::NonExecutableFile => {
            listing::serve_file(&mut stream, entry)
        }
        kind => Err(ShaasError::InvalidEntryKind {
            op: Operation::Get,
            kind,
        }),
    }
}

fn post(
    config: &Arc<Config>,
    ctx: &RequestContext,
    entry: &FilesystemEntry,
    reader: BufReader<TcpStream>,
    stream: TcpStream,
) -> Result<(), ShaasError> {
    let bridge = ProcessBridge::new(config.clone());
    let child = bridge.spawn(entry, &cgi::build(ctx, false), false)?;
    let halves = match StreamEndpoint::Http(HttpEndpoint::new(ctx, reader, stream)).split() {
        Ok(h) => h,
        Err(e) => {
            child.terminator().terminate();
            warn!(error = %e, "stream setup failed");
            return Ok(());
        }
    };
    if let Err(e) = bridge.attach(child, halves) {
        error!(error = %e, "execution failed");
    }
    Ok(())
}

fn exec_websocket(
    config: &Arc<Config>,
    ctx: &RequestContext,
    entry: &FilesystemEntry,
    reader: BufReader<TcpStream>,
    stream: TcpStream,
) -> Result<(), ShaasError> {
    let bridge = ProcessBridge::new(config.clone());
    // Reject unusable entries while a JSON error can still be sent
    bridge.command_for(entry, true)?;
    let endpoint = StreamEndpoint::WebSocket(stream::accept_websocket(ctx, reader, stream)?);
    debug!(transport = endpoint.kind(), "upgraded");
    if let Err(e) = bridge.run(entry, &cgi::build(ctx, true), endpoint, true) {
        error!(error = %e, "interactive execution failed");
    }
    Ok(())
}
