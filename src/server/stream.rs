/*!
Bidirectional byte streams between a client connection and a child process.

A `StreamEndpoint` is either a chunked HTTP response paired with the request body, or an
upgraded WebSocket. Both are split into a `ByteSource` (client to child) and a
`FlushSink` (child to client) that run on separate threads. Every sink write reaches the
client before `write` returns.
*/

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tungstenite::handshake::derive_accept_key;
use tungstenite::protocol::Role;
use tungstenite::{Message, WebSocket};

use crate::errors::ShaasError;
use crate::server::http::{self, BodyReader, ChunkedWriter, RequestContext};

/// Read poll interval for WebSocket input. Writers take the socket lock between polls.
const WS_POLL: Duration = Duration::from_millis(25);
/// How often a finished HTTP request checks whether its client reset the connection.
const HANGUP_POLL: Duration = Duration::from_millis(100);

/// Client-to-child half.
pub trait ByteSource: Send {
    /// Next bytes from the client; `Ok(0)` when the client has no more input.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Block until the client stops sending, discarding anything it sends, and report
    /// whether the connection is still there to receive output.
    fn wait_hangup(&mut self) -> Departure;
}

/// How a client left once its input ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// Clean end of input (TCP half-close). The client may still be reading.
    HalfClosed,
    /// The connection is closed or broken.
    Gone,
}

/// Child-to-client half.
pub trait FlushSink: Send {
    /// Write one chunk and flush it to the client.
    fn write(&mut self, chunk: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    /// End the output stream. The source may still be draining.
    fn finish(&mut self) -> io::Result<()>;
}

/// Forcibly disconnects the client, unblocking any pending source read.
#[derive(Debug)]
pub struct Hangup(Option<TcpStream>);

impl Hangup {
    pub fn new(stream: TcpStream) -> Self {
        Hangup(Some(stream))
    }

    /// No connection to hang up (in-memory streams).
    pub fn none() -> Self {
        Hangup(None)
    }

    pub fn hang_up(&self) {
        if let Some(s) = &self.0 {
            let _ = s.shutdown(Shutdown::Both);
        }
    }
}

/// Both halves of a split endpoint.
pub struct StreamHalves {
    pub source: Box<dyn ByteSource>,
    pub sink: Box<dyn FlushSink>,
    pub hangup: Hangup,
}

pub enum StreamEndpoint {
    Http(HttpEndpoint),
    WebSocket(WsEndpoint),
}

impl StreamEndpoint {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEndpoint::Http(_) => "http",
            StreamEndpoint::WebSocket(_) => "websocket",
        }
    }

    pub fn split(self) -> io::Result<StreamHalves> {
        match self {
            StreamEndpoint::Http(ep) => ep.split(),
            StreamEndpoint::WebSocket(ep) => ep.split(),
        }
    }
}

/// Request body in, chunked `200 OK` response out.
pub struct HttpEndpoint {
    body: BodyReader<BufReader<TcpStream>>,
    stream: TcpStream,
    send_continue: bool,
}

impl HttpEndpoint {
    pub fn new(ctx: &RequestContext, reader: BufReader<TcpStream>, stream: TcpStream) -> Self {
        let body = BodyReader::for_request(ctx, reader);
        let send_continue = ctx.expects_continue() && !body.is_done();
        HttpEndpoint {
            body,
            stream,
            send_continue,
        }
    }

    fn split(mut self) -> io::Result<StreamHalves> {
        if self.send_continue {
            self.stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
            self.stream.flush()?;
        }
        let hangup = Hangup::new(self.stream.try_clone()?);
        let response = Arc::new(Mutex::new(HttpResponse {
            out: ChunkedWriter::new(BufWriter::new(self.stream.try_clone()?)),
            started: false,
            finished: false,
        }));
        Ok(StreamHalves {
            source: Box::new(HttpSource {
                body: self.body,
                response: response.clone(),
            }),
            sink: Box::new(HttpSink {
                response,
                socket: self.stream,
            }),
            hangup,
        })
    }
}

/// The chunked `200 OK` response. The sink writes it; the source may open it early.
struct HttpResponse {
    out: ChunkedWriter<BufWriter<TcpStream>>,
    started: bool,
    finished: bool,
}

impl HttpResponse {
    fn start(&mut self) -> io::Result<()> {
        if !self.started {
            self.started = true;
            http::write_head(
                self.out.get_mut(),
                200,
                &[
                    ("Content-Type", "text/plain; charset=utf-8".to_string()),
                    ("Transfer-Encoding", "chunked".to_string()),
                ],
            )?;
        }
        Ok(())
    }
}

fn lock_response(r: &Mutex<HttpResponse>) -> MutexGuard<'_, HttpResponse> {
    r.lock().unwrap_or_else(|e| e.into_inner())
}

struct HttpSource {
    body: BodyReader<BufReader<TcpStream>>,
    response: Arc<Mutex<HttpResponse>>,
}

impl ByteSource for HttpSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.body.read(buf)
    }

    fn wait_hangup(&mut self) -> Departure {
        let conn = self.body.get_mut();
        loop {
            let n = match conn.fill_buf() {
                Ok([]) => break,
                Ok(b) => b.len(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return Departure::Gone,
            };
            conn.consume(n);
        }

        // EOF reads the same after shutdown(SHUT_WR) and close(). Sending the response
        // head makes a closed peer answer with a reset; a half-closed one stays quiet.
        {
            let mut resp = lock_response(&self.response);
            if resp.finished {
                return Departure::HalfClosed;
            }
            if resp.start().and_then(|()| resp.out.flush()).is_err() {
                return Departure::Gone;
            }
        }
        loop {
            std::thread::sleep(HANGUP_POLL);
            if lock_response(&self.response).finished {
                return Departure::HalfClosed;
            }
            if let Ok(Some(_)) | Err(_) = conn.get_ref().take_error() {
                return Departure::Gone;
            }
        }
    }
}

struct HttpSink {
    response: Arc<Mutex<HttpResponse>>,
    socket: TcpStream,
}

impl FlushSink for HttpSink {
    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        let mut resp = lock_response(&self.response);
        resp.start()?;
        resp.out.write_chunk(chunk)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut resp = lock_response(&self.response);
        resp.start()?;
        resp.out.flush()
    }

    fn finish(&mut self) -> io::Result<()> {
        {
            let mut resp = lock_response(&self.response);
            resp.finished = true;
            resp.start()?;
            resp.out.finish()?;
        }
        // The client sees EOF; its own close ends wait_hangup.
        match self.socket.shutdown(Shutdown::Write) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

/// Complete the server side of a WebSocket handshake on `stream`.
///
/// Bytes the client sent after its handshake are still in `reader`'s buffer and are
/// handed to the protocol layer.
pub fn accept_websocket(
    ctx: &RequestContext,
    reader: BufReader<TcpStream>,
    mut stream: TcpStream,
) -> Result<WsEndpoint, ShaasError> {
    let key = ctx
        .headers
        .get("sec-websocket-key")
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            ShaasError::BadRequest("websocket: missing Sec-WebSocket-Key header".to_string())
        })?;
    let version = ctx.headers.get("sec-websocket-version").map(str::trim);
    if version != Some("13") {
        return Err(ShaasError::BadRequest(
            "websocket: unsupported version".to_string(),
        ));
    }

    let accept = derive_accept_key(key.as_bytes());
    let response = format!(
        "HTTP/1.1 101 {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        http::reason_phrase(101),
        accept
    );
    stream
        .write_all(response.as_bytes())
        .and_then(|_| stream.flush())
        .map_err(|e| ShaasError::RuntimeExec(format!("websocket handshake: {e}")))?;

    let leftover = reader.buffer().to_vec();
    drop(reader);
    stream
        .set_read_timeout(Some(WS_POLL))
        .map_err(|e| ShaasError::RuntimeExec(format!("websocket setup: {e}")))?;
    let raw = stream
        .try_clone()
        .map_err(|e| ShaasError::RuntimeExec(format!("websocket setup: {e}")))?;
    let ws = WebSocket::from_partially_read(stream, leftover, Role::Server, None);
    Ok(WsEndpoint {
        ws: Arc::new(Mutex::new(ws)),
        raw,
    })
}

/// Upgraded connection: inbound messages in, one outbound message per write.
pub struct WsEndpoint {
    ws: Arc<Mutex<WebSocket<TcpStream>>>,
    raw: TcpStream,
}

impl WsEndpoint {
    fn split(self) -> io::Result<StreamHalves> {
        let closed = Arc::new(AtomicBool::new(false));
        let hangup = Hangup::new(self.raw.try_clone()?);
        Ok(StreamHalves {
            source: Box::new(WsSource {
                ws: self.ws.clone(),
                closed: closed.clone(),
                pending: Vec::new(),
            }),
            sink: Box::new(WsSink {
                ws: self.ws,
                raw: self.raw,
                closed,
            }),
            hangup,
        })
    }
}

fn lock_ws(ws: &Mutex<WebSocket<TcpStream>>) -> MutexGuard<'_, WebSocket<TcpStream>> {
    ws.lock().unwrap_or_else(|e| e.into_inner())
}

fn ws_io_error(e: tungstenite::Error) -> io::Error {
    match e {
        tungstenite::Error::Io(e) => e,
        other => io::Error::other(other),
    }
}

struct WsSource {
    ws: Arc<Mutex<WebSocket<TcpStream>>>,
    closed: Arc<AtomicBool>,
    pending: Vec<u8>,
}

impl ByteSource for WsSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.drain(..n);
                return Ok(n);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            let msg = lock_ws(&self.ws).read();
            match msg {
                Ok(Message::Text(t)) => self.pending = t.into_bytes(),
                Ok(Message::Binary(b)) => self.pending = b,
                Ok(Message::Close(_)) => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Ok(0);
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    // Let a waiting writer take the lock
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Ok(0);
                }
                Err(e) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return Ok(0);
                    }
                    return Err(ws_io_error(e));
                }
            }
        }
    }

    fn wait_hangup(&mut self) -> Departure {
        let mut buf = [0u8; 1024];
        loop {
            match self.read(&mut buf) {
                // A WebSocket has no half-close: end of input is a close frame or a dead socket
                Ok(0) | Err(_) => return Departure::Gone,
                Ok(_) => {}
            }
        }
    }
}

struct WsSink {
    ws: Arc<Mutex<WebSocket<TcpStream>>>,
    raw: TcpStream,
    closed: Arc<AtomicBool>,
}

impl FlushSink for WsSink {
    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        let msg = match std::str::from_utf8(chunk) {
            Ok(s) => Message::text(s),
            Err(_) => Message::binary(chunk.to_vec()),
        };
        lock_ws(&self.ws).send(msg).map_err(ws_io_error)
    }

    fn flush(&mut self) -> io::Result<()> {
        lock_ws(&self.ws).flush().map_err(ws_io_error)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        {
            let mut ws = lock_ws(&self.ws);
            let _ = ws.close(None);
            let _ = ws.flush();
        }
        match self.raw.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}
