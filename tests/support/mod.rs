/*!
Test support helpers shared across integration tests.

- start_server(configure): in-process server on 127.0.0.1 with a fresh temp root
- request(port, raw): send a raw HTTP request and read the whole response
- request_half_closed(port, raw): same, with the write side shut down after sending
- parse_response(bytes): status, headers and (de-chunked) body
- write_script(dir, name, body): executable shell script fixture
- pid_alive(pid), wait_until(timeout, cond): polling helpers for process assertions
*/

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use shaas::{Config, ServerHandle};

pub struct TestServer {
    pub root: tempfile::TempDir,
    pub port: u16,
    handle: Option<ServerHandle>,
}

impl TestServer {
    #[allow(dead_code)]
    pub fn path(&self) -> &Path {
        self.root.path()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            h.stop();
        }
    }
}

/// Start a server rooted at a new temp dir; `configure` may adjust the config.
#[allow(dead_code)]
pub fn start_server<F>(configure: F) -> TestServer
where
    F: FnOnce(Config) -> Config,
{
    let root = tempfile::tempdir().expect("tmpdir");
    let cfg = Config::new(root.path())
        .with_bind([127, 0, 0, 1].into())
        .with_port(0);
    let handle = shaas::start(configure(cfg)).expect("start server");
    let port = handle.addr().port();
    TestServer {
        root,
        port,
        handle: Some(handle),
    }
}

#[allow(dead_code)]
pub fn connect(port: u16) -> TcpStream {
    let s = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    s.set_read_timeout(Some(Duration::from_secs(20))).ok();
    s
}

/// Send `raw` and read until the server closes the connection.
#[allow(dead_code)]
pub fn request(port: u16, raw: &[u8]) -> Vec<u8> {
    let mut s = connect(port);
    s.write_all(raw).expect("write request");
    let mut out = Vec::new();
    s.read_to_end(&mut out).ok();
    out
}

/// Like `request`, but half-close the connection once `raw` is sent.
#[allow(dead_code)]
pub fn request_half_closed(port: u16, raw: &[u8]) -> Vec<u8> {
    let mut s = connect(port);
    s.write_all(raw).expect("write request");
    s.shutdown(std::net::Shutdown::Write).expect("half-close");
    let mut out = Vec::new();
    s.read_to_end(&mut out).ok();
    out
}

#[allow(dead_code)]
pub fn get(port: u16, path: &str, extra_headers: &str) -> Response {
    let raw = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{extra_headers}\r\n");
    parse_response(&request(port, raw.as_bytes()))
}

#[allow(dead_code)]
pub fn post(port: u16, path: &str, body: &str) -> Response {
    let raw = format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    parse_response(&request(port, raw.as_bytes()))
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    #[allow(dead_code)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[allow(dead_code)]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn find_head_end(b: &[u8]) -> Option<usize> {
    b.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse a full response, skipping interim 1xx heads and decoding chunked bodies.
#[allow(dead_code)]
pub fn parse_response(mut bytes: &[u8]) -> Response {
    loop {
        let end = find_head_end(bytes).unwrap_or_else(|| {
            panic!(
                "no response head in:\n{}",
                String::from_utf8_lossy(bytes)
            )
        });
        let head = String::from_utf8_lossy(&bytes[..end]).to_string();
        let mut lines = head.split("\r\n");
        let status: u16 = lines
            .next()
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|s| s.parse().ok())
            .expect("status line");
        let headers: Vec<(String, String)> = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        let rest = &bytes[end..];
        if (100..200).contains(&status) {
            bytes = rest;
            continue;
        }
        let chunked = headers.iter().any(|(k, v)| {
            k.eq_ignore_ascii_case("transfer-encoding") && v.eq_ignore_ascii_case("chunked")
        });
        let body = if chunked { dechunk(rest) } else { rest.to_vec() };
        return Response {
            status,
            headers,
            body,
        };
    }
}

fn dechunk(mut b: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let Some(nl) = b.windows(2).position(|w| w == b"\r\n") else {
            break;
        };
        let size_line = String::from_utf8_lossy(&b[..nl]).to_string();
        let size = usize::from_str_radix(size_line.split(';').next().unwrap_or("").trim(), 16)
            .expect("chunk size");
        b = &b[nl + 2..];
        if size == 0 || b.len() < size {
            break;
        }
        out.extend_from_slice(&b[..size]);
        b = &b[(size + 2).min(b.len())..];
    }
    out
}

/// Write an executable (0755) shell script.
#[allow(dead_code)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let p = dir.join(name);
    fs::write(&p, body).expect("write script");
    fs::set_permissions(&p, fs::Permissions::from_mode(0o755)).expect("chmod");
    p
}

#[allow(dead_code)]
pub fn pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Poll `cond` every 50ms until it holds or `timeout` passes.
#[allow(dead_code)]
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    cond()
}

/// Read a pid written by a fixture script, waiting for the file to appear.
#[allow(dead_code)]
pub fn read_pid(path: &Path) -> i32 {
    let mut pid = None;
    wait_until(Duration::from_secs(10), || {
        pid = fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());
        pid.is_some()
    });
    pid.unwrap_or_else(|| panic!("no pid in {}", path.display()))
}

/// The helper shell shipped with the crate.
#[allow(dead_code)]
pub fn pseudo_interactive_bash() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("bin")
        .join("pseudo-interactive-bash")
}
