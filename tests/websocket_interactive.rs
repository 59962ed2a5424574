mod support;

use std::fs;
use std::net::TcpStream;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use tungstenite::{Message, WebSocket};

fn ws_connect(port: u16, path: &str) -> WebSocket<TcpStream> {
    let stream = support::connect(port);
    let (ws, resp) = tungstenite::client(format!("ws://127.0.0.1:{port}{path}"), stream)
        .unwrap_or_else(|e| panic!("websocket handshake failed: {e}"));
    assert_eq!(resp.status().as_u16(), 101);
    ws
}

/// Collect text until `needle` shows up or the server closes.
fn read_until(ws: &mut WebSocket<TcpStream>, needle: &str) -> String {
    let mut seen = String::new();
    while !seen.contains(needle) {
        match ws.read() {
            Ok(Message::Text(t)) => seen.push_str(&t),
            Ok(Message::Binary(b)) => seen.push_str(&String::from_utf8_lossy(&b)),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => panic!("websocket read failed after {seen:?}: {e}"),
        }
    }
    seen
}

#[test]
fn test_ws_directory_runs_interactive_shell() {
    let shell = support::pseudo_interactive_bash();
    let srv = support::start_server(|c| c.with_interactive_shell(shell));
    let mut ws = ws_connect(srv.port, "/");
    ws.send(Message::text("echo hello-ws\n")).unwrap();
    let out = read_until(&mut ws, "hello-ws\n");
    assert!(out.contains("hello-ws\n"), "out: {out:?}");
    assert!(out.contains("$ "), "prompt missing: {out:?}");
    ws.send(Message::text("echo \"prompt=${PS1:+set}\"\n")).unwrap();
    let out = read_until(&mut ws, "prompt=set");
    assert!(out.contains("prompt=set"), "out: {out:?}");
    let _ = ws.close(None);
}

#[test]
fn test_ws_executable_round_trip_and_close() {
    let srv = support::start_server(|c| c);
    support::write_script(
        srv.path(),
        "greet.sh",
        "#!/bin/sh\nread line\necho \"got:$line\"\n",
    );
    let mut ws = ws_connect(srv.port, "/greet.sh");
    ws.send(Message::text("abc\n")).unwrap();
    let out = read_until(&mut ws, "got:abc\n");
    assert_eq!(out, "got:abc\n");
    // Child exit ends the session with a close frame
    let mut closed = false;
    for _ in 0..20 {
        match ws.read() {
            Ok(Message::Close(_)) => {
                closed = true;
                break;
            }
            Ok(_) => {}
            Err(_) => {
                closed = true;
                break;
            }
        }
    }
    assert!(closed, "server did not close after child exit");
}

#[test]
fn test_ws_each_child_write_is_its_own_message() {
    let srv = support::start_server(|c| c);
    support::write_script(
        srv.path(),
        "parts.sh",
        "#!/bin/sh\nprintf a\nsleep 0.3\nprintf b\nsleep 0.3\nprintf '\\377\\376'\n",
    );
    let mut ws = ws_connect(srv.port, "/parts.sh");
    let mut frames = Vec::new();
    loop {
        match ws.read() {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(m @ (Message::Text(_) | Message::Binary(_))) => frames.push(m),
            Ok(_) => {}
        }
    }
    assert_eq!(
        frames,
        vec![
            Message::text("a"),
            Message::text("b"),
            Message::binary(vec![0xff, 0xfe]),
        ]
    );
}

#[test]
fn test_ws_client_close_terminates_child() {
    let srv = support::start_server(|c| c);
    let pidfile = srv.path().join("pid");
    support::write_script(
        srv.path(),
        "hold.sh",
        &format!(
            "#!/bin/sh\necho $$ > '{}'\necho ready\nexec sleep 30\n",
            pidfile.display()
        ),
    );
    let mut ws = ws_connect(srv.port, "/hold.sh");
    read_until(&mut ws, "ready");
    let pid = support::read_pid(&pidfile);
    assert!(support::pid_alive(pid));
    let _ = ws.close(None);
    let _ = ws.flush();
    assert!(
        support::wait_until(Duration::from_secs(10), || !support::pid_alive(pid)),
        "child {pid} survived the client closing"
    );
}

#[test]
fn test_ws_non_executable_rejected_before_upgrade() {
    let srv = support::start_server(|c| c);
    let p = srv.path().join("plain.txt");
    fs::write(&p, "x").unwrap();
    fs::set_permissions(&p, fs::Permissions::from_mode(0o644)).unwrap();
    let raw = b"GET /plain.txt HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
    let resp = support::parse_response(&support::request(srv.port, raw));
    assert_eq!(resp.status, 400);
    let v: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    assert!(v["message"]
        .as_str()
        .unwrap()
        .starts_with("Invalid file type for POST"));
}

#[test]
fn test_ws_missing_key_is_400() {
    let srv = support::start_server(|c| c);
    let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\n\r\n";
    let resp = support::parse_response(&support::request(srv.port, raw));
    assert_eq!(resp.status, 400);
}

#[test]
fn test_ws_origin_header_alone_is_plain_get() {
    let srv = support::start_server(|c| c);
    let resp = support::get(
        srv.port,
        "/",
        "Origin: ws://localhost\r\nAccept: application/json\r\n",
    );
    assert_eq!(resp.status, 200);
    assert!(serde_json::from_slice::<serde_json::Value>(&resp.body).is_ok());
}
