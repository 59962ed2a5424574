mod support;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

fn authed() -> support::TestServer {
    support::start_server(|c| c.with_credentials("alice", "pw"))
}

#[test]
fn test_missing_credentials_is_401_authorization_required() {
    let srv = authed();
    let resp = support::get(srv.port, "/", "");
    assert_eq!(resp.status, 401);
    assert_eq!(
        resp.header("www-authenticate"),
        Some("Basic realm=\"shaas\"")
    );
    let v: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(v["message"], "Not Authorized");
    assert_eq!(v["cause"], "Authorization Required");
}

#[test]
fn test_wrong_credentials_is_401_not_authorized() {
    let srv = authed();
    let hdr = format!("Authorization: Basic {}\r\n", STANDARD.encode("alice:wrong"));
    let resp = support::get(srv.port, "/", &hdr);
    assert_eq!(resp.status, 401);
    let v: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(v["message"], "Not Authorized");
    assert_eq!(v["cause"], "Not Authorized");
}

#[test]
fn test_valid_credentials_pass() {
    let srv = authed();
    std::fs::write(srv.path().join("f"), "ok").unwrap();
    let hdr = format!("Authorization: Basic {}\r\n", STANDARD.encode("alice:pw"));
    let resp = support::get(srv.port, "/f", &hdr);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"ok");
}

#[test]
fn test_post_is_gated_before_execution() {
    let srv = authed();
    let marker = srv.path().join("ran");
    support::write_script(
        srv.path(),
        "touch.sh",
        &format!("#!/bin/sh\ntouch '{}'\n", marker.display()),
    );
    let resp = support::post(srv.port, "/touch.sh", "");
    assert_eq!(resp.status, 401);
    assert!(!marker.exists(), "script ran without authorization");
}

#[test]
fn test_no_credentials_configured_is_open() {
    let srv = support::start_server(|c| c);
    let resp = support::get(srv.port, "/", "Accept: application/json\r\n");
    assert_eq!(resp.status, 200);
}
