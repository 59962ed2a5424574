//! CGI-style environment for child processes.
//!
//! The child sees the server's own environment, then the CGI variables describing the
//! request, then one `HTTP_*` variable per distinct request header. Later entries win
//! when a name repeats.
use std::ffi::{OsStr, OsString};

use crate::server::http::RequestContext;

pub const SERVER_SOFTWARE: &str = concat!("shaas/", env!("CARGO_PKG_VERSION"));

/// Two-tone prompt: cyan working directory, green `$`.
pub const INTERACTIVE_PS1: &str =
    "\\[\\033[01;36m\\]\\w\\[\\033[00m\\] \\[\\033[01;32m\\]$ \\[\\033[00m\\]";

/// Ordered `NAME=value` list handed to a child process. Names and values are kept as
/// `OsString` so inherited variables reach the child byte for byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessEnvironment(Vec<(OsString, OsString)>);

impl ProcessEnvironment {
    pub fn new() -> Self {
        ProcessEnvironment(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<OsString>, value: impl Into<OsString>) {
        self.0.push((name.into(), value.into()));
    }

    /// Value of `name`; the last entry wins. `None` also when the value is not UTF-8.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_os(name).and_then(|v| v.to_str())
    }

    pub fn get_os(&self, name: &str) -> Option<&OsStr> {
        self.pairs()
            .filter(|(k, _)| *k == name)
            .last()
            .map(|(_, v)| v)
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.0.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// `Content-Type` → `CONTENT_TYPE`: uppercase, non-alphanumerics become `_`.
pub fn fold_header_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Environment for a child serving `ctx`, on top of the current process environment.
pub fn build(ctx: &RequestContext, interactive: bool) -> ProcessEnvironment {
    let ambient: Vec<(OsString, OsString)> = std::env::vars_os().collect();
    build_from(&ambient, ctx, interactive)
}

pub fn build_from(
    ambient: &[(OsString, OsString)],
    ctx: &RequestContext,
    interactive: bool,
) -> ProcessEnvironment {
    let mut env = ProcessEnvironment(ambient.to_vec());

    env.push("SERVER_SOFTWARE", SERVER_SOFTWARE);
    env.push("SERVER_NAME", &ctx.host);
    env.push("SERVER_PROTOCOL", "HTTP/1.1");
    env.push("HTTP_HOST", &ctx.host);
    env.push("GATEWAY_INTERFACE", "CGI/1.1");
    env.push("REQUEST_METHOD", ctx.method.as_str());
    env.push("QUERY_STRING", &ctx.query);
    env.push("REQUEST_URI", &ctx.request_uri());
    env.push("PATH_INFO", &ctx.path);
    env.push("SCRIPT_NAME", &ctx.path);
    env.push("SCRIPT_FILENAME", &ctx.path);
    env.push("REMOTE_ADDR", &ctx.remote_addr);
    env.push("REMOTE_HOST", &ctx.remote_addr);
    env.push("SERVER_PORT", &ctx.server_port.to_string());

    if ctx.tls {
        env.push("HTTPS", "on");
    }
    if let Some(len) = ctx.content_length().filter(|n| *n > 0) {
        env.push("CONTENT_LENGTH", &len.to_string());
    }
    if let Some(ct) = ctx.content_type() {
        env.push("CONTENT_TYPE", ct);
    }

    for (name, values) in ctx.headers.grouped() {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        let joiner = if name.eq_ignore_ascii_case("cookie") {
            "; "
        } else {
            ", "
        };
        env.push(
            &format!("HTTP_{}", fold_header_name(name)),
            &values.join(joiner),
        );
    }

    if interactive {
        env.push("PS1", INTERACTIVE_PS1);
    }
    env
}
