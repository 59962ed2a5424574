/*!
HTTP Basic authentication for every endpoint.
*/

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::config::Credentials;
use crate::server::http::Headers;

/// Outcome of checking a request against the configured credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthResult {
    Authorized,
    /// No usable `Authorization: Basic` header.
    Missing,
    /// Credentials present but wrong.
    Rejected,
}

/// Decode `Basic <base64(user:password)>`. The scheme is case-insensitive; anything
/// else (other schemes, bad base64, no colon) yields None.
pub(crate) fn parse_basic(value: &str) -> Option<(String, String)> {
    let v = value.trim();
    let idx = v.find(|c: char| c.is_ascii_whitespace())?;
    let (scheme, rest) = v.split_at(idx);
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(rest.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn same_bytes(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub(crate) fn check(headers: &Headers, expected: Option<&Credentials>) -> AuthResult {
    let Some(expected) = expected else {
        return AuthResult::Authorized;
    };
    match headers.get("authorization").and_then(parse_basic) {
        None => AuthResult::Missing,
        Some((user, password)) => {
            let user_ok = same_bytes(&user, &expected.user);
            let pass_ok = same_bytes(&password, &expected.password);
            if user_ok && pass_ok {
                AuthResult::Authorized
            } else {
                AuthResult::Rejected
            }
        }
    }
}
