//! Error mapping guide:
//! - Filesystem and classification failures are resolved before any child is spawned and
//!   before any response byte is written, so each maps to an HTTP status and a JSON body.
//! - Failures after streaming began (`RuntimeExec`) have no status; they are logged only.
//! - Startup failures map to process exit codes: 127 for NotFound, 1 for everything else.
use std::fmt;
use std::io;

use crate::fsentry::EntryKind;

/// Map an io::Error to a process exit code:
/// - 127 for NotFound (binary or path not found)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

/// Request operation an entry kind was rejected for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Post,
    Exec,
}

#[derive(Debug)]
pub enum ShaasError {
    /// Path does not exist.
    NotFound(io::Error),
    /// Metadata of the path could not be read.
    Stat(io::Error),
    /// File contents could not be opened or read.
    ReadFile(io::Error),
    /// Directory listing could not be read.
    ReadDir(io::Error),
    /// The entry kind is not valid for the requested operation.
    InvalidEntryKind { op: Operation, kind: EntryKind },
    AuthRequired,
    AuthFailed,
    MethodNotAllowed(String),
    BadRequest(String),
    /// Child process could not be started.
    Spawn(io::Error),
    /// Child failed or the stream broke after output started.
    RuntimeExec(String),
}

impl ShaasError {
    /// HTTP status used when the error is reported before any response byte.
    pub fn status(&self) -> u16 {
        match self {
            ShaasError::NotFound(_) => 404,
            ShaasError::Stat(_) => 400,
            ShaasError::ReadFile(_) | ShaasError::ReadDir(_) => 500,
            ShaasError::InvalidEntryKind { .. } => 400,
            ShaasError::AuthRequired | ShaasError::AuthFailed => 401,
            ShaasError::MethodNotAllowed(_) => 405,
            ShaasError::BadRequest(_) => 400,
            ShaasError::Spawn(_) | ShaasError::RuntimeExec(_) => 500,
        }
    }

    /// Client-facing message (the `message` field of the JSON error body).
    pub fn message(&self) -> String {
        match self {
            ShaasError::NotFound(_) => "File not found".to_string(),
            ShaasError::Stat(_) => "Error reading path".to_string(),
            ShaasError::ReadFile(_) => "Error reading file".to_string(),
            ShaasError::ReadDir(_) => "Error reading directory".to_string(),
            ShaasError::InvalidEntryKind { op, .. } => match op {
                Operation::Get => {
                    "Invalid file type for GET. Only directories and regular files are supported."
                        .to_string()
                }
                Operation::Post | Operation::Exec => {
                    "Invalid file type for POST. Only directories and regular executable file are supported"
                        .to_string()
                }
            },
            ShaasError::AuthRequired | ShaasError::AuthFailed => "Not Authorized".to_string(),
            ShaasError::MethodNotAllowed(_) => "Only GET and POST supported".to_string(),
            ShaasError::BadRequest(msg) => msg.clone(),
            ShaasError::Spawn(_) => "Error executing command".to_string(),
            ShaasError::RuntimeExec(_) => "Error executing command".to_string(),
        }
    }

    /// Underlying cause (the `cause` field of the JSON error body), if any.
    pub fn cause(&self) -> Option<String> {
        match self {
            ShaasError::NotFound(e)
            | ShaasError::Stat(e)
            | ShaasError::ReadFile(e)
            | ShaasError::ReadDir(e)
            | ShaasError::Spawn(e) => Some(e.to_string()),
            ShaasError::InvalidEntryKind { .. } => None,
            ShaasError::AuthRequired => Some("Authorization Required".to_string()),
            ShaasError::AuthFailed => Some("Not Authorized".to_string()),
            ShaasError::MethodNotAllowed(method) => Some(format!("method {method}")),
            ShaasError::BadRequest(_) => None,
            ShaasError::RuntimeExec(detail) => Some(detail.clone()),
        }
    }
}

impl fmt::Display for ShaasError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cause() {
            Some(cause) => write!(f, "{}: {}", self.message(), cause),
            None => write!(f, "{}", self.message()),
        }
    }
}

impl std::error::Error for ShaasError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShaasError::NotFound(e)
            | ShaasError::Stat(e)
            | ShaasError::ReadFile(e)
            | ShaasError::ReadDir(e)
            | ShaasError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

/// Metadata failures: NotFound stays distinct, everything else is a stat error.
impl From<io::Error> for ShaasError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            ShaasError::NotFound(e)
        } else {
            ShaasError::Stat(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_127() {
        let e = io::Error::new(io::ErrorKind::NotFound, "nope");
        assert_eq!(exit_code_for_io_error(&e), 127);
        let e = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(exit_code_for_io_error(&e), 1);
    }

    #[test]
    fn from_io_keeps_not_found_distinct() {
        let nf: ShaasError = io::Error::new(io::ErrorKind::NotFound, "x").into();
        assert_eq!(nf.status(), 404);
        assert_eq!(nf.message(), "File not found");
        let st: ShaasError = io::Error::new(io::ErrorKind::PermissionDenied, "x").into();
        assert_eq!(st.status(), 400);
        assert_eq!(st.message(), "Error reading path");
    }

    #[test]
    fn auth_errors_share_message_but_not_cause() {
        assert_eq!(ShaasError::AuthRequired.status(), 401);
        assert_eq!(ShaasError::AuthRequired.message(), "Not Authorized");
        assert_eq!(
            ShaasError::AuthRequired.cause().as_deref(),
            Some("Authorization Required")
        );
        assert_eq!(ShaasError::AuthFailed.cause().as_deref(), Some("Not Authorized"));
    }

    #[test]
    fn invalid_entry_kind_messages_name_the_operation() {
        let get = ShaasError::InvalidEntryKind {
            op: Operation::Get,
            kind: EntryKind::Other,
        };
        assert!(get.message().starts_with("Invalid file type for GET"));
        assert!(get.cause().is_none());
        let post = ShaasError::InvalidEntryKind {
            op: Operation::Post,
            kind: EntryKind::NonExecutableFile,
        };
        assert_eq!(post.status(), 400);
        assert!(post.message().starts_with("Invalid file type for POST"));
    }
}
