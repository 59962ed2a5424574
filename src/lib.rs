/*!
shaas: browse a filesystem over HTTP and execute files or shells on it.

- `GET` lists directories (JSON or HTML) and streams regular files;
- `POST` runs an executable file, or `bash` in a directory, with the request body as
  stdin and combined stdout/stderr streamed back in a chunked response;
- a WebSocket upgrade runs the same interactively, one message per write;
- children receive a CGI/1.1-style environment describing the request.
*/

pub mod cgi;
pub mod config;
pub mod errors;
pub mod fsentry;
pub mod server;
pub mod telemetry;

pub use cgi::{build as build_cgi_env, build_from as build_cgi_env_from, ProcessEnvironment};
pub use config::{Config, ConfigError, Credentials, Overrides};
pub use errors::{exit_code_for_io_error, Operation, ShaasError};
pub use fsentry::{classify, inspect, resolve, EntryKind, FilesystemEntry};
pub use server::bridge::{ChildExit, ChildProcessHandle, ProcessBridge, Terminator};
pub use server::stream::{ByteSource, Departure, FlushSink, StreamEndpoint, StreamHalves};
pub use server::{serve, start, ServerHandle};
pub use telemetry::telemetry_init;

/// Build metadata recorded by build.rs.
pub fn build_info() -> [(&'static str, &'static str); 5] {
    [
        ("version", env!("CARGO_PKG_VERSION")),
        ("date", env!("SHAAS_BUILD_DATE")),
        ("target", env!("SHAAS_BUILD_TARGET")),
        ("profile", env!("SHAAS_BUILD_PROFILE")),
        ("rustc", env!("SHAAS_BUILD_RUSTC")),
    ]
}
