use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// Validate a humantime duration such as `30s` or `2m 30s`
fn validate_duration(s: &str) -> Result<String, String> {
    humantime::parse_duration(s.trim())
        .map(|_| s.trim().to_string())
        .map_err(|e| format!("invalid duration: {e}"))
}

#[derive(Parser, Debug)]
#[command(
    name = "shaas",
    version,
    about = "Browse a filesystem over HTTP and execute files or shells with stdio streamed over HTTP POST or WebSocket.",
    after_long_help = "Environment:\n  PORT, SHAAS_BIND, SHAAS_ROOT, SHAAS_EXEC_TIMEOUT, SHAAS_INTERACTIVE_SHELL, BASIC_AUTH=user:password, SHAAS_LOG\n\nExamples:\n  shaas --port 5000\n  curl localhost:5000/tmp/\n  curl -X POST --data-binary 'uname -a' localhost:5000/tmp/\n  curl localhost:5000/%3E/exit?code=0\n"
)]
pub(crate) struct Cli {
    /// Port to listen on (overrides PORT; default 5000)
    #[arg(long)]
    pub(crate) port: Option<u16>,

    /// Address to bind (overrides SHAAS_BIND; default 0.0.0.0)
    #[arg(long)]
    pub(crate) bind: Option<IpAddr>,

    /// Directory served as `/` (overrides SHAAS_ROOT; default /)
    #[arg(long)]
    pub(crate) root: Option<PathBuf>,

    /// Terminate executions that run longer than this, e.g. 30s (overrides SHAAS_EXEC_TIMEOUT)
    #[arg(long = "exec-timeout", value_parser = validate_duration)]
    pub(crate) exec_timeout: Option<String>,

    /// Program run for interactive WebSocket sessions in a directory
    #[arg(long = "interactive-shell")]
    pub(crate) interactive_shell: Option<PathBuf>,

    /// Debug-level logging unless SHAAS_LOG is set
    #[arg(long, short = 'v')]
    pub(crate) verbose: bool,
}
