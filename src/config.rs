//! Server configuration, built once at startup and shared read-only.
//!
//! Sources in increasing precedence: built-in defaults, environment variables (after
//! `.env` is loaded by the binary), command-line overrides.
use std::fmt;
use std::net::{AddrParseError, IpAddr};
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_BIND: &str = "0.0.0.0";

static DEFAULT_INTERACTIVE_SHELL: Lazy<PathBuf> = Lazy::new(|| {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("bin")
        .join("pseudo-interactive-bash")
});

static DEFAULT_SHELL: Lazy<PathBuf> =
    Lazy::new(|| which::which("bash").unwrap_or_else(|_| PathBuf::from("/bin/sh")));

/// A setting whose value could not be parsed.
#[derive(Debug)]
pub enum ConfigError {
    Port { value: String, source: ParseIntError },
    Bind { value: String, source: AddrParseError },
    ExecTimeout { value: String, source: humantime::DurationError },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Port { value, source } => write!(f, "invalid PORT value {value:?}: {source}"),
            ConfigError::Bind { value, source } => {
                write!(f, "invalid SHAAS_BIND address {value:?}: {source}")
            }
            ConfigError::ExecTimeout { value, source } => {
                write!(f, "invalid exec timeout {value:?}: {source}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Port { source, .. } => Some(source),
            ConfigError::Bind { source, .. } => Some(source),
            ConfigError::ExecTimeout { source, .. } => Some(source),
        }
    }
}

/// Basic-auth credentials from `BASIC_AUTH=user:password`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    /// Split at the first `:`; the password may be empty or absent.
    pub fn parse(raw: &str) -> Option<Credentials> {
        if raw.is_empty() {
            return None;
        }
        let (user, password) = raw.split_once(':').unwrap_or((raw, ""));
        Some(Credentials {
            user: user.to_string(),
            password: password.to_string(),
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Command-line values that take precedence over the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub bind: Option<IpAddr>,
    pub root: Option<PathBuf>,
    pub exec_timeout: Option<String>,
    pub interactive_shell: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    bind: IpAddr,
    port: u16,
    root: PathBuf,
    credentials: Option<Credentials>,
    interactive_shell: PathBuf,
    shell: PathBuf,
    exec_timeout: Option<Duration>,
}

impl Config {
    /// Defaults serving `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Config {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            root: root.into(),
            credentials: None,
            interactive_shell: DEFAULT_INTERACTIVE_SHELL.clone(),
            shell: DEFAULT_SHELL.clone(),
            exec_timeout: None,
        }
    }

    /// Build from the process environment plus overrides.
    pub fn from_env(overrides: Overrides) -> Result<Self, ConfigError> {
        Self::load(|k| std::env::var(k).ok(), overrides)
    }

    /// Build from an arbitrary variable lookup plus overrides.
    pub fn load<F>(lookup: F, overrides: Overrides) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());

        let port = match overrides.port {
            Some(p) => p,
            None => match var("PORT") {
                Some(p) => p
                    .trim()
                    .parse::<u16>()
                    .map_err(|source| ConfigError::Port { value: p.clone(), source })?,
                None => DEFAULT_PORT,
            },
        };
        let bind = match overrides.bind {
            Some(b) => b,
            None => {
                let raw = var("SHAAS_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
                raw.trim()
                    .parse::<IpAddr>()
                    .map_err(|source| ConfigError::Bind { value: raw.clone(), source })?
            }
        };
        let root = overrides
            .root
            .or_else(|| var("SHAAS_ROOT").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/"));
        let interactive_shell = overrides
            .interactive_shell
            .or_else(|| var("SHAAS_INTERACTIVE_SHELL").map(PathBuf::from))
            .unwrap_or_else(|| DEFAULT_INTERACTIVE_SHELL.clone());
        let exec_timeout = match overrides.exec_timeout.or_else(|| var("SHAAS_EXEC_TIMEOUT")) {
            Some(raw) => Some(
                humantime::parse_duration(raw.trim())
                    .map_err(|source| ConfigError::ExecTimeout { value: raw.clone(), source })?,
            ),
            None => None,
        };
        let credentials = lookup("BASIC_AUTH").and_then(|raw| Credentials::parse(&raw));

        Ok(Config {
            bind,
            port,
            root,
            credentials,
            interactive_shell,
            shell: DEFAULT_SHELL.clone(),
            exec_timeout,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind(mut self, bind: IpAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_credentials(mut self, user: &str, password: &str) -> Self {
        self.credentials = Some(Credentials {
            user: user.to_string(),
            password: password.to_string(),
        });
        self
    }

    pub fn with_interactive_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.interactive_shell = shell.into();
        self
    }

    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = Some(timeout);
        self
    }

    pub fn bind(&self) -> IpAddr {
        self.bind
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn interactive_shell(&self) -> &Path {
        &self.interactive_shell
    }

    /// Shell used for non-interactive directory execution.
    pub fn shell(&self) -> &Path {
        &self.shell
    }

    pub fn exec_timeout(&self) -> Option<Duration> {
        self.exec_timeout
    }
}
