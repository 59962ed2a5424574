use std::env;

use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

/// Filter directive: `SHAAS_LOG` when set, else `debug` when verbose, else `info`.
fn filter_directive(verbose: bool) -> String {
    env::var("SHAAS_LOG")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string())
}

/// Install the global fmt subscriber (stderr). Returns false when a subscriber was
/// already installed, by us or by someone else.
pub fn telemetry_init(verbose: bool) -> bool {
    if INIT.get().is_some() {
        return false;
    }
    let env_filter = EnvFilter::try_new(filter_directive(verbose))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    if tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        return false;
    }
    let _ = INIT.set(());
    true
}
