use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info};

use shaas::{exit_code_for_io_error, Config, Overrides};

mod cli;
use cli::Cli;

fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = Overrides {
        port: cli.port,
        bind: cli.bind,
        root: cli.root,
        exec_timeout: cli.exec_timeout,
        interactive_shell: cli.interactive_shell,
    };
    let config = Config::from_env(overrides).context("invalid configuration")?;
    if !config.interactive_shell().exists() {
        debug!(
            shell = %config.interactive_shell().display(),
            "interactive shell not found; WebSocket sessions on directories will fail"
        );
    }
    let addr = format!("{}:{}", config.bind(), config.port());
    shaas::serve(config).with_context(|| format!("failed to listen on {addr}"))?;
    Ok(())
}

fn main() -> ExitCode {
    // A missing .env is the normal case
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();
    shaas::telemetry_init(cli.verbose);
    if let Ok(path) = dotenv {
        debug!(path = %path.display(), "loaded environment file");
    }
    let build = shaas::build_info()
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ");
    info!(%build, "starting shaas");

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            let code = e
                .chain()
                .find_map(|c| c.downcast_ref::<std::io::Error>())
                .map(exit_code_for_io_error)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}
