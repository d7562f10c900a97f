//! ameshd binary entrypoint.
//!
//! The long-running agent: registers this host in the directory and
//! reconciles local WireGuard peers and routes with the mesh.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use amesh_kernel::CommandKernel;
use ameshd::agent::Agent;
use ameshd::config::AgentConfig;
use ameshd::error::AgentError;

/// amesh agent: a WireGuard full-mesh control plane over etcd.
#[derive(Parser, Debug)]
#[command(name = "ameshd", version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,

    /// Log human-oriented output for a terminal; the default plain format
    /// suits capture by a service supervisor.
    #[arg(long)]
    foreground_log: bool,
}

fn init_tracing(debug: bool, foreground: bool) {
    use tracing_subscriber::EnvFilter;

    let default_filter = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if foreground {
        builder.init();
    } else {
        builder.with_ansi(false).without_time().init();
    }
}

async fn run(cli: Cli) -> Result<(), AgentError> {
    let config = AgentConfig::load(&cli.config)?;
    let agent = Agent::new(config, CommandKernel::new());
    agent.run().await
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.foreground_log);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("ameshd: failed to start runtime: {err}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ AgentError::Config(_)) => {
            eprintln!("ameshd: {err}");
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("ameshd: {err}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::try_parse_from(["ameshd", "--config", "/etc/amesh/amesh.conf", "--debug"])
            .expect("parses");
        assert_eq!(cli.config, PathBuf::from("/etc/amesh/amesh.conf"));
        assert!(cli.debug);
        assert!(!cli.foreground_log);
    }

    #[test]
    fn cli_requires_config() {
        assert!(Cli::try_parse_from(["ameshd"]).is_err());
    }
}
