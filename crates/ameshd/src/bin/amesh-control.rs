//! amesh-control binary entrypoint.
//!
//! Seeds the directory with node descriptors from configuration files,
//! prints the current node set, and removes nodes.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

use ameshd::control::{Control, Source};
use ameshd::error::ControlError;

/// Default control configuration path.
const DEFAULT_CONFIG: &str = "/usr/local/etc/amesh/amesh-control.conf";

/// Administrative tool for the amesh directory.
#[derive(Parser, Debug)]
#[command(name = "amesh-control", version, about, long_about = None)]
struct Cli {
    /// Configuration file; may be given multiple times.
    #[arg(short, long = "config", default_value = DEFAULT_CONFIG)]
    config: Vec<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print node information.
    Get {
        /// Data source to read from.
        #[arg(value_enum, default_value_t = SourceArg::Etcd)]
        source: SourceArg,
    },
    /// Put node information into the directory.
    Put {
        /// Node ids to put.
        node_ids: Vec<String>,
        /// Put every node in the config file(s).
        #[arg(short, long)]
        all_node: bool,
        /// Also remove directory nodes that are not in the config file(s).
        #[arg(short, long)]
        sync: bool,
    },
    /// Delete nodes from the directory.
    Delete {
        /// Node ids to delete.
        node_ids: Vec<String>,
        /// Delete every node in the config file(s).
        #[arg(short, long)]
        all_node: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SourceArg {
    /// Read from the live directory.
    Etcd,
    /// Read from the local config file(s).
    Config,
}

impl std::fmt::Display for SourceArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Etcd => "etcd",
            Self::Config => "config",
        })
    }
}

impl From<SourceArg> for Source {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Etcd => Source::Etcd,
            SourceArg::Config => Source::Config,
        }
    }
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let default_filter = if debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), ControlError> {
    let control = Control::from_files(&cli.config)?;
    match cli.command {
        Command::Get { source } => control.get(source.into()).await,
        Command::Put {
            node_ids,
            all_node,
            sync,
        } => control.put(&node_ids, all_node, sync).await,
        Command::Delete { node_ids, all_node } => control.delete(&node_ids, all_node).await,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("amesh-control: failed to start runtime: {err}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ ControlError::Config(_)) => {
            eprintln!("amesh-control: {err}");
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("amesh-control: {err}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_put_with_flags() {
        let cli = Cli::try_parse_from([
            "amesh-control",
            "--config",
            "/tmp/a.conf",
            "put",
            "node-1",
            "--sync",
        ])
        .expect("parses");
        assert_eq!(cli.config, [PathBuf::from("/tmp/a.conf")]);
        let Command::Put {
            node_ids,
            all_node,
            sync,
        } = cli.command
        else {
            unreachable!("expected put command");
        };
        assert_eq!(node_ids, ["node-1"]);
        assert!(!all_node);
        assert!(sync);
    }

    #[test]
    fn cli_defaults_config_path() {
        let cli = Cli::try_parse_from(["amesh-control", "get"]).expect("parses");
        assert_eq!(cli.config, [PathBuf::from(DEFAULT_CONFIG)]);
        assert!(matches!(
            cli.command,
            Command::Get {
                source: SourceArg::Etcd
            }
        ));
    }

    #[test]
    fn cli_accepts_multiple_config_files() {
        let cli = Cli::try_parse_from([
            "amesh-control",
            "-c",
            "/tmp/a.conf",
            "-c",
            "/tmp/b.conf",
            "delete",
            "--all-node",
        ])
        .expect("parses");
        assert_eq!(cli.config.len(), 2);
    }
}
