//! CLI argument parsing.

use clap::{Parser, Subcommand};

use convertd_core::Config;

#[derive(Parser, Debug)]
#[command(name = "convertd", version, about = "Document and media conversion service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start the HTTP server (default)
    Serve {
        /// Bind address, overrides HOST
        #[arg(long)]
        host: Option<String>,
        /// Listen port, overrides PORT
        #[arg(long)]
        port: Option<u16>,
    },
    /// Check that every external tool is installed, then exit
    Check,
    /// Run one retention sweep over the storage root, then exit
    Sweep,
}

impl Cli {
    /// The subcommand to run; a bare invocation serves.
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve {
            host: None,
            port: None,
        })
    }
}

/// Apply `serve` flag overrides on top of the environment config.
pub fn apply_overrides(config: &mut Config, host: Option<String>, port: Option<u16>) {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_serves() {
        let cli = Cli::parse_from(["convertd"]);
        assert_eq!(cli.command(), Command::Serve { host: None, port: None });
    }

    #[test]
    fn serve_flags_override_config() {
        let cli = Cli::parse_from(["convertd", "serve", "--port", "9100"]);
        let mut config = Config::for_profile("CLITEST");
        if let Command::Serve { host, port } = cli.command() {
            apply_overrides(&mut config, host, port);
        }
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn maintenance_subcommands_parse() {
        assert_eq!(Cli::parse_from(["convertd", "check"]).command(), Command::Check);
        assert_eq!(Cli::parse_from(["convertd", "sweep"]).command(), Command::Sweep);
    }
}
