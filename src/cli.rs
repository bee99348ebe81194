use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "slotwatch")]
#[command(about = "Track in-flight tasks per account and audit abnormal concurrency", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the HTTP API and the background high-activity scanner.
    Serve {
        /// JSON config file. Missing file means defaults.
        #[arg(short, long, default_value = "slotwatch.json")]
        config: PathBuf,
        /// Override the bind address
        #[arg(long)]
        bind: Option<String>,
        /// Override the listen port
        #[arg(long)]
        port: Option<u16>,
        /// Do not start the background scanner.
        #[arg(long)]
        no_scanner: bool,
    },

    /// Query recorded high-activity snapshots.
    History {
        /// History database (SQLite)
        #[arg(long, default_value = "slotwatch.sqlite")]
        db: PathBuf,
        /// Only records created at or after this unix timestamp
        #[arg(long, default_value_t = 0)]
        start: i64,
        /// Only records created at or before this unix timestamp
        #[arg(long, default_value_t = 0)]
        end: i64,
        /// Only records for this owner id
        #[arg(long, default_value_t = 0)]
        owner: i64,
        /// Maximum rows (default 100)
        #[arg(short = 'n', long, default_value_t = 0)]
        limit: i64,
        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the six-level prefix fingerprint of a payload.
    Fingerprint {
        /// Read payload from file
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,
        /// Inline text payload
        #[arg(long)]
        text: Option<String>,
        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a default config file.
    InitConfig { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve() {
        let cli = Cli::try_parse_from(["slotwatch", "serve", "--port", "9000", "--no-scanner"]).unwrap();
        match cli.command {
            Command::Serve {
                config,
                port,
                no_scanner,
                bind,
            } => {
                assert_eq!(config, PathBuf::from("slotwatch.json"));
                assert_eq!(port, Some(9000));
                assert!(no_scanner);
                assert!(bind.is_none());
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_fingerprint_inputs_conflict() {
        assert!(
            Cli::try_parse_from(["slotwatch", "fingerprint", "--file", "a", "--text", "b"]).is_err()
        );
    }
}
