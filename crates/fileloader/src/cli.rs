//! Command-line surface
//!
//! Exit codes: 0 when the run had no fatal internal errors (per-file
//! failures do not fail the process), 1 for internal-fatal conditions,
//! 2 for configuration errors.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "fileloader",
    version,
    about = "Ingest structured data files into relational and analytic targets"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose (debug-level) console logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process all matching files in the drop directory
    Run {
        /// Process a single file path instead of scanning the directory
        #[arg(long)]
        file: Option<String>,

        /// Override the configured drop directory
        #[arg(long)]
        directory: Option<String>,

        /// Restrict matching to one named source
        #[arg(long)]
        source: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "fileloader",
            "run",
            "--file",
            "/drop/orders.csv",
            "--source",
            "orders",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { file, source, directory } => {
                assert_eq!(file.as_deref(), Some("/drop/orders.csv"));
                assert_eq!(source.as_deref(), Some("orders"));
                assert!(directory.is_none());
            },
        }
    }

    #[test]
    fn requires_a_subcommand() {
        assert!(Cli::try_parse_from(["fileloader"]).is_err());
    }
}
