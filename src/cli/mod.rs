pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::utils::default_log_file;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Also write logs to the default log file in the user data directory
    #[arg(long, global = true, conflicts_with = "log_file")]
    pub save_log: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a list of pages in a new workflow
    Run {
        /// Project directory that receives results and checkpoints
        #[arg(short, long)]
        project: PathBuf,

        /// Configuration file (defaults to the user config)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// File with one URL per line
        #[arg(short, long)]
        urls_file: Option<PathBuf>,

        /// Page URLs to analyze
        urls: Vec<String>,
    },

    /// Continue a workflow from its last checkpoint
    Resume {
        #[arg(short, long)]
        project: PathBuf,

        /// Workflow ID to resume
        #[arg(required = true)]
        workflow_id: String,
    },

    /// Show the checkpointed progress of a workflow
    Status {
        #[arg(short, long)]
        project: PathBuf,

        /// Workflow ID to inspect
        #[arg(required = true)]
        workflow_id: String,

        /// List the result file and page title of every analyzed page
        #[arg(long)]
        results: bool,
    },

    /// Show or create the default configuration
    Config {
        /// Write a fresh default configuration file
        #[arg(long)]
        init: bool,

        /// Configuration file to show or write
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

impl Cli {
    /// File that receives a copy of the log output, if any
    pub fn log_target(&self) -> Option<PathBuf> {
        self.log_file
            .clone()
            .or_else(|| self.save_log.then(default_log_file))
    }
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run {
            project,
            config,
            urls_file,
            urls,
        } => {
            info!("Starting workflow in {}", project.display());
            commands::run(project, config, urls_file, urls).await
        }
        Commands::Resume { project, workflow_id } => {
            info!("Resuming workflow {}", workflow_id);
            commands::resume(project, workflow_id).await
        }
        Commands::Status {
            project,
            workflow_id,
            results,
        } => commands::status(project, workflow_id, results).await,
        Commands::Config { init, path } => {
            if init {
                commands::init_config(path).await
            } else {
                commands::show_config(path).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "workflow",
            "--verbose",
            "run",
            "--project",
            "/tmp/acme",
            "https://a.example.com/",
            "https://b.example.com/",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Run { project, urls, urls_file, .. } => {
                assert_eq!(project, PathBuf::from("/tmp/acme"));
                assert_eq!(urls.len(), 2);
                assert!(urls_file.is_none());
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_log_target() {
        let cli = Cli::try_parse_from(["workflow", "config"]).unwrap();
        assert!(cli.log_target().is_none());

        let cli = Cli::try_parse_from(["workflow", "config", "--save-log"]).unwrap();
        assert_eq!(cli.log_target(), Some(default_log_file()));

        let cli = Cli::try_parse_from(["workflow", "--log-file", "/tmp/run.log", "config"]).unwrap();
        assert_eq!(cli.log_target(), Some(PathBuf::from("/tmp/run.log")));

        assert!(Cli::try_parse_from(["workflow", "--log-file", "/tmp/run.log", "--save-log", "config"]).is_err());
    }

    #[test]
    fn test_parse_status_results() {
        let cli = Cli::try_parse_from(["workflow", "status", "--project", "/tmp/acme", "--results", "wf-1"]).unwrap();
        match cli.command {
            Commands::Status { workflow_id, results, .. } => {
                assert_eq!(workflow_id, "wf-1");
                assert!(results);
            }
            _ => panic!("expected status command"),
        }
    }

    #[test]
    fn test_resume_requires_workflow_id() {
        assert!(Cli::try_parse_from(["workflow", "resume", "--project", "/tmp/acme"]).is_err());
    }
}
