use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Build the log filter. `RUST_LOG` directives are kept; ours are added on top.
fn build_filter(verbose: bool) -> Result<EnvFilter> {
    let level = if verbose { "debug" } else { "info" };
    Ok(EnvFilter::from_default_env()
        .add_directive(format!("page_workflow={}", level).parse()?)
        .add_directive("warn".parse()?))
}

/// Initialize the logging system
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let env_filter = build_filter(verbose)?;
    let console = fmt::layer().with_target(verbose);

    match log_file {
        Some(log_file) => {
            if let Some(parent) = log_file.parent() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create log directory: {}", parent.display()))?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .context(format!("Failed to open log file: {}", log_file.display()))?;
            let file_layer = fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(file);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .with(file_layer)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .init();
        }
    }

    Ok(())
}

/// Default log file location under the user data directory
pub fn default_log_file() -> PathBuf {
    let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "page-workflow", "page-workflow") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from("./logs")
    };

    path.push("workflow.log");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_levels() {
        assert!(build_filter(false).unwrap().to_string().contains("page_workflow=info"));
        assert!(build_filter(true).unwrap().to_string().contains("page_workflow=debug"));
    }

    #[test]
    fn test_default_log_file_name() {
        assert!(default_log_file().ends_with("workflow.log"));
    }
}
