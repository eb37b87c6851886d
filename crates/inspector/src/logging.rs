//! Logging setup.

use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Initialize logging.
///
/// Logs go to stdout unless `to_file` is set, in which case they are
/// appended to `inspector.log` in the platform log directory. `RUST_LOG`
/// overrides the default filter. Returns the log file path when one is used.
pub fn init(verbose: bool, to_file: bool) -> Option<PathBuf> {
    let filter = if verbose {
        "inspector=debug,inspector_server=debug,inspector_proxy=debug,inspector_auth=debug,tower_http=debug"
    } else {
        "inspector=info,inspector_server=info,inspector_proxy=info,inspector_auth=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    if !to_file {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(true)
            .init();
        return None;
    }

    let log_dir = log_dir();
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: Could not create log directory: {}", e);
        return None;
    }

    let log_file = log_dir.join("inspector.log");
    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not open log file: {}", e);
            return None;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(file)
        .init();

    Some(log_file)
}

/// Get the log directory path.
pub fn log_dir() -> PathBuf {
    // macOS: ~/Library/Logs/inspector
    // Linux: ~/.local/state/inspector/logs
    // Windows: %LOCALAPPDATA%/inspector/logs

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = dirs::home_dir() {
            return home.join("Library/Logs/inspector");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Some(state_dir) = dirs::state_dir() {
            return state_dir.join("inspector/logs");
        }
        if let Some(home) = dirs::home_dir() {
            return home.join(".local/state/inspector/logs");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(local_app) = dirs::data_local_dir() {
            return local_app.join("inspector/logs");
        }
    }

    PathBuf::from(".inspector/logs")
}
