//! Log subscriber setup.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing::level_filters::LevelFilter;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

use crate::config::LogConfig;

/// Dependencies that are chatty below warn.
const NOISY_TARGETS: [&str; 4] = ["hyper=warn", "hyper_util=warn", "reqwest=warn", "rustls=warn"];

/// Map a configured level name to a filter.
///
/// `silent` turns logging off. Unknown names yield `None`.
pub fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "" | "info" => Some(LevelFilter::INFO),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        "silent" | "off" => Some(LevelFilter::OFF),
        _ => None,
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` directives take precedence over the configured level. When a
/// log file is configured, output goes to stdout and is appended to the
/// file. Calling this twice keeps the first subscriber.
pub fn init(config: &LogConfig) {
    let level = parse_level(&config.level);

    let mut filter = EnvFilter::builder()
        .with_default_directive(level.unwrap_or(LevelFilter::INFO).into())
        .from_env_lossy();
    for directive in NOISY_TARGETS {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let mut file_error = None;
    let log_file = config
        .file
        .as_deref()
        .filter(|path| !path.as_os_str().is_empty())
        .and_then(|path| {
            open_log_file(path)
                .inspect_err(|e| file_error = Some((path, e.to_string())))
                .ok()
        });

    let (writer, ansi) = match log_file {
        Some(log) => (BoxMakeWriter::new(std::io::stdout.and(Mutex::new(log))), false),
        None => (BoxMakeWriter::new(std::io::stdout), true),
    };

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false)
        .try_init()
        .is_ok();
    if !installed {
        return;
    }

    if level.is_none() {
        warn!(level = %config.level, "unknown log level, using info");
    }
    if let Some((path, e)) = file_error {
        warn!(path = %path.display(), error = %e, "cannot open log file, logging to stdout only");
    }
}

fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
