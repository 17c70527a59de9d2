//! Tracing subscriber setup

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Build the log filter
///
/// `RUST_LOG` wins; otherwise `-v` raises the level above the configured
/// one, never below it. russh stays at `warn` unless `-vvv` is given.
pub fn env_filter(verbosity: u8, configured: &str) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::try_new(directives(verbosity, configured))
        .unwrap_or_else(|_| EnvFilter::new("warn,russh=warn"))
}

fn directives(verbosity: u8, configured: &str) -> String {
    let requested = match verbosity {
        0 => None,
        1 => Some(LevelFilter::INFO),
        2 => Some(LevelFilter::DEBUG),
        _ => return "trace,russh=debug".to_string(),
    };

    match (requested, configured.parse::<LevelFilter>()) {
        (Some(requested), Ok(level)) => {
            format!("{},russh=warn", lowercase(requested.max(level)))
        }
        // configured value is a full directive list, not a single level
        (Some(requested), Err(_)) => format!("{},russh=warn", lowercase(requested)),
        (None, _) => format!("{configured},russh=warn"),
    }
}

// LevelFilter displays as "INFO"
fn lowercase(level: LevelFilter) -> String {
    level.to_string().to_ascii_lowercase()
}

/// Install the global subscriber; logs go to stderr
pub fn init(verbosity: u8, configured: &str, format: LogFormat) {
    let filter = env_filter(verbosity, configured);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.with_target(false).init(),
        LogFormat::Json => builder.json().init(),
    }
}
