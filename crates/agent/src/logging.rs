//! Logging bootstrap. The agent keeps the numeric `--loglvl` verbosity knob
//! its operators already script around, mapped onto a tracing level filter.

/// The format for logs.
#[derive(Debug, clap::ValueEnum, Clone, Copy)]
pub enum LogFormat {
    /// One JSON object per line on stderr.
    Json,
    /// Plain text with no colors.
    Text,
    /// Same as plain text, but with colors for interactive terminals.
    Color,
}

fn default_log_format() -> LogFormat {
    if atty::is(atty::Stream::Stderr) {
        LogFormat::Color
    } else {
        // Non-interactive runs feed log shippers; JSON saves them a parser.
        LogFormat::Json
    }
}

/// Numeric verbosity: 10 debug, 20 info, 30 warn, 40+ error. Values at or
/// below 5 open the trace firehose.
fn level_filter(loglvl: u8) -> &'static str {
    match loglvl {
        0..=5 => "trace",
        6..=10 => "debug",
        11..=20 => "info",
        21..=30 => "warn",
        _ => "error",
    }
}

/// Initializes the global subscriber. Panics if called twice.
pub fn init(loglvl: u8, format: Option<LogFormat>) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(level_filter(loglvl))
        .with_target(false);

    match format.unwrap_or_else(default_log_format) {
        LogFormat::Json => {
            builder.json().flatten_event(true).init();
        }
        LogFormat::Text => {
            builder.compact().with_ansi(false).init();
        }
        LogFormat::Color => {
            builder.compact().with_ansi(true).init();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn numeric_levels_map_onto_filters() {
        assert_eq!(level_filter(10), "debug");
        assert_eq!(level_filter(20), "info");
        assert_eq!(level_filter(30), "warn");
        assert_eq!(level_filter(40), "error");
        assert_eq!(level_filter(50), "error");
    }
}
