//! Structured logging setup.
//!
//! Everything in the crate logs through `tracing`; this module installs the
//! subscriber the binary (or an embedding application) wants.
//!
//! ## Environment Variables
//!
//! - `MASTERCONTROL_LOG` or `RUST_LOG`: filter directive, e.g. `mastercontrol=debug,warn`
//! - `MASTERCONTROL_LOG_FORMAT`: `pretty`, `compact` or `json`
//!
//! ```bash
//! MASTERCONTROL_LOG=mastercontrol::scheduler=debug mastercontrol run
//! MASTERCONTROL_LOG_FORMAT=json mastercontrol run
//! ```

use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

pub const LOG_ENV: &str = "MASTERCONTROL_LOG";
pub const LOG_FORMAT_ENV: &str = "MASTERCONTROL_LOG_FORMAT";
const DEFAULT_FILTER: &str = "mastercontrol=info,warn";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, human-readable
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// Newline-delimited JSON
    Json,
}

impl LogFormat {
    /// Parse case-insensitively; anything unknown is `Pretty`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `EnvFilter` directive
    pub filter: String,
    pub format: LogFormat,
    /// Emit span open/close events
    pub with_spans: bool,
    /// Include file and line
    pub with_file: bool,
    pub with_thread_ids: bool,
    /// Include the module path
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::Pretty,
            with_spans: false,
            with_file: false,
            with_thread_ids: false,
            with_target: true,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        let filter = std::env::var(LOG_ENV)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_FILTER.to_string());

        let format = std::env::var(LOG_FORMAT_ENV)
            .map(|s| LogFormat::parse(&s))
            .unwrap_or_default();

        Self {
            filter,
            format,
            ..Default::default()
        }
    }

    /// Verbose preset; worker thread ids matter when reading dispatch logs.
    pub fn debug() -> Self {
        Self {
            filter: "mastercontrol=debug,info".to_string(),
            with_file: true,
            with_thread_ids: true,
            ..Default::default()
        }
    }

    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            with_spans: true,
            ..Default::default()
        }
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(config: LogConfig) {
    let env_filter =
        EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let span_events = if config.with_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file)
        .with_line_number(config.with_file)
        .with_thread_ids(config.with_thread_ids)
        .with_thread_names(config.with_thread_ids)
        .with_target(config.with_target);

    let layer = match config.format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(env_filter).with(layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Install the subscriber configured by `MASTERCONTROL_LOG` and
/// `MASTERCONTROL_LOG_FORMAT`.
pub fn init_from_env() {
    init(LogConfig::from_env());
}
