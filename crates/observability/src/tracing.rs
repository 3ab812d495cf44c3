//! Tracing/logging initialization.
//!
//! Filtering comes from `RUST_LOG` (default `info`, with sqlx statement logging
//! turned down to `warn`).

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,sqlx=warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers.
    Json,
    /// Human-readable single-line output.
    Compact,
}

impl LogFormat {
    /// JSON everywhere except local development.
    pub fn for_environment(environment: &str) -> Self {
        match environment {
            "development" | "dev" | "local" | "test" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

pub fn init(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
}
