//! Process-wide tracing setup shared by the service binaries.

/// Initialize tracing for the process.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init(environment: &str) {
    tracing::init(tracing::LogFormat::for_environment(environment));
}

/// Subscriber configuration (filters, output format).
pub mod tracing;
