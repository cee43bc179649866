use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default directives when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,chat_sync=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize tracing with a compact, human-readable stdout layer.
///
/// - Default level: INFO (crate at DEBUG), override via RUST_LOG env
/// - Safe to call more than once; later calls are no-ops
///
/// Returns `true` if this call installed the subscriber.
pub fn init() -> bool {
    let stdout_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(stdout_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!("Tracing initialized");
    }
    installed
}

/// Initialize tracing with line-delimited JSON output, for hosts that ship
/// logs to a collector.
pub fn init_json() -> bool {
    let json_layer = fmt::layer().json().with_current_span(false);

    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(json_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!("Tracing initialized (json)");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_noop() {
        // Whichever initializer runs first wins; every later call reports false.
        let _ = init();
        assert!(!init());
        assert!(!init_json());
    }
}
