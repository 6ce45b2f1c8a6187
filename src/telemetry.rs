//! Logging setup for the binary

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,efs_attach=debug,kube=info";

/// Build the env filter: `RUST_LOG` when set and valid, otherwise
/// [`DEFAULT_FILTER`]
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. `json` switches to one JSON object per
/// event for log shipping.
///
/// Calling this twice is harmless; the second call is ignored.
pub fn init_tracing(json: bool) {
    let registry = tracing_subscriber::registry().with(env_filter());
    let result = if json {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "tracing already initialized");
    }
}
