//! Tracing subscriber setup for embedding applications

use tracing_subscriber::{fmt, EnvFilter};

/// Directive used when `RUST_LOG` is unset
pub const DEFAULT_DIRECTIVE: &str = "quarry=info";

/// Install a formatted `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_directive`. Returns false if a
/// global subscriber was already installed, which leaves it in place.
pub fn init_logging(default_directive: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        init_logging(DEFAULT_DIRECTIVE);
        assert!(!init_logging("quarry=debug"));
    }
}
