use tracing_subscriber::{fmt, EnvFilter};

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`)
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(true).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_refused() {
        init_tracing();
        assert!(!init_tracing());
    }
}
