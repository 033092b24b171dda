//! Tracing bootstrap for binaries and demos.

use tracing_subscriber::EnvFilter;

/// Installs a global `fmt` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directive` is used
/// (e.g. `"siyaq=debug"`). Returns `false` if a global subscriber was
/// already installed, which is harmless in tests.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_reported() {
        let _ = init_tracing("siyaq=trace");
        assert!(!init_tracing("siyaq=trace"));
    }
}
