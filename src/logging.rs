//! Tracing subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

/// Default filter directive for a verbosity level.
///
/// `quiet` wins over `verbose`: only errors are shown.
pub fn default_directive(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbose {
        0 => "warn",
        1 => "voxrelay=info,warn",
        2 => "voxrelay=debug,info",
        _ => "trace",
    }
}

/// Installs a stderr `fmt` subscriber. `RUST_LOG` takes precedence over the
/// verbosity flags. Calling it twice is harmless.
pub fn init_tracing(verbose: u8, quiet: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, quiet)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose >= 2)
        .with_thread_names(verbose >= 2)
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_overrides_verbose() {
        assert_eq!(default_directive(3, true), "error");
    }

    #[test]
    fn verbosity_levels_increase() {
        assert_eq!(default_directive(0, false), "warn");
        assert!(default_directive(1, false).contains("info"));
        assert!(default_directive(2, false).contains("debug"));
        assert_eq!(default_directive(5, false), "trace");
    }

    #[test]
    fn init_twice_does_not_panic() {
        init_tracing(0, true);
        init_tracing(2, false);
    }
}
