use std::sync::Once;

use slog::Drain;

/// Install the process-wide logger on stderr. Safe to call more than once;
/// only the first call takes effect.
///
/// Stderr keeps the log stream out of the way of `-n`/`-v` stdout output and
/// survives the daemon child's stdout redirection.
pub fn init_terminal(verbose: bool) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::CompactFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
            .fuse();
        let root = slog::Logger::root(drain, slog::o!());

        // The logger stays installed for the lifetime of the process, so
        // the reset guard can be discarded outright.
        slog_scope::set_global_logger(root).cancel_reset();
        let _ = slog_stdlog::init();
        log::set_max_level(max_level(verbose));
    });
}

/// Logger for the WireGuard device, honoring the `-s` silent flag.
#[must_use]
pub fn device_logger(silent: bool) -> slog::Logger {
    if silent {
        slog::Logger::root(slog::Discard, slog::o!())
    } else {
        slog_scope::logger().new(slog::o!("subsystem" => "device"))
    }
}

/// `RUST_LOG` overrides the flag-derived level when it names a valid filter.
fn max_level(verbose: bool) -> log::LevelFilter {
    let flag_level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    std::env::var("RUST_LOG")
        .ok()
        .and_then(|value| value.trim().to_ascii_lowercase().parse().ok())
        .unwrap_or(flag_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_level_follows_verbose_flag() {
        std::env::remove_var("RUST_LOG");
        assert_eq!(max_level(false), log::LevelFilter::Info);
        assert_eq!(max_level(true), log::LevelFilter::Debug);
    }

    #[test]
    fn test_device_logger_discards_when_silent() {
        // A discard logger must swallow records without a global logger set.
        let logger = device_logger(true);
        slog::info!(logger, "dropped");
    }
}
