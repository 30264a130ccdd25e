//! Runner logging setup.
use log::{debug, info, LevelFilter};

/// Install the global logger at `level`, letting `RUST_LOG` override it, and log the banner.
pub fn init_logging(level: LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_micros()
        .init();

    info!(
        "\x1b[1mIPC buffer allocator self-test\x1b[0m v{} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("VERGEN_CARGO_TARGET_TRIPLE"),
    );
    debug!("Build timestamp: {}", env!("VERGEN_BUILD_TIMESTAMP"));
    debug!("Debug build: {}", env!("VERGEN_CARGO_DEBUG"));
}
