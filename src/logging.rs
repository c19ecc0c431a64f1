use log::LevelFilter;
use std::sync::OnceLock;

static LOGGER_INIT: OnceLock<()> = OnceLock::new();

/// Install the process logger. `RUST_LOG` overrides the default `info` level.
pub fn init() {
    LOGGER_INIT.get_or_init(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Info)
            .parse_default_env()
            .format_timestamp_millis()
            .init();
    });
}
