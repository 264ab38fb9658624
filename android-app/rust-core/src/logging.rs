//! Logcat setup

use std::sync::Once;

use log::LevelFilter;

/// Tag shown in logcat for every record from the core
pub const LOG_TAG: &str = "BandBookCore";

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Install the Android logger. Later calls only adjust the level.
pub fn init(level: LevelFilter) {
    INIT_LOGGER.call_once(|| {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(level)
                .with_tag(LOG_TAG),
        );
    });
    log::set_max_level(level);
}
