use log::LevelFilter;

/// Initializes the process-wide log sink. Idempotent: later calls are no-ops, matching the
/// single "logging is the only process-wide sink" rule the control plane relies on.
pub fn init(level: LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .is_test(false)
        .try_init();
}
