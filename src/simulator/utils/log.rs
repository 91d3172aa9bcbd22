/// Logging setup and the global quiet switch
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

static ENABLE_LOG: AtomicBool = AtomicBool::new(true);
static INIT: Once = Once::new();

/// Install env_logger once. Level defaults to `info`, `RUST_LOG` overrides.
pub fn init_log() {
  INIT.call_once(|| {
    let env = env_logger::Env::default().default_filter_or("info");
    let _ = env_logger::Builder::from_env(env)
      .format_timestamp(None)
      .format_target(false)
      .is_test(cfg!(test))
      .try_init();
  });
}

/// Set logging enabled. Disabling drops the level to `warn`.
pub fn set_log(enabled: bool) {
  ENABLE_LOG.store(enabled, Ordering::Relaxed);
  if enabled {
    ::log::set_max_level(::log::LevelFilter::Info);
  } else {
    ::log::set_max_level(::log::LevelFilter::Warn);
  }
}

/// Check if logging is enabled, default is true
pub fn is_log_enabled() -> bool {
  ENABLE_LOG.load(Ordering::Relaxed)
}
