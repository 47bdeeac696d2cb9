use std::sync::{Mutex, OnceLock};

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Serialises tests that read or mutate `FLINT_*` and `HOME`.
pub(crate) fn with_locked_env<R>(run: impl FnOnce() -> R) -> R {
    let _guard = env_lock()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    run()
}

/// Sets an environment variable; call inside `with_locked_env`.
pub(crate) fn set_env_var(key: &str, value: &str) {
    // SAFETY: env mutation is serialised by `with_locked_env`.
    unsafe {
        std::env::set_var(key, value);
    }
}

/// Removes an environment variable; call inside `with_locked_env`.
pub(crate) fn remove_env_var(key: &str) {
    // SAFETY: env mutation is serialised by `with_locked_env`.
    unsafe {
        std::env::remove_var(key);
    }
}
