//! Shared test helpers. Env-var-mutating tests (config resolution) need a
//! process-wide lock so they don't stomp on each other's `std::env::set_var`
//! calls when the test binary runs them concurrently.

#![cfg(test)]

use std::sync::{Mutex, OnceLock};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn lock_env() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
