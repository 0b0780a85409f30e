// Shared helpers: lock recovery, token masking, retry backoff

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock acquisition that recovers from poisoning instead of panicking
pub(crate) trait LockExt<T> {
    fn lock_or_recover(&self) -> MutexGuard<'_, T>;
}

impl<T> LockExt<T> for Mutex<T> {
    #[track_caller]
    fn lock_or_recover(&self) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                let loc = std::panic::Location::caller();
                tracing::error!(
                    lock_type = std::any::type_name::<T>(),
                    file = loc.file(),
                    line = loc.line(),
                    "Mutex poisoned, recovering inner state"
                );
                poisoned.into_inner()
            }
        }
    }
}

/// Read/write counterpart of [`LockExt`]
pub(crate) trait RwLockExt<T> {
    fn read_or_recover(&self) -> RwLockReadGuard<'_, T>;
    fn write_or_recover(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> RwLockExt<T> for RwLock<T> {
    #[track_caller]
    fn read_or_recover(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(|poisoned| {
            tracing::error!(
                lock_type = std::any::type_name::<T>(),
                "RwLock poisoned on read, recovering inner state"
            );
            poisoned.into_inner()
        })
    }

    #[track_caller]
    fn write_or_recover(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(|poisoned| {
            tracing::error!(
                lock_type = std::any::type_name::<T>(),
                "RwLock poisoned on write, recovering inner state"
            );
            poisoned.into_inner()
        })
    }
}

/// Short, log-safe prefix of a secret
pub fn mask_token(token: &str) -> String {
    let visible: String = token.chars().take(6).collect();
    if token.chars().count() <= 6 {
        "***".to_string()
    } else {
        format!("{}***", visible)
    }
}

/// Exponential backoff delay in milliseconds: base * 2^attempt plus up to 10% jitter
pub(crate) fn backoff_delay_ms(base_delay_ms: u64, attempt: u32) -> u64 {
    let delay = base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let jitter = (delay as f64 * 0.1 * rand::random()) as u64;
    delay.saturating_add(jitter)
}

// Simple random number generation for jitter
mod rand {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hash, Hasher};

    pub fn random() -> f64 {
        let state = RandomState::new();
        let mut hasher = state.build_hasher();
        std::time::SystemTime::now().hash(&mut hasher);
        (hasher.finish() % 1000) as f64 / 1000.0
    }
}
