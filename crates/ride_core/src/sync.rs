//! Deadline-bounded lock acquisition. Store operations never wait forever:
//! a lock that cannot be taken before the deadline surfaces as `Timeout`.
//! Poisoned locks are recovered, since every writer replaces whole records.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{DispatchError, DispatchResult};

const MAX_BACKOFF: Duration = Duration::from_millis(1);

fn acquire<G>(
    timeout: Duration,
    operation: &'static str,
    mut try_once: impl FnMut() -> Option<G>,
) -> DispatchResult<G> {
    let deadline = Instant::now() + timeout;
    let mut backoff = Duration::from_micros(5);
    loop {
        if let Some(guard) = try_once() {
            return Ok(guard);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(DispatchError::Timeout {
                operation,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        thread::sleep(backoff.min(deadline - now));
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

pub(crate) fn lock_within<'a, T>(
    mutex: &'a Mutex<T>,
    timeout: Duration,
    operation: &'static str,
) -> DispatchResult<MutexGuard<'a, T>> {
    acquire(timeout, operation, move || match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    })
}

pub(crate) fn read_within<'a, T>(
    lock: &'a RwLock<T>,
    timeout: Duration,
    operation: &'static str,
) -> DispatchResult<RwLockReadGuard<'a, T>> {
    acquire(timeout, operation, move || match lock.try_read() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    })
}

pub(crate) fn write_within<'a, T>(
    lock: &'a RwLock<T>,
    timeout: Duration,
    operation: &'static str,
) -> DispatchResult<RwLockWriteGuard<'a, T>> {
    acquire(timeout, operation, move || match lock.try_write() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    })
}
