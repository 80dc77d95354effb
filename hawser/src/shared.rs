use std::io;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Connection identifier: positive, monotonic within an endpoint, never
/// reused during a run.
pub type ConnId = i64;

/// Group identifier; 0 means "no group".
pub type GroupId = i64;

pub type NetResult<T> = Result<T, NetError>;

/// Two-level error plumbing for the non-blocking data path. `Wait` flags a
/// retryable would-block condition (no full frame buffered yet); `Fatal`
/// carries a terminal error kind.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FrameTooLarge,
    Codec,
    Closed,
    HandlerMissing,
    QueueFull,
    Panic,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}

// Poison-tolerant lock helpers. Panics are contained at task boundaries, so a
// poisoned lock only means a tick was abandoned mid-flight; the guarded data
// is still structurally sound.

#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

#[inline]
pub(crate) fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(|err| err.into_inner())
}

#[inline]
pub(crate) fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(|err| err.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_maps_to_wait() {
        let err: NetError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetError::Wait);
    }

    #[test]
    fn test_other_io_errors_are_fatal() {
        let err: NetError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(err, NetError::Fatal(ErrorKind::Io(io::ErrorKind::ConnectionReset)));
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), NetError>(()).has_failed());
        assert!(!Err::<(), NetError>(NetError::Wait).has_failed());
        assert!(Err::<(), NetError>(NetError::Fatal(ErrorKind::Closed)).has_failed());
    }
}
