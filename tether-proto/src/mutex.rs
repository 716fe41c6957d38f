use std::fmt::Debug;
use std::ops::{Deref, DerefMut};

#[cfg(feature = "lock_tracking")]
mod tracking {
    use super::*;
    use std::time::{Duration, Instant};
    use tracing::warn;

    #[derive(Debug)]
    struct Inner<T> {
        last_owner: Option<(&'static str, Duration)>,
        value: T,
    }

    /// A Mutex which optionally tracks how long the write-queue lock is
    /// contended for and held, and warns about excessive times
    pub(crate) struct Mutex<T> {
        inner: std::sync::Mutex<Inner<T>>,
    }

    impl<T: Debug> Debug for Mutex<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            Debug::fmt(&self.inner, f)
        }
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: std::sync::Mutex::new(Inner {
                    last_owner: None,
                    value,
                }),
            }
        }

        /// Acquires the lock for a certain purpose
        ///
        /// The purpose is recorded as the last lock owner
        pub(crate) fn lock(&self, purpose: &'static str) -> MutexGuard<'_, T> {
            let contended_at = Instant::now();
            let guard = self.inner.lock().unwrap();
            let acquired_at = Instant::now();

            let waited = acquired_at.duration_since(contended_at);
            if waited >= Duration::from_millis(1) {
                warn!(
                    "waited {waited:?} to lock the write queues for {purpose}; last owner: {:?}",
                    guard.last_owner
                );
            }

            MutexGuard {
                guard,
                acquired_at,
                purpose,
            }
        }
    }

    pub(crate) struct MutexGuard<'a, T> {
        guard: std::sync::MutexGuard<'a, Inner<T>>,
        acquired_at: Instant,
        purpose: &'static str,
    }

    impl<T> Drop for MutexGuard<'_, T> {
        fn drop(&mut self) {
            let held = self.acquired_at.elapsed();
            if held >= Duration::from_millis(1) {
                warn!("held the write queues for {held:?} during {}", self.purpose);
            }
            self.guard.last_owner = Some((self.purpose, held));
        }
    }

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            &self.guard.value
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.guard.value
        }
    }
}

#[cfg(feature = "lock_tracking")]
pub(crate) use tracking::{Mutex, MutexGuard};

#[cfg(not(feature = "lock_tracking"))]
mod non_tracking {
    use super::*;

    /// A Mutex which optionally tracks how long the write-queue lock is
    /// contended for and held, and warns about excessive times
    #[derive(Debug)]
    pub(crate) struct Mutex<T> {
        inner: std::sync::Mutex<T>,
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: std::sync::Mutex::new(value),
            }
        }

        /// Acquires the lock for a certain purpose
        pub(crate) fn lock(&self, _purpose: &'static str) -> MutexGuard<'_, T> {
            MutexGuard {
                guard: self.inner.lock().unwrap(),
            }
        }
    }

    pub(crate) struct MutexGuard<'a, T> {
        guard: std::sync::MutexGuard<'a, T>,
    }

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            self.guard.deref()
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            self.guard.deref_mut()
        }
    }
}

#[cfg(not(feature = "lock_tracking"))]
pub(crate) use non_tracking::{Mutex, MutexGuard};
