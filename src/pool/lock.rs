//! Shared-ownership lock helpers used by the pool and its route sub-pools.
//!

use std::fmt;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::Weak;

use crate::DebugLiteral;

/// An optional weak reference, which may point at an unsized value.
pub(crate) struct WeakOpt<T: ?Sized>(Option<Weak<T>>);

impl<T: ?Sized> WeakOpt<T> {
    pub(crate) fn none() -> Self {
        Self(None)
    }

    pub(crate) fn new(weak: Weak<T>) -> Self {
        Self(Some(weak))
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<T>> {
        self.0.as_ref().and_then(|weak| weak.upgrade())
    }

    #[cfg(test)]
    pub(crate) fn is_none(&self) -> bool {
        self.0.is_none()
    }
}

impl<T: ?Sized> Clone for WeakOpt<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: ?Sized> fmt::Debug for WeakOpt<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(_) => f
                .debug_tuple("WeakOpt")
                .field(&DebugLiteral("Some(...)"))
                .finish(),
            None => f
                .debug_tuple("WeakOpt")
                .field(&DebugLiteral("None"))
                .finish(),
        }
    }
}

/// Reference-counted, mutex-protected data.
#[derive(Debug)]
pub(crate) struct ArcMutex<T>(Arc<parking_lot::Mutex<T>>);

impl<T> Clone for ArcMutex<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> ArcMutex<T> {
    /// Create a new ArcMutex with the given value.
    pub(crate) fn new(value: T) -> Self {
        Self(Arc::new(parking_lot::Mutex::new(value)))
    }

    /// Lock the ArcMutex and return a guard.
    pub(crate) fn lock(&self) -> ArcMutexGuard<T> {
        ArcMutexGuard(self.0.lock_arc())
    }

    /// Returns `true` if any other handle or guard refers to this mutex.
    pub(crate) fn is_shared(&self) -> bool {
        Arc::strong_count(&self.0) > 1
    }
}

/// ArcMutexGuard is a guard that provides mutable access to the value inside the ArcMutex.
pub(crate) struct ArcMutexGuard<T>(parking_lot::ArcMutexGuard<parking_lot::RawMutex, T>);

impl<T> Deref for ArcMutexGuard<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for ArcMutexGuard<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
pub(crate) mod test_weak_opt {
    use super::*;

    #[test]
    fn weak_opt() {
        let arc = Arc::new(());
        let weak = WeakOpt::new(Arc::downgrade(&arc));
        assert!(weak.upgrade().is_some());
        drop(arc);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn weak_opt_none() {
        let weak = WeakOpt::<()>::none();
        assert!(weak.upgrade().is_none());
        assert!(weak.is_none());
    }

    #[test]
    fn weak_opt_unsized() {
        let arc: Arc<dyn fmt::Debug + Send + Sync> = Arc::new(5u8);
        let weak = WeakOpt::new(Arc::downgrade(&arc));
        assert_eq!(format!("{:?}", weak.upgrade().unwrap()), "5");
    }

    #[test]
    fn weak_opt_debug() {
        let arc = Arc::new(());
        let weak = WeakOpt::new(Arc::downgrade(&arc));
        assert_eq!(format!("{weak:?}"), "WeakOpt(Some(...))");

        let weak: WeakOpt<()> = WeakOpt::none();
        assert_eq!(format!("{weak:?}"), "WeakOpt(None)");
    }

    #[test]
    fn arc_mutex_shared() {
        let mutex = ArcMutex::new(1);
        assert!(!mutex.is_shared());

        let guard = mutex.lock();
        assert!(mutex.is_shared());
        drop(guard);

        let other = mutex.clone();
        assert!(mutex.is_shared());
        drop(other);
        assert!(!mutex.is_shared());

        *mutex.lock() += 1;
        assert_eq!(*mutex.lock(), 2);
    }
}
