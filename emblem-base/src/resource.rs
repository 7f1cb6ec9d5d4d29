use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

//
// A SharedResource is a refcounted wrapper around a decoded asset. Handles are acquired from
// it and released by dropping. When the last handle drops the resource does not die immediately,
// it becomes idle and an idle timestamp starts a grace window. Whoever owns the resource (the
// cache) disposes it once the grace window elapses with no new acquire. Disposal is terminal,
// a disposed resource can never hand out another handle.
//

/// Error returned when acquiring or reading a resource that was already disposed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceDisposedError;

impl std::error::Error for ResourceDisposedError {}

impl fmt::Display for ResourceDisposedError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "resource has been disposed")
    }
}

/// Observable lifecycle state of a shared resource.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceState {
    /// At least one handle is held
    Ready,
    /// No handles held, grace window running
    Idle,
    /// Disposal ran, terminal
    Disposed,
}

/// The predicate/action pair a decoder attaches to an asset. The predicate answers "can this
/// asset still be used" (an externally destroyed texture would say no). The action releases
/// whatever the asset owns and runs at most once, and only while the predicate still holds.
pub struct ResourceLifecycle<T> {
    is_usable: Box<dyn Fn(&T) -> bool + Send + Sync>,
    dispose: Box<dyn FnMut(&mut T) + Send>,
}

impl<T> ResourceLifecycle<T> {
    pub fn new<P, D>(
        is_usable: P,
        dispose: D,
    ) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
        D: FnMut(&mut T) + Send + 'static,
    {
        ResourceLifecycle {
            is_usable: Box::new(is_usable),
            dispose: Box::new(dispose),
        }
    }

    /// Always usable, nothing to release. For plain in-memory assets.
    pub fn trivial() -> Self {
        ResourceLifecycle {
            is_usable: Box::new(|_| true),
            dispose: Box::new(|_| {}),
        }
    }
}

/// What a decoder hands back: the asset plus its lifecycle hooks.
pub struct LoadedAsset<T> {
    pub asset: T,
    pub lifecycle: ResourceLifecycle<T>,
}

impl<T> LoadedAsset<T> {
    pub fn new(asset: T) -> Self {
        LoadedAsset {
            asset,
            lifecycle: ResourceLifecycle::trivial(),
        }
    }

    pub fn with_lifecycle(
        asset: T,
        lifecycle: ResourceLifecycle<T>,
    ) -> Self {
        LoadedAsset { asset, lifecycle }
    }
}

struct ResourceShared<T> {
    asset: RwLock<T>,
    ref_count: AtomicU32,
    disposed: AtomicBool,
    // Some(instant) while ref_count == 0, None while handles are held
    idle_since: Mutex<Option<Instant>>,
    is_usable: Box<dyn Fn(&T) -> bool + Send + Sync>,
    // taken on dispose so the action can only run once
    dispose: Mutex<Option<Box<dyn FnMut(&mut T) + Send>>>,
}

/// Owning side of a refcounted asset. The owner (a cache entry) keeps this and hands out
/// [`ResourceHandle`]s via [`SharedResource::acquire`]. The owner itself is uncounted.
pub struct SharedResource<T> {
    shared: Arc<ResourceShared<T>>,
}

impl<T> SharedResource<T> {
    pub fn new(
        asset: T,
        lifecycle: ResourceLifecycle<T>,
    ) -> Self {
        SharedResource {
            shared: Arc::new(ResourceShared {
                asset: RwLock::new(asset),
                ref_count: AtomicU32::new(0),
                disposed: AtomicBool::new(false),
                // no handles yet, the grace clock starts immediately
                idle_since: Mutex::new(Some(Instant::now())),
                is_usable: lifecycle.is_usable,
                dispose: Mutex::new(Some(lifecycle.dispose)),
            }),
        }
    }

    /// Take a new counted handle. Fails if the resource was already disposed, a disposed
    /// resource is never resurrected and the caller must re-request a fresh load.
    pub fn acquire(&self) -> Result<ResourceHandle<T>, ResourceDisposedError> {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(ResourceDisposedError);
        }

        self.shared.ref_count.fetch_add(1, Ordering::AcqRel);
        *self.shared.idle_since.lock().unwrap() = None;
        Ok(ResourceHandle {
            shared: self.shared.clone(),
        })
    }

    /// True while the resource is not disposed and its usability predicate still holds.
    pub fn is_valid(&self) -> bool {
        if self.shared.disposed.load(Ordering::Acquire) {
            return false;
        }
        let asset = self.shared.asset.read().unwrap();
        (self.shared.is_usable)(&asset)
    }

    pub fn ref_count(&self) -> u32 {
        self.shared.ref_count.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ResourceState {
        if self.shared.disposed.load(Ordering::Acquire) {
            ResourceState::Disposed
        } else if self.shared.ref_count.load(Ordering::Acquire) > 0 {
            ResourceState::Ready
        } else {
            ResourceState::Idle
        }
    }

    /// True once the resource has sat idle (no handles) for at least `grace`.
    pub fn is_expired(
        &self,
        grace: Duration,
    ) -> bool {
        if self.shared.disposed.load(Ordering::Acquire) {
            return false;
        }
        if self.shared.ref_count.load(Ordering::Acquire) > 0 {
            return false;
        }
        match *self.shared.idle_since.lock().unwrap() {
            Some(idle_since) => idle_since.elapsed() >= grace,
            None => false,
        }
    }

    /// Terminal. Runs the disposal action if the asset is still usable, skips it otherwise
    /// (an externally dead asset has nothing left to release). Idempotent.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let dispose = self.shared.dispose.lock().unwrap().take();
        if let Some(mut dispose) = dispose {
            let mut asset = self.shared.asset.write().unwrap();
            if (self.shared.is_usable)(&asset) {
                (dispose)(&mut asset);
            }
        }
    }
}

impl<T> fmt::Debug for SharedResource<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("SharedResource")
            .field("state", &self.state())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Counted RAII handle to a shared asset. Clone to add a reference, drop to release one.
/// The last drop starts the owner's grace window.
pub struct ResourceHandle<T> {
    shared: Arc<ResourceShared<T>>,
}

impl<T> ResourceHandle<T> {
    /// Shared read access to the asset for blitting/inspection.
    pub fn read(&self) -> Result<ResourceReadGuard<'_, T>, ResourceDisposedError> {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(ResourceDisposedError);
        }
        Ok(ResourceReadGuard {
            guard: self.shared.asset.read().unwrap(),
        })
    }

    /// True while the resource is not disposed and its usability predicate still holds.
    /// A handle whose predicate went false must be treated as unusable and re-requested.
    pub fn is_valid(&self) -> bool {
        if self.shared.disposed.load(Ordering::Acquire) {
            return false;
        }
        let asset = self.shared.asset.read().unwrap();
        (self.shared.is_usable)(&asset)
    }

    pub fn ref_count(&self) -> u32 {
        self.shared.ref_count.load(Ordering::Acquire)
    }

    /// True if both handles refer to the same underlying resource instance.
    pub fn same_resource(
        &self,
        other: &ResourceHandle<T>,
    ) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T> Clone for ResourceHandle<T> {
    fn clone(&self) -> Self {
        // A live handle means the count is nonzero and the resource cannot be mid-dispose
        let previous = self.shared.ref_count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
        ResourceHandle {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for ResourceHandle<T> {
    fn drop(&mut self) {
        let previous = self.shared.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
        if previous == 1 {
            *self.shared.idle_since.lock().unwrap() = Some(Instant::now());
        }
    }
}

impl<T> fmt::Debug for ResourceHandle<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

pub struct ResourceReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
}

impl<'a, T> std::ops::Deref for ResourceReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn acquire_and_release_track_ref_count() {
        let resource = SharedResource::new(7u32, ResourceLifecycle::trivial());
        assert_eq!(resource.state(), ResourceState::Idle);

        let a = resource.acquire().unwrap();
        assert_eq!(resource.ref_count(), 1);
        assert_eq!(resource.state(), ResourceState::Ready);

        let b = a.clone();
        assert_eq!(resource.ref_count(), 2);

        drop(a);
        assert_eq!(resource.ref_count(), 1);
        assert_eq!(resource.state(), ResourceState::Ready);

        drop(b);
        assert_eq!(resource.ref_count(), 0);
        assert_eq!(resource.state(), ResourceState::Idle);
    }

    #[test]
    fn idle_resource_expires_after_grace() {
        let resource = SharedResource::new(0u32, ResourceLifecycle::trivial());
        assert!(!resource.is_expired(Duration::from_millis(50)));
        std::thread::sleep(Duration::from_millis(60));
        assert!(resource.is_expired(Duration::from_millis(50)));

        // acquiring clears the idle clock
        let handle = resource.acquire().unwrap();
        assert!(!resource.is_expired(Duration::from_millis(0)));
        drop(handle);
        assert!(!resource.is_expired(Duration::from_millis(50)));
    }

    #[test]
    fn dispose_runs_action_once() {
        let dispose_count = Arc::new(AtomicUsize::new(0));
        let dispose_count_clone = dispose_count.clone();
        let resource = SharedResource::new(
            0u32,
            ResourceLifecycle::new(
                |_| true,
                move |_| {
                    dispose_count_clone.fetch_add(1, Ordering::SeqCst);
                },
            ),
        );

        resource.dispose();
        resource.dispose();
        assert_eq!(dispose_count.load(Ordering::SeqCst), 1);
        assert_eq!(resource.state(), ResourceState::Disposed);
    }

    #[test]
    fn dispose_skips_action_when_predicate_fails() {
        let dispose_count = Arc::new(AtomicUsize::new(0));
        let dispose_count_clone = dispose_count.clone();
        let resource = SharedResource::new(
            0u32,
            ResourceLifecycle::new(
                |value: &u32| *value != 0,
                move |_| {
                    dispose_count_clone.fetch_add(1, Ordering::SeqCst);
                },
            ),
        );

        assert!(!resource.is_valid());
        resource.dispose();
        assert_eq!(dispose_count.load(Ordering::SeqCst), 0);
        assert_eq!(resource.state(), ResourceState::Disposed);
    }

    #[test]
    fn acquire_after_dispose_fails() {
        let resource = SharedResource::new(0u32, ResourceLifecycle::trivial());
        let handle = resource.acquire().unwrap();
        resource.dispose();

        assert_eq!(resource.acquire().unwrap_err(), ResourceDisposedError);
        assert!(handle.read().is_err());
        assert!(!handle.is_valid());
    }

    #[test]
    fn read_sees_the_asset() {
        let resource = SharedResource::new(41u32, ResourceLifecycle::trivial());
        let handle = resource.acquire().unwrap();
        assert_eq!(*handle.read().unwrap(), 41);

        let other = resource.acquire().unwrap();
        assert!(handle.same_resource(&other));
    }
}
