//! Subscription handles
//!
//! A [`Handle`] is a plain numeric id tagged with the callback signature it
//! belongs to, so a handle obtained from one subscription list can't be
//! passed to another by accident. Id 0 is the null handle.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque subscription token for callbacks of signature `S`
pub struct Handle<S: ?Sized> {
    id: u64,
    _signature: PhantomData<fn(&S)>,
}

impl<S: ?Sized> Handle<S> {
    pub(crate) const fn from_id(id: u64) -> Self {
        Self {
            id,
            _signature: PhantomData,
        }
    }

    /// The null handle
    pub const fn null() -> Self {
        Self::from_id(0)
    }

    /// Numeric identity
    pub fn id(&self) -> u64 {
        self.id
    }

    /// False for the null handle
    pub fn valid(&self) -> bool {
        self.id != 0
    }
}

// Manual impls: deriving would put bounds on `S`.
impl<S: ?Sized> Clone for Handle<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: ?Sized> Copy for Handle<S> {}

impl<S: ?Sized> PartialEq for Handle<S> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<S: ?Sized> Eq for Handle<S> {}

impl<S: ?Sized> Hash for Handle<S> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<S: ?Sized> Default for Handle<S> {
    fn default() -> Self {
        Self::null()
    }
}

impl<S: ?Sized> fmt::Debug for Handle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.id)
    }
}

/// Issues unique handles, starting at 1
pub struct HandleFactory<S: ?Sized> {
    next_id: AtomicU64,
    _signature: PhantomData<fn(&S)>,
}

impl<S: ?Sized> HandleFactory<S> {
    pub const fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            _signature: PhantomData,
        }
    }

    /// Fresh handle; unique per factory, safe to call from any thread
    pub fn create(&self) -> Handle<S> {
        Handle::from_id(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Relabel a handle of another signature as one of ours
    pub fn convert_from<T: ?Sized>(handle: Handle<T>) -> Handle<S> {
        Handle::from_id(handle.id)
    }

    /// Relabel one of our handles as a handle of another signature
    pub fn convert_to<T: ?Sized>(handle: Handle<S>) -> Handle<T> {
        Handle::from_id(handle.id)
    }
}

impl<S: ?Sized> Default for HandleFactory<S> {
    fn default() -> Self {
        Self::new()
    }
}
