//! Intrusive reference counts.
//!
//! A [`RefCount`] lives *inside* the value it counts, rather than in a
//! separately allocated header like the one behind [`std::sync::Arc`]. Any type
//! opts in by embedding one and implementing [`RefCounted`], or by being
//! wrapped in a [`Counted`].
//!
//! The count only reports when it reaches zero. Reclaiming the value is up to
//! whoever holds it, which is normally a [`Ref`](crate::Ref).

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{self, AtomicIsize, Ordering};

use log::error;

/// Anything past this is almost certainly a leak in a loop.
const MAX_REFCOUNT: isize = isize::MAX / 2;

/// The result of dropping one contribution from a [`RefCount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other contributions remain. Holds the count after the decrement.
    Retained(isize),
    /// This decrement took the count to exactly zero, so the value can be reclaimed.
    Unreferenced,
    /// The count went below zero, meaning something released more than it
    /// acquired. Holds the count after the decrement.
    Underflow(isize),
}

impl Release {
    pub fn is_unreferenced(self) -> bool {
        self == Release::Unreferenced
    }
}

/// An atomic, signed reference count, meant to be embedded in the value it counts.
pub struct RefCount {
    count: AtomicIsize,
}

impl RefCount {
    pub const fn new() -> Self {
        Self { count: AtomicIsize::new(0) }
    }

    pub fn increment(&self) {
        // Relaxed is enough here: a new reference is always made from an
        // existing one, which already keeps the value alive.
        let old_count = self.count.fetch_add(1, Ordering::Relaxed);

        // The increment already happened, so catching this panic leaks the value.
        if old_count >= MAX_REFCOUNT {
            panic!("too many references to a ref-counted value")
        }
    }

    /// Drops one contribution. Only the value returned here may be used to
    /// decide whether the counted value should be destroyed.
    ///
    /// # Safety
    ///
    /// Every decrement has to be matched by an earlier increment that the
    /// caller owns. Otherwise a [`Ref`](crate::Ref) still pointing at the value
    /// may free it while another one is in use. Safe code reaching the count
    /// through a handle cannot do that:
    ///
    /// ```compile_fail
    /// use refcounted::{Counted, Ref, RefCounted};
    ///
    /// let a = Ref::new(Counted::new(1));
    /// a.ref_count().decrement();
    /// ```
    pub unsafe fn decrement(&self) -> Release {
        // Ordering::Release makes every use of the value through this
        // contribution visible to whichever thread ends up destroying it.
        let old_count = self.count.fetch_sub(1, Ordering::Release);

        match old_count {
            1 => {
                atomic::fence(Ordering::Acquire);
                Release::Unreferenced
            }
            n if n > 1 => Release::Retained(n - 1),
            n => {
                error!(
                    "Reference count underflow at {:p}: decremented from {n} to {}",
                    self,
                    n - 1
                );
                Release::Underflow(n - 1)
            }
        }
    }

    /// Current value of the count.
    ///
    /// Only useful for diagnostics: by the time the caller looks at it, other
    /// threads may have changed it.
    pub fn get(&self) -> isize {
        self.count.load(Ordering::Relaxed)
    }

    /// Takes the count from 1 to 0 if this is the only contribution.
    pub(crate) fn try_claim(&self) -> bool {
        self.count
            .compare_exchange(1, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn is_unique(&self) -> bool {
        self.count.load(Ordering::Acquire) == 1
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

/// A copy of a value starts out unreferenced, so cloning does not carry the count over.
impl Clone for RefCount {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefCount").field(&self.get()).finish()
    }
}

/// A value that carries its own [`RefCount`].
///
/// # Safety
///
/// `ref_count` must return the same `RefCount` every time it is called on a
/// given value, and that `RefCount` must not be shared with any other value.
/// [`Ref`](crate::Ref) frees the value based on what this count says.
pub unsafe trait RefCounted {
    fn ref_count(&self) -> &RefCount;

    fn increment_count(&self) {
        self.ref_count().increment()
    }

    /// Decrements the count without ever destroying the value.
    ///
    /// # Safety
    ///
    /// Every decrement has to be matched by an earlier increment that the
    /// caller owns. Otherwise a [`Ref`](crate::Ref) still pointing at the value
    /// may free it while another one is in use.
    unsafe fn decrement_count(&self) -> Release {
        // SAFETY: guaranteed by caller
        unsafe { self.ref_count().decrement() }
    }

    fn current_count(&self) -> isize {
        self.ref_count().get()
    }
}

/// Attaches a [`RefCount`] to any `T`.
#[derive(Clone, Default)]
pub struct Counted<T: ?Sized> {
    count: RefCount,
    value: T,
}

impl<T> Counted<T> {
    pub const fn new(value: T) -> Self {
        Self { count: RefCount::new(), value }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

// SAFETY: `count` is a field of this value and is never handed to anything else.
unsafe impl<T: ?Sized> RefCounted for Counted<T> {
    fn ref_count(&self) -> &RefCount {
        &self.count
    }
}

impl<T: ?Sized> Deref for Counted<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: ?Sized> DerefMut for Counted<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Counted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counted")
            .field("count", &self.count.get())
            .field("value", &&self.value)
            .finish()
    }
}
