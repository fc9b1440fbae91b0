use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::{self, NonNull};

use log::trace;

use crate::atomic_refcount::{Counted, RefCounted, Release};

/// A strong reference to a heap-allocated value that counts its own references.
///
/// Each `Ref` accounts for exactly one increment of the pointee's [`RefCount`].
/// Cloning adds one, dropping removes one, and the handle that removes the last
/// one drops and frees the value. Because the count lives in the value rather
/// than next to it, a `Ref` is a single pointer, and a new `Ref` can be made
/// from a plain pointer to the value (see [`Ref::from_ptr`]).
///
/// A `Ref` is never null. An unbound handle is an `Option<Ref<T>>`, which is
/// the same size. Moving out of one and leaving `None` behind is
/// [`Option::take`].
///
/// Values only ever reach the heap through [`Ref::new`] or [`Ref::from_box`],
/// so nothing the count can free was allocated anywhere else.
///
/// [`RefCount`]: crate::RefCount
pub struct Ref<T: ?Sized + RefCounted> {
    ptr: NonNull<T>,
    phantom: PhantomData<T>,
}

// SAFETY: the value is dropped by whichever thread releases the last `Ref`, so `T: Send` is needed,
//         and every `Ref` hands out `&T` on its own thread, so `T: Sync` is needed too.
unsafe impl<T: ?Sized + RefCounted + Sync + Send> Send for Ref<T> {}
unsafe impl<T: ?Sized + RefCounted + Sync + Send> Sync for Ref<T> {}

impl<T: RefCounted> Ref<T> {
    /// Moves a value onto the heap and takes the first reference to it.
    pub fn new(value: T) -> Self {
        Self::from_box(Box::new(value))
    }

    /// Returns the value if `this` is the only reference to it.
    ///
    /// The returned value's count is back at zero. Otherwise `this` is handed back unchanged.
    pub fn try_unwrap(this: Self) -> Result<T, Self> {
        if !this.inner().ref_count().try_claim() {
            return Err(this)
        }

        let this = ManuallyDrop::new(this);
        // SAFETY: the count was 1 and is now 0, so this was the last reference,
        //         and the allocation came from a `Box`.
        let boxed = unsafe { Box::from_raw(this.ptr.as_ptr()) };
        Ok(*boxed)
    }
}

impl<T: ?Sized + RefCounted> Ref<T> {
    /// Takes a reference to an already boxed value.
    ///
    /// This is how unsized values get behind a `Ref`, e.g. a `Box<dyn Trait>`
    /// where `Trait: RefCounted`.
    pub fn from_box(value: Box<T>) -> Self {
        let ptr = NonNull::from(Box::leak(value));
        // SAFETY: `ptr` came from a `Box`, and nothing else has seen it yet.
        unsafe { Self::acquire(ptr) }
    }

    /// Makes a new reference from a raw pointer, adding one to the count.
    ///
    /// A null pointer gives `None`.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, or point to a live value that was put on the heap by
    /// [`Ref::new`] or [`Ref::from_box`] and that some other reference is
    /// keeping alive for the duration of this call.
    pub unsafe fn from_ptr(ptr: *const T) -> Option<Self> {
        // SAFETY: guaranteed by caller
        NonNull::new(ptr as *mut T).map(|ptr| unsafe { Self::acquire(ptr) })
    }

    /// Reclaims a reference previously given up by [`Ref::into_raw`], without
    /// touching the count.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Ref::into_raw`], and each pointer from it may
    /// only be turned back into a `Ref` once.
    pub unsafe fn from_raw(ptr: *const T) -> Self {
        Self {
            // SAFETY: `into_raw` never returns null
            ptr: unsafe { NonNull::new_unchecked(ptr as *mut T) },
            phantom: PhantomData,
        }
    }

    /// Consumes the `Ref` without releasing its reference.
    ///
    /// The count keeps the contribution, so the value stays alive until the
    /// pointer is passed to [`Ref::from_raw`] and that `Ref` is dropped.
    pub fn into_raw(this: Self) -> *const T {
        let this = ManuallyDrop::new(this);
        this.ptr.as_ptr()
    }

    pub fn as_ptr(this: &Self) -> *const T {
        this.ptr.as_ptr()
    }

    /// Whether both handles point at the same value (by address, not by contents).
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        ptr::addr_eq(this.ptr.as_ptr(), other.ptr.as_ptr())
    }

    /// The pointee's current count.
    pub fn count(this: &Self) -> isize {
        this.inner().current_count()
    }

    /// Adds a reference that no handle owns.
    ///
    /// Unless it is later given back with [`Ref::decrement_count`], the value is leaked.
    pub fn increment_count(this: &Self) {
        this.inner().increment_count()
    }

    /// Removes one reference from the pointee, the way dropping a `Ref` would,
    /// but while `this` stays alive.
    ///
    /// With `auto_destroy`, reaching zero drops and frees the value. Without it
    /// the value is left in place with a count of zero.
    ///
    /// # Safety
    ///
    /// The reference being removed has to be one the caller added through
    /// [`Ref::increment_count`]. If `auto_destroy` frees the value, `this` (and
    /// any other handle to it) must not be used or dropped afterwards.
    pub unsafe fn decrement_count(this: &Self, auto_destroy: bool) -> Release {
        // SAFETY: guaranteed by caller
        unsafe { release(this.ptr, auto_destroy) }
    }

    /// Points `slot` at `ptr`, adding a reference to the new value before
    /// releasing the old one.
    ///
    /// If `slot` already points at `ptr`, nothing happens, so the count never
    /// passes through zero on the way.
    ///
    /// # Safety
    ///
    /// Same as [`Ref::from_ptr`].
    pub unsafe fn assign_ptr(slot: &mut Option<Self>, ptr: *const T) {
        if let Some(current) = slot {
            if ptr::addr_eq(current.ptr.as_ptr(), ptr) {
                return
            }
        }

        // SAFETY: guaranteed by caller
        let new = unsafe { Self::from_ptr(ptr) };
        *slot = new;
    }

    fn inner(&self) -> &T {
        // SAFETY: while this `Ref` exists the count is positive, so the value is alive.
        unsafe { self.ptr.as_ref() }
    }

    /// # Safety
    /// `ptr` must point at a live heap value allocated by a `Box`.
    unsafe fn acquire(ptr: NonNull<T>) -> Self {
        // SAFETY: guaranteed by caller
        unsafe { ptr.as_ref() }.increment_count();
        Self { ptr, phantom: PhantomData }
    }
}

impl<T: ?Sized> Ref<Counted<T>> {
    /// Mutable access to the wrapped value, if `this` is its only reference.
    ///
    /// Only the value inside the [`Counted`] is handed out. The count itself
    /// stays out of reach, since replacing it would let the value be freed
    /// under `this`. Types that embed their own count get no `get_mut`:
    ///
    /// ```compile_fail
    /// use refcounted::{Ref, RefCount, RefCounted};
    ///
    /// struct Node { rc: RefCount }
    /// // SAFETY: `rc` belongs to this `Node` alone.
    /// unsafe impl RefCounted for Node {
    ///     fn ref_count(&self) -> &RefCount { &self.rc }
    /// }
    ///
    /// let mut a = Ref::new(Node { rc: RefCount::new() });
    /// *Ref::get_mut(&mut a).unwrap() = Node { rc: RefCount::new() };
    /// ```
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        if !this.inner().ref_count().is_unique() {
            return None
        }

        // SAFETY: no other `Ref` exists, and `this` is borrowed mutably.
        let counted = unsafe { this.ptr.as_mut() };
        Some(&mut **counted)
    }
}

/// Drops one contribution from the value at `ptr`, freeing it if that was the
/// last one and `auto_destroy` is set.
///
/// # Safety
/// `ptr` must point at a live value allocated by a `Box`, and the caller must
/// own the contribution it is giving up.
unsafe fn release<T: ?Sized + RefCounted>(ptr: NonNull<T>, auto_destroy: bool) -> Release {
    // SAFETY: the caller's contribution keeps the value alive until this decrement,
    //         and it is the one being given up.
    let status = unsafe { ptr.as_ref().ref_count().decrement() };

    if auto_destroy && status.is_unreferenced() {
        trace!("Destroying unreferenced value at {:p}", ptr);
        // SAFETY: the count just reached zero on this thread, so nobody else can reach the value.
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
    }

    status
}

impl<T: ?Sized + RefCounted> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.inner()
    }
}

impl<T: ?Sized + RefCounted> Clone for Ref<T> {
    fn clone(&self) -> Self {
        self.inner().increment_count();
        Self { ptr: self.ptr, phantom: PhantomData }
    }

    fn clone_from(&mut self, source: &Self) {
        // Releasing first could drop the value `source` still points at.
        if Self::ptr_eq(self, source) {
            return
        }
        *self = source.clone();
    }
}

impl<T: ?Sized + RefCounted> Drop for Ref<T> {
    fn drop(&mut self) {
        // SAFETY: this `Ref` owns one contribution, and is never used again.
        unsafe { release(self.ptr, true); }
    }
}

impl<T: ?Sized + RefCounted> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}
impl<T: ?Sized + RefCounted> Eq for Ref<T> {}

impl<T: ?Sized + RefCounted> PartialEq<*const T> for Ref<T> {
    fn eq(&self, other: &*const T) -> bool {
        ptr::addr_eq(self.ptr.as_ptr(), *other)
    }
}

impl<T: ?Sized + RefCounted> Hash for Ref<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.as_ptr().cast::<()>().hash(state)
    }
}

impl<T: ?Sized + RefCounted> AsRef<T> for Ref<T> {
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T: ?Sized + RefCounted> Borrow<T> for Ref<T> {
    fn borrow(&self) -> &T {
        self
    }
}

impl<T: ?Sized + RefCounted + fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <T as fmt::Debug>::fmt(self, f)
    }
}
impl<T: ?Sized + RefCounted + fmt::Display> fmt::Display for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <T as fmt::Display>::fmt(self, f)
    }
}
impl<T: ?Sized + RefCounted> fmt::Pointer for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.ptr, f)
    }
}
