// The counting scheme follows the standard library Arc. The counter lives in its own
// allocation so that a value which is already boxed can be adopted as is.

use alloc::alloc::{alloc, Layout};
use alloc::boxed::Box;
use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::mem;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};

use log::{debug, trace};

use crate::{AllocError, ReferenceCounted};

/// A soft limit on the amount of references that may be made to one payload.
///
/// Cloning past this limit panics instead of letting the counter wrap around.
const MAX_REFCOUNT: usize = (isize::MAX) as usize;

macro_rules! acquire {
    ($x:expr) => {
        atomic::fence(Acquire)
    };
}

/// A thread-safe reference-counted pointer that may be empty.
///
/// Every non-empty handle refers to a payload and to the counter shared by all
/// handles of that payload. The payload and the counter are freed together by
/// whichever handle releases the last share.
///
/// Operations on the handle itself are associated functions, as with
/// `std::sync::Arc`, so that they never shadow methods of the pointee:
///
/// ```
/// use shared_ptr::SharedPtr;
///
/// let mut h = SharedPtr::new(String::from("A"));
/// let r = h.clone();
/// assert_eq!(SharedPtr::use_count(&r), 2);
///
/// SharedPtr::reset(&mut h);
/// assert!(SharedPtr::is_empty(&h));
/// assert_eq!(SharedPtr::use_count(&r), 1);
/// ```
pub struct SharedPtr<T: ?Sized> {
    share: Option<Share<T>>,
    phantom: PhantomData<T>,
}

unsafe impl<T: ?Sized + Sync + Send> Send for SharedPtr<T> {}
unsafe impl<T: ?Sized + Sync + Send> Sync for SharedPtr<T> {}

/// The two allocations a non-empty handle points at.
struct Share<T: ?Sized> {
    data: NonNull<T>,
    count: NonNull<AtomicUsize>,
}

impl<T: ?Sized> Clone for Share<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for Share<T> {}

impl<T: ?Sized> Share<T> {
    #[inline]
    fn count(&self) -> &AtomicUsize {
        // The counter outlives every handle holding this share.
        unsafe { self.count.as_ref() }
    }

    /// Free the payload, then the counter.
    ///
    /// Safety: only the handle that took the counter to zero may call this, once.
    unsafe fn free(self) {
        // Bound before the payload is dropped so it is freed even if that drop panics.
        let count = unsafe { Box::from_raw(self.count.as_ptr()) };
        drop(unsafe { Box::from_raw(self.data.as_ptr()) });
        drop(count);
    }
}

/// Move `value` into a fresh heap allocation, handing it back if the allocator refuses.
fn try_box<V>(value: V) -> Result<Box<V>, AllocError<V>> {
    let layout = Layout::new::<V>();
    if layout.size() == 0 {
        return Ok(Box::new(value));
    }

    let raw = unsafe { alloc(layout) } as *mut V;
    match NonNull::new(raw) {
        Some(raw) => unsafe {
            ptr::write(raw.as_ptr(), value);
            Ok(Box::from_raw(raw.as_ptr()))
        },
        None => {
            debug!("allocation of {} bytes for a shared pointer failed", layout.size());
            Err(AllocError::new(value, layout))
        }
    }
}

impl<T: ?Sized> SharedPtr<T> {
    /// Create a handle that owns nothing.
    pub const fn empty() -> Self {
        SharedPtr { share: None, phantom: PhantomData }
    }

    fn from_share(share: Share<T>) -> Self {
        SharedPtr { share: Some(share), phantom: PhantomData }
    }

    fn adopt(data: Box<T>, count: Box<AtomicUsize>) -> Self {
        Self::from_share(Share {
            data: NonNull::from(Box::leak(data)),
            count: NonNull::from(Box::leak(count)),
        })
    }

    #[inline]
    #[track_caller]
    fn share(&self, op: &str) -> Share<T> {
        match self.share {
            Some(share) => share,
            None => panic!("called `{}` on an empty SharedPtr", op),
        }
    }

    /// Take ownership of a boxed value, becoming its sole owner.
    ///
    /// ```
    /// use shared_ptr::SharedPtr;
    ///
    /// let name: SharedPtr<str> = SharedPtr::from_box("shared".into());
    /// assert_eq!(&*name, "shared");
    /// ```
    pub fn from_box(data: Box<T>) -> Self {
        Self::adopt(data, Box::new(AtomicUsize::new(1)))
    }

    /// Like [`from_box`](Self::from_box), but reports a failed counter
    /// allocation instead of aborting. The box is handed back inside the error.
    pub fn try_from_box(data: Box<T>) -> Result<Self, AllocError<Box<T>>> {
        match try_box(AtomicUsize::new(1)) {
            Ok(count) => Ok(Self::adopt(data, count)),
            Err(err) => Err(err.map(|_| data)),
        }
    }

    /// Take ownership of a raw heap pointer. A null pointer yields an empty handle.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must come from `Box::into_raw` (or an equivalent global
    /// allocation of a `T`), and the caller must neither use nor free it afterwards.
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        if ptr.is_null() {
            return Self::empty();
        }
        Self::from_box(unsafe { Box::from_raw(ptr) })
    }

    /// Whether this handle owns nothing.
    #[inline]
    pub fn is_empty(this: &Self) -> bool {
        this.share.is_none()
    }

    /// Whether this handle refers to a payload.
    #[inline]
    pub fn is_some(this: &Self) -> bool {
        this.share.is_some()
    }

    /// Borrow the payload, or `None` for an empty handle.
    pub fn get(this: &Self) -> Option<&T> {
        this.share.map(|share| unsafe { &*share.data.as_ptr() })
    }

    /// A mutable reference to the payload, if this is the only handle to it.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        let share = this.share?;
        if share.count().load(Acquire) == 1 {
            Some(unsafe { &mut *share.data.as_ptr() })
        } else {
            None
        }
    }

    /// A mutable reference to the payload without checking for other handles.
    ///
    /// # Panics
    ///
    /// Panics if the handle is empty.
    ///
    /// # Safety
    ///
    /// No other handle to the same payload may read or write it while the
    /// returned reference is alive. Only the count is synchronized between
    /// handles, never the payload.
    #[track_caller]
    pub unsafe fn get_mut_unchecked(this: &mut Self) -> &mut T {
        unsafe { &mut *this.share("get_mut_unchecked").data.as_ptr() }
    }

    /// The number of handles sharing this payload.
    ///
    /// # Panics
    ///
    /// Panics if the handle is empty; see [`try_use_count`](Self::try_use_count).
    #[track_caller]
    pub fn use_count(this: &Self) -> usize {
        this.share("use_count").count().load(SeqCst)
    }

    /// The number of handles sharing this payload, or `None` for an empty handle.
    pub fn try_use_count(this: &Self) -> Option<usize> {
        this.share.map(|share| share.count().load(SeqCst))
    }

    /// Whether both handles are empty or share the same payload.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        match (this.share, other.share) {
            (None, None) => true,
            (Some(a), Some(b)) => a.count == b.count,
            _ => false,
        }
    }

    /// Move the share out of `this`, leaving it empty.
    pub fn take(this: &mut Self) -> Self {
        mem::take(this)
    }

    /// Release the share held by `this` and replace it with a copy of `other`.
    ///
    /// Assigning from a handle that already shares `this`'s payload changes nothing.
    pub fn assign(this: &mut Self, other: &Self) {
        this.clone_from(other)
    }

    /// Release the share held by `this` and move `other`'s share into it,
    /// leaving `other` empty. The count of the moved share is unchanged.
    pub fn take_from(this: &mut Self, other: &mut Self) {
        *this = Self::take(other);
    }

    /// Release the share held by `this`, leaving it empty.
    ///
    /// Frees the payload if this was the last handle. Resetting an empty handle
    /// does nothing.
    pub fn reset(this: &mut Self) {
        this.release();
    }

    /// Release the share held by `this` and become the sole owner of `data`.
    pub fn reset_box(this: &mut Self, data: Box<T>) {
        *this = Self::from_box(data);
    }

    /// Exchange the shares held by two handles. No count changes.
    pub fn swap(this: &mut Self, other: &mut Self) {
        mem::swap(&mut this.share, &mut other.share);
    }

    fn release(&mut self) {
        let share = match self.share.take() {
            Some(share) => share,
            None => return,
        };

        // Because `fetch_sub` is already atomic, we do not need to synchronize
        // with other threads unless we are going to delete the object.
        if share.count().fetch_sub(1, Release) != 1 {
            return;
        }

        // Pairs with the `Release` decrements of every other handle, so all of
        // their uses of the payload happen before it is freed here.
        acquire!(share.count());

        trace!("last share of {:p} released, freeing payload", share.data);
        unsafe { share.free() }
    }
}

impl<T> SharedPtr<T> {
    /// Move `data` to the heap, becoming its sole owner.
    pub fn new(data: T) -> Self {
        Self::from_box(Box::new(data))
    }

    /// Like [`new`](Self::new), but reports allocation failure instead of
    /// aborting. The value is handed back inside the error.
    pub fn try_new(data: T) -> Result<Self, AllocError<T>> {
        let data = try_box(data)?;
        Self::try_from_box(data).map_err(|err| err.map(|data| *data))
    }

    /// The address of the payload, or null for an empty handle.
    pub fn as_ptr(this: &Self) -> *const T {
        match this.share {
            Some(share) => share.data.as_ptr(),
            None => ptr::null(),
        }
    }

    /// Release the share held by `this` and become the sole owner of `data`.
    pub fn reset_to(this: &mut Self, data: T) {
        *this = Self::new(data);
    }

    /// Like [`reset_to`](Self::reset_to), but reports allocation failure. On
    /// failure `this` still holds its previous share.
    pub fn try_reset_to(this: &mut Self, data: T) -> Result<(), AllocError<T>> {
        *this = Self::try_new(data)?;
        Ok(())
    }

    /// Return the payload if `this` is its only handle.
    pub fn try_unwrap(this: Self) -> Result<T, Self> {
        let share = match this.share {
            Some(share) => share,
            None => return Err(this),
        };
        if share.count().compare_exchange(1, 0, Relaxed, Relaxed).is_err() {
            return Err(this);
        }

        acquire!(share.count());

        mem::forget(this);
        unsafe {
            let data = Box::from_raw(share.data.as_ptr());
            drop(Box::from_raw(share.count.as_ptr()));
            Ok(*data)
        }
    }
}

impl<T: ?Sized> Clone for SharedPtr<T> {
    /// Makes a clone of the `SharedPtr`.
    ///
    /// This creates another handle to the same payload, increasing the reference count.
    /// Cloning an empty handle yields an empty handle.
    #[inline]
    fn clone(&self) -> SharedPtr<T> {
        let share = match self.share {
            Some(share) => share,
            None => return Self::empty(),
        };

        // Using a relaxed ordering is alright here, as knowledge of the
        // original reference prevents other threads from erroneously deleting
        // the object.
        let old_size = share.count().fetch_add(1, Relaxed);

        if old_size > MAX_REFCOUNT {
            panic!("SharedPtr reference count overflow");
        }

        Self::from_share(share)
    }

    /// Copy-assigns `source` into `self`.
    ///
    /// The new share is taken before the old one is released, so assigning
    /// from a handle of the same payload can never free it.
    fn clone_from(&mut self, source: &Self) {
        if Self::ptr_eq(self, source) {
            return;
        }
        *self = source.clone();
    }
}

impl<T: ?Sized> Drop for SharedPtr<T> {
    /// Drops the `SharedPtr`.
    ///
    /// This will decrement the reference count and free the payload if this was the
    /// last handle to it.
    #[inline]
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: ?Sized> Deref for SharedPtr<T> {
    type Target = T;

    /// # Panics
    ///
    /// Panics if the handle is empty.
    #[inline]
    #[track_caller]
    fn deref(&self) -> &T {
        unsafe { &*self.share("deref").data.as_ptr() }
    }
}

impl<T: ?Sized> Default for SharedPtr<T> {
    /// Creates an empty `SharedPtr<T>`.
    fn default() -> SharedPtr<T> {
        Self::empty()
    }
}

impl<T: ?Sized> ReferenceCounted<T> for SharedPtr<T> {
    fn reference_count(this: &Self) -> usize {
        SharedPtr::use_count(this)
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for SharedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SharedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match SharedPtr::get(self) {
            Some(data) => f.debug_tuple("SharedPtr").field(&data).finish(),
            None => f.write_str("SharedPtr(<empty>)"),
        }
    }
}

impl<T: ?Sized> fmt::Pointer for SharedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.share {
            Some(share) => fmt::Pointer::fmt(&share.data, f),
            None => fmt::Pointer::fmt(&ptr::null::<u8>(), f),
        }
    }
}

impl<T: ?Sized + PartialEq> PartialEq for SharedPtr<T> {
    /// Equality for two `SharedPtr`s.
    ///
    /// Two handles are equal if their payloads are equal, even if they are
    /// stored in different allocations. Empty handles are equal to each other only.
    #[inline]
    fn eq(&self, other: &SharedPtr<T>) -> bool {
        SharedPtr::get(self) == SharedPtr::get(other)
    }
}

impl<T: ?Sized + Eq> Eq for SharedPtr<T> {}

impl<T: ?Sized + PartialOrd> PartialOrd for SharedPtr<T> {
    /// Partial comparison for two `SharedPtr`s.
    ///
    /// Payloads are compared with `partial_cmp()`; an empty handle orders before
    /// every non-empty one.
    fn partial_cmp(&self, other: &SharedPtr<T>) -> Option<Ordering> {
        SharedPtr::get(self).partial_cmp(&SharedPtr::get(other))
    }
}

impl<T: ?Sized + Ord> Ord for SharedPtr<T> {
    fn cmp(&self, other: &SharedPtr<T>) -> Ordering {
        SharedPtr::get(self).cmp(&SharedPtr::get(other))
    }
}

impl<T: ?Sized + Hash> Hash for SharedPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        SharedPtr::get(self).hash(state)
    }
}

impl<T> From<T> for SharedPtr<T> {
    fn from(t: T) -> Self {
        SharedPtr::new(t)
    }
}

impl<T: ?Sized> From<Box<T>> for SharedPtr<T> {
    fn from(data: Box<T>) -> Self {
        SharedPtr::from_box(data)
    }
}

impl<T: ?Sized> Unpin for SharedPtr<T> {}
