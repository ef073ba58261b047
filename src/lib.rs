#![no_std]
#![allow(unused_unsafe)]
//! A thread-safe shared-ownership pointer that may also be empty.
//!
//! [`SharedPtr`] owns a heap value together with a separately allocated atomic
//! counter. Cloning a handle bumps the counter, dropping or resetting one lowers
//! it, and whichever handle brings it to zero frees the value. Unlike
//! `std::sync::Arc`, a handle can be empty, can be reset to a new value in
//! place, and can adopt a value that is already boxed.
//!
//! ```
//! use shared_ptr::SharedPtr;
//!
//! let h = SharedPtr::new(3);
//! assert_eq!(*h, 3);
//! assert_eq!(SharedPtr::use_count(&h), 1);
//!
//! let r = h.clone();
//! assert_eq!(SharedPtr::use_count(&r), 2);
//! drop(r);
//! assert_eq!(SharedPtr::use_count(&h), 1);
//! ```
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

/// A smart pointer that keeps track of how many pointers refer to the same allocation and
/// exposes this information in its API.
pub trait ReferenceCounted<T: ?Sized>: Clone {
    /// Get the number of owning pointers referring to the same allocation.
    ///
    /// Implementations may panic if `this` does not refer to any allocation.
    fn reference_count(this: &Self) -> usize;
}

impl<T: ?Sized> ReferenceCounted<T> for alloc::sync::Arc<T> {
    fn reference_count(this: &Self) -> usize {
        alloc::sync::Arc::strong_count(this)
    }
}

impl<T: ?Sized> ReferenceCounted<T> for alloc::rc::Rc<T> {
    fn reference_count(this: &Self) -> usize {
        alloc::rc::Rc::strong_count(this)
    }
}

mod error;
pub use error::AllocError;

mod shared;
pub use shared::*;
