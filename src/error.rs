use core::alloc::Layout;
use core::fmt;

/// The error returned when a fallible constructor or reset could not allocate.
///
/// It returns the ownership of the value which was given as a parameter, so
/// nothing leaks and the caller may retry or drop it.
pub struct AllocError<V> {
    /// The value that could not be adopted.
    pub value: V,
    layout: Layout,
}

impl<V> AllocError<V> {
    pub(crate) fn new(value: V, layout: Layout) -> Self {
        AllocError { value, layout }
    }

    /// The layout of the allocation that failed.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Take back the value that could not be adopted.
    pub fn into_inner(self) -> V {
        self.value
    }

    pub(crate) fn map<W, F: FnOnce(V) -> W>(self, f: F) -> AllocError<W> {
        AllocError { value: f(self.value), layout: self.layout }
    }
}

impl<V> fmt::Debug for AllocError<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocError")
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

impl<V> fmt::Display for AllocError<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory allocation of {} bytes (align {}) failed",
            self.layout.size(),
            self.layout.align()
        )
    }
}

#[cfg(feature = "std")]
impl<V> std::error::Error for AllocError<V> {}
