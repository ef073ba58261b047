use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::ptr;

use shared_ptr::SharedPtr;

thread_local! {
    /// Allocations this thread may still make before the allocator refuses one.
    static BUDGET: Cell<Option<usize>> = const { Cell::new(None) };
}

struct FailingAlloc;

unsafe impl GlobalAlloc for FailingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let refuse = BUDGET
            .try_with(|budget| match budget.get() {
                Some(0) => true,
                Some(n) => {
                    budget.set(Some(n - 1));
                    false
                }
                None => false,
            })
            .unwrap_or(false);
        if refuse {
            ptr::null_mut()
        } else {
            System.alloc(layout)
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static GLOBAL: FailingAlloc = FailingAlloc;

/// Run `f` with the allocator refusing the allocation after `allowed` successful ones.
fn with_budget<R>(allowed: usize, f: impl FnOnce() -> R) -> R {
    BUDGET.with(|budget| budget.set(Some(allowed)));
    let result = f();
    BUDGET.with(|budget| budget.set(None));
    result
}

#[test]
fn try_new_hands_back_the_value() {
    // Payload allocation refused.
    let err = with_budget(0, || SharedPtr::try_new([7u64; 4])).unwrap_err();
    assert_eq!(err.layout(), Layout::new::<[u64; 4]>());
    assert_eq!(err.into_inner(), [7u64; 4]);

    // Payload allocated, counter refused.
    let err = with_budget(1, || SharedPtr::try_new(11u32)).unwrap_err();
    assert_eq!(err.layout().size(), std::mem::size_of::<usize>());
    assert_eq!(err.value, 11);

    let ok = with_budget(2, || SharedPtr::try_new(11u32)).unwrap();
    assert_eq!(*ok, 11);
    assert_eq!(SharedPtr::use_count(&ok), 1);
}

#[test]
fn try_from_box_returns_the_box() {
    let boxed = Box::new(String::from("kept"));
    let err = with_budget(0, || SharedPtr::try_from_box(boxed)).unwrap_err();
    assert_eq!(*err.value, "kept");
}

#[test]
fn failed_reset_keeps_the_previous_share() {
    let mut p = SharedPtr::new(1u64);
    let sibling = p.clone();

    let err = with_budget(0, || SharedPtr::try_reset_to(&mut p, 2)).unwrap_err();
    assert_eq!(err.value, 2);
    assert_eq!(*p, 1);
    assert_eq!(SharedPtr::use_count(&sibling), 2);

    let err = with_budget(1, || SharedPtr::try_reset_to(&mut p, 3)).unwrap_err();
    assert_eq!(err.value, 3);
    assert!(SharedPtr::ptr_eq(&p, &sibling));

    SharedPtr::try_reset_to(&mut p, 4).unwrap();
    assert_eq!(*p, 4);
    assert_eq!(SharedPtr::use_count(&sibling), 1);
}

#[test]
fn error_is_a_std_error() {
    let err = with_budget(0, || SharedPtr::try_new(5u16)).unwrap_err();
    let boxed: Box<dyn std::error::Error> = Box::new(err);
    assert_eq!(boxed.to_string(), "memory allocation of 2 bytes (align 2) failed");
}
